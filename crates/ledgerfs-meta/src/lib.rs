//! LedgerFS Metadata Engine
//!
//! Crash-consistent persistence for the three B+Tree-backed metadata maps
//! of a LedgerFS volume (inode records, log-segment records, and B+Tree
//! objects), checkpointed into an object-store container and journaled
//! locally between checkpoints.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                       Volume                         │
//! │  ┌───────────┐ ┌───────────────┐ ┌────────────────┐  │
//! │  │ InodeRec  │ │ LogSegmentRec │ │ BPlusTreeObject│  │
//! │  │  B+Tree   │ │    B+Tree     │ │     B+Tree     │  │
//! │  └─────┬─────┘ └───────┬───────┘ └────────┬───────┘  │
//! │        │  node reads/writes + layout      │          │
//! │  ┌─────▼──────────────▼──────────────────▼───────┐   │
//! │  │ chunked PUT / object GET   │  replay log      │   │
//! │  │ (checkpoint container)     │  (local, 4 KiB   │   │
//! │  │                            │   aligned, CRC64)│   │
//! │  └────────────────────────────┴──────────────────┘   │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! # Durable states
//!
//! A volume is either **checkpointed** (fully described by the checkpoint
//! header stored on the container plus the trailer at the tail of the
//! current checkpoint object) or **advanced** (checkpointed state plus a
//! sequence of CRC-protected transactions in the local replay log). The
//! checkpoint daemon periodically collapses the advanced state back into a
//! checkpointed one; the header POST is the commit point.

pub mod btree;
pub mod cache;
mod checkpoint;
pub mod format;
pub mod replaylog;
pub mod store;
pub mod transaction;
pub mod volume;

pub use btree::{BPlusTree, NodeIo, NodeRef};
pub use format::{CheckpointHeader, CheckpointTrailer};
pub use replaylog::ReplayLog;
pub use store::{ChunkedPutContext, Headers, MemoryStore, ObjectStore};
pub use transaction::Transaction;
pub use volume::Volume;

pub use ledgerfs_common::{Error, LayoutReport, Result, TreeType, VolumeConfig};
