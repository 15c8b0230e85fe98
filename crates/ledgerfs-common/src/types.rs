//! Core shared types for the LedgerFS metadata engine

use std::collections::HashMap;
use std::fmt;

/// Map from object-store object numbers to the bytes of that object still
/// referenced by a particular B+Tree.
pub type LayoutReport = HashMap<u64, u64>;

/// The three B+Tree maps owned by a volume
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TreeType {
    /// Inode number to inode record
    InodeRec,
    /// Log-segment number to log-segment record
    LogSegmentRec,
    /// Object number to serialized B+Tree object
    BPlusTreeObject,
}

impl TreeType {
    /// Human-readable tree name, used in log messages
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::InodeRec => "InodeRec",
            Self::LogSegmentRec => "LogSegmentRec",
            Self::BPlusTreeObject => "BPlusTreeObject",
        }
    }
}

impl fmt::Display for TreeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
