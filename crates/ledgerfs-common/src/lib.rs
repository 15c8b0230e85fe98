//! LedgerFS Common - Shared types and utilities
//!
//! This crate provides the error taxonomy, checksum helpers, and
//! configuration types used across the LedgerFS metadata engine.

pub mod checksum;
pub mod config;
pub mod error;
pub mod types;

pub use config::VolumeConfig;
pub use error::{Error, Result};
pub use types::{LayoutReport, TreeType};
