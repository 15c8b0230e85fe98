//! Error types for LedgerFS
//!
//! This module defines the common error type used throughout the engine.

use thiserror::Error;

/// Common result type for LedgerFS operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for LedgerFS
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP status {status}: {context}")]
    Http { status: u16, context: String },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("unsupported checkpoint version: {0}")]
    UnsupportedVersion(u64),

    #[error("corruption detected: {0}")]
    Corrupt(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("volume halted after a fatal checkpoint or record failure")]
    Halted,

    #[error("volume is down")]
    Down,
}

impl Error {
    /// Create an HTTP error carrying the backend status code
    pub fn http(status: u16, context: impl Into<String>) -> Self {
        Self::Http {
            status,
            context: context.into(),
        }
    }

    /// Create a parse error
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    /// Create a corruption error
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Http { status: 404, .. })
    }
}
