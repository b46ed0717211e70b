//! Error types for the Annex persistence domain
//!
//! One unified error type is used across all crates. We use `thiserror` for
//! automatic `Display` and `Error` trait implementations.
//!
//! ## Error Categories
//!
//! - **InvalidArgument**: caller passed inconsistent or out-of-range inputs
//! - **NotFound**: an optional record is absent
//! - **AlreadyExists**: a vector key is already present in an index
//! - **Busy**: the operation conflicts with an in-flight checkpoint or an
//!   exhausted pin map
//! - **MapFull**: the KV engine is out of space; grow the map and retry
//! - **Io**: a filesystem or OS call failed
//! - **Corruption**: CRC mismatch, bad version, truncated record, ordinal
//!   gap, or token mismatch; unrecoverable locally
//! - **OutOfMemory**: an external collaborator reported allocation failure

use std::io;
use thiserror::Error;

/// Result type alias for Annex operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the Annex persistence domain
#[derive(Debug, Error)]
pub enum Error {
    /// Caller passed inconsistent or out-of-range inputs
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Optional record absent
    #[error("not found: {0}")]
    NotFound(&'static str),

    /// Vector key already present in an index
    #[error("key {0} already exists in index")]
    AlreadyExists(u64),

    /// Operation conflicts with in-flight state
    #[error("busy: {0}")]
    Busy(&'static str),

    /// KV engine is out of space; the caller must grow the map and retry
    #[error("KV map is full")]
    MapFull,

    /// I/O error (file operations, mmap, locking)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Data corruption detected
    #[error("corruption: {0}")]
    Corruption(String),

    /// External collaborator reported allocation failure
    #[error("out of memory")]
    OutOfMemory,
}

impl Error {
    /// Check whether this error is map-full back-pressure.
    ///
    /// Map-full is the only error a checkpoint preserves its pending record
    /// across; callers use this to decide between "grow and retry" and
    /// "start over".
    pub fn is_map_full(&self) -> bool {
        matches!(self, Error::MapFull)
    }

    /// Check whether this error is a missing optional record.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Check whether this error reports corrupted persistent state.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption(_))
    }
}
