//! Durability layer for Annex
//!
//! This crate handles everything that touches the pending directory:
//!
//! - WAL on-disk format: file header, frame prefix, state suffixes
//! - WAL writer: per-transaction append-only files with the
//!   writing → sealed → ready-for-publish lifecycle
//! - WAL replay: verified frame-by-frame streaming of a ready file
//! - Pending-directory recovery: classification and cleanup after a crash
//!
//! The KV-resident side of the domain (meta, delta log, snapshot catalog,
//! reader pins) lives in `annex-storage`; the orchestration that ties both
//! together lives in `annex-engine`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod format;
pub mod recovery;
pub mod replay;
pub mod writer;

pub use format::{FramePrefix, WalHeader, WalState, ULOG_HEADER_LEN, ULOG_MAGIC, ULOG_VERSION};
pub use recovery::scan_pending;
pub use replay::{replay_wal_file, ReplayOutcome};
pub use writer::WalWriter;
