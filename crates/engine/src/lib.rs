//! Engine layer of the Annex persistence domain
//!
//! Ties the KV-resident storage and the on-disk WAL into one crash-safe
//! lifecycle:
//!
//! - `domain`: open/close, schema gate, defaults, recovery orchestration,
//!   reader-pin surface, live-handle registry
//! - `txn`: per-host-transaction staging, seal, publish, abort
//! - `checkpoint`: resumable serialization of a live index into the chunk
//!   catalog, log prune, retention trim
//! - `handle`: activation, refresh, and publish-driven mutation of
//!   in-memory indexes
//! - `flat`: the exact-scan reference implementation of the index contract

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod checkpoint;
pub mod domain;
pub mod flat;
pub mod handle;
pub mod txn;

pub use domain::{Domain, DomainOptions, SCHEMA_VERSION};
pub use flat::{FlatIndex, FlatIndexFactory};
pub use handle::Handle;
pub use txn::TxnContext;
