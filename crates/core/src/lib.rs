//! Core types and contracts for the Annex vector-index persistence domain
//!
//! This crate holds everything the other layers agree on:
//!
//! - Big-endian packing helpers and CRC-32C (`bytes`)
//! - The unified error type (`error`)
//! - Identifiers, tokens, and staged-update types (`types`)
//! - The delta record wire codec (`delta`)
//! - The key/value engine contract (`kv`)
//! - The ANN index contract and init options (`index`)
//! - An in-memory KV engine for tests (`testing`)
//!
//! Nothing in this crate touches the filesystem; the on-disk WAL lives in
//! `annex-durability` and the KV-resident records in `annex-storage`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bytes;
pub mod delta;
pub mod error;
pub mod index;
pub mod kv;
pub mod testing;
pub mod types;

pub use delta::DeltaRecord;
pub use error::{Error, Result};
pub use index::{IndexFactory, IndexOptions, MetricKind, ScalarKind, VectorIndex};
pub use kv::{Dbi, KvEngine, KvRead, KvWrite};
pub use types::{Token, Update, UpdateOp};
