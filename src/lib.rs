//! Annex: a crash-safe persistence domain for memory-resident vector indexes
//!
//! Annex turns a transient in-memory approximate-nearest-neighbor index into
//! a durable, multi-reader, multi-process resource layered on an embedded
//! copy-on-write key/value store. Updates are staged inside host KV
//! transactions, durably sealed in per-transaction write-ahead log files,
//! then published into live in-memory indexes and a chunked on-disk snapshot
//! catalog from which fresh indexes are rebuilt after any crash.
//!
//! # Write path
//!
//! ```ignore
//! let domain = Domain::open(env.clone(), "embeddings", root, DomainOptions::default())?;
//! domain.put_init_options(&options)?;
//!
//! let mut txn = env.begin_write()?;
//! let mut ctx = None;
//! domain.stage(&mut *txn, &Update { op: UpdateOp::Add, key: 5, payload: &bytes }, &mut ctx)?;
//! let mut ctx = ctx.expect("staged");
//! ctx.apply_pending(&mut *txn)?;
//! txn.commit()?;
//! ctx.publish(true)?;
//! ```
//!
//! # Read path
//!
//! ```ignore
//! let handle = domain.activate()?;
//! let nearest = handle.search(&query, 10)?;
//! domain.checkpoint(&handle)?;
//! ```

pub use annex_core::{
    delta::DeltaRecord,
    error::{Error, Result},
    index::{IndexFactory, IndexOptions, MetricKind, ScalarKind, VectorIndex},
    kv::{Dbi, KvEngine, KvRead, KvWrite},
    types::{Token, Update, UpdateOp},
};
pub use annex_durability::{WalHeader, WalState, WalWriter};
pub use annex_engine::{Domain, DomainOptions, FlatIndex, FlatIndexFactory, Handle, TxnContext};
pub use annex_storage::{MetaStore, PinFile};

/// Test-support KV engine (in-memory, LMDB-shaped).
pub use annex_core::testing::MemKv;
