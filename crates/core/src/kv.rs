//! Key/value engine contract
//!
//! The host store — an embedded, memory-mapped, copy-on-write B+tree with
//! MVCC transactions — is an external collaborator. This module is the
//! narrow surface the domain consumes it through: named sub-databases,
//! point get/put/del, ascending range scans, and ACID commit with
//! read-your-writes inside a transaction.
//!
//! The contract assumes the store's usual discipline: one writer, many
//! readers, lexicographic byte ordering of keys (which is why every
//! persisted key in this workspace is big-endian), and map-full signaled as
//! [`crate::error::Error::MapFull`] from `put` or `commit`.

use crate::error::Result;

/// Handle to a named sub-database within a KV engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dbi(pub u32);

/// Read surface of a KV transaction.
pub trait KvRead {
    /// Identifier of this transaction object, unique within its engine for
    /// the engine's lifetime. Used to detect a context being driven with a
    /// different transaction than the one it was created under.
    fn id(&self) -> u64;

    /// Point lookup. Returns the value bytes, or `None` when absent.
    fn get(&self, dbi: Dbi, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Visit entries with `key >= start` in ascending key order until the
    /// visitor returns `Ok(false)` or the sub-database is exhausted.
    fn scan_from(
        &self,
        dbi: Dbi,
        start: &[u8],
        visit: &mut dyn FnMut(&[u8], &[u8]) -> Result<bool>,
    ) -> Result<()>;
}

/// Write surface of a KV transaction.
pub trait KvWrite: KvRead {
    /// Insert or overwrite. Surfaces `MapFull` when the engine is out of
    /// space.
    fn put(&mut self, dbi: Dbi, key: &[u8], value: &[u8]) -> Result<()>;

    /// Delete a key. Returns whether it was present.
    fn del(&mut self, dbi: Dbi, key: &[u8]) -> Result<bool>;

    /// Commit the transaction. All effects land atomically or not at all.
    fn commit(self: Box<Self>) -> Result<()>;

    /// Abort the transaction, discarding all staged effects.
    fn abort(self: Box<Self>);
}

/// The KV engine itself.
pub trait KvEngine: Send + Sync {
    /// Open (creating if absent) a named sub-database.
    fn open_dbi(&self, name: &str) -> Result<Dbi>;

    /// Begin a read-only transaction over a consistent snapshot.
    fn begin_read(&self) -> Result<Box<dyn KvRead + '_>>;

    /// Begin the write transaction. Blocks while another writer is active.
    fn begin_write(&self) -> Result<Box<dyn KvWrite + '_>>;
}

/// Collect the keys in `[start, ..]` accepted by `keep`, for scan-then-delete
/// range operations (a scan borrows the transaction immutably, so deletions
/// happen after it finishes).
pub fn collect_keys(
    txn: &(impl KvRead + ?Sized),
    dbi: Dbi,
    start: &[u8],
    keep: &mut dyn FnMut(&[u8]) -> KeyScan,
) -> Result<Vec<Vec<u8>>> {
    let mut keys = Vec::new();
    txn.scan_from(dbi, start, &mut |key, _value| match keep(key) {
        KeyScan::Take => {
            keys.push(key.to_vec());
            Ok(true)
        }
        KeyScan::Skip => Ok(true),
        KeyScan::Stop => Ok(false),
    })?;
    Ok(keys)
}

/// Per-key decision for [`collect_keys`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyScan {
    /// Collect this key and continue
    Take,
    /// Leave this key and continue
    Skip,
    /// Stop scanning
    Stop,
}
