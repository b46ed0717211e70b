//! Handle layer
//!
//! A handle is one live in-memory index bound to the `(snapshot_seq,
//! log_seq)` baseline it was materialized from. Activation builds the index
//! from the latest snapshot plus the unpruned delta suffix; refresh brings
//! it forward (or rebuilds it when a checkpoint moved the ground under it);
//! publish pushes freshly replayed deltas into every live handle without
//! requiring readers to poll.
//!
//! The domain keeps weak references to handle cells; a dropped handle simply
//! stops upgrading and is swept on the next publish. Deactivation frees the
//! index and leaves the cell inert so later calls fail cleanly.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use annex_core::delta::DeltaRecord;
use annex_core::error::{Error, Result};
use annex_core::index::{ScalarKind, VectorIndex};
use annex_core::kv::KvRead;
use annex_core::types::UpdateOp;
use annex_storage::meta::keys;

use crate::domain::{Domain, SCHEMA_VERSION};

/// Floor for the activation reserve hint; reserving zero is never allowed.
const MIN_RESERVE: u64 = 16;

pub(crate) struct HandleCell {
    pub(crate) index: Option<Box<dyn VectorIndex>>,
    pub(crate) scalar: ScalarKind,
    pub(crate) snapshot_seq: u64,
    pub(crate) log_seq: u64,
}

/// A live in-memory index bound to a domain.
pub struct Handle {
    pub(crate) cell: Arc<Mutex<HandleCell>>,
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle").finish_non_exhaustive()
    }
}

impl Handle {
    fn with_index<T>(&self, body: impl FnOnce(&dyn VectorIndex) -> Result<T>) -> Result<T> {
        let cell = self.cell.lock();
        match cell.index.as_deref() {
            Some(index) => body(index),
            None => Err(Error::InvalidArgument("handle has been deactivated")),
        }
    }

    /// K-nearest search against the handle's current in-memory state.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(u64, f32)>> {
        self.with_index(|index| index.search(query, k))
    }

    /// Whether the key currently holds a vector.
    pub fn contains(&self, key: u64) -> Result<bool> {
        self.with_index(|index| Ok(index.contains(key)))
    }

    /// Number of stored vectors.
    pub fn len(&self) -> Result<usize> {
        self.with_index(|index| Ok(index.len()))
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Scalar kind the index was built with.
    pub fn scalar(&self) -> ScalarKind {
        self.cell.lock().scalar
    }

    /// The `(snapshot_seq, log_seq)` baseline this handle has materialized.
    pub fn baseline(&self) -> (u64, u64) {
        let cell = self.cell.lock();
        (cell.snapshot_seq, cell.log_seq)
    }

    /// Free the underlying index. Must happen before the owning domain
    /// closes; later operations on this handle fail.
    pub fn deactivate(&self) {
        let mut cell = self.cell.lock();
        cell.index = None;
    }

    pub(crate) fn serialize_with_baseline(&self) -> Result<(Vec<u8>, u64)> {
        let cell = self.cell.lock();
        match cell.index.as_deref() {
            // An empty index serializes to an empty stream, so its
            // checkpoint stores zero chunks and activation starts fresh.
            Some(index) if index.is_empty() => Ok((Vec::new(), cell.log_seq)),
            Some(index) => Ok((index.serialize()?, cell.log_seq)),
            None => Err(Error::InvalidArgument("handle has been deactivated")),
        }
    }

    pub(crate) fn note_checkpoint(&self, snapshot_seq: u64) {
        let mut cell = self.cell.lock();
        cell.snapshot_seq = snapshot_seq;
        cell.log_seq = snapshot_seq;
    }
}

/// ADD / REPLACE / DELETE semantics shared by activation replay, refresh
/// replay, and publish-driven mutation.
pub(crate) fn apply_record(index: &mut dyn VectorIndex, record: &DeltaRecord) -> Result<()> {
    match record.op {
        UpdateOp::Add => match index.add(record.key, &record.payload) {
            // Republish of an already-applied frame: idempotent re-add.
            Err(Error::AlreadyExists(_)) => {
                index.remove(record.key)?;
                index.add(record.key, &record.payload)
            }
            other => other,
        },
        UpdateOp::Replace => {
            index.remove(record.key)?;
            index.add(record.key, &record.payload)
        }
        UpdateOp::Delete => {
            index.remove(record.key)?;
            Ok(())
        }
    }
}

impl Domain {
    /// Build a handle from persisted state: snapshot, then delta suffix.
    pub fn activate(&self) -> Result<Handle> {
        let txn = self.env.begin_read()?;
        let (index, scalar, snapshot_seq, log_seq) = self.build_index(&*txn)?;
        drop(txn);

        let cell = Arc::new(Mutex::new(HandleCell {
            index: Some(index),
            scalar,
            snapshot_seq,
            log_seq,
        }));
        self.handles.lock().push(Arc::downgrade(&cell));
        info!(domain = %self.name, snapshot_seq, log_seq, "handle activated");
        Ok(Handle { cell })
    }

    fn build_index(
        &self,
        txn: &(impl KvRead + ?Sized),
    ) -> Result<(Box<dyn VectorIndex>, ScalarKind, u64, u64)> {
        let version = self.meta.get_u64(txn, keys::SCHEMA_VERSION, 0)?;
        if version != SCHEMA_VERSION {
            return Err(Error::Corruption(format!(
                "domain schema version {version}, this build supports {SCHEMA_VERSION}"
            )));
        }
        let options = self.meta.init_options(txn)?.ok_or(Error::NotFound("init options"))?;
        let snapshot_seq = self.meta.get_u64(txn, keys::SNAPSHOT_SEQ, 0)?;
        let log_seq = self.meta.get_u64(txn, keys::LOG_SEQ, 0)?;

        let mut index = self.factory.create(&options)?;
        if let Some(stream) = self.snapshots.load(txn, snapshot_seq)? {
            index.deserialize(&stream)?;
        }
        index.reserve(snapshot_seq.max(log_seq).max(MIN_RESERVE) as usize)?;

        let replayed = self.delta.replay(txn, snapshot_seq + 1, log_seq, &mut |_, record| {
            apply_record(index.as_mut(), &record)
        })?;
        debug!(
            domain = %self.name,
            snapshot_seq,
            log_seq,
            replayed,
            "index materialized"
        );
        Ok((index, options.scalar, snapshot_seq, log_seq))
    }

    /// Bring a handle up to the domain's current state using a fresh read
    /// transaction.
    pub fn refresh(&self, handle: &Handle) -> Result<()> {
        let txn = self.env.begin_read()?;
        self.refresh_in(handle, &*txn)
    }

    /// Bring a handle up to the state visible in `txn`.
    ///
    /// A newer snapshot, or a log that rolled back beneath the handle's
    /// baseline, rebuilds the index from persisted state; a longer log
    /// replays just the suffix; anything else is a no-op.
    pub fn refresh_in(&self, handle: &Handle, txn: &(impl KvRead + ?Sized)) -> Result<()> {
        let mut cell = handle.cell.lock();
        if cell.index.is_none() {
            return Err(Error::InvalidArgument("handle has been deactivated"));
        }
        let snapshot_seq = self.meta.get_u64(txn, keys::SNAPSHOT_SEQ, 0)?;
        let log_seq = self.meta.get_u64(txn, keys::LOG_SEQ, 0)?;

        if snapshot_seq > cell.snapshot_seq || log_seq < cell.log_seq {
            let (index, scalar, new_snap, new_log) = self.build_index(txn)?;
            cell.index = Some(index);
            cell.scalar = scalar;
            cell.snapshot_seq = new_snap;
            cell.log_seq = new_log;
            debug!(domain = %self.name, snapshot_seq = new_snap, log_seq = new_log, "handle rebuilt");
        } else if log_seq > cell.log_seq {
            let start = cell.log_seq + 1;
            if let Some(index) = cell.index.as_mut() {
                self.delta.replay(txn, start, log_seq, &mut |_, record| {
                    apply_record(index.as_mut(), &record)
                })?;
            }
            cell.log_seq = log_seq;
        }
        Ok(())
    }

    /// Apply one replayed delta to every live handle, advancing each
    /// handle's log baseline when the frame's sequence is known.
    pub(crate) fn apply_to_handles(
        &self,
        record: &DeltaRecord,
        log_seq: Option<u64>,
    ) -> Result<()> {
        let cells: Vec<Arc<Mutex<HandleCell>>> = {
            let mut handles = self.handles.lock();
            handles.retain(|weak| weak.strong_count() > 0);
            handles.iter().filter_map(std::sync::Weak::upgrade).collect()
        };
        for cell in cells {
            let mut cell = cell.lock();
            if let Some(index) = cell.index.as_mut() {
                apply_record(index.as_mut(), record)?;
                if let Some(seq) = log_seq {
                    if seq > cell.log_seq {
                        cell.log_seq = seq;
                    }
                }
            }
        }
        Ok(())
    }

    /// Drop every live handle's index. Returns how many were still active.
    pub(crate) fn deactivate_all(&self) -> usize {
        let cells: Vec<Arc<Mutex<HandleCell>>> = {
            let mut handles = self.handles.lock();
            let cells = handles.iter().filter_map(std::sync::Weak::upgrade).collect();
            handles.clear();
            cells
        };
        let mut active = 0;
        for cell in cells {
            let mut cell = cell.lock();
            if cell.index.take().is_some() {
                active += 1;
            }
        }
        active
    }
}
