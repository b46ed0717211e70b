//! Checkpoint state machine
//!
//! Durably replaces the on-disk snapshot with the serialization of a live
//! index, prunes the delta log, and trims snapshot history. The pending
//! record in the meta store makes every phase resumable:
//!
//! - `INIT`: declared intent, no chunks yet
//! - `WRITING`: `chunk_cursor` chunks have committed, in bounded batches
//! - `FINALIZING`: metadata advance and pruning in progress
//!
//! Finalization runs in a single KV transaction — sequence advance, log
//! prune, retention trim, and pending clear land together or not at all.
//! Map-full during chunk writing aborts the batch but preserves the pending
//! record so the caller can grow the map; recovery on the next open discards
//! the partial snapshot instead.

use tracing::{info, warn};

use annex_core::error::{Error, Result};
use annex_core::kv::KvWrite;
use annex_core::types::Token;
use annex_storage::meta::{keys, CheckpointPending, CheckpointStage};

use crate::domain::Domain;
use crate::handle::Handle;

impl Domain {
    /// Checkpoint a live handle: write its serialization into the chunk
    /// catalog and finalize. Returns the new `snapshot_seq`.
    pub fn checkpoint(&self, handle: &Handle) -> Result<u64> {
        // The serialization must cover the full delta log; bring the handle
        // forward first so the target sequence equals the log head.
        self.refresh(handle)?;
        let snapshot_seq = self.checkpoint_write(handle)?;
        self.checkpoint_finalize(snapshot_seq, snapshot_seq)?;
        handle.note_checkpoint(snapshot_seq);
        Ok(snapshot_seq)
    }

    /// Phase one: serialize the handle's index and write it as chunks, in
    /// bounded batches, tracking progress in the pending record. Returns
    /// the target `snapshot_seq` to pass to [`Domain::checkpoint_finalize`].
    ///
    /// On `MapFull` the pending record survives with the last committed
    /// cursor; any other failure deletes it best-effort so the next attempt
    /// starts clean.
    pub fn checkpoint_write(&self, handle: &Handle) -> Result<u64> {
        {
            let txn = self.env.begin_read()?;
            if let Some(pending) = self.meta.checkpoint_pending(&*txn)? {
                if pending.stage() != Some(CheckpointStage::None) {
                    return Err(Error::Busy("a checkpoint is already in flight"));
                }
            }
        }

        let (stream, snapshot_seq) = handle.serialize_with_baseline()?;
        let writer = Token::mint();

        let (chunk_bytes, batch) = {
            let txn = self.env.begin_read()?;
            let chunk_bytes = self.meta.get_u32(&*txn, keys::CHUNK_BYTES, 1 << 20)?.max(1);
            let batch = self.meta.get_u32(&*txn, keys::CHECKPOINT_CHUNK_BATCH, 8)?.max(1);
            (chunk_bytes as usize, batch as usize)
        };

        self.commit_write(|domain, txn| {
            domain.meta.put_checkpoint_pending(
                txn,
                CheckpointPending::new(CheckpointStage::Init, 0, snapshot_seq, writer),
            )
        })?;

        let chunks: Vec<&[u8]> = stream.chunks(chunk_bytes).collect();
        let result = self.write_chunks(&chunks, batch, snapshot_seq, writer);
        match result {
            Ok(()) => Ok(snapshot_seq),
            Err(err) if err.is_map_full() => {
                warn!(
                    domain = %self.name,
                    snapshot_seq,
                    "checkpoint hit map-full; pending record preserved for retry after growth"
                );
                Err(err)
            }
            Err(err) => {
                // Leave nothing behind on ordinary failures.
                let _ = self.commit_write(|domain, txn| {
                    domain.meta.del_checkpoint_pending(txn)?;
                    Ok(())
                });
                Err(err)
            }
        }
    }

    fn write_chunks(
        &self,
        chunks: &[&[u8]],
        batch: usize,
        snapshot_seq: u64,
        writer: Token,
    ) -> Result<()> {
        if chunks.is_empty() {
            // An empty index still transitions to WRITING so finalize has a
            // complete (zero-chunk) snapshot to land.
            return self.commit_write(|domain, txn| {
                domain.meta.put_checkpoint_pending(
                    txn,
                    CheckpointPending::new(CheckpointStage::Writing, 0, snapshot_seq, writer),
                )
            });
        }
        let mut cursor = 0usize;
        while cursor < chunks.len() {
            let upto = (cursor + batch).min(chunks.len());
            self.commit_write(|domain, txn| {
                for ordinal in cursor..upto {
                    domain.snapshots.store_chunk(
                        txn,
                        snapshot_seq,
                        ordinal as u32,
                        chunks[ordinal],
                    )?;
                }
                domain.meta.put_checkpoint_pending(
                    txn,
                    CheckpointPending::new(
                        CheckpointStage::Writing,
                        upto as u32,
                        snapshot_seq,
                        writer,
                    ),
                )
            })?;
            cursor = upto;
        }
        Ok(())
    }

    /// Phase two: advance `(snapshot_seq, log_seq)`, prune the delta log up
    /// to `prune_log_seq`, trim snapshot history per retention, and clear
    /// the pending record — all in one KV transaction.
    ///
    /// `prune_log_seq` must be at least `snapshot_seq`. Live reader pins
    /// clamp both the prune bound and the retention floor.
    pub fn checkpoint_finalize(&self, snapshot_seq: u64, prune_log_seq: u64) -> Result<()> {
        if prune_log_seq < snapshot_seq {
            return Err(Error::InvalidArgument("prune_log_seq below the target snapshot_seq"));
        }
        self.commit_write(|domain, txn| domain.finalize_in(txn, snapshot_seq, prune_log_seq))
    }

    fn finalize_in(
        &self,
        txn: &mut dyn KvWrite,
        snapshot_seq: u64,
        prune_log_seq: u64,
    ) -> Result<()> {
        let pending = self
            .meta
            .checkpoint_pending(&*txn)?
            .ok_or(Error::NotFound("checkpoint pending record"))?;
        if pending.snapshot_seq != snapshot_seq {
            return Err(Error::Busy("pending checkpoint targets a different snapshot"));
        }
        match pending.stage() {
            Some(CheckpointStage::Writing) | Some(CheckpointStage::Finalizing) => {}
            _ => return Err(Error::Busy("checkpoint is not ready to finalize")),
        }
        self.meta.put_checkpoint_pending(
            txn,
            CheckpointPending::new(
                CheckpointStage::Finalizing,
                pending.chunk_cursor,
                snapshot_seq,
                pending.writer,
            ),
        )?;

        let floors = self.pin_floors()?;
        let mut prune_upto = prune_log_seq;
        if let Some(f) = floors {
            prune_upto = prune_upto.min(f.log_seq.saturating_sub(1));
        }

        self.meta.put_u64(txn, keys::SNAPSHOT_SEQ, snapshot_seq)?;
        self.meta.put_u64(txn, keys::LOG_SEQ, snapshot_seq)?;
        let pruned = self.delta.prune_upto(txn, prune_upto)?;
        self.meta.put_u64(txn, keys::LOG_TAIL_SEQ, prune_upto)?;

        let retention = self.meta.get_u32(&*txn, keys::SNAPSHOT_RETENTION_COUNT, 2)? as u64;
        let mut floor = if retention > 0 && snapshot_seq + 1 > retention {
            snapshot_seq + 1 - retention
        } else {
            0
        };
        if let Some(f) = floors {
            floor = floor.min(f.snapshot_seq);
        }
        let trimmed = self.snapshots.delete_before(txn, floor)?;
        self.meta.put_u64(txn, keys::SNAPSHOT_RETAINED_FLOOR, floor)?;

        self.meta.del_checkpoint_pending(txn)?;
        info!(
            domain = %self.name,
            snapshot_seq,
            prune_log_seq = prune_upto,
            pruned,
            retained_floor = floor,
            trimmed,
            "checkpoint finalized"
        );
        Ok(())
    }

    /// Open-time recovery. Discards a checkpoint that died before its
    /// chunks completed; finishes one that died mid-finalize; drops a
    /// record it cannot interpret.
    pub(crate) fn checkpoint_recover(&self) -> Result<()> {
        let pending = {
            let txn = self.env.begin_read()?;
            self.meta.checkpoint_pending(&*txn)?
        };
        let Some(pending) = pending else {
            return Ok(());
        };
        match pending.stage() {
            Some(CheckpointStage::Init) | Some(CheckpointStage::Writing) => {
                let snapshot_seq = pending.snapshot_seq;
                self.commit_write(|domain, txn| {
                    let discarded = domain.snapshots.delete_from(txn, snapshot_seq, 0)?;
                    domain.meta.del_checkpoint_pending(txn)?;
                    info!(
                        domain = %domain.name,
                        snapshot_seq,
                        discarded,
                        "discarded partial checkpoint"
                    );
                    Ok(())
                })
            }
            Some(CheckpointStage::Finalizing) => {
                info!(
                    domain = %self.name,
                    snapshot_seq = pending.snapshot_seq,
                    "resuming checkpoint finalize"
                );
                self.checkpoint_finalize(pending.snapshot_seq, pending.snapshot_seq)
            }
            Some(CheckpointStage::None) | None => self.commit_write(|domain, txn| {
                warn!(domain = %domain.name, "dropping unrecognized checkpoint pending record");
                domain.meta.del_checkpoint_pending(txn)?;
                Ok(())
            }),
        }
    }

    /// Run `body` in a write transaction, committing on success and
    /// aborting on failure.
    pub(crate) fn commit_write(
        &self,
        body: impl FnOnce(&Domain, &mut dyn KvWrite) -> Result<()>,
    ) -> Result<()> {
        let mut txn = self.env.begin_write()?;
        match body(self, &mut *txn) {
            Ok(()) => txn.commit(),
            Err(err) => {
                txn.abort();
                Err(err)
            }
        }
    }
}
