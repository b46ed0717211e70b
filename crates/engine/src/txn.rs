//! Transaction context
//!
//! Per-host-transaction staging. The context is created lazily by the first
//! staged update, holds the WAL writer for the transaction's lifetime, and
//! coordinates the three-step lifecycle:
//!
//! 1. `stage` (any number of times): encode the update, append it to the
//!    delta log and the WAL, advance `log_seq` — all inside the host KV
//!    transaction.
//! 2. `apply_pending` (before the host commit): seal the WAL and write the
//!    `sealed_log_seq` marker, which becomes durable exactly when the host
//!    transaction commits.
//! 3. `publish` (after the host commit): mark the WAL ready, replay it into
//!    every live handle, advance `published_log_tail` per frame.
//!
//! `abort` deletes the WAL file so a dead transaction leaves nothing behind.
//! A staging failure does not abort the host transaction itself; the caller
//! aborts it and then aborts the context.

use tracing::debug;

use annex_core::delta::DeltaRecord;
use annex_core::error::{Error, Result};
use annex_core::kv::KvWrite;
use annex_core::types::{Token, Update};
use annex_durability::replay::ReplayOutcome;
use annex_durability::writer::WalWriter;
use annex_storage::meta::{keys, SealMarker};

use crate::domain::Domain;

/// Staging state for one host KV transaction.
pub struct TxnContext<'d> {
    domain: &'d Domain,
    txn_id: u64,
    wal: WalWriter,
    log_seq_head: u64,
    last_log_seq: u64,
    frames_appended: u32,
    sealed: bool,
}

impl Domain {
    /// Stage one update inside the host KV transaction `txn`.
    ///
    /// The first call creates the context in `ctx` (reading the current
    /// sequence baseline and opening a WAL writer); later calls must pass
    /// the same host transaction.
    pub fn stage<'d>(
        &'d self,
        txn: &mut dyn KvWrite,
        update: &Update<'_>,
        ctx: &mut Option<TxnContext<'d>>,
    ) -> Result<()> {
        update.validate()?;

        let context = match ctx {
            Some(context) => {
                if context.txn_id != txn.id() {
                    return Err(Error::InvalidArgument(
                        "update staged with a different host transaction",
                    ));
                }
                context
            }
            None => {
                let snapshot_seq = self.meta.get_u64(&*txn, keys::SNAPSHOT_SEQ, 0)?;
                let log_seq = self.meta.get_u64(&*txn, keys::LOG_SEQ, 0)?;
                let wal = WalWriter::open(&self.pending_dir, snapshot_seq, log_seq + 1)?;
                debug!(domain = %self.name, token = %wal.token(), "transaction context created");
                ctx.insert(TxnContext {
                    domain: self,
                    txn_id: txn.id(),
                    wal,
                    log_seq_head: log_seq,
                    last_log_seq: log_seq,
                    frames_appended: 0,
                    sealed: false,
                })
            }
        };
        if context.sealed {
            return Err(Error::Busy("transaction context is already sealed"));
        }

        let ordinal = context.frames_appended + 1;
        let encoded = DeltaRecord::encode_update(update, ordinal, context.wal.token());
        let next_seq = context.log_seq_head + 1;

        self.delta.append(txn, next_seq, &encoded)?;
        self.meta.put_u64(txn, keys::LOG_SEQ, next_seq)?;
        context.wal.append(&encoded)?;

        context.frames_appended = ordinal;
        context.log_seq_head = next_seq;
        context.last_log_seq = next_seq;
        Ok(())
    }
}

impl<'d> TxnContext<'d> {
    /// Seal the WAL and write the `sealed_log_seq` marker into the host
    /// transaction. Call once, after the last `stage` and before the host
    /// commit.
    pub fn apply_pending(&mut self, txn: &mut dyn KvWrite) -> Result<()> {
        if self.txn_id != txn.id() {
            return Err(Error::InvalidArgument(
                "apply_pending called with a different host transaction",
            ));
        }
        if self.frames_appended == 0 {
            return Err(Error::InvalidArgument("no updates staged in this transaction"));
        }
        if self.sealed {
            return Err(Error::Busy("transaction context is already sealed"));
        }
        self.wal.seal()?;
        self.domain.meta.put_seal_marker(
            txn,
            SealMarker { token: self.wal.token(), log_seq: self.last_log_seq },
        )?;
        self.sealed = true;
        Ok(())
    }

    /// Mark the WAL ready and replay it into every live handle. Call after
    /// the host transaction committed; consumes the context.
    ///
    /// Replay resumes past `published_log_tail` when it already refers to
    /// this context's token, so a republish after a partial crash applies
    /// each frame exactly once.
    pub fn publish(mut self, unlink_after: bool) -> Result<ReplayOutcome> {
        if !self.sealed {
            return Err(Error::InvalidArgument("publish before apply_pending"));
        }
        self.wal.mark_ready()?;

        let token = self.wal.token();
        let hint = self.wal.log_seq_hint();
        let start = {
            let txn = self.domain.env.begin_read()?;
            match self.domain.meta.publish_marker(&*txn)? {
                Some(marker) if marker.token == token => marker.ordinal + 1,
                _ => 1,
            }
        };
        let path = self.wal.ready_path().to_path_buf();
        self.domain.replay_ready(&path, token, start, unlink_after, Some(hint))
    }

    /// Drop the context and delete its WAL file. Used when the host
    /// transaction aborts, or after a staging failure.
    pub fn abort(self) {
        debug!(domain = %self.domain.name, token = %self.wal.token(), "transaction context aborted");
        self.wal.close(true);
    }

    /// Token binding this context to its WAL file.
    pub fn token(&self) -> Token {
        self.wal.token()
    }

    /// Frames appended so far.
    pub fn frames_appended(&self) -> u32 {
        self.frames_appended
    }

    /// `log_seq` of the most recently staged update.
    pub fn last_log_seq(&self) -> u64 {
        self.last_log_seq
    }
}
