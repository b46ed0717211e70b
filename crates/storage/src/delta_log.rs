//! Delta log
//!
//! Append-only sub-database of encoded update records keyed by the 8-byte
//! big-endian `log_seq`. Sequences are strictly increasing within and across
//! transactions, so appends never collide and the engine's lexicographic
//! ordering is numeric ordering.

use annex_core::delta::DeltaRecord;
use annex_core::error::{Error, Result};
use annex_core::kv::{self, Dbi, KeyScan, KvRead, KvWrite};

/// Typed facade over the delta sub-database.
#[derive(Debug, Clone, Copy)]
pub struct DeltaLog {
    dbi: Dbi,
}

impl DeltaLog {
    /// Wrap the opened delta sub-database.
    pub fn new(dbi: Dbi) -> Self {
        DeltaLog { dbi }
    }

    fn decode_key(key: &[u8]) -> Result<u64> {
        if key.len() != 8 {
            return Err(Error::Corruption(format!(
                "delta log key is {} bytes, expected 8",
                key.len()
            )));
        }
        Ok(u64::from_be_bytes(key.try_into().expect("length checked")))
    }

    /// Append an encoded record at `log_seq`. Unconditional put; uniqueness
    /// comes from sequence monotonicity.
    pub fn append(&self, txn: &mut dyn KvWrite, log_seq: u64, encoded: &[u8]) -> Result<()> {
        txn.put(self.dbi, &log_seq.to_be_bytes(), encoded)
    }

    /// Decode and visit records with `start_seq <= log_seq <= end_seq` in
    /// order. Any decode error stops the scan and surfaces unchanged.
    ///
    /// Returns the number of records visited.
    pub fn replay(
        &self,
        txn: &(impl KvRead + ?Sized),
        start_seq: u64,
        end_seq: u64,
        visit: &mut dyn FnMut(u64, DeltaRecord) -> Result<()>,
    ) -> Result<u64> {
        if start_seq > end_seq {
            return Ok(0);
        }
        let mut visited = 0u64;
        let mut failure: Option<Error> = None;
        txn.scan_from(self.dbi, &start_seq.to_be_bytes(), &mut |key, value| {
            let log_seq = match Self::decode_key(key) {
                Ok(seq) => seq,
                Err(err) => {
                    failure = Some(err);
                    return Ok(false);
                }
            };
            if log_seq > end_seq {
                return Ok(false);
            }
            match DeltaRecord::decode(value).and_then(|record| visit(log_seq, record)) {
                Ok(()) => {
                    visited += 1;
                    Ok(true)
                }
                Err(err) => {
                    failure = Some(err);
                    Ok(false)
                }
            }
        })?;
        match failure {
            Some(err) => Err(err),
            None => Ok(visited),
        }
    }

    /// Range-delete records with `log_seq <= upto_seq`. Returns how many
    /// were removed. Performed only as part of checkpoint finalization.
    pub fn prune_upto(&self, txn: &mut dyn KvWrite, upto_seq: u64) -> Result<u64> {
        let keys = kv::collect_keys(&*txn, self.dbi, &0u64.to_be_bytes(), &mut |key| {
            match Self::decode_key(key) {
                Ok(seq) if seq <= upto_seq => KeyScan::Take,
                _ => KeyScan::Stop,
            }
        })?;
        let mut removed = 0u64;
        for key in keys {
            if txn.del(self.dbi, &key)? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
