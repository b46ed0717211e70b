//! Snapshot catalog
//!
//! Chunked storage of serialized indexes in the `{domain}/usearch-snapshot`
//! sub-database. Keys are 12 bytes: `snapshot_seq` (u64 BE) followed by
//! `chunk_ordinal` (u32 BE), so one snapshot's chunks are contiguous under
//! the engine's lexicographic ordering and ordinals run `0..N-1`.
//!
//! # Chunk Value Layout
//!
//! ```text
//! ┌─────────┬──────────┬──────────────┬───────────────┬─────────┬────────────┐
//! │ ver (1) │ res (1)  │ hdr_len (2)  │ chunk_len (4) │ crc (4) │ chunk bytes│
//! └─────────┴──────────┴──────────────┴───────────────┴─────────┴────────────┘
//! ```
//!
//! The CRC-32C covers the chunk bytes. Concatenating payloads in ordinal
//! order reconstructs the serialized-index byte stream.

use tracing::debug;

use annex_core::bytes;
use annex_core::error::{Error, Result};
use annex_core::kv::{self, Dbi, KeyScan, KvRead, KvWrite};

/// Length of the chunk value header.
pub const CHUNK_HEADER_LEN: usize = 12;

/// Current chunk format version.
pub const CHUNK_FORMAT_VERSION: u8 = 1;

/// Length of a chunk key.
const CHUNK_KEY_LEN: usize = 12;

/// Typed facade over the snapshot sub-database.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotCatalog {
    dbi: Dbi,
}

impl SnapshotCatalog {
    /// Wrap the opened snapshot sub-database.
    pub fn new(dbi: Dbi) -> Self {
        SnapshotCatalog { dbi }
    }

    fn chunk_key(snapshot_seq: u64, chunk_ordinal: u32) -> [u8; CHUNK_KEY_LEN] {
        let mut key = [0u8; CHUNK_KEY_LEN];
        bytes::put_u64(&mut key, 0, snapshot_seq);
        bytes::put_u32(&mut key, 8, chunk_ordinal);
        key
    }

    fn decode_key(key: &[u8]) -> Result<(u64, u32)> {
        if key.len() != CHUNK_KEY_LEN {
            return Err(Error::Corruption(format!(
                "snapshot chunk key is {} bytes, expected {CHUNK_KEY_LEN}",
                key.len()
            )));
        }
        Ok((bytes::get_u64(key, 0), bytes::get_u32(key, 8)))
    }

    /// Store one chunk of a snapshot's serialized-index stream.
    pub fn store_chunk(
        &self,
        txn: &mut dyn KvWrite,
        snapshot_seq: u64,
        chunk_ordinal: u32,
        chunk: &[u8],
    ) -> Result<()> {
        if chunk.len() > u32::MAX as usize {
            return Err(Error::InvalidArgument("snapshot chunk exceeds 4 GiB"));
        }
        let mut value = vec![0u8; CHUNK_HEADER_LEN + chunk.len()];
        value[0] = CHUNK_FORMAT_VERSION;
        // value[1] reserved
        bytes::put_u16(&mut value, 2, CHUNK_HEADER_LEN as u16);
        bytes::put_u32(&mut value, 4, chunk.len() as u32);
        bytes::put_u32(&mut value, 8, bytes::crc32c(chunk));
        value[CHUNK_HEADER_LEN..].copy_from_slice(chunk);
        txn.put(self.dbi, &Self::chunk_key(snapshot_seq, chunk_ordinal), &value)
    }

    fn decode_chunk(value: &[u8], snapshot_seq: u64, ordinal: u32) -> Result<&[u8]> {
        if value.len() < CHUNK_HEADER_LEN {
            return Err(Error::Corruption(format!(
                "snapshot {snapshot_seq} chunk {ordinal} truncated at {} bytes",
                value.len()
            )));
        }
        if value[0] != CHUNK_FORMAT_VERSION {
            return Err(Error::Corruption(format!(
                "snapshot {snapshot_seq} chunk {ordinal} version {}",
                value[0]
            )));
        }
        let header_len = bytes::get_u16(value, 2) as usize;
        if header_len != CHUNK_HEADER_LEN {
            return Err(Error::Corruption(format!(
                "snapshot {snapshot_seq} chunk {ordinal} header length {header_len}"
            )));
        }
        let chunk_len = bytes::get_u32(value, 4) as usize;
        if value.len() != CHUNK_HEADER_LEN + chunk_len {
            return Err(Error::Corruption(format!(
                "snapshot {snapshot_seq} chunk {ordinal} declares {chunk_len} bytes, holds {}",
                value.len() - CHUNK_HEADER_LEN
            )));
        }
        let chunk = &value[CHUNK_HEADER_LEN..];
        bytes::verify_crc32c(chunk, bytes::get_u32(value, 8), "snapshot chunk")?;
        Ok(chunk)
    }

    /// Load a snapshot's full serialized-index stream.
    ///
    /// Returns `None` when no chunks exist for `snapshot_seq`. Ordinal gaps,
    /// version or length mismatches, and CRC failures are corruption.
    pub fn load(&self, txn: &(impl KvRead + ?Sized), snapshot_seq: u64) -> Result<Option<Vec<u8>>> {
        let mut stream: Option<Vec<u8>> = None;
        let mut expected_ordinal = 0u32;
        let mut failure: Option<Error> = None;
        txn.scan_from(self.dbi, &Self::chunk_key(snapshot_seq, 0), &mut |key, value| {
            let (seq, ordinal) = match Self::decode_key(key) {
                Ok(decoded) => decoded,
                Err(err) => {
                    failure = Some(err);
                    return Ok(false);
                }
            };
            if seq != snapshot_seq {
                return Ok(false);
            }
            if ordinal != expected_ordinal {
                failure = Some(Error::Corruption(format!(
                    "snapshot {snapshot_seq} chunk ordinal {ordinal} where {expected_ordinal} was expected"
                )));
                return Ok(false);
            }
            match Self::decode_chunk(value, snapshot_seq, ordinal) {
                Ok(chunk) => {
                    stream.get_or_insert_with(Vec::new).extend_from_slice(chunk);
                    expected_ordinal += 1;
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
            None => Ok(stream),
        }
    }

    /// Delete chunks of `snapshot_seq` with `chunk_ordinal >= chunk_start`.
    /// Recovery uses this to discard partial snapshots.
    pub fn delete_from(
        &self,
        txn: &mut dyn KvWrite,
        snapshot_seq: u64,
        chunk_start: u32,
    ) -> Result<u64> {
        let keys = kv::collect_keys(
            &*txn,
            self.dbi,
            &Self::chunk_key(snapshot_seq, chunk_start),
            &mut |key| match Self::decode_key(key) {
                Ok((seq, _)) if seq == snapshot_seq => KeyScan::Take,
                _ => KeyScan::Stop,
            },
        )?;
        let mut removed = 0u64;
        for key in keys {
            if txn.del(self.dbi, &key)? {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(snapshot_seq, chunk_start, removed, "discarded snapshot chunks");
        }
        Ok(removed)
    }

    /// Delete every chunk whose `snapshot_seq < floor_seq`. Retention trim.
    pub fn delete_before(&self, txn: &mut dyn KvWrite, floor_seq: u64) -> Result<u64> {
        let keys = kv::collect_keys(&*txn, self.dbi, &Self::chunk_key(0, 0), &mut |key| {
            match Self::decode_key(key) {
                Ok((seq, _)) if seq < floor_seq => KeyScan::Take,
                _ => KeyScan::Stop,
            }
        })?;
        let mut removed = 0u64;
        for key in keys {
            if txn.del(self.dbi, &key)? {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(floor_seq, removed, "trimmed snapshot history");
        }
        Ok(removed)
    }
}
