//! Metadata store
//!
//! A typed facade over point get/put/del on the `{domain}/usearch-meta`
//! sub-database. Keys are NUL-terminated ASCII names; values are fixed-width
//! big-endian records. Reads of missing keys return a caller-supplied
//! default; writes are always full-record overwrites.

use annex_core::bytes;
use annex_core::error::{Error, Result};
use annex_core::index::{IndexOptions, INIT_OPTIONS_LEN};
use annex_core::kv::{Dbi, KvRead, KvWrite};
use annex_core::types::Token;

/// Recognized metadata key names.
pub mod keys {
    /// Schema version; must equal 1 on activate
    pub const SCHEMA_VERSION: &str = "schema_version";
    /// 44-byte packed index construction parameters
    pub const INIT: &str = "init";
    /// Chunk size for snapshot serialization
    pub const CHUNK_BYTES: &str = "chunk_bytes";
    /// Chunks written per sub-transaction during checkpoint
    pub const CHECKPOINT_CHUNK_BATCH: &str = "checkpoint_chunk_batch";
    /// Snapshots to retain
    pub const SNAPSHOT_RETENTION_COUNT: &str = "snapshot_retention_count";
    /// Oldest snapshot_seq still retained
    pub const SNAPSHOT_RETAINED_FLOOR: &str = "snapshot_retained_floor";
    /// Most recent finalized snapshot
    pub const SNAPSHOT_SEQ: &str = "snapshot_seq";
    /// Head of the delta log (last assigned)
    pub const LOG_SEQ: &str = "log_seq";
    /// Highest log_seq pruned by a checkpoint
    pub const LOG_TAIL_SEQ: &str = "log_tail_seq";
    /// Seal marker written with the host commit
    pub const SEALED_LOG_SEQ: &str = "sealed_log_seq";
    /// Publish progress marker advanced per replayed frame
    pub const PUBLISHED_LOG_TAIL: &str = "published_log_tail";
    /// Resumable checkpoint record
    pub const CHECKPOINT_PENDING: &str = "checkpoint_pending";
}

/// Length of the seal and publish markers.
const MARKER_LEN: usize = 24;

/// Length of the checkpoint pending record.
const PENDING_LEN: usize = 32;

/// Current checkpoint pending record format version.
const PENDING_VERSION: u8 = 1;

/// `sealed_log_seq` record: the token of the sealed WAL and the `log_seq`
/// of its last frame. Durable exactly when the host transaction commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SealMarker {
    /// Token of the sealed WAL file
    pub token: Token,
    /// `log_seq` assigned to the last staged update
    pub log_seq: u64,
}

/// `published_log_tail` record: how far replay of the sealed WAL got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishMarker {
    /// Token of the WAL being replayed
    pub token: Token,
    /// Ordinal of the last frame applied to live handles
    pub ordinal: u32,
}

/// Stage of a resumable checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CheckpointStage {
    /// Record present but checkpoint idle
    None,
    /// Chunk writing not yet begun
    Init,
    /// Zero or more chunks written
    Writing,
    /// Chunks complete; metadata advance and pruning in progress
    Finalizing,
}

impl CheckpointStage {
    /// Wire discriminant.
    pub fn as_byte(self) -> u8 {
        match self {
            CheckpointStage::None => 0,
            CheckpointStage::Init => 1,
            CheckpointStage::Writing => 2,
            CheckpointStage::Finalizing => 3,
        }
    }
}

/// `checkpoint_pending` record.
///
/// The stage byte is kept raw so recovery can treat an unknown stage as
/// "delete the record" instead of refusing to open the domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointPending {
    stage_byte: u8,
    /// Count of chunks successfully written
    pub chunk_cursor: u32,
    /// Target snapshot sequence
    pub snapshot_seq: u64,
    /// Token of the writer that started this checkpoint
    pub writer: Token,
}

impl CheckpointPending {
    /// Build a record for a known stage.
    pub fn new(stage: CheckpointStage, chunk_cursor: u32, snapshot_seq: u64, writer: Token) -> Self {
        CheckpointPending { stage_byte: stage.as_byte(), chunk_cursor, snapshot_seq, writer }
    }

    /// Decode the stage byte; `None` for unknown values.
    pub fn stage(&self) -> Option<CheckpointStage> {
        match self.stage_byte {
            0 => Some(CheckpointStage::None),
            1 => Some(CheckpointStage::Init),
            2 => Some(CheckpointStage::Writing),
            3 => Some(CheckpointStage::Finalizing),
            _ => None,
        }
    }

    fn encode(&self) -> [u8; PENDING_LEN] {
        let mut buf = [0u8; PENDING_LEN];
        buf[0] = PENDING_VERSION;
        buf[1] = self.stage_byte;
        // buf[2..4] reserved
        bytes::put_u32(&mut buf, 4, self.chunk_cursor);
        bytes::put_u64(&mut buf, 8, self.snapshot_seq);
        bytes::put_u64(&mut buf, 16, self.writer.hi);
        bytes::put_u64(&mut buf, 24, self.writer.lo);
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        bytes::expect_len(buf, PENDING_LEN, "checkpoint pending")?;
        if buf[0] != PENDING_VERSION {
            return Err(Error::Corruption(format!("checkpoint pending version {}", buf[0])));
        }
        Ok(CheckpointPending {
            stage_byte: buf[1],
            chunk_cursor: bytes::get_u32(buf, 4),
            snapshot_seq: bytes::get_u64(buf, 8),
            writer: Token { hi: bytes::get_u64(buf, 16), lo: bytes::get_u64(buf, 24) },
        })
    }
}

/// Typed facade over the meta sub-database.
#[derive(Debug, Clone, Copy)]
pub struct MetaStore {
    dbi: Dbi,
}

impl MetaStore {
    /// Wrap the opened meta sub-database.
    pub fn new(dbi: Dbi) -> Self {
        MetaStore { dbi }
    }

    fn key_bytes(name: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(name.len() + 1);
        key.extend_from_slice(name.as_bytes());
        key.push(0);
        key
    }

    /// Read a u64 record, or `default` when absent.
    pub fn get_u64(&self, txn: &(impl KvRead + ?Sized), name: &str, default: u64) -> Result<u64> {
        match txn.get(self.dbi, &Self::key_bytes(name))? {
            Some(value) => {
                bytes::expect_len(&value, 8, name)?;
                Ok(bytes::get_u64(&value, 0))
            }
            None => Ok(default),
        }
    }

    /// Overwrite a u64 record.
    pub fn put_u64(&self, txn: &mut dyn KvWrite, name: &str, value: u64) -> Result<()> {
        let mut buf = [0u8; 8];
        bytes::put_u64(&mut buf, 0, value);
        txn.put(self.dbi, &Self::key_bytes(name), &buf)
    }

    /// Read a u32 record, or `default` when absent.
    pub fn get_u32(&self, txn: &(impl KvRead + ?Sized), name: &str, default: u32) -> Result<u32> {
        match txn.get(self.dbi, &Self::key_bytes(name))? {
            Some(value) => {
                bytes::expect_len(&value, 4, name)?;
                Ok(bytes::get_u32(&value, 0))
            }
            None => Ok(default),
        }
    }

    /// Overwrite a u32 record.
    pub fn put_u32(&self, txn: &mut dyn KvWrite, name: &str, value: u32) -> Result<()> {
        let mut buf = [0u8; 4];
        bytes::put_u32(&mut buf, 0, value);
        txn.put(self.dbi, &Self::key_bytes(name), &buf)
    }

    /// Ensure a u64 knob exists, seeding `default` on first open.
    pub fn ensure_u64(&self, txn: &mut dyn KvWrite, name: &str, default: u64) -> Result<u64> {
        let value = self.get_u64(&*txn, name, default)?;
        self.put_u64(txn, name, value)?;
        Ok(value)
    }

    /// Ensure a u32 knob exists, seeding `default` on first open.
    pub fn ensure_u32(&self, txn: &mut dyn KvWrite, name: &str, default: u32) -> Result<u32> {
        let value = self.get_u32(&*txn, name, default)?;
        self.put_u32(txn, name, value)?;
        Ok(value)
    }

    /// Delete a record. Missing is not an error.
    pub fn del(&self, txn: &mut dyn KvWrite, name: &str) -> Result<bool> {
        txn.del(self.dbi, &Self::key_bytes(name))
    }

    /// Read the `sealed_log_seq` marker.
    pub fn seal_marker(&self, txn: &(impl KvRead + ?Sized)) -> Result<Option<SealMarker>> {
        match txn.get(self.dbi, &Self::key_bytes(keys::SEALED_LOG_SEQ))? {
            Some(value) => {
                bytes::expect_len(&value, MARKER_LEN, keys::SEALED_LOG_SEQ)?;
                Ok(Some(SealMarker {
                    token: Token { hi: bytes::get_u64(&value, 0), lo: bytes::get_u64(&value, 8) },
                    log_seq: bytes::get_u64(&value, 16),
                }))
            }
            None => Ok(None),
        }
    }

    /// Overwrite the `sealed_log_seq` marker.
    pub fn put_seal_marker(&self, txn: &mut dyn KvWrite, marker: SealMarker) -> Result<()> {
        let mut buf = [0u8; MARKER_LEN];
        bytes::put_u64(&mut buf, 0, marker.token.hi);
        bytes::put_u64(&mut buf, 8, marker.token.lo);
        bytes::put_u64(&mut buf, 16, marker.log_seq);
        txn.put(self.dbi, &Self::key_bytes(keys::SEALED_LOG_SEQ), &buf)
    }

    /// Read the `published_log_tail` marker.
    pub fn publish_marker(&self, txn: &(impl KvRead + ?Sized)) -> Result<Option<PublishMarker>> {
        match txn.get(self.dbi, &Self::key_bytes(keys::PUBLISHED_LOG_TAIL))? {
            Some(value) => {
                bytes::expect_len(&value, MARKER_LEN, keys::PUBLISHED_LOG_TAIL)?;
                Ok(Some(PublishMarker {
                    token: Token { hi: bytes::get_u64(&value, 0), lo: bytes::get_u64(&value, 8) },
                    ordinal: bytes::get_u32(&value, 16),
                }))
            }
            None => Ok(None),
        }
    }

    /// Overwrite the `published_log_tail` marker.
    pub fn put_publish_marker(&self, txn: &mut dyn KvWrite, marker: PublishMarker) -> Result<()> {
        let mut buf = [0u8; MARKER_LEN];
        bytes::put_u64(&mut buf, 0, marker.token.hi);
        bytes::put_u64(&mut buf, 8, marker.token.lo);
        bytes::put_u32(&mut buf, 16, marker.ordinal);
        // buf[20..24] reserved
        txn.put(self.dbi, &Self::key_bytes(keys::PUBLISHED_LOG_TAIL), &buf)
    }

    /// Read the init options record; `None` before the first write.
    pub fn init_options(&self, txn: &(impl KvRead + ?Sized)) -> Result<Option<IndexOptions>> {
        match txn.get(self.dbi, &Self::key_bytes(keys::INIT))? {
            Some(value) => {
                bytes::expect_len(&value, INIT_OPTIONS_LEN, keys::INIT)?;
                Ok(Some(IndexOptions::decode(&value)?))
            }
            None => Ok(None),
        }
    }

    /// Overwrite the init options record.
    pub fn put_init_options(&self, txn: &mut dyn KvWrite, options: &IndexOptions) -> Result<()> {
        txn.put(self.dbi, &Self::key_bytes(keys::INIT), &options.encode())
    }

    /// Read the checkpoint pending record; `None` when idle.
    pub fn checkpoint_pending(&self, txn: &(impl KvRead + ?Sized)) -> Result<Option<CheckpointPending>> {
        match txn.get(self.dbi, &Self::key_bytes(keys::CHECKPOINT_PENDING))? {
            Some(value) => Ok(Some(CheckpointPending::decode(&value)?)),
            None => Ok(None),
        }
    }

    /// Overwrite the checkpoint pending record.
    pub fn put_checkpoint_pending(
        &self,
        txn: &mut dyn KvWrite,
        pending: CheckpointPending,
    ) -> Result<()> {
        txn.put(self.dbi, &Self::key_bytes(keys::CHECKPOINT_PENDING), &pending.encode())
    }

    /// Delete the checkpoint pending record.
    pub fn del_checkpoint_pending(&self, txn: &mut dyn KvWrite) -> Result<bool> {
        self.del(txn, keys::CHECKPOINT_PENDING)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use annex_core::index::{MetricKind, ScalarKind};
    use annex_core::kv::KvEngine;
    use annex_core::testing::MemKv;

    fn setup() -> (MemKv, MetaStore) {
        let kv = MemKv::new();
        let dbi = kv.open_dbi("dom/usearch-meta").unwrap();
        (kv, MetaStore::new(dbi))
    }

    #[test]
    fn test_u64_default_and_overwrite() {
        let (kv, meta) = setup();
        let mut txn = kv.begin_write().unwrap();
        assert_eq!(meta.get_u64(&*txn, keys::LOG_SEQ, 7).unwrap(), 7);
        meta.put_u64(&mut *txn, keys::LOG_SEQ, 42).unwrap();
        assert_eq!(meta.get_u64(&*txn, keys::LOG_SEQ, 7).unwrap(), 42);
        txn.commit().unwrap();

        let read = kv.begin_read().unwrap();
        assert_eq!(meta.get_u64(&*read, keys::LOG_SEQ, 0).unwrap(), 42);
    }

    #[test]
    fn test_keys_are_nul_terminated() {
        let (kv, meta) = setup();
        let mut txn = kv.begin_write().unwrap();
        meta.put_u64(&mut *txn, keys::LOG_SEQ, 1).unwrap();
        // Raw lookup without the terminator misses; with it, hits.
        assert_eq!(txn.get(Dbi(0), b"log_seq").unwrap(), None);
        assert!(txn.get(Dbi(0), b"log_seq\0").unwrap().is_some());
        txn.abort();
    }

    #[test]
    fn test_wrong_width_is_corruption() {
        let (kv, meta) = setup();
        let mut txn = kv.begin_write().unwrap();
        txn.put(Dbi(0), b"log_seq\0", &[1, 2, 3]).unwrap();
        assert!(meta.get_u64(&*txn, keys::LOG_SEQ, 0).unwrap_err().is_corruption());
        txn.abort();
    }

    #[test]
    fn test_seal_marker_roundtrip() {
        let (kv, meta) = setup();
        let marker = SealMarker { token: Token { hi: 1, lo: 2 }, log_seq: 99 };
        let mut txn = kv.begin_write().unwrap();
        assert_eq!(meta.seal_marker(&*txn).unwrap(), None);
        meta.put_seal_marker(&mut *txn, marker).unwrap();
        assert_eq!(meta.seal_marker(&*txn).unwrap(), Some(marker));
        txn.commit().unwrap();
    }

    #[test]
    fn test_publish_marker_roundtrip() {
        let (kv, meta) = setup();
        let marker = PublishMarker { token: Token { hi: 3, lo: 4 }, ordinal: 17 };
        let mut txn = kv.begin_write().unwrap();
        meta.put_publish_marker(&mut *txn, marker).unwrap();
        assert_eq!(meta.publish_marker(&*txn).unwrap(), Some(marker));
        txn.abort();
    }

    #[test]
    fn test_init_options_roundtrip() {
        let (kv, meta) = setup();
        let options = IndexOptions {
            metric: MetricKind::L2Sq,
            scalar: ScalarKind::F32,
            dimensions: 128,
            connectivity: 16,
            expansion_add: 128,
            expansion_search: 64,
            multi: false,
        };
        let mut txn = kv.begin_write().unwrap();
        assert_eq!(meta.init_options(&*txn).unwrap(), None);
        meta.put_init_options(&mut *txn, &options).unwrap();
        assert_eq!(meta.init_options(&*txn).unwrap(), Some(options));
        txn.abort();
    }

    #[test]
    fn test_checkpoint_pending_roundtrip_and_unknown_stage() {
        let (kv, meta) = setup();
        let pending =
            CheckpointPending::new(CheckpointStage::Writing, 5, 12, Token { hi: 9, lo: 9 });
        let mut txn = kv.begin_write().unwrap();
        meta.put_checkpoint_pending(&mut *txn, pending).unwrap();
        let loaded = meta.checkpoint_pending(&*txn).unwrap().unwrap();
        assert_eq!(loaded, pending);
        assert_eq!(loaded.stage(), Some(CheckpointStage::Writing));

        // An unknown stage byte still decodes; the stage accessor says so.
        let mut raw = pending.encode();
        raw[1] = 0x7F;
        txn.put(Dbi(0), b"checkpoint_pending\0", &raw).unwrap();
        let loaded = meta.checkpoint_pending(&*txn).unwrap().unwrap();
        assert_eq!(loaded.stage(), None);

        assert!(meta.del_checkpoint_pending(&mut *txn).unwrap());
        assert_eq!(meta.checkpoint_pending(&*txn).unwrap(), None);
        txn.abort();
    }

    #[test]
    fn test_ensure_seeds_then_preserves() {
        let (kv, meta) = setup();
        let mut txn = kv.begin_write().unwrap();
        assert_eq!(meta.ensure_u32(&mut *txn, keys::CHUNK_BYTES, 1 << 20).unwrap(), 1 << 20);
        txn.commit().unwrap();

        let mut txn = kv.begin_write().unwrap();
        meta.put_u32(&mut *txn, keys::CHUNK_BYTES, 4096).unwrap();
        txn.commit().unwrap();

        // A later open must not clobber the persisted knob.
        let mut txn = kv.begin_write().unwrap();
        assert_eq!(meta.ensure_u32(&mut *txn, keys::CHUNK_BYTES, 1 << 20).unwrap(), 4096);
        txn.commit().unwrap();
    }
}
