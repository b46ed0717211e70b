//! Domain controller
//!
//! One domain per (KV environment, domain name, filesystem root) triple. The
//! domain owns its three sub-databases (`{name}/usearch-meta`,
//! `{name}/usearch-delta`, `{name}/usearch-snapshot`), the pending WAL
//! directory, and the reader-pin file, and runs the two recovery passes on
//! every open: checkpoint recovery first, then WAL recovery, both before any
//! handle can be activated.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{debug, info};

use annex_core::error::{Error, Result};
use annex_core::index::IndexFactory;
use annex_core::kv::KvEngine;
use annex_core::types::{now_millis, Token};
use annex_durability::recovery::scan_pending;
use annex_durability::replay::{replay_wal_file, ReplayOutcome};
use annex_storage::meta::{keys, MetaStore, PublishMarker};
use annex_storage::pins::{PinFile, PinFloors};
use annex_storage::{DeltaLog, SnapshotCatalog};

use crate::flat::FlatIndexFactory;
use crate::handle::HandleCell;

/// Schema version this implementation reads and writes.
pub const SCHEMA_VERSION: u64 = 1;

/// Name of the reader-pin file under the filesystem root.
const PIN_FILE_NAME: &str = "reader-pins.lock";

/// Name of the pending WAL directory under the filesystem root.
const PENDING_DIR_NAME: &str = "pending";

/// Open-time configuration.
///
/// The three persisted knobs seed the meta store on first open only; a
/// reopened domain keeps whatever is stored. Pin TTL and heartbeat are
/// process-local.
#[derive(Debug, Clone, Copy)]
pub struct DomainOptions {
    /// Max payload bytes per snapshot chunk
    pub chunk_bytes: u32,
    /// Chunks written per checkpoint sub-transaction
    pub checkpoint_chunk_batch: u32,
    /// Snapshots to retain after finalize
    pub snapshot_retention_count: u32,
    /// Reader pin lifetime granted by `pin_reader`/`touch_reader`
    pub pin_ttl_ms: i64,
    /// Suggested interval between `touch_reader` calls
    pub pin_heartbeat_ms: i64,
}

impl Default for DomainOptions {
    fn default() -> Self {
        DomainOptions {
            chunk_bytes: 1 << 20,
            checkpoint_chunk_batch: 8,
            snapshot_retention_count: 2,
            pin_ttl_ms: 60_000,
            pin_heartbeat_ms: 5_000,
        }
    }
}

// One active domain object per (env, name) pair, process-wide.
static ACTIVE_DOMAINS: Lazy<Mutex<HashSet<(usize, String)>>> = Lazy::new(Default::default);

struct DomainClaim {
    key: (usize, String),
}

impl DomainClaim {
    fn acquire(env: &Arc<dyn KvEngine>, name: &str) -> Result<Self> {
        let key = (Arc::as_ptr(env) as *const () as usize, name.to_string());
        if !ACTIVE_DOMAINS.lock().insert(key.clone()) {
            return Err(Error::Busy("domain is already open on this environment"));
        }
        Ok(DomainClaim { key })
    }
}

impl Drop for DomainClaim {
    fn drop(&mut self) {
        ACTIVE_DOMAINS.lock().remove(&self.key);
    }
}

/// A crash-safe vector-index persistence domain.
pub struct Domain {
    pub(crate) env: Arc<dyn KvEngine>,
    pub(crate) name: String,
    pub(crate) meta: MetaStore,
    pub(crate) delta: DeltaLog,
    pub(crate) snapshots: SnapshotCatalog,
    pub(crate) pins: Mutex<PinFile>,
    pub(crate) pending_dir: PathBuf,
    pub(crate) factory: Arc<dyn IndexFactory>,
    pub(crate) handles: Mutex<Vec<Weak<Mutex<HandleCell>>>>,
    pub(crate) options: DomainOptions,
    _claim: DomainClaim,
}

impl std::fmt::Debug for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Domain").field("name", &self.name).finish_non_exhaustive()
    }
}

impl Domain {
    /// Open a domain with the flat index factory.
    pub fn open(
        env: Arc<dyn KvEngine>,
        name: &str,
        filesystem_root: &Path,
        options: DomainOptions,
    ) -> Result<Self> {
        Self::open_with_factory(env, name, filesystem_root, options, Arc::new(FlatIndexFactory))
    }

    /// Open a domain with a caller-supplied index factory.
    ///
    /// Creates sub-databases and filesystem state as needed, validates the
    /// schema version, seeds defaulted knobs, then runs checkpoint recovery
    /// followed by WAL recovery.
    pub fn open_with_factory(
        env: Arc<dyn KvEngine>,
        name: &str,
        filesystem_root: &Path,
        options: DomainOptions,
        factory: Arc<dyn IndexFactory>,
    ) -> Result<Self> {
        if name.is_empty() {
            return Err(Error::InvalidArgument("domain name must be nonempty"));
        }
        let claim = DomainClaim::acquire(&env, name)?;

        let pending_dir = filesystem_root.join(PENDING_DIR_NAME);
        fs::create_dir_all(&pending_dir)?;
        let pins = PinFile::open(&filesystem_root.join(PIN_FILE_NAME))?;

        let meta = MetaStore::new(env.open_dbi(&format!("{name}/usearch-meta"))?);
        let delta = DeltaLog::new(env.open_dbi(&format!("{name}/usearch-delta"))?);
        let snapshots = SnapshotCatalog::new(env.open_dbi(&format!("{name}/usearch-snapshot"))?);

        let domain = Domain {
            env,
            name: name.to_string(),
            meta,
            delta,
            snapshots,
            pins: Mutex::new(pins),
            pending_dir,
            factory,
            handles: Mutex::new(Vec::new()),
            options,
            _claim: claim,
        };

        domain.init_meta()?;
        domain.checkpoint_recover()?;
        domain.recover_wal()?;
        info!(domain = %domain.name, "domain opened");
        Ok(domain)
    }

    fn init_meta(&self) -> Result<()> {
        let mut txn = self.env.begin_write()?;
        let result = (|| {
            let version = self.meta.get_u64(&*txn, keys::SCHEMA_VERSION, 0)?;
            if version != 0 && version != SCHEMA_VERSION {
                return Err(Error::Corruption(format!(
                    "domain schema version {version}, this build supports {SCHEMA_VERSION}"
                )));
            }
            self.meta.put_u64(&mut *txn, keys::SCHEMA_VERSION, SCHEMA_VERSION)?;
            self.meta.ensure_u64(&mut *txn, keys::LOG_SEQ, 0)?;
            self.meta.ensure_u64(&mut *txn, keys::SNAPSHOT_SEQ, 0)?;
            self.meta.ensure_u64(&mut *txn, keys::LOG_TAIL_SEQ, 0)?;
            self.meta.ensure_u64(&mut *txn, keys::SNAPSHOT_RETAINED_FLOOR, 0)?;
            self.meta.ensure_u32(&mut *txn, keys::CHUNK_BYTES, self.options.chunk_bytes)?;
            self.meta.ensure_u32(
                &mut *txn,
                keys::CHECKPOINT_CHUNK_BATCH,
                self.options.checkpoint_chunk_batch,
            )?;
            self.meta.ensure_u32(
                &mut *txn,
                keys::SNAPSHOT_RETENTION_COUNT,
                self.options.snapshot_retention_count,
            )?;
            Ok(())
        })();
        match result {
            Ok(()) => txn.commit(),
            Err(err) => {
                txn.abort();
                Err(err)
            }
        }
    }

    /// WAL recovery: match the pending directory against the sealed marker
    /// and replay whatever survived, resuming at `published_log_tail`.
    fn recover_wal(&self) -> Result<()> {
        let sealed = {
            let txn = self.env.begin_read()?;
            self.meta.seal_marker(&*txn)?
        };
        let Some(sealed) = sealed else {
            return Ok(());
        };
        let Some(ready) = scan_pending(&self.pending_dir, sealed.token)? else {
            debug!(domain = %self.name, "no pending WAL to replay");
            return Ok(());
        };
        let start = {
            let txn = self.env.begin_read()?;
            match self.meta.publish_marker(&*txn)? {
                Some(marker) if marker.token == sealed.token => marker.ordinal + 1,
                _ => 1,
            }
        };
        let outcome = self.replay_ready(&ready, sealed.token, start, true, None)?;
        info!(
            domain = %self.name,
            token = %sealed.token,
            frames = outcome.frames_applied,
            "recovered sealed WAL"
        );
        Ok(())
    }

    /// Replay a ready WAL file into the live handles, advancing
    /// `published_log_tail` in its own KV transaction per frame so a crash
    /// mid-replay resumes where it stopped.
    pub(crate) fn replay_ready(
        &self,
        path: &Path,
        token: Token,
        start_ordinal: u32,
        unlink_after: bool,
        log_seq_hint: Option<u64>,
    ) -> Result<ReplayOutcome> {
        replay_wal_file(path, token, start_ordinal, unlink_after, &mut |ordinal, record| {
            let log_seq = log_seq_hint.map(|hint| hint + ordinal as u64 - 1);
            self.apply_to_handles(record, log_seq)?;
            let mut txn = self.env.begin_write()?;
            self.meta.put_publish_marker(&mut *txn, PublishMarker { token, ordinal })?;
            txn.commit()
        })
    }

    /// Domain name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The KV engine this domain is layered on; the caller begins host
    /// transactions here.
    pub fn env(&self) -> &Arc<dyn KvEngine> {
        &self.env
    }

    /// Open-time options.
    pub fn options(&self) -> &DomainOptions {
        &self.options
    }

    /// Persist index construction parameters. Activation requires them.
    pub fn put_init_options(&self, options: &annex_core::index::IndexOptions) -> Result<()> {
        let mut txn = self.env.begin_write()?;
        match self.meta.put_init_options(&mut *txn, options) {
            Ok(()) => txn.commit(),
            Err(err) => {
                txn.abort();
                Err(err)
            }
        }
    }

    /// Read the persisted index construction parameters.
    pub fn init_options(&self) -> Result<Option<annex_core::index::IndexOptions>> {
        let txn = self.env.begin_read()?;
        self.meta.init_options(&*txn)
    }

    /// Current `(snapshot_seq, log_seq)` pair.
    pub fn sequences(&self) -> Result<(u64, u64)> {
        let txn = self.env.begin_read()?;
        let snapshot_seq = self.meta.get_u64(&*txn, keys::SNAPSHOT_SEQ, 0)?;
        let log_seq = self.meta.get_u64(&*txn, keys::LOG_SEQ, 0)?;
        Ok((snapshot_seq, log_seq))
    }

    /// Pin `(snapshot_seq, log_seq)` for a reader for one TTL.
    pub fn pin_reader(&self, reader: Token, snapshot_seq: u64, log_seq: u64) -> Result<()> {
        let now = now_millis();
        self.pins.lock().pin(reader, snapshot_seq, log_seq, now + self.options.pin_ttl_ms, now)
    }

    /// Extend a reader's pin by one TTL (the heartbeat call).
    pub fn touch_reader(&self, reader: Token) -> Result<()> {
        self.pins.lock().touch(reader, now_millis() + self.options.pin_ttl_ms)
    }

    /// Release a reader's pin. Missing is not an error.
    pub fn release_reader(&self, reader: Token) -> Result<()> {
        self.pins.lock().release(reader)
    }

    /// Retention floors from currently live pins.
    pub(crate) fn pin_floors(&self) -> Result<Option<PinFloors>> {
        self.pins.lock().floors(now_millis())
    }

    /// Deactivate remaining handles and close the domain.
    pub fn close(self) {
        let dropped = self.deactivate_all();
        if dropped > 0 {
            debug!(domain = %self.name, handles = dropped, "deactivated handles at close");
        }
        info!(domain = %self.name, "domain closed");
    }
}

impl Drop for Domain {
    fn drop(&mut self) {
        self.deactivate_all();
    }
}
