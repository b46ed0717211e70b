//! Reader-pin map
//!
//! A fixed-layout shared file (`reader-pins.lock`, 64 slots x 48 bytes)
//! memory-mapped read-write into every process that opens the domain. A pin
//! declares that snapshots >= `snapshot_seq` and delta entries >= `log_seq`
//! must be retained until the pin expires or is released; checkpoint
//! finalization consults the map before trimming.
//!
//! Every operation takes an exclusive OS file lock over the whole file for
//! its duration. Slots are written version-byte-last: zero the version,
//! copy bytes 1..47, then store the version, so a concurrent mapper that
//! observes a nonzero version sees a fully formed record.
//!
//! # Slot Layout (48 bytes, big-endian)
//!
//! ```text
//! ┌─────────┬──────────────┬───────────┬───────────┬───────────────┬───────────┬────────────────┐
//! │ ver (1) │ reserved (7) │ uuid hi 8 │ uuid lo 8 │ snap_seq (8)  │ log_seq 8 │ expires_ms (8) │
//! └─────────┴──────────────┴───────────┴───────────┴───────────────┴───────────┴────────────────┘
//! ```
//!
//! Version 0 means empty; `expires_at_ms` is interpreted signed.

use std::fs::OpenOptions;
use std::path::Path;

use fs2::FileExt;
use memmap2::MmapMut;
use tracing::warn;

use annex_core::bytes;
use annex_core::error::{Error, Result};
use annex_core::types::Token;

/// Bytes per pin slot.
pub const PIN_SLOT_LEN: usize = 48;

/// Number of slots in the pin file.
pub const PIN_SLOT_COUNT: usize = 64;

/// Total pin file length.
pub const PIN_FILE_LEN: usize = PIN_SLOT_LEN * PIN_SLOT_COUNT;

const SLOT_VERSION: u8 = 1;

/// Retention floors derived from the unexpired pins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinFloors {
    /// Minimum pinned snapshot sequence
    pub snapshot_seq: u64,
    /// Minimum pinned log sequence
    pub log_seq: u64,
}

/// One decoded, occupied pin slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinSlot {
    /// Reader identity
    pub reader: Token,
    /// Pinned snapshot sequence
    pub snapshot_seq: u64,
    /// Pinned log sequence
    pub log_seq: u64,
    /// Expiry deadline, wall-clock milliseconds
    pub expires_at_ms: i64,
}

/// The mmap'd pin file with its open handle.
#[derive(Debug)]
pub struct PinFile {
    file: std::fs::File,
    map: MmapMut,
}

impl PinFile {
    /// Open (creating and sizing if needed) and map the pin file.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
        let len = file.metadata()?.len();
        if len != PIN_FILE_LEN as u64 {
            if len != 0 {
                return Err(Error::Corruption(format!(
                    "pin file is {len} bytes, expected {PIN_FILE_LEN}"
                )));
            }
            file.set_len(PIN_FILE_LEN as u64)?;
        }
        // Safety: the mapping stays private to this struct; slot writes are
        // serialized by the exclusive file lock taken in every operation.
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(PinFile { file, map })
    }

    /// Run `body` with the exclusive whole-file lock held, releasing it on
    /// the way out regardless of the outcome.
    fn with_lock<T>(&mut self, body: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.file.lock_exclusive()?;
        let result = body(self);
        let _ = FileExt::unlock(&self.file);
        result
    }

    fn read_slot(&self, slot: usize) -> Option<PinSlot> {
        let buf = &self.map[slot * PIN_SLOT_LEN..(slot + 1) * PIN_SLOT_LEN];
        if buf[0] == 0 {
            return None;
        }
        Some(PinSlot {
            reader: Token { hi: bytes::get_u64(buf, 8), lo: bytes::get_u64(buf, 16) },
            snapshot_seq: bytes::get_u64(buf, 24),
            log_seq: bytes::get_u64(buf, 32),
            expires_at_ms: bytes::get_u64(buf, 40) as i64,
        })
    }

    fn write_slot(&mut self, slot: usize, pin: &PinSlot) -> Result<()> {
        let mut record = [0u8; PIN_SLOT_LEN];
        bytes::put_u64(&mut record, 8, pin.reader.hi);
        bytes::put_u64(&mut record, 16, pin.reader.lo);
        bytes::put_u64(&mut record, 24, pin.snapshot_seq);
        bytes::put_u64(&mut record, 32, pin.log_seq);
        bytes::put_u64(&mut record, 40, pin.expires_at_ms as u64);

        let offset = slot * PIN_SLOT_LEN;
        let buf = &mut self.map[offset..offset + PIN_SLOT_LEN];
        // Version byte last: no mapper can observe a half-written record.
        buf[0] = 0;
        buf[1..].copy_from_slice(&record[1..]);
        buf[0] = SLOT_VERSION;
        self.map.flush_range(offset, PIN_SLOT_LEN)?;
        Ok(())
    }

    fn clear_slot(&mut self, slot: usize) -> Result<()> {
        let offset = slot * PIN_SLOT_LEN;
        self.map[offset..offset + PIN_SLOT_LEN].fill(0);
        self.map.flush_range(offset, PIN_SLOT_LEN)?;
        Ok(())
    }

    /// Pin `(snapshot_seq, log_seq)` for a reader until `expires_at_ms`.
    ///
    /// Reuses the reader's existing slot, else an empty slot, else a slot
    /// whose pin expired by `now_ms`. Fails `Busy` when all slots hold live
    /// pins.
    pub fn pin(
        &mut self,
        reader: Token,
        snapshot_seq: u64,
        log_seq: u64,
        expires_at_ms: i64,
        now_ms: i64,
    ) -> Result<()> {
        self.with_lock(|this| {
            let mut empty: Option<usize> = None;
            let mut expired: Option<usize> = None;
            for slot in 0..PIN_SLOT_COUNT {
                match this.read_slot(slot) {
                    Some(pin) if pin.reader == reader => {
                        return this.write_slot(
                            slot,
                            &PinSlot { reader, snapshot_seq, log_seq, expires_at_ms },
                        );
                    }
                    Some(pin) => {
                        if expired.is_none() && pin.expires_at_ms <= now_ms {
                            expired = Some(slot);
                        }
                    }
                    None => {
                        if empty.is_none() {
                            empty = Some(slot);
                        }
                    }
                }
            }
            let slot = match (empty, expired) {
                (Some(slot), _) => slot,
                (None, Some(slot)) => {
                    warn!(slot, "reclaiming expired reader pin");
                    slot
                }
                (None, None) => return Err(Error::Busy("reader pin map is full")),
            };
            this.write_slot(slot, &PinSlot { reader, snapshot_seq, log_seq, expires_at_ms })
        })
    }

    /// Extend a reader's pin to a new expiry. Fails `NotFound` when the
    /// reader holds no slot.
    pub fn touch(&mut self, reader: Token, expires_at_ms: i64) -> Result<()> {
        self.with_lock(|this| {
            for slot in 0..PIN_SLOT_COUNT {
                if let Some(pin) = this.read_slot(slot) {
                    if pin.reader == reader {
                        return this.write_slot(slot, &PinSlot { expires_at_ms, ..pin });
                    }
                }
            }
            Err(Error::NotFound("reader pin"))
        })
    }

    /// Release a reader's pin. Missing is not an error.
    pub fn release(&mut self, reader: Token) -> Result<()> {
        self.with_lock(|this| {
            for slot in 0..PIN_SLOT_COUNT {
                if let Some(pin) = this.read_slot(slot) {
                    if pin.reader == reader {
                        return this.clear_slot(slot);
                    }
                }
            }
            Ok(())
        })
    }

    /// Minimum `(snapshot_seq, log_seq)` over pins unexpired at `now_ms`,
    /// or `None` when nothing is pinned.
    pub fn floors(&mut self, now_ms: i64) -> Result<Option<PinFloors>> {
        self.with_lock(|this| {
            let mut floors: Option<PinFloors> = None;
            for slot in 0..PIN_SLOT_COUNT {
                if let Some(pin) = this.read_slot(slot) {
                    if pin.expires_at_ms <= now_ms {
                        continue;
                    }
                    floors = Some(match floors {
                        Some(current) => PinFloors {
                            snapshot_seq: current.snapshot_seq.min(pin.snapshot_seq),
                            log_seq: current.log_seq.min(pin.log_seq),
                        },
                        None => PinFloors { snapshot_seq: pin.snapshot_seq, log_seq: pin.log_seq },
                    });
                }
            }
            Ok(floors)
        })
    }

    /// Number of occupied slots (expired pins included).
    pub fn occupied(&mut self) -> Result<usize> {
        self.with_lock(|this| {
            Ok((0..PIN_SLOT_COUNT).filter(|&slot| this.read_slot(slot).is_some()).count())
        })
    }
}
