//! WAL file replay
//!
//! Streams a ready-for-publish WAL file frame by frame, verifying the header
//! (magic, version, length, checksum, expected token) and every frame
//! (ordinal continuity, nonzero length, payload checksum) before handing the
//! decoded delta record to the caller's sink. Any verification or sink error
//! aborts the replay immediately and leaves the file on disk so the next
//! open can retry; the file is unlinked only after every frame was
//! processed.
//!
//! The sink runs once per frame at or past the start ordinal. Publish and
//! recovery use it to apply the delta to live handles and then advance
//! `published_log_tail` in its own KV transaction, which is what makes
//! replay idempotent under crash.

use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::Path;

use tracing::debug;

use annex_core::bytes;
use annex_core::delta::DeltaRecord;
use annex_core::error::{Error, Result};
use annex_core::types::Token;

use crate::format::{FramePrefix, WalHeader, FRAME_PREFIX_LEN, ULOG_HEADER_LEN};

/// Summary of one replay pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayOutcome {
    /// Frames present in the file
    pub frames_total: u32,
    /// Frames at or past the start ordinal that reached the sink
    pub frames_applied: u32,
    /// Whether the file was removed after a complete pass
    pub unlinked: bool,
}

/// Replay `path`, streaming each verified frame with ordinal ≥
/// `start_ordinal` to `apply` as `(ordinal, record)`.
pub fn replay_wal_file(
    path: &Path,
    expected_token: Token,
    start_ordinal: u32,
    unlink_after: bool,
    apply: &mut dyn FnMut(u32, &DeltaRecord) -> Result<()>,
) -> Result<ReplayOutcome> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let mut header_buf = [0u8; ULOG_HEADER_LEN];
    reader
        .read_exact(&mut header_buf)
        .map_err(|_| Error::Corruption("WAL file shorter than its header".into()))?;
    let header = WalHeader::from_bytes(&header_buf)?;
    if header.token != expected_token {
        return Err(Error::Corruption(format!(
            "WAL token mismatch: file {}, expected {}",
            header.token, expected_token
        )));
    }

    let mut applied = 0u32;
    let mut prefix_buf = [0u8; FRAME_PREFIX_LEN];
    for ordinal in 1..=header.frame_count {
        reader
            .read_exact(&mut prefix_buf)
            .map_err(|_| Error::Corruption(format!("WAL truncated at frame {ordinal}")))?;
        let prefix = FramePrefix::from_bytes(&prefix_buf)?;
        if prefix.ordinal != ordinal {
            return Err(Error::Corruption(format!(
                "WAL frame ordinal {} where {} was expected",
                prefix.ordinal, ordinal
            )));
        }
        if prefix.delta_bytes == 0 {
            return Err(Error::Corruption(format!("WAL frame {ordinal} is empty")));
        }
        let mut payload = vec![0u8; prefix.delta_bytes as usize];
        reader
            .read_exact(&mut payload)
            .map_err(|_| Error::Corruption(format!("WAL frame {ordinal} payload truncated")))?;
        bytes::verify_crc32c(&payload, prefix.checksum, "WAL frame")?;

        if ordinal >= start_ordinal {
            let record = DeltaRecord::decode(&payload)?;
            apply(ordinal, &record)?;
            applied += 1;
        }
    }

    let mut unlinked = false;
    if unlink_after {
        fs::remove_file(path)?;
        unlinked = true;
    }
    debug!(
        token = %expected_token,
        frames_total = header.frame_count,
        frames_applied = applied,
        unlinked,
        "WAL replay complete"
    );
    Ok(ReplayOutcome { frames_total: header.frame_count, frames_applied: applied, unlinked })
}
