//! WAL writer
//!
//! One writer exists per transaction context. Opening mints a fresh token,
//! creates `{token_hex}.ulog.open` exclusively (two writers can never race
//! on the same name), and writes the initial header. Frames append
//! sequentially; `seal` and `mark_ready` flush, rewrite the header in place,
//! flush again, and rename, so the filename suffix always matches the
//! on-disk state after a successful transition. A reader that finds an
//! `.ulog.open` file may assume the writer crashed mid-stream.

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use annex_core::bytes::crc32c;
use annex_core::error::{Error, Result};
use annex_core::types::Token;

use crate::format::{
    self, FramePrefix, WalHeader, WalState, ULOG_HEADER_LEN,
};

/// Append-only per-transaction WAL file with a three-state lifecycle.
pub struct WalWriter {
    token: Token,
    state: WalState,
    snapshot_seq_base: u64,
    log_seq_hint: u64,
    next_ordinal: u32,
    frame_count: u32,
    file: File,
    path_open: PathBuf,
    path_sealed: PathBuf,
    path_ready: PathBuf,
}

impl WalWriter {
    /// Create a writer bound to a freshly minted token.
    ///
    /// Creates the pending directory if needed and the `.ulog.open` file
    /// exclusively, then writes the initial header.
    pub fn open(pending_dir: &Path, snapshot_seq_base: u64, log_seq_hint: u64) -> Result<Self> {
        fs::create_dir_all(pending_dir)?;
        let token = Token::mint();
        let path_open = format::open_path(pending_dir, token);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path_open)?;
        let mut writer = WalWriter {
            token,
            state: WalState::Writing,
            snapshot_seq_base,
            log_seq_hint,
            next_ordinal: 1,
            frame_count: 0,
            file,
            path_open,
            path_sealed: format::sealed_path(pending_dir, token),
            path_ready: format::ready_path(pending_dir, token),
        };
        writer.rewrite_header(WalState::Writing)?;
        writer.file.seek(SeekFrom::Start(ULOG_HEADER_LEN as u64))?;
        debug!(token = %token, snapshot_seq_base, log_seq_hint, "WAL writer opened");
        Ok(writer)
    }

    fn header(&self, state: WalState) -> WalHeader {
        WalHeader {
            state,
            snapshot_seq_base: self.snapshot_seq_base,
            log_seq_hint: self.log_seq_hint,
            token: self.token,
            frame_count: self.frame_count,
        }
    }

    fn rewrite_header(&mut self, state: WalState) -> Result<()> {
        let buf = self.header(state).to_bytes();
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&buf)?;
        Ok(())
    }

    /// Append one frame carrying an encoded delta record.
    ///
    /// Rejected once the writer has left the writing state.
    pub fn append(&mut self, delta: &[u8]) -> Result<()> {
        if self.state != WalState::Writing {
            return Err(Error::Busy("WAL writer is no longer accepting frames"));
        }
        if delta.is_empty() {
            return Err(Error::InvalidArgument("empty WAL frame payload"));
        }
        if delta.len() > u32::MAX as usize {
            return Err(Error::InvalidArgument("WAL frame payload exceeds 4 GiB"));
        }
        let prefix = FramePrefix {
            ordinal: self.next_ordinal,
            delta_bytes: delta.len() as u32,
            checksum: crc32c(delta),
        };
        self.file.write_all(&prefix.to_bytes())?;
        self.file.write_all(delta)?;
        self.next_ordinal += 1;
        self.frame_count += 1;
        Ok(())
    }

    /// Transition writing → sealed: flush frames, rewrite the header with
    /// the final frame count, flush, rename `.ulog.open` → `.ulog`.
    ///
    /// Errors are fatal to the writer; the caller aborts and the file is
    /// cleaned up at close or by the next open's recovery.
    pub fn seal(&mut self) -> Result<()> {
        if self.state != WalState::Writing {
            return Err(Error::Busy("WAL writer is not in the writing state"));
        }
        self.file.sync_data()?;
        self.rewrite_header(WalState::Sealed)?;
        self.file.sync_data()?;
        fs::rename(&self.path_open, &self.path_sealed)?;
        self.state = WalState::Sealed;
        debug!(token = %self.token, frames = self.frame_count, "WAL sealed");
        Ok(())
    }

    /// Transition sealed → ready-for-publish: rewrite the header, flush,
    /// rename `.ulog` → `.ulog.sealed`. Calling again once ready is a no-op.
    pub fn mark_ready(&mut self) -> Result<()> {
        if self.state == WalState::Writing {
            return Err(Error::Busy("WAL writer has not been sealed"));
        }
        self.rewrite_header(WalState::ReadyForPublish)?;
        self.file.sync_data()?;
        if self.state == WalState::Sealed {
            fs::rename(&self.path_sealed, &self.path_ready)?;
        }
        self.state = WalState::ReadyForPublish;
        debug!(token = %self.token, "WAL marked ready for publish");
        Ok(())
    }

    /// Close the file handle. With `best_effort_delete`, also remove the
    /// file for the current state — the abort path uses this so a dead
    /// transaction does not orphan its log. Never fails the caller.
    pub fn close(self, best_effort_delete: bool) {
        if best_effort_delete {
            let path = match self.state {
                WalState::Writing => &self.path_open,
                WalState::Sealed => &self.path_sealed,
                WalState::ReadyForPublish => &self.path_ready,
            };
            let _ = fs::remove_file(path);
        }
    }

    /// Token binding this file to its transaction context.
    pub fn token(&self) -> Token {
        self.token
    }

    /// Frames appended so far.
    pub fn frame_count(&self) -> u32 {
        self.frame_count
    }

    /// `log_seq` hint recorded in the header (the sequence the first frame
    /// was assigned).
    pub fn log_seq_hint(&self) -> u64 {
        self.log_seq_hint
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WalState {
        self.state
    }

    /// Path of the ready-for-publish file.
    pub fn ready_path(&self) -> &Path {
        &self.path_ready
    }
}
