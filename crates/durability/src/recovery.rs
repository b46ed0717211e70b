//! Pending-directory recovery
//!
//! Runs once at domain open, after checkpoint recovery and before any handle
//! activation, when the meta store carries a `sealed_log_seq` marker. The
//! filenames in the pending directory are the authoritative record of how
//! far each crashed writer got:
//!
//! - `.ulog.open` — writer crashed mid-stream; the file is discardable
//! - `.ulog` — sealed; if its token matches the marker the publish-side
//!   crash happened before mark-ready, so the rename is completed here
//! - `.ulog.sealed` — ready for publish; replay resumes from
//!   `published_log_tail`
//! - anything else — stray; deleted
//!
//! This module only classifies and cleans the directory; the caller owns
//! reading the markers and replaying the surviving file.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use annex_core::error::Result;
use annex_core::types::Token;

use crate::format::{self, PendingName};

/// Scan the pending directory against the sealed token from
/// `sealed_log_seq`.
///
/// Deletes every entry that cannot be the sealed transaction's file,
/// completes the sealed → ready rename when needed, and returns the path of
/// the ready file for the sealed token, or `None` when the publish already
/// finished (nothing survived to replay).
pub fn scan_pending(pending_dir: &Path, sealed_token: Token) -> Result<Option<PathBuf>> {
    if !pending_dir.exists() {
        return Ok(None);
    }

    let mut ready: Option<PathBuf> = None;
    for entry in fs::read_dir(pending_dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        match format::classify_name(&name) {
            PendingName::Open(token) => {
                debug!(%token, "removing writer-open WAL left by a crash");
                fs::remove_file(&path)?;
            }
            PendingName::Sealed(token) if token == sealed_token => {
                let target = format::ready_path(pending_dir, token);
                debug!(%token, "completing sealed WAL rename to ready");
                fs::rename(&path, &target)?;
                ready = Some(target);
            }
            PendingName::Ready(token) if token == sealed_token => {
                ready = Some(path);
            }
            PendingName::Sealed(token) | PendingName::Ready(token) => {
                warn!(%token, "removing pending WAL that does not match the sealed token");
                fs::remove_file(&path)?;
            }
            PendingName::Malformed => {
                warn!(file = %name, "removing stray file from pending directory");
                fs::remove_file(&path)?;
            }
        }
    }
    Ok(ready)
}
