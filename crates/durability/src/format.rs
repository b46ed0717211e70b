//! WAL file and frame format
//!
//! WAL files live in the domain's pending directory and are named by their
//! token: `{token_hex}.ulog.open` while writing, `{token_hex}.ulog` once
//! sealed, `{token_hex}.ulog.sealed` when ready for publish. The suffix and
//! the header's state byte move together through writer transitions.
//!
//! # File Layout
//!
//! ```text
//! ┌────────────────────────────────────┐
//! │ Header (56 bytes)                  │
//! ├────────────────────────────────────┤
//! │ Frame 1 prefix (12) + payload      │
//! ├────────────────────────────────────┤
//! │ Frame 2 prefix (12) + payload      │
//! ├────────────────────────────────────┤
//! │ ...                                │
//! └────────────────────────────────────┘
//! ```
//!
//! # Header Layout (all multibyte fields big-endian)
//!
//! ```text
//! ┌───────────┬─────┬───────┬────────────┬───────────────┬──────────────┬──────────┬──────────┬─────────────┬─────────┐
//! │ magic (8) │ ver │ state │ hdr_len(2) │ snap_base (8) │ log_hint (8) │ tok hi 8 │ tok lo 8 │ frames (4)  │ crc (4) │
//! └───────────┴─────┴───────┴────────────┴───────────────┴──────────────┴──────────┴──────────┴─────────────┴─────────┘
//! ```
//!
//! The header CRC-32C covers everything from the header-length field through
//! the frame count (bytes 10..52). Each frame prefix is ordinal (4), payload
//! length (4), payload CRC-32C (4).

use std::path::{Path, PathBuf};

use annex_core::bytes;
use annex_core::error::{Error, Result};
use annex_core::types::Token;

/// Magic bytes identifying a WAL file.
pub const ULOG_MAGIC: [u8; 8] = *b"DTLVULOG";

/// Current WAL format version.
pub const ULOG_VERSION: u8 = 1;

/// Size of the WAL header in bytes.
pub const ULOG_HEADER_LEN: usize = 56;

/// Size of a frame prefix in bytes.
pub const FRAME_PREFIX_LEN: usize = 12;

/// Filename suffix of a WAL still being written.
pub const SUFFIX_OPEN: &str = ".ulog.open";

/// Filename suffix of a sealed WAL.
pub const SUFFIX_SEALED: &str = ".ulog";

/// Filename suffix of a WAL ready for publish.
pub const SUFFIX_READY: &str = ".ulog.sealed";

/// Lifecycle state recorded in the header and mirrored by the file suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalState {
    /// Frames may still be appended
    Writing,
    /// Frame stream complete; host transaction about to commit
    Sealed,
    /// Safe to replay into live indexes
    ReadyForPublish,
}

impl WalState {
    /// Wire discriminant.
    pub fn as_byte(self) -> u8 {
        match self {
            WalState::Writing => 0,
            WalState::Sealed => 1,
            WalState::ReadyForPublish => 2,
        }
    }

    /// Decode a wire discriminant.
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(WalState::Writing),
            1 => Ok(WalState::Sealed),
            2 => Ok(WalState::ReadyForPublish),
            other => Err(Error::Corruption(format!("unknown WAL state {other}"))),
        }
    }
}

/// Decoded WAL file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalHeader {
    /// Lifecycle state at the last header rewrite
    pub state: WalState,
    /// `snapshot_seq` of the domain when the writer opened
    pub snapshot_seq_base: u64,
    /// `log_seq` the first frame in this file was assigned
    pub log_seq_hint: u64,
    /// Token binding this file to its transaction context
    pub token: Token,
    /// Number of frames at the last header rewrite
    pub frame_count: u32,
}

impl WalHeader {
    /// Serialize, computing the header checksum.
    pub fn to_bytes(&self) -> [u8; ULOG_HEADER_LEN] {
        let mut buf = [0u8; ULOG_HEADER_LEN];
        buf[0..8].copy_from_slice(&ULOG_MAGIC);
        buf[8] = ULOG_VERSION;
        buf[9] = self.state.as_byte();
        bytes::put_u16(&mut buf, 10, ULOG_HEADER_LEN as u16);
        bytes::put_u64(&mut buf, 12, self.snapshot_seq_base);
        bytes::put_u64(&mut buf, 20, self.log_seq_hint);
        bytes::put_u64(&mut buf, 28, self.token.hi);
        bytes::put_u64(&mut buf, 36, self.token.lo);
        bytes::put_u32(&mut buf, 44, self.frame_count);
        let crc = bytes::crc32c(&buf[10..52]);
        bytes::put_u32(&mut buf, 52, crc);
        buf
    }

    /// Deserialize, validating magic, version, header length, and checksum.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        bytes::expect_len(buf, ULOG_HEADER_LEN, "WAL header")?;
        if buf[0..8] != ULOG_MAGIC {
            return Err(Error::Corruption("WAL header magic mismatch".into()));
        }
        if buf[8] != ULOG_VERSION {
            return Err(Error::Corruption(format!("WAL header version {}", buf[8])));
        }
        let header_len = bytes::get_u16(buf, 10);
        if header_len as usize != ULOG_HEADER_LEN {
            return Err(Error::Corruption(format!("WAL header length {header_len}")));
        }
        bytes::verify_crc32c(&buf[10..52], bytes::get_u32(buf, 52), "WAL header")?;
        Ok(WalHeader {
            state: WalState::from_byte(buf[9])?,
            snapshot_seq_base: bytes::get_u64(buf, 12),
            log_seq_hint: bytes::get_u64(buf, 20),
            token: Token { hi: bytes::get_u64(buf, 28), lo: bytes::get_u64(buf, 36) },
            frame_count: bytes::get_u32(buf, 44),
        })
    }
}

/// Frame prefix: ordinal, payload length, payload checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramePrefix {
    /// 1-based position of this frame within its file
    pub ordinal: u32,
    /// Payload length in bytes; always nonzero
    pub delta_bytes: u32,
    /// CRC-32C of the payload
    pub checksum: u32,
}

impl FramePrefix {
    /// Serialize.
    pub fn to_bytes(&self) -> [u8; FRAME_PREFIX_LEN] {
        let mut buf = [0u8; FRAME_PREFIX_LEN];
        bytes::put_u32(&mut buf, 0, self.ordinal);
        bytes::put_u32(&mut buf, 4, self.delta_bytes);
        bytes::put_u32(&mut buf, 8, self.checksum);
        buf
    }

    /// Deserialize. Structural validation (ordinal continuity, nonzero
    /// length, checksum) is the reader's job, which knows the context.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        bytes::expect_len(buf, FRAME_PREFIX_LEN, "WAL frame prefix")?;
        Ok(FramePrefix {
            ordinal: bytes::get_u32(buf, 0),
            delta_bytes: bytes::get_u32(buf, 4),
            checksum: bytes::get_u32(buf, 8),
        })
    }
}

/// Path of a writer-open WAL for `token` under `pending_dir`.
pub fn open_path(pending_dir: &Path, token: Token) -> PathBuf {
    pending_dir.join(format!("{}{}", token.hex(), SUFFIX_OPEN))
}

/// Path of a sealed WAL for `token` under `pending_dir`.
pub fn sealed_path(pending_dir: &Path, token: Token) -> PathBuf {
    pending_dir.join(format!("{}{}", token.hex(), SUFFIX_SEALED))
}

/// Path of a ready-for-publish WAL for `token` under `pending_dir`.
pub fn ready_path(pending_dir: &Path, token: Token) -> PathBuf {
    pending_dir.join(format!("{}{}", token.hex(), SUFFIX_READY))
}

/// Classification of a pending-directory filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingName {
    /// `{token_hex}.ulog.open`
    Open(Token),
    /// `{token_hex}.ulog`
    Sealed(Token),
    /// `{token_hex}.ulog.sealed`
    Ready(Token),
    /// Anything else; recovery deletes these
    Malformed,
}

/// Classify a pending-directory filename by suffix and token stem.
///
/// `.ulog` is a prefix of both other suffixes, so the longer suffixes are
/// matched first.
pub fn classify_name(name: &str) -> PendingName {
    let parse = |stem: &str, build: fn(Token) -> PendingName| {
        Token::parse_hex(stem).map(build).unwrap_or(PendingName::Malformed)
    };
    if let Some(stem) = name.strip_suffix(SUFFIX_OPEN) {
        parse(stem, PendingName::Open)
    } else if let Some(stem) = name.strip_suffix(SUFFIX_READY) {
        parse(stem, PendingName::Ready)
    } else if let Some(stem) = name.strip_suffix(SUFFIX_SEALED) {
        parse(stem, PendingName::Sealed)
    } else {
        PendingName::Malformed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> WalHeader {
        WalHeader {
            state: WalState::Writing,
            snapshot_seq_base: 7,
            log_seq_hint: 42,
            token: Token { hi: 0xAAAA_BBBB_CCCC_DDDD, lo: 0x1111_2222_3333_4444 },
            frame_count: 3,
        }
    }

    #[test]
    fn test_header_roundtrip() {
        let header = sample_header();
        let buf = header.to_bytes();
        assert_eq!(buf.len(), ULOG_HEADER_LEN);
        assert_eq!(&buf[0..8], b"DTLVULOG");
        assert_eq!(WalHeader::from_bytes(&buf).unwrap(), header);
    }

    #[test]
    fn test_header_roundtrip_all_states() {
        for state in [WalState::Writing, WalState::Sealed, WalState::ReadyForPublish] {
            let header = WalHeader { state, ..sample_header() };
            assert_eq!(WalHeader::from_bytes(&header.to_bytes()).unwrap().state, state);
        }
    }

    #[test]
    fn test_header_rejects_bad_magic() {
        let mut buf = sample_header().to_bytes();
        buf[0] = b'X';
        assert!(WalHeader::from_bytes(&buf).unwrap_err().is_corruption());
    }

    #[test]
    fn test_header_rejects_bad_crc() {
        let mut buf = sample_header().to_bytes();
        buf[20] ^= 0xFF;
        assert!(WalHeader::from_bytes(&buf).unwrap_err().is_corruption());
    }

    #[test]
    fn test_header_rejects_bad_version_and_length() {
        let mut buf = sample_header().to_bytes();
        buf[8] = 2;
        assert!(WalHeader::from_bytes(&buf).unwrap_err().is_corruption());

        let mut buf = sample_header().to_bytes();
        buf[11] = 57;
        assert!(WalHeader::from_bytes(&buf).unwrap_err().is_corruption());
    }

    #[test]
    fn test_frame_prefix_roundtrip() {
        let prefix = FramePrefix { ordinal: 9, delta_bytes: 1024, checksum: 0xDEAD_BEEF };
        assert_eq!(FramePrefix::from_bytes(&prefix.to_bytes()).unwrap(), prefix);
    }

    #[test]
    fn test_classify_name() {
        let token = Token { hi: 1, lo: 2 };
        let hex = token.hex();
        assert_eq!(classify_name(&format!("{hex}.ulog.open")), PendingName::Open(token));
        assert_eq!(classify_name(&format!("{hex}.ulog")), PendingName::Sealed(token));
        assert_eq!(classify_name(&format!("{hex}.ulog.sealed")), PendingName::Ready(token));
        assert_eq!(classify_name("garbage.txt"), PendingName::Malformed);
        assert_eq!(classify_name("zzzz.ulog"), PendingName::Malformed);
        assert_eq!(classify_name(".ulog"), PendingName::Malformed);
    }

    #[test]
    fn test_paths_share_stem() {
        let token = Token { hi: 3, lo: 4 };
        let dir = Path::new("/tmp/pending");
        let open = open_path(dir, token);
        let sealed = sealed_path(dir, token);
        let ready = ready_path(dir, token);
        assert!(open.to_str().unwrap().ends_with(".ulog.open"));
        assert!(sealed.to_str().unwrap().ends_with(".ulog"));
        assert!(ready.to_str().unwrap().ends_with(".ulog.sealed"));
        for path in [&open, &sealed, &ready] {
            assert!(path.to_str().unwrap().contains(&token.hex()));
        }
    }
}
