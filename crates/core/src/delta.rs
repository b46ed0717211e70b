//! Delta record wire codec
//!
//! One delta record encodes one staged update. The same bytes are written in
//! two places: as the value of a delta-log entry (keyed by `log_seq`) and as
//! the payload of a WAL frame, so replaying either source decodes through
//! this codec.
//!
//! # Record Layout
//!
//! ```text
//! ┌─────────┬────┬─────────┬──────────┬─────────────┬──────────┬──────────┬─────────────┬─────────┬─────┬─────────┐
//! │ ver (1) │ op │ key_len │ reserved │ ordinal (4) │ tok hi 8 │ tok lo 8 │ pay_len (4) │ crc (4) │ key │ payload │
//! └─────────┴────┴─────────┴──────────┴─────────────┴──────────┴──────────┴─────────────┴─────────┴─────┴─────────┘
//! ```
//!
//! All multibyte fields big-endian; the CRC-32C covers `key ∥ payload`. The
//! canonical key is the 64-bit vector key, so `key_len` is always 8 on
//! encode and anything else is rejected as corruption on decode.

use crate::bytes;
use crate::error::{Error, Result};
use crate::types::{Token, Update, UpdateOp};

/// Fixed header length of an encoded delta record.
pub const DELTA_HEADER_LEN: usize = 32;

/// Current delta record format version.
pub const DELTA_FORMAT_VERSION: u8 = 1;

const KEY_LEN: usize = 8;

/// A decoded delta record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaRecord {
    /// Operation kind
    pub op: UpdateOp,
    /// 64-bit vector key
    pub key: u64,
    /// Frame ordinal within the owning WAL file (1-based)
    pub ordinal: u32,
    /// Token of the transaction context that staged this update
    pub token: Token,
    /// Vector payload bytes; empty for deletes
    pub payload: Vec<u8>,
}

impl DeltaRecord {
    /// Encode a staged update into record bytes.
    ///
    /// Deterministic: the same inputs always produce the same bytes.
    pub fn encode_update(update: &Update<'_>, ordinal: u32, token: Token) -> Vec<u8> {
        let mut buf = vec![0u8; DELTA_HEADER_LEN + KEY_LEN + update.payload.len()];
        buf[0] = DELTA_FORMAT_VERSION;
        buf[1] = update.op.as_byte();
        buf[2] = KEY_LEN as u8;
        // buf[3] reserved
        bytes::put_u32(&mut buf, 4, ordinal);
        bytes::put_u64(&mut buf, 8, token.hi);
        bytes::put_u64(&mut buf, 16, token.lo);
        bytes::put_u32(&mut buf, 24, update.payload.len() as u32);
        bytes::put_u64(&mut buf, DELTA_HEADER_LEN, update.key);
        buf[DELTA_HEADER_LEN + KEY_LEN..].copy_from_slice(update.payload);
        let crc = bytes::crc32c(&buf[DELTA_HEADER_LEN..]);
        bytes::put_u32(&mut buf, 28, crc);
        buf
    }

    /// Encode this record back into its wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        Self::encode_update(
            &Update { op: self.op, key: self.key, payload: &self.payload },
            self.ordinal,
            self.token,
        )
    }

    /// Decode and fully validate record bytes.
    ///
    /// Every decode error — bad version, unknown op, wrong key length,
    /// truncation, payload/op mismatch, CRC failure — is corruption; callers
    /// never skip a record that fails here.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < DELTA_HEADER_LEN {
            return Err(Error::Corruption(format!(
                "delta record truncated: {} bytes",
                buf.len()
            )));
        }
        if buf[0] != DELTA_FORMAT_VERSION {
            return Err(Error::Corruption(format!("delta record version {}", buf[0])));
        }
        let op = UpdateOp::from_byte(buf[1])?;
        let key_len = buf[2] as usize;
        if key_len != KEY_LEN {
            return Err(Error::Corruption(format!(
                "delta record key length {key_len}, expected {KEY_LEN}"
            )));
        }
        let ordinal = bytes::get_u32(buf, 4);
        let token = Token { hi: bytes::get_u64(buf, 8), lo: bytes::get_u64(buf, 16) };
        let payload_len = bytes::get_u32(buf, 24) as usize;
        let stored_crc = bytes::get_u32(buf, 28);
        let expected_len = DELTA_HEADER_LEN + key_len + payload_len;
        if buf.len() != expected_len {
            return Err(Error::Corruption(format!(
                "delta record is {} bytes, header declares {}",
                buf.len(),
                expected_len
            )));
        }
        match op {
            UpdateOp::Delete if payload_len != 0 => {
                return Err(Error::Corruption("delete delta carries a payload".into()));
            }
            UpdateOp::Add | UpdateOp::Replace if payload_len == 0 => {
                return Err(Error::Corruption("add/replace delta has no payload".into()));
            }
            _ => {}
        }
        bytes::verify_crc32c(&buf[DELTA_HEADER_LEN..], stored_crc, "delta record")?;
        let key = bytes::get_u64(buf, DELTA_HEADER_LEN);
        let payload = buf[DELTA_HEADER_LEN + KEY_LEN..].to_vec();
        Ok(DeltaRecord { op, key, ordinal, token, payload })
    }
}
