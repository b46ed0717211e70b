//! Identifiers and staged-update types
//!
//! Sequence numbers (`log_seq`, `snapshot_seq`) are plain `u64`s; the types
//! here are the ones with structure: the 128-bit token that binds a WAL file
//! to its transaction context (also used as reader identity in the pin map),
//! and the staged update passed to the write path.

use std::fmt;

use crate::bytes;
use crate::error::{Error, Result};

/// Number of lowercase hex characters in a formatted token.
pub const TOKEN_HEX_LEN: usize = 32;

/// A 128-bit opaque identifier.
///
/// Minted once per WAL file to tie frames, meta markers, and the pending
/// directory entry to a single transaction context. Reader pins use the same
/// type for reader identity. Halves are persisted big-endian everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token {
    /// High 64 bits
    pub hi: u64,
    /// Low 64 bits
    pub lo: u64,
}

impl Token {
    /// Mint a fresh random token.
    pub fn mint() -> Self {
        let bytes = *uuid::Uuid::new_v4().as_bytes();
        Token {
            hi: bytes::get_u64(&bytes, 0),
            lo: bytes::get_u64(&bytes, 8),
        }
    }

    /// Format as 32 lowercase hex characters (the pending-file stem).
    pub fn hex(&self) -> String {
        format!("{:016x}{:016x}", self.hi, self.lo)
    }

    /// Parse a 32-character lowercase hex stem back into a token.
    ///
    /// Returns `None` for anything that is not exactly 32 hex digits; WAL
    /// recovery uses this to classify stray files in the pending directory.
    pub fn parse_hex(stem: &str) -> Option<Self> {
        if stem.len() != TOKEN_HEX_LEN || !stem.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        let hi = u64::from_str_radix(&stem[..16], 16).ok()?;
        let lo = u64::from_str_radix(&stem[16..], 16).ok()?;
        Some(Token { hi, lo })
    }

    /// A zero token; used as the "absent" value in defaulted meta reads.
    pub fn zero() -> Self {
        Token { hi: 0, lo: 0 }
    }

    /// Whether this is the zero token.
    pub fn is_zero(&self) -> bool {
        self.hi == 0 && self.lo == 0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex())
    }
}

/// Operation carried by one staged update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOp {
    /// Insert a vector under a key that is expected to be absent
    Add,
    /// Remove any existing vector for the key, then insert
    Replace,
    /// Remove the vector for the key; missing is not an error on apply
    Delete,
}

impl UpdateOp {
    /// Wire discriminant.
    pub fn as_byte(self) -> u8 {
        match self {
            UpdateOp::Add => 0,
            UpdateOp::Replace => 1,
            UpdateOp::Delete => 2,
        }
    }

    /// Decode a wire discriminant.
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(UpdateOp::Add),
            1 => Ok(UpdateOp::Replace),
            2 => Ok(UpdateOp::Delete),
            other => Err(Error::Corruption(format!("unknown delta op {other}"))),
        }
    }
}

/// One user-visible update staged into a host KV transaction.
///
/// The canonical key is a 64-bit vector key; the payload is the vector's raw
/// bytes in the index's scalar encoding, and must be empty exactly when the
/// op is [`UpdateOp::Delete`].
#[derive(Debug, Clone, Copy)]
pub struct Update<'a> {
    /// Operation kind
    pub op: UpdateOp,
    /// 64-bit vector key
    pub key: u64,
    /// Vector payload bytes; empty for deletes
    pub payload: &'a [u8],
}

impl<'a> Update<'a> {
    /// Stage-time argument validation. A DELETE carrying payload bytes is an
    /// argument error here; the same shape arriving off the wire is
    /// corruption instead.
    pub fn validate(&self) -> Result<()> {
        match self.op {
            UpdateOp::Delete => {
                if !self.payload.is_empty() {
                    return Err(Error::InvalidArgument("delete update carries a payload"));
                }
            }
            UpdateOp::Add | UpdateOp::Replace => {
                if self.payload.is_empty() {
                    return Err(Error::InvalidArgument("add/replace update has no payload"));
                }
            }
        }
        if self.payload.len() > u32::MAX as usize {
            return Err(Error::InvalidArgument("payload exceeds 4 GiB frame limit"));
        }
        Ok(())
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
///
/// Returns 0 if the system clock is before the epoch.
pub fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_hex_roundtrip() {
        let token = Token { hi: 0x0123_4567_89AB_CDEF, lo: 0xFEDC_BA98_7654_3210 };
        let hex = token.hex();
        assert_eq!(hex.len(), TOKEN_HEX_LEN);
        assert_eq!(hex, "0123456789abcdeffedcba9876543210");
        assert_eq!(Token::parse_hex(&hex), Some(token));
    }

    #[test]
    fn test_token_parse_rejects_malformed() {
        assert_eq!(Token::parse_hex(""), None);
        assert_eq!(Token::parse_hex("0123"), None);
        assert_eq!(Token::parse_hex("zz23456789abcdeffedcba9876543210"), None);
        assert_eq!(Token::parse_hex("0123456789abcdeffedcba98765432100"), None);
    }

    #[test]
    fn test_minted_tokens_differ() {
        assert_ne!(Token::mint(), Token::mint());
    }

    #[test]
    fn test_update_validation() {
        let payload = [1u8, 2, 3, 4];
        assert!(Update { op: UpdateOp::Add, key: 1, payload: &payload }.validate().is_ok());
        assert!(Update { op: UpdateOp::Delete, key: 1, payload: &[] }.validate().is_ok());
        assert!(Update { op: UpdateOp::Add, key: 1, payload: &[] }.validate().is_err());
        assert!(Update { op: UpdateOp::Replace, key: 1, payload: &[] }.validate().is_err());
        assert!(Update { op: UpdateOp::Delete, key: 1, payload: &payload }.validate().is_err());
    }

    #[test]
    fn test_op_bytes() {
        for op in [UpdateOp::Add, UpdateOp::Replace, UpdateOp::Delete] {
            assert_eq!(UpdateOp::from_byte(op.as_byte()).unwrap(), op);
        }
        assert!(UpdateOp::from_byte(3).is_err());
    }
}
