//! Big-endian packing helpers and CRC-32C
//!
//! Every multibyte integer persisted by this workspace — in WAL headers,
//! frame prefixes, delta records, snapshot chunks, meta records, and pin
//! slots — is big-endian, so lexicographic byte comparison in the KV engine
//! matches numeric ordering.
//!
//! Checksums are CRC-32C (Castagnoli, reflected polynomial `0x82F63B78`)
//! with initial value `0xFFFFFFFF` and a final one's-complement. A 256-entry
//! table is built lazily on first use.

use byteorder::{BigEndian, ByteOrder};
use once_cell::sync::Lazy;

use crate::error::{Error, Result};

/// Write `value` big-endian into `buf[offset..offset + 2]`.
pub fn put_u16(buf: &mut [u8], offset: usize, value: u16) {
    BigEndian::write_u16(&mut buf[offset..offset + 2], value);
}

/// Write `value` big-endian into `buf[offset..offset + 4]`.
pub fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    BigEndian::write_u32(&mut buf[offset..offset + 4], value);
}

/// Write `value` big-endian into `buf[offset..offset + 8]`.
pub fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
    BigEndian::write_u64(&mut buf[offset..offset + 8], value);
}

/// Read a big-endian u16 from `buf[offset..offset + 2]`.
pub fn get_u16(buf: &[u8], offset: usize) -> u16 {
    BigEndian::read_u16(&buf[offset..offset + 2])
}

/// Read a big-endian u32 from `buf[offset..offset + 4]`.
pub fn get_u32(buf: &[u8], offset: usize) -> u32 {
    BigEndian::read_u32(&buf[offset..offset + 4])
}

/// Read a big-endian u64 from `buf[offset..offset + 8]`.
pub fn get_u64(buf: &[u8], offset: usize) -> u64 {
    BigEndian::read_u64(&buf[offset..offset + 8])
}

/// Require `buf` to hold exactly `len` bytes, surfacing a corruption error
/// naming the record otherwise.
pub fn expect_len(buf: &[u8], len: usize, what: &str) -> Result<()> {
    if buf.len() != len {
        return Err(Error::Corruption(format!(
            "{} record is {} bytes, expected {}",
            what,
            buf.len(),
            len
        )));
    }
    Ok(())
}

static CRC32C_TABLE: Lazy<[u32; 256]> = Lazy::new(|| {
    const POLY: u32 = 0x82F6_3B78;
    let mut table = [0u32; 256];
    let mut i = 0u32;
    while i < 256 {
        let mut crc = i;
        let mut j = 0;
        while j < 8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ POLY } else { crc >> 1 };
            j += 1;
        }
        table[i as usize] = crc;
        i += 1;
    }
    table
});

/// CRC-32C of `data`.
pub fn crc32c(data: &[u8]) -> u32 {
    let table = &*CRC32C_TABLE;
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        let idx = ((crc ^ byte as u32) & 0xFF) as usize;
        crc = table[idx] ^ (crc >> 8);
    }
    !crc
}

/// Verify a stored CRC-32C against `data`, naming the record on mismatch.
pub fn verify_crc32c(data: &[u8], stored: u32, what: &str) -> Result<()> {
    let computed = crc32c(data);
    if computed != stored {
        return Err(Error::Corruption(format!(
            "{} checksum mismatch: stored {:08x}, computed {:08x}",
            what, stored, computed
        )));
    }
    Ok(())
}
