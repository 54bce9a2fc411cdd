//! SSH wire encoding helpers (RFC 4251 §5)

use alloc::vec::Vec;
use core::convert::TryInto;

// ============================================================================
// Writers
// ============================================================================

/// Write a u32 in big-endian format
pub fn write_u32(buf: &mut Vec<u8>, val: u32) {
    buf.extend_from_slice(&val.to_be_bytes());
}

/// Write a boolean as a single byte
pub fn write_bool(buf: &mut Vec<u8>, val: bool) {
    buf.push(u8::from(val));
}

/// Write a length-prefixed string
pub fn write_string(buf: &mut Vec<u8>, s: &[u8]) {
    write_u32(buf, s.len() as u32);
    buf.extend_from_slice(s);
}

/// Write a name-list (comma-separated, length-prefixed)
pub fn write_namelist(buf: &mut Vec<u8>, names: &[&str]) {
    let joined = names.join(",");
    write_string(buf, joined.as_bytes());
}

/// Write a non-negative big-endian magnitude as an mpint.
///
/// Leading zero bytes are stripped; a 0x00 byte is prepended when the top
/// bit of the first remaining byte is set. Zero encodes as an empty string.
pub fn write_mpint(buf: &mut Vec<u8>, magnitude: &[u8]) {
    let start = magnitude
        .iter()
        .position(|&b| b != 0)
        .unwrap_or(magnitude.len());
    let digits = &magnitude[start..];

    if digits.first().is_some_and(|&b| b & 0x80 != 0) {
        write_u32(buf, (digits.len() + 1) as u32);
        buf.push(0);
    } else {
        write_u32(buf, digits.len() as u32);
    }
    buf.extend_from_slice(digits);
}

/// Encode a magnitude as a standalone mpint
pub fn mpint_encode(magnitude: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(magnitude.len() + 5);
    write_mpint(&mut out, magnitude);
    out
}

// ============================================================================
// Readers
// ============================================================================

/// Read a single byte from buffer at offset
pub fn read_byte(data: &[u8], offset: &mut usize) -> Option<u8> {
    let b = *data.get(*offset)?;
    *offset += 1;
    Some(b)
}

/// Read a boolean (any non-zero byte is TRUE)
pub fn read_bool(data: &[u8], offset: &mut usize) -> Option<bool> {
    read_byte(data, offset).map(|b| b != 0)
}

/// Read a u32 from buffer at offset
pub fn read_u32(data: &[u8], offset: &mut usize) -> Option<u32> {
    let end = offset.checked_add(4)?;
    let val = u32::from_be_bytes(data.get(*offset..end)?.try_into().ok()?);
    *offset = end;
    Some(val)
}

/// Read a length-prefixed string from buffer at offset
pub fn read_string<'a>(data: &'a [u8], offset: &mut usize) -> Option<&'a [u8]> {
    let len = read_u32(data, offset)? as usize;
    let end = offset.checked_add(len)?;
    let s = data.get(*offset..end)?;
    *offset = end;
    Some(s)
}

/// Read a length-prefixed UTF-8 string
pub fn read_str<'a>(data: &'a [u8], offset: &mut usize) -> Option<&'a str> {
    core::str::from_utf8(read_string(data, offset)?).ok()
}

/// Read a name-list. An empty string yields an empty list.
pub fn read_namelist<'a>(data: &'a [u8], offset: &mut usize) -> Option<Vec<&'a str>> {
    let raw = read_str(data, offset)?;
    if raw.is_empty() {
        return Some(Vec::new());
    }
    Some(raw.split(',').collect())
}

/// Read an mpint, returning its magnitude without leading zero bytes.
///
/// Negative values are rejected.
pub fn read_mpint<'a>(data: &'a [u8], offset: &mut usize) -> Option<&'a [u8]> {
    let raw = read_string(data, offset)?;
    if raw.first().is_some_and(|&b| b & 0x80 != 0) {
        return None;
    }
    let start = raw.iter().position(|&b| b != 0).unwrap_or(raw.len());
    Some(&raw[start..])
}

/// Decode a standalone mpint; the whole buffer must be consumed
pub fn mpint_decode(encoded: &[u8]) -> Option<&[u8]> {
    let mut offset = 0;
    let magnitude = read_mpint(encoded, &mut offset)?;
    (offset == encoded.len()).then_some(magnitude)
}
