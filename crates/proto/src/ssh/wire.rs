//! SSH data type encoding (RFC 4251 Section 5).
//!
//! Readers take the input slice plus a cursor and advance it past the value
//! they decode; writers append to a `Vec<u8>`.

use piper_platform::{PiperError, PiperResult};

fn truncated(what: &str) -> PiperError {
    PiperError::Protocol(format!("truncated {}", what))
}

/// Appends a `byte`.
pub fn write_u8(buf: &mut Vec<u8>, value: u8) {
    buf.push(value);
}

/// Appends a `boolean`.
pub fn write_bool(buf: &mut Vec<u8>, value: bool) {
    buf.push(u8::from(value));
}

/// Appends a `uint32`.
pub fn write_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_be_bytes());
}

/// Appends a `uint64`.
pub fn write_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_be_bytes());
}

/// Appends a length-prefixed `string`.
pub fn write_string(buf: &mut Vec<u8>, value: &[u8]) {
    write_u32(buf, value.len() as u32);
    buf.extend_from_slice(value);
}

/// Appends a UTF-8 `string`.
pub fn write_str(buf: &mut Vec<u8>, value: &str) {
    write_string(buf, value.as_bytes());
}

/// Appends a `name-list`.
pub fn write_name_list<S: AsRef<str>>(buf: &mut Vec<u8>, names: &[S]) {
    let joined = names
        .iter()
        .map(|n| n.as_ref())
        .collect::<Vec<_>>()
        .join(",");
    write_str(buf, &joined);
}

/// Appends an unsigned big-endian integer as an `mpint`.
///
/// Leading zero bytes are stripped and a zero byte is prepended when the
/// high bit is set, so the value is never read back as negative.
pub fn write_mpint(buf: &mut Vec<u8>, magnitude: &[u8]) {
    buf.extend_from_slice(&encode_mpint(magnitude));
}

/// Encodes an unsigned big-endian integer as an `mpint` including its
/// length prefix.
pub fn encode_mpint(magnitude: &[u8]) -> Vec<u8> {
    let start = magnitude
        .iter()
        .position(|&b| b != 0)
        .unwrap_or(magnitude.len());
    let trimmed = &magnitude[start..];

    let mut out = Vec::with_capacity(trimmed.len() + 5);
    if trimmed.is_empty() {
        write_u32(&mut out, 0);
        return out;
    }

    if trimmed[0] & 0x80 != 0 {
        write_u32(&mut out, trimmed.len() as u32 + 1);
        out.push(0);
    } else {
        write_u32(&mut out, trimmed.len() as u32);
    }
    out.extend_from_slice(trimmed);
    out
}

/// Reads a `byte`.
pub fn read_u8(data: &[u8], offset: &mut usize) -> PiperResult<u8> {
    let value = *data.get(*offset).ok_or_else(|| truncated("byte"))?;
    *offset += 1;
    Ok(value)
}

/// Reads a `boolean`.
pub fn read_bool(data: &[u8], offset: &mut usize) -> PiperResult<bool> {
    Ok(read_u8(data, offset)? != 0)
}

/// Reads a `uint32`.
pub fn read_u32(data: &[u8], offset: &mut usize) -> PiperResult<u32> {
    let end = offset.checked_add(4).ok_or_else(|| truncated("uint32"))?;
    let bytes = data.get(*offset..end).ok_or_else(|| truncated("uint32"))?;
    *offset = end;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Reads a `uint64`.
pub fn read_u64(data: &[u8], offset: &mut usize) -> PiperResult<u64> {
    let high = read_u32(data, offset)? as u64;
    let low = read_u32(data, offset)? as u64;
    Ok((high << 32) | low)
}

/// Reads a length-prefixed `string` as raw bytes.
pub fn read_string<'a>(data: &'a [u8], offset: &mut usize) -> PiperResult<&'a [u8]> {
    let len = read_u32(data, offset)? as usize;
    let end = offset.checked_add(len).ok_or_else(|| truncated("string"))?;
    let bytes = data.get(*offset..end).ok_or_else(|| truncated("string"))?;
    *offset = end;
    Ok(bytes)
}

/// Reads a `string` that must be valid UTF-8.
pub fn read_utf8(data: &[u8], offset: &mut usize) -> PiperResult<String> {
    let bytes = read_string(data, offset)?;
    String::from_utf8(bytes.to_vec())
        .map_err(|_| PiperError::Protocol("string is not valid UTF-8".to_string()))
}

/// Reads a `name-list`.
pub fn read_name_list(data: &[u8], offset: &mut usize) -> PiperResult<Vec<String>> {
    let joined = read_utf8(data, offset)?;
    if joined.is_empty() {
        return Ok(Vec::new());
    }
    Ok(joined.split(',').map(str::to_string).collect())
}

/// Reads an `mpint`, returning its unsigned magnitude without leading zeros.
pub fn read_mpint<'a>(data: &'a [u8], offset: &mut usize) -> PiperResult<&'a [u8]> {
    let bytes = read_string(data, offset)?;
    if bytes.first().map_or(false, |b| b & 0x80 != 0) {
        return Err(PiperError::Protocol("negative mpint".to_string()));
    }
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    Ok(&bytes[start..])
}

/// Fails unless the whole input has been consumed.
pub fn expect_end(data: &[u8], offset: usize, what: &str) -> PiperResult<()> {
    if offset != data.len() {
        return Err(PiperError::Protocol(format!(
            "{} trailing bytes after {}",
            data.len().saturating_sub(offset),
            what
        )));
    }
    Ok(())
}
