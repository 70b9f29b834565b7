//! Small helpers shared between the transport roles.

use crate::{Error, Result};

/// Render bytes as contiguous lowercase hex, the format used in logs and by
/// the hex-string APDU entry points.
pub fn to_hex(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2);
    for b in data {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Parse a hex string into bytes. Whitespace is ignored, so both `"a0a40000"`
/// and `"a0 a4 00 00"` are accepted.
pub fn from_hex(s: &str) -> Result<Vec<u8>> {
    let compact: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.len() % 2 != 0 {
        return Err(Error::Protocol(format!("odd-length hex string ({s:?})")));
    }
    let mut out = Vec::with_capacity(compact.len() / 2);
    for i in (0..compact.len()).step_by(2) {
        let byte = u8::from_str_radix(&compact[i..i + 2], 16)
            .map_err(|_| Error::Protocol(format!("invalid hex string ({s:?})")))?;
        out.push(byte);
    }
    Ok(out)
}

/// XOR of all bytes; the PCK check byte of a PPS frame.
pub fn xor_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, b| acc ^ b)
}
