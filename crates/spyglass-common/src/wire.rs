//! Wire-format helpers
//!
//! Addresses cross the wire as `0x`-prefixed hex strings in both directions;
//! JSON numbers cannot hold a full 64-bit address without precision loss.
//! Typed values travel as strings and are converted here.

use crate::error::{Error, Result};
use crate::types::ValueType;

/// Parse a hex address, accepting an optional `0x`/`0X` prefix and either
/// letter case.
pub fn parse_address(s: &str) -> Result<usize> {
    let trimmed = s.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if digits.is_empty() {
        return Err(Error::InvalidParameter(format!("Bad address: {:?}", s)));
    }
    usize::from_str_radix(digits, 16)
        .map_err(|_| Error::InvalidParameter(format!("Bad address: {:?}", s)))
}

/// Format an address as `0x` + lowercase hex.
pub fn format_address(address: usize) -> String {
    format!("0x{:x}", address)
}

/// Space-separated uppercase hex, e.g. `90 8B EC`.
pub fn bytes_to_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse whitespace-separated hex bytes; each token must be two digits.
pub fn hex_to_bytes(s: &str) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    for token in s.split_whitespace() {
        if token.len() != 2 {
            return Err(Error::InvalidParameter(format!("Bad hex byte: {}", token)));
        }
        let byte = u8::from_str_radix(token, 16)
            .map_err(|_| Error::InvalidParameter(format!("Bad hex byte: {}", token)))?;
        bytes.push(byte);
    }
    Ok(bytes)
}

/// Convert a string representation into native-endian bytes for a type tag.
pub fn value_to_bytes(value: &str, value_type: ValueType) -> Result<Vec<u8>> {
    match value_type {
        ValueType::Int32 => {
            let v: i32 = value
                .trim()
                .parse()
                .map_err(|_| Error::InvalidParameter(format!("Invalid int32: {}", value)))?;
            Ok(v.to_ne_bytes().to_vec())
        }
        ValueType::Int64 => {
            let v: i64 = value
                .trim()
                .parse()
                .map_err(|_| Error::InvalidParameter(format!("Invalid int64: {}", value)))?;
            Ok(v.to_ne_bytes().to_vec())
        }
        ValueType::Float => {
            let v: f32 = value
                .trim()
                .parse()
                .map_err(|_| Error::InvalidParameter(format!("Invalid float: {}", value)))?;
            Ok(v.to_ne_bytes().to_vec())
        }
        ValueType::Double => {
            let v: f64 = value
                .trim()
                .parse()
                .map_err(|_| Error::InvalidParameter(format!("Invalid double: {}", value)))?;
            Ok(v.to_ne_bytes().to_vec())
        }
        ValueType::Byte => {
            let v: u8 = value
                .trim()
                .parse()
                .map_err(|_| Error::InvalidParameter(format!("Invalid byte: {}", value)))?;
            Ok(vec![v])
        }
        ValueType::String => Ok(value.as_bytes().to_vec()),
        ValueType::Bytes => hex_to_bytes(value),
    }
}

/// Render bytes into the display string for a type tag.
pub fn bytes_to_string(bytes: &[u8], value_type: ValueType) -> String {
    match value_type {
        ValueType::Int32 if bytes.len() >= 4 => i32::from_ne_bytes(take4(bytes)).to_string(),
        ValueType::Int64 if bytes.len() >= 8 => i64::from_ne_bytes(take8(bytes)).to_string(),
        ValueType::Float if bytes.len() >= 4 => f32::from_ne_bytes(take4(bytes)).to_string(),
        ValueType::Double if bytes.len() >= 8 => f64::from_ne_bytes(take8(bytes)).to_string(),
        ValueType::Byte if !bytes.is_empty() => bytes[0].to_string(),
        ValueType::String => String::from_utf8_lossy(bytes).to_string(),
        _ => bytes_to_hex(bytes),
    }
}

fn take4(bytes: &[u8]) -> [u8; 4] {
    bytes
        .get(..4)
        .and_then(|s| s.try_into().ok())
        .unwrap_or([0; 4])
}

fn take8(bytes: &[u8]) -> [u8; 8] {
    bytes
        .get(..8)
        .and_then(|s| s.try_into().ok())
        .unwrap_or([0; 8])
}
