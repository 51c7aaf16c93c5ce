//! Byte pattern (AOB) scanner
//!
//! Patterns are space-separated hex bytes with `?` / `??` wildcards, e.g.
//! `"48 8B ?? 05"`. Matching walks readable regions byte by byte.

use crate::memory::MemoryAccess;
use spyglass_common::{Error, Result};

/// A parsed wildcard byte pattern
#[derive(Debug, Clone)]
pub struct Pattern {
    bytes: Vec<u8>,
    mask: Vec<bool>,
}

impl Pattern {
    /// Parse `"48 8B ?? 05"`; `?` and `??` match any byte.
    pub fn parse(pattern: &str) -> Result<Self> {
        let mut bytes = Vec::new();
        let mut mask = Vec::new();

        for token in pattern.split_whitespace() {
            if token == "?" || token == "??" {
                bytes.push(0);
                mask.push(false);
            } else if token.len() == 2 {
                let byte = u8::from_str_radix(token, 16).map_err(|_| {
                    Error::InvalidParameter(format!("Bad pattern byte: {}", token))
                })?;
                bytes.push(byte);
                mask.push(true);
            } else {
                return Err(Error::InvalidParameter(format!(
                    "Bad pattern token: {}",
                    token
                )));
            }
        }

        if bytes.is_empty() {
            return Err(Error::InvalidParameter("Empty pattern".to_string()));
        }

        Ok(Self { bytes, mask })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn matches(&self, window: &[u8]) -> bool {
        window.len() >= self.len()
            && self
                .bytes
                .iter()
                .zip(&self.mask)
                .zip(window)
                .all(|((pat, fixed), byte)| !fixed || pat == byte)
    }
}

/// All match addresses within `[start, end)`, up to `limit`.
pub fn scan_all(
    mem: &MemoryAccess,
    pattern: &Pattern,
    start: usize,
    end: usize,
    limit: usize,
) -> Vec<usize> {
    let mut results = Vec::new();

    for region in mem.regions() {
        if !region.readable() {
            continue;
        }
        let lo = region.base.max(start);
        let hi = region.end().min(end);
        if lo >= hi || hi - lo < pattern.len() {
            continue;
        }

        let data = match mem.read_bytes(lo, hi - lo) {
            Some(data) => data,
            None => continue,
        };

        for offset in 0..=(data.len() - pattern.len()) {
            if pattern.matches(&data[offset..]) {
                results.push(lo + offset);
                if results.len() >= limit {
                    return results;
                }
            }
        }
    }

    results
}

/// First match address within `[start, end)`.
pub fn scan_first(mem: &MemoryAccess, pattern: &Pattern, start: usize, end: usize) -> Option<usize> {
    scan_all(mem, pattern, start, end, 1).into_iter().next()
}
