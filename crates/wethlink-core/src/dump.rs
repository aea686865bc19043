//! Register dump text format
//!
//! A dump is a CSV-like text file:
//!
//! ```text
//! "Address","Data"
//! "1","74"
//! "2","0x2a"
//! ```
//!
//! Addresses are decimal. Values are decimal on export and may be decimal or
//! `0x`-prefixed hex on import. Rows are applied in file order.

use std::fmt::Write as _;
use thiserror::Error;

use crate::register::RegisterMap;

/// Header line of every dump
pub const DUMP_HEADER: &str = "\"Address\",\"Data\"";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DumpError {
    #[error("missing \"Address\",\"Data\" header")]
    MissingHeader,
    #[error("line {line}: expected two quoted fields")]
    Malformed { line: usize },
    #[error("line {line}: invalid address '{text}'")]
    BadAddress { line: usize, text: String },
    #[error("line {line}: invalid value '{text}'")]
    BadValue { line: usize, text: String },
    #[error("line {line}: address {addr} is not a valid {device} register")]
    ReservedAddress {
        line: usize,
        addr: u32,
        device: &'static str,
    },
}

/// Ordered register contents of one device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterDump {
    pub rows: Vec<(u32, u8)>,
}

impl RegisterDump {
    pub fn new(rows: Vec<(u32, u8)>) -> Self {
        Self { rows }
    }

    /// Parse dump text, validating every address against `map`
    pub fn parse(text: &str, map: &RegisterMap) -> Result<Self, DumpError> {
        let mut lines = text
            .lines()
            .enumerate()
            .map(|(i, l)| (i + 1, l.trim()))
            .filter(|(_, l)| !l.is_empty());

        match lines.next() {
            Some((_, header)) if header == DUMP_HEADER => {}
            _ => return Err(DumpError::MissingHeader),
        }

        let mut rows = Vec::new();
        for (line, content) in lines {
            let (addr_text, value_text) = split_row(content).ok_or(DumpError::Malformed { line })?;

            let addr: u32 = addr_text.parse().map_err(|_| DumpError::BadAddress {
                line,
                text: addr_text.to_string(),
            })?;

            let value = parse_value(value_text).ok_or_else(|| DumpError::BadValue {
                line,
                text: value_text.to_string(),
            })?;

            if !map.contains(addr) {
                return Err(DumpError::ReservedAddress {
                    line,
                    addr,
                    device: map.device,
                });
            }

            rows.push((addr, value));
        }

        Ok(Self { rows })
    }

    /// Render header plus one row per register
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(16 + self.rows.len() * 12);
        out.push_str(DUMP_HEADER);
        out.push('\n');
        for (addr, value) in &self.rows {
            let _ = writeln!(out, "\"{}\",\"{}\"", addr, value);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Split `"a","b"` into its two unquoted fields
fn split_row(line: &str) -> Option<(&str, &str)> {
    fn unquote(s: &str) -> Option<&str> {
        let s = s.trim();
        s.strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .map(str::trim)
    }

    let (left, right) = line.split_once(',')?;
    Some((unquote(left)?, unquote(right)?))
}

/// Decimal or 0x-hex, must fit in one byte
fn parse_value(text: &str) -> Option<u8> {
    let value = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok()?,
        None => text.parse::<u32>().ok()?,
    };
    u8::try_from(value).ok()
}
