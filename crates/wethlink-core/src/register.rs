//! Per-device register maps
//!
//! Each transceiver chip exposes a small byte-wide register file with its own
//! reserved address gaps. The gap policy is a constant table per device, not
//! a general rule.

use std::ops::{Range, RangeInclusive};

/// Transmitter chip name
pub const TX_DEVICE: &str = "hmc6300";
/// Receiver chip name
pub const RX_DEVICE: &str = "hmc6301";

/// Valid address layout of one device's register file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterMap {
    pub device: &'static str,
    pub span: Range<u32>,
    pub reserved: &'static [RangeInclusive<u32>],
}

pub static TX_REGISTERS: RegisterMap = RegisterMap {
    device: TX_DEVICE,
    span: 0..28,
    reserved: &[0..=0, 13..=15],
};

pub static RX_REGISTERS: RegisterMap = RegisterMap {
    device: RX_DEVICE,
    span: 0..28,
    reserved: &[10..=15],
};

impl RegisterMap {
    /// Look up the built-in table for a device
    pub fn for_device(name: &str) -> Option<&'static RegisterMap> {
        match name {
            TX_DEVICE => Some(&TX_REGISTERS),
            RX_DEVICE => Some(&RX_REGISTERS),
            _ => None,
        }
    }

    /// Whether `addr` is in range and not reserved
    pub fn contains(&self, addr: u32) -> bool {
        self.span.contains(&addr) && !self.reserved.iter().any(|r| r.contains(&addr))
    }

    /// Valid addresses in ascending order
    pub fn addresses(&self) -> impl Iterator<Item = u32> + '_ {
        self.span.clone().filter(move |addr| self.contains(*addr))
    }

    pub fn len(&self) -> usize {
        self.addresses().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Parse an operator-entered register value and mask it to one byte.
/// Accepts decimal, `0x`-prefixed hex, or bare hex when `bare_hex` is set.
pub fn parse_byte(text: &str, bare_hex: bool) -> Option<u8> {
    let text = text.trim();
    let value = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()?
    } else if bare_hex {
        u32::from_str_radix(text, 16).ok()?
    } else {
        text.parse::<u32>().ok()?
    };
    Some((value & 0xff) as u8)
}
