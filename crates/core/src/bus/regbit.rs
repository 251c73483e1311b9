// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use serde::{Deserialize, Serialize};

/// A bit field inside one I/O register: `mask` applied after shifting right by
/// `bit`. Address 0 means "not present on this chip"; every accessor treats
/// such a field as reading zero and ignores writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RegBit {
    pub reg: u16,
    pub bit: u8,
    pub mask: u8,
}

impl RegBit {
    pub const NONE: RegBit = RegBit {
        reg: 0,
        bit: 0,
        mask: 0,
    };

    /// Single bit.
    pub const fn new(reg: u16, bit: u8) -> Self {
        Self { reg, bit, mask: 1 }
    }

    /// Multi-bit field.
    pub const fn field(reg: u16, bit: u8, mask: u8) -> Self {
        Self { reg, bit, mask }
    }

    pub const fn is_none(&self) -> bool {
        self.reg == 0
    }

    /// Mask in register position.
    pub const fn raw_mask(&self) -> u8 {
        self.mask << self.bit
    }

    /// Extracts the field from a register value that has not been stored yet.
    pub const fn from_value(&self, value: u8) -> u8 {
        if self.reg == 0 {
            return 0;
        }
        (value >> self.bit) & self.mask
    }

    /// Returns `value` with the field replaced by `v`.
    pub const fn insert(&self, value: u8, v: u8) -> u8 {
        let m = self.raw_mask();
        (value & !m) | ((v << self.bit) & m)
    }
}

/// Packs an array of fields into one value, field `i` landing at bit `i`.
/// This is how prescaler selectors split across registers are read.
pub fn pack_fields(fields: &[RegBit], read: impl Fn(u16) -> u8) -> u8 {
    fields
        .iter()
        .enumerate()
        .filter(|(_, rb)| !rb.is_none())
        .fold(0u8, |acc, (i, rb)| {
            acc | (((read(rb.reg) >> rb.bit) & rb.mask) << i)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_value_and_insert() {
        let adps = RegBit::field(0x7A, 0, 0x7);
        assert_eq!(adps.from_value(0x85), 5);
        assert_eq!(adps.insert(0x80, 3), 0x83);
        assert_eq!(RegBit::NONE.from_value(0xFF), 0);
    }

    #[test]
    fn test_pack_fields() {
        let fields = [
            RegBit::new(0x10, 0),
            RegBit::new(0x10, 1),
            RegBit::new(0x11, 5),
        ];
        let packed = pack_fields(&fields, |addr| if addr == 0x10 { 0b01 } else { 0x20 });
        assert_eq!(packed, 0b101);
    }
}
