// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::System;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum PairState {
    #[default]
    Clean,
    /// The low byte was read; the high byte still belongs to the same result.
    LoRead,
}

/// Torn-read interlock for a 16-bit result exposed as two byte registers.
///
/// Reading the low byte freezes the pair. A result published while frozen is
/// held back and lands when the high byte is read, so a lo/hi read sequence
/// always observes one consistent result.
#[derive(Debug, Clone, Serialize)]
pub struct ResultPair {
    lo: u16,
    hi: u16,
    state: PairState,
    pending: Option<u16>,
}

impl ResultPair {
    pub fn new(lo: u16, hi: u16) -> Self {
        Self {
            lo,
            hi,
            state: PairState::Clean,
            pending: None,
        }
    }

    pub fn state(&self) -> PairState {
        self.state
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn lo_addr(&self) -> u16 {
        self.lo
    }

    pub fn hi_addr(&self) -> u16 {
        self.hi
    }

    /// Makes `value` visible, or defers it while the pair is frozen.
    /// Returns true when the registers were updated immediately.
    pub fn publish(&mut self, sys: &mut System, value: u16) -> bool {
        if self.state == PairState::LoRead {
            self.pending = Some(value);
            return false;
        }
        self.store(sys, value);
        true
    }

    pub fn read_lo(&mut self, sys: &mut System) -> u8 {
        self.state = PairState::LoRead;
        sys.default_read(self.lo)
    }

    pub fn read_hi(&mut self, sys: &mut System) -> u8 {
        let v = sys.default_read(self.hi);
        self.state = PairState::Clean;
        if let Some(value) = self.pending.take() {
            self.store(sys, value);
        }
        v
    }

    pub fn reset(&mut self) {
        self.state = PairState::Clean;
        self.pending = None;
    }

    fn store(&self, sys: &mut System, value: u16) {
        sys.default_write(self.lo, value as u8);
        sys.default_write(self.hi, (value >> 8) as u8);
    }
}
