// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::bus::RegBit;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A CPU interrupt vector as seen by a peripheral: the vector number plus the
/// "enable" and "raised" flag bits that gate it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InterruptVector {
    /// Vector number, 0 (reset) is reserved.
    pub vector: u8,
    pub enable: RegBit,
    pub raised: RegBit,
}

impl InterruptVector {
    pub const fn new(vector: u8, enable: RegBit, raised: RegBit) -> Self {
        Self {
            vector,
            enable,
            raised,
        }
    }
}

/// Pending-vector bookkeeping consumed by the executor.
///
/// Lower vector numbers have priority, matching the AVR fixed-priority scheme.
#[derive(Debug, Default)]
pub struct InterruptController {
    pending: BTreeSet<u8>,
    vectors: BTreeMap<u8, InterruptVector>,
}

impl InterruptController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the vector so `acknowledge` can clear its raised flag.
    pub fn register(&mut self, vector: InterruptVector) {
        self.vectors.insert(vector.vector, vector);
    }

    pub fn vector(&self, number: u8) -> Option<&InterruptVector> {
        self.vectors.get(&number)
    }

    pub fn set_pending(&mut self, vector: u8) {
        self.pending.insert(vector);
    }

    pub fn clear(&mut self, vector: u8) {
        self.pending.remove(&vector);
    }

    pub fn is_pending(&self, vector: u8) -> bool {
        self.pending.contains(&vector)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Highest priority pending vector without consuming it.
    pub fn next_pending(&self) -> Option<u8> {
        self.pending.iter().next().copied()
    }

    pub fn pending(&self) -> impl Iterator<Item = u8> + '_ {
        self.pending.iter().copied()
    }

    pub fn reset(&mut self) {
        self.pending.clear();
    }
}
