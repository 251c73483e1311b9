// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Register interception layer.
//!
//! The data address space is a flat byte array ("default storage"). Any
//! address may additionally carry a read hook and/or a write hook. A later
//! bind on the same address replaces the earlier one, which is how a chip
//! variant overrides a generic peripheral hook.

mod regbit;
mod result_pair;

pub use regbit::{pack_fields, RegBit};
pub use result_pair::{PairState, ResultPair};

use crate::system::PeripheralId;
use crate::System;

pub type ReadFn = Box<dyn FnMut(&mut System, u16) -> u8 + Send>;
pub type WriteFn = Box<dyn FnMut(&mut System, u16, u8) + Send>;

/// Read hook bound to an address.
pub enum ReadHook {
    Peripheral { id: PeripheralId, token: u32 },
    Closure(ReadFn),
}

/// Write hook bound to an address.
pub enum WriteHook {
    Peripheral { id: PeripheralId, token: u32 },
    Closure(WriteFn),
}

impl std::fmt::Debug for ReadHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadHook::Peripheral { id, token } => write!(f, "Peripheral({:?}, {})", id, token),
            ReadHook::Closure(_) => f.write_str("Closure(..)"),
        }
    }
}

impl std::fmt::Debug for WriteHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteHook::Peripheral { id, token } => write!(f, "Peripheral({:?}, {})", id, token),
            WriteHook::Closure(_) => f.write_str("Closure(..)"),
        }
    }
}

#[derive(Debug)]
pub struct IoBus {
    data: Vec<u8>,
    read_hooks: Vec<Option<ReadHook>>,
    write_hooks: Vec<Option<WriteHook>>,
}

impl IoBus {
    pub fn new(size: usize) -> Self {
        let mut read_hooks = Vec::with_capacity(size);
        read_hooks.resize_with(size, || None);
        let mut write_hooks = Vec::with_capacity(size);
        write_hooks.resize_with(size, || None);
        Self {
            data: vec![0; size],
            read_hooks,
            write_hooks,
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn contains(&self, addr: u16) -> bool {
        (addr as usize) < self.data.len()
    }

    /// Plain storage read. Out-of-range addresses read as zero.
    pub fn default_read(&self, addr: u16) -> u8 {
        self.data.get(addr as usize).copied().unwrap_or(0)
    }

    /// Plain storage write. Out-of-range addresses are ignored.
    pub fn default_write(&mut self, addr: u16, value: u8) {
        if let Some(slot) = self.data.get_mut(addr as usize) {
            *slot = value;
        }
    }

    pub fn bind_read(&mut self, addr: u16, hook: ReadHook) {
        if let Some(slot) = self.read_hooks.get_mut(addr as usize) {
            *slot = Some(hook);
        }
    }

    pub fn bind_write(&mut self, addr: u16, hook: WriteHook) {
        if let Some(slot) = self.write_hooks.get_mut(addr as usize) {
            *slot = Some(hook);
        }
    }

    pub fn has_read_hook(&self, addr: u16) -> bool {
        matches!(self.read_hooks.get(addr as usize), Some(Some(_)))
    }

    pub fn has_write_hook(&self, addr: u16) -> bool {
        matches!(self.write_hooks.get(addr as usize), Some(Some(_)))
    }

    /// Peripheral-bound read hook at `addr`, if that is what is installed.
    pub(crate) fn peripheral_read_hook(&self, addr: u16) -> Option<(PeripheralId, u32)> {
        match self.read_hooks.get(addr as usize) {
            Some(Some(ReadHook::Peripheral { id, token })) => Some((*id, *token)),
            _ => None,
        }
    }

    pub(crate) fn peripheral_write_hook(&self, addr: u16) -> Option<(PeripheralId, u32)> {
        match self.write_hooks.get(addr as usize) {
            Some(Some(WriteHook::Peripheral { id, token })) => Some((*id, *token)),
            _ => None,
        }
    }

    /// Takes a closure read hook out of its slot so it can run with mutable
    /// access to the system.
    pub(crate) fn take_read_closure(&mut self, addr: u16) -> Option<ReadFn> {
        let slot = self.read_hooks.get_mut(addr as usize)?;
        match slot.take() {
            Some(ReadHook::Closure(f)) => Some(f),
            other => {
                *slot = other;
                None
            }
        }
    }

    pub(crate) fn take_write_closure(&mut self, addr: u16) -> Option<WriteFn> {
        let slot = self.write_hooks.get_mut(addr as usize)?;
        match slot.take() {
            Some(WriteHook::Closure(f)) => Some(f),
            other => {
                *slot = other;
                None
            }
        }
    }

    /// Puts a closure back unless the hook rebound the address meanwhile.
    pub(crate) fn restore_read_closure(&mut self, addr: u16, f: ReadFn) {
        if let Some(slot) = self.read_hooks.get_mut(addr as usize) {
            if slot.is_none() {
                *slot = Some(ReadHook::Closure(f));
            }
        }
    }

    pub(crate) fn restore_write_closure(&mut self, addr: u16, f: WriteFn) {
        if let Some(slot) = self.write_hooks.get_mut(addr as usize) {
            if slot.is_none() {
                *slot = Some(WriteHook::Closure(f));
            }
        }
    }

    /// Removes every hook bound to `id`.
    pub fn unbind_peripheral(&mut self, id: PeripheralId) {
        for slot in self.read_hooks.iter_mut() {
            if matches!(slot, Some(ReadHook::Peripheral { id: i, .. }) if *i == id) {
                *slot = None;
            }
        }
        for slot in self.write_hooks.iter_mut() {
            if matches!(slot, Some(WriteHook::Peripheral { id: i, .. }) if *i == id) {
                *slot = None;
            }
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_storage() {
        let mut io = IoBus::new(0x100);
        io.default_write(0x20, 0x5A);
        assert_eq!(io.default_read(0x20), 0x5A);
        // out of range is silently ignored
        io.default_write(0x1000, 1);
        assert_eq!(io.default_read(0x1000), 0);
    }

    #[test]
    fn test_last_bind_wins() {
        let mut io = IoBus::new(0x100);
        io.bind_write(
            0x30,
            WriteHook::Peripheral {
                id: PeripheralId(0),
                token: 1,
            },
        );
        io.bind_write(
            0x30,
            WriteHook::Peripheral {
                id: PeripheralId(4),
                token: 7,
            },
        );
        assert_eq!(io.peripheral_write_hook(0x30), Some((PeripheralId(4), 7)));
        assert!(!io.has_read_hook(0x30));
    }

    #[test]
    fn test_closure_take_and_restore() {
        let mut io = IoBus::new(0x10);
        io.bind_read(2, ReadHook::Closure(Box::new(|_, _| 9)));
        let f = io.take_read_closure(2).unwrap();
        assert!(!io.has_read_hook(2));
        io.restore_read_closure(2, f);
        assert!(io.has_read_hook(2));
    }

    #[test]
    fn test_unbind_peripheral() {
        let mut io = IoBus::new(0x10);
        let hook = || WriteHook::Peripheral {
            id: PeripheralId(2),
            token: 0,
        };
        io.bind_write(1, hook());
        io.bind_write(3, hook());
        io.unbind_peripheral(PeripheralId(2));
        assert!(!io.has_write_hook(1));
        assert!(!io.has_write_hook(3));
    }
}
