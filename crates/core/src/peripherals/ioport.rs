// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::signals::{LineFlags, LineId, LineSet, Signal};
use crate::{Peripheral, PeripheralId, System};
use serde::Serialize;
use std::any::Any;
use tracing::trace;

const HOOK_PORT: u32 = 0;
const HOOK_DDR: u32 = 1;
const HOOK_PIN: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortConfig {
    pub name: char,
    pub r_port: u16,
    pub r_ddr: u16,
    pub r_pin: u16,
}

/// One 8-bit GPIO port.
///
/// Lines 0..8 are the pins, both directions: the port raises them for output
/// pins and latches raises from outside into PIN. Line 8 carries the whole
/// pin byte, line 9 the PORT register.
#[derive(Debug, Serialize)]
pub struct IoPort {
    name: String,
    #[serde(skip)]
    config: PortConfig,
    #[serde(skip)]
    pins: LineSet,
    #[serde(skip)]
    extra: LineSet,
}

impl IoPort {
    pub const PIN_ALL: usize = 8;
    pub const REG_PORT: usize = 9;

    pub fn attach(sys: &mut System, config: PortConfig) -> PeripheralId {
        let name = format!("port{}", config.name.to_ascii_lowercase());
        sys.attach(&name, |sys, id| {
            let names: Vec<String> = (0..8).map(|i| format!("p{}{}", config.name, i)).collect();
            let names: Vec<&str> = names.iter().map(String::as_str).collect();
            let pins = sys.alloc_lines(Some(id), &names, LineFlags::FILTERED | LineFlags::BINARY);
            let extra = sys.alloc_lines(Some(id), &["all", "port"], LineFlags::empty());
            for (i, line) in pins.iter().enumerate() {
                sys.subscribe(line, id, i as u32);
            }
            sys.bind_write(config.r_port, id, HOOK_PORT);
            sys.bind_write(config.r_ddr, id, HOOK_DDR);
            sys.bind_write(config.r_pin, id, HOOK_PIN);
            sys.bind_read(config.r_pin, id, HOOK_PIN);
            Self {
                name: name.clone(),
                config,
                pins,
                extra,
            }
        })
    }

    pub fn letter(&self) -> char {
        self.config.name
    }

    pub fn pin(&self, index: usize) -> LineId {
        self.pins.get(index)
    }

    pub fn line(&self, index: usize) -> LineId {
        match index {
            0..=7 => self.pins.get(index),
            _ => self.extra.get(index - Self::PIN_ALL),
        }
    }

    fn update_lines(&mut self, sys: &mut System) {
        let ddr = sys.default_read(self.config.r_ddr);
        let port = sys.default_read(self.config.r_port);
        for i in 0..8 {
            let mask = 1u8 << i;
            if ddr & mask != 0 {
                sys.raise(self.pins.get(i), ((port >> i) & 1) as u32);
            } else if port & mask != 0 {
                // input with pull-up
                sys.raise(self.pins.get(i), 1);
            }
        }
        let pin = (sys.default_read(self.config.r_pin) & !ddr) | (port & ddr);
        sys.raise(self.extra.get(0), pin as u32);
        sys.raise(self.extra.get(1), port as u32);
    }
}

impl Peripheral for IoPort {
    fn reset(&mut self, sys: &mut System) {
        sys.default_write(self.config.r_port, 0);
        sys.default_write(self.config.r_ddr, 0);
    }

    fn on_signal(&mut self, sys: &mut System, input: u32, signal: Signal) {
        let mask = 1u8 << (input & 7);
        let pin = sys.default_read(self.config.r_pin);
        let pin = if signal.value != 0 {
            pin | mask
        } else {
            pin & !mask
        };
        trace!(peripheral = %self.name, pin = input, value = signal.value, "pin input");
        sys.default_write(self.config.r_pin, pin);
    }

    fn io_read(&mut self, sys: &mut System, _addr: u16, _token: u32) -> u8 {
        let ddr = sys.default_read(self.config.r_ddr);
        (sys.default_read(self.config.r_pin) & !ddr) | (sys.default_read(self.config.r_port) & ddr)
    }

    fn io_write(&mut self, sys: &mut System, addr: u16, value: u8, token: u32) {
        match token {
            // writing a one to PIN toggles the PORT bit
            HOOK_PIN => {
                let port = sys.default_read(self.config.r_port) ^ value;
                sys.default_write(self.config.r_port, port);
            }
            HOOK_PORT | HOOK_DDR => sys.default_write(addr, value),
            _ => return,
        }
        self.update_lines(sys);
    }

    fn as_any(&self) -> Option<&dyn Any> {
        Some(self)
    }

    fn as_any_mut(&mut self) -> Option<&mut dyn Any> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SimulationConfig;
    use std::sync::{Arc, Mutex};

    const PORTB: PortConfig = PortConfig {
        name: 'B',
        r_port: 0x25,
        r_ddr: 0x24,
        r_pin: 0x23,
    };

    #[test]
    fn test_output_pins_follow_port() {
        let mut sys = System::new(SimulationConfig::default(), 0x100);
        let port = IoPort::attach(&mut sys, PORTB);
        let pb2 = sys.get::<IoPort>(port).unwrap().pin(2);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        sys.register_notify(pb2, move |_, sig| s.lock().unwrap().push(sig.value));

        sys.write(0x24, 0x04);
        sys.write(0x25, 0x04);
        sys.write(0x25, 0x04);
        sys.write(0x25, 0x00);
        // filtered: the repeated PORT write leaves PB2 high and does not notify
        assert_eq!(*seen.lock().unwrap(), vec![1, 0]);
        assert_eq!(sys.read(0x23), 0x00);
    }

    #[test]
    fn test_external_input_sets_pin() {
        let mut sys = System::new(SimulationConfig::default(), 0x100);
        let port = IoPort::attach(&mut sys, PORTB);
        let pb5 = sys.get::<IoPort>(port).unwrap().pin(5);
        sys.raise(pb5, 1);
        assert_eq!(sys.read(0x23), 0x20);
        sys.raise(pb5, 0);
        assert_eq!(sys.read(0x23), 0x00);
    }

    #[test]
    fn test_pin_write_toggles_port() {
        let mut sys = System::new(SimulationConfig::default(), 0x100);
        IoPort::attach(&mut sys, PORTB);
        sys.write(0x24, 0xFF);
        sys.write(0x23, 0x81);
        assert_eq!(sys.default_read(0x25), 0x81);
        sys.write(0x23, 0x01);
        assert_eq!(sys.default_read(0x25), 0x80);
        assert_eq!(sys.read(0x23), 0x80);
    }
}
