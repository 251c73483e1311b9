// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::bus::RegBit;
use crate::interrupt::InterruptVector;
use crate::signals::{LineFlags, LineId, LineSet, Signal};
use crate::{Peripheral, PeripheralId, System};
use serde::Serialize;
use std::any::Any;
use tracing::trace;

/// SCK divider for SPR1:SPR0.
const CLOCK_DIVIDERS: [u64; 4] = [4, 16, 64, 128];

const EVENT_SHIFTED: u32 = 0;

#[derive(Debug, Clone, Copy)]
pub struct SpiConfig {
    pub r_spdr: u16,
    pub r_spcr: u16,
    pub spe: RegBit,
    pub mstr: RegBit,
    /// SPR0, SPR1, SPI2X.
    pub spr: [RegBit; 3],
    /// SPIE / SPIF.
    pub vector: InterruptVector,
}

/// SPI controller. `OUTPUT` carries each byte shifted out, `INPUT` each byte
/// shifted in by a slave.
#[derive(Debug, Serialize)]
pub struct Spi {
    name: String,
    #[serde(skip)]
    config: SpiConfig,
    id: PeripheralId,
    #[serde(skip)]
    lines: LineSet,
    bytes_sent: u64,
}

impl Spi {
    pub const INPUT: usize = 0;
    pub const OUTPUT: usize = 1;

    pub fn attach(sys: &mut System, name: &str, config: SpiConfig) -> PeripheralId {
        sys.attach(name, |sys, id| {
            let lines = sys.alloc_lines(Some(id), &["in", "out"], LineFlags::empty());
            sys.subscribe(lines.get(Self::INPUT), id, Self::INPUT as u32);
            sys.bind_write(config.r_spdr, id, 0);
            sys.bind_read(config.r_spdr, id, 0);
            sys.register_vector(config.vector);
            Self {
                name: name.to_string(),
                config,
                id,
                lines,
                bytes_sent: 0,
            }
        })
    }

    pub fn line(&self, index: usize) -> LineId {
        self.lines.get(index)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Cycles to shift one byte out at the current SCK rate.
    pub fn byte_cycles(&self, sys: &System) -> u64 {
        let spcr = sys.default_read(self.config.r_spcr);
        let mut divider = CLOCK_DIVIDERS[(spcr & 0x3) as usize];
        if sys.regbit_get(self.config.mstr) != 0 && sys.regbit_get(self.config.spr[2]) != 0 {
            divider >>= 1;
        }
        divider * 8
    }
}

impl Peripheral for Spi {
    fn reset(&mut self, sys: &mut System) {
        sys.cancel(self.id, EVENT_SHIFTED);
        sys.default_write(self.config.r_spcr, 0);
        sys.default_write(self.config.r_spdr, 0);
    }

    /// Byte from a slave: latched into SPDR. A slave-mode controller answers
    /// with the byte it had loaded.
    fn on_signal(&mut self, sys: &mut System, _input: u32, signal: Signal) {
        if sys.regbit_get(self.config.spe) == 0 {
            return;
        }
        sys.default_write(self.config.r_spdr, signal.value as u8);
        sys.raise_interrupt(&self.config.vector);
        if sys.regbit_get(self.config.mstr) == 0 {
            let v = sys.default_read(self.config.r_spdr);
            sys.raise(self.lines.get(Self::OUTPUT), v as u32);
        }
    }

    fn on_event(&mut self, sys: &mut System, _token: u32, _when: u64) -> Option<u64> {
        if sys.regbit_get(self.config.spe) != 0 && sys.regbit_get(self.config.mstr) != 0 {
            sys.raise_interrupt(&self.config.vector);
            let v = sys.default_read(self.config.r_spdr);
            self.bytes_sent += 1;
            trace!(peripheral = %self.name, byte = v, "shifted out");
            sys.raise(self.lines.get(Self::OUTPUT), v as u32);
        }
        None
    }

    fn io_read(&mut self, sys: &mut System, addr: u16, _token: u32) -> u8 {
        let v = sys.default_read(addr);
        sys.regbit_clear(self.config.vector.raised);
        v
    }

    fn io_write(&mut self, sys: &mut System, addr: u16, value: u8, _token: u32) {
        sys.regbit_clear(self.config.vector.raised);
        sys.default_write(addr, value);
        let delay = self.byte_cycles(sys);
        sys.schedule(delay, self.id, EVENT_SHIFTED);
    }

    fn as_any(&self) -> Option<&dyn Any> {
        Some(self)
    }

    fn as_any_mut(&mut self) -> Option<&mut dyn Any> {
        Some(self)
    }

    fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chips::atmega328p;
    use crate::SimulationConfig;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_master_byte_timing() {
        let mut sys = System::new(SimulationConfig::default(), atmega328p::IO_SIZE);
        let spi = Spi::attach(&mut sys, "spi", atmega328p::SPI);
        let out = sys.get::<Spi>(spi).unwrap().line(Spi::OUTPUT);
        let bytes = Arc::new(Mutex::new(Vec::new()));
        let b = bytes.clone();
        sys.register_notify(out, move |_, sig| b.lock().unwrap().push(sig.value));

        // SPE | MSTR, fosc/4
        sys.write(0x4C, 0x50);
        sys.write(0x4E, 0xA5);
        assert_eq!(sys.get::<Spi>(spi).unwrap().byte_cycles(&sys), 32);
        for _ in 0..31 {
            sys.advance(1);
            sys.service();
        }
        assert!(bytes.lock().unwrap().is_empty());
        sys.advance(1);
        sys.service();
        assert_eq!(*bytes.lock().unwrap(), vec![0xA5]);
        assert_ne!(sys.default_read(0x4D) & 0x80, 0);
        // reading SPDR clears SPIF
        sys.read(0x4E);
        assert_eq!(sys.default_read(0x4D) & 0x80, 0);
    }

    #[test]
    fn test_double_speed_halves_divider() {
        let mut sys = System::new(SimulationConfig::default(), atmega328p::IO_SIZE);
        let spi = Spi::attach(&mut sys, "spi", atmega328p::SPI);
        sys.write(0x4C, 0x53);
        sys.write(0x4D, 0x01);
        assert_eq!(sys.get::<Spi>(spi).unwrap().byte_cycles(&sys), 64 * 8);
    }
}
