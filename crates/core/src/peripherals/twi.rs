// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Two-wire (I2C) master and the message format shared with TWI slave parts.
//!
//! Bus activity is not modelled bit by bit. Each bus phase is one [`TwiMessage`]
//! raised on the master's `OUTPUT` line; slaves answer on the master's `INPUT`
//! line with `ACK` and, for reads, the data byte.

use crate::bus::RegBit;
use crate::interrupt::InterruptVector;
use crate::signals::{LineFlags, LineId, LineSet, Signal};
use crate::{Peripheral, PeripheralId, System};
use serde::Serialize;
use std::any::Any;
use tracing::{debug, trace};

bitflags::bitflags! {
    /// Bus conditions carried by a [`TwiMessage`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TwiCond: u8 {
        const START = 1 << 0;
        const STOP = 1 << 1;
        const ADDR = 1 << 2;
        const ACK = 1 << 3;
        const WRITE = 1 << 4;
        const READ = 1 << 5;
    }
}

/// One bus phase, packed into a line value as
/// `cond << 8 | addr << 16 | data << 24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TwiMessage {
    pub cond: TwiCond,
    /// 8-bit address including the R/W bit.
    pub addr: u8,
    pub data: u8,
}

impl TwiMessage {
    pub fn new(cond: TwiCond, addr: u8, data: u8) -> Self {
        Self { cond, addr, data }
    }

    pub fn pack(self) -> u32 {
        ((self.cond.bits() as u32) << 8) | ((self.addr as u32) << 16) | ((self.data as u32) << 24)
    }

    pub fn unpack(value: u32) -> Self {
        Self {
            cond: TwiCond::from_bits_truncate((value >> 8) as u8),
            addr: (value >> 16) as u8,
            data: (value >> 24) as u8,
        }
    }

    pub fn has(&self, cond: TwiCond) -> bool {
        self.cond.contains(cond)
    }
}

/// TWSR status codes, master side.
pub mod status {
    pub const START: u8 = 0x08;
    pub const REPEATED_START: u8 = 0x10;
    pub const MTX_ADR_ACK: u8 = 0x18;
    pub const MTX_ADR_NACK: u8 = 0x20;
    pub const MTX_DATA_ACK: u8 = 0x28;
    pub const MTX_DATA_NACK: u8 = 0x30;
    pub const MRX_ADR_ACK: u8 = 0x40;
    pub const MRX_ADR_NACK: u8 = 0x48;
    pub const MRX_DATA_ACK: u8 = 0x50;
    pub const MRX_DATA_NACK: u8 = 0x58;
    pub const NO_INFO: u8 = 0xF8;
}

const START_CYCLES: u64 = 3;
const BYTE_CYCLES: u64 = 9;

const HOOK_TWCR: u32 = 0;
const HOOK_TWSR: u32 = 1;
const HOOK_TWDR: u32 = 2;
const EVENT_STATUS: u32 = 0;

#[derive(Debug, Clone, Copy)]
pub struct TwiConfig {
    pub r_twbr: u16,
    pub r_twsr: u16,
    pub r_twar: u16,
    pub r_twdr: u16,
    pub r_twcr: u16,
    pub twen: RegBit,
    pub twea: RegBit,
    pub twsta: RegBit,
    pub twsto: RegBit,
    pub twwc: RegBit,
    pub twps: [RegBit; 2],
    /// TWS7..TWS3.
    pub tws: RegBit,
    /// TWIE / TWINT.
    pub vector: InterruptVector,
}

/// Status to latch when the bus phase completes. Address and data phases
/// depend on the slave's answer, which arrives after the message is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
enum PendingStatus {
    Fixed(u8),
    Acked { ack: u8, nack: u8 },
}

#[derive(Debug, Serialize)]
pub struct Twi {
    name: String,
    #[serde(skip)]
    config: TwiConfig,
    id: PeripheralId,
    #[serde(skip)]
    lines: LineSet,
    #[serde(skip)]
    state: TwiCond,
    peer: u8,
    acked: bool,
    pending: Option<PendingStatus>,
}

impl Twi {
    pub const INPUT: usize = 0;
    pub const OUTPUT: usize = 1;

    pub fn attach(sys: &mut System, name: &str, config: TwiConfig) -> PeripheralId {
        sys.attach(name, |sys, id| {
            let lines = sys.alloc_lines(Some(id), &["in", "out"], LineFlags::empty());
            sys.subscribe(lines.get(Self::INPUT), id, Self::INPUT as u32);
            sys.bind_write(config.r_twcr, id, HOOK_TWCR);
            sys.bind_write(config.r_twsr, id, HOOK_TWSR);
            sys.bind_write(config.r_twdr, id, HOOK_TWDR);
            sys.register_vector(config.vector);
            let mut twi = Self {
                name: name.to_string(),
                config,
                id,
                lines,
                state: TwiCond::empty(),
                peer: 0,
                acked: false,
                pending: None,
            };
            twi.power_on(sys);
            twi
        })
    }

    pub fn line(&self, index: usize) -> LineId {
        self.lines.get(index)
    }

    /// Current TWSR status code.
    pub fn status(&self, sys: &System) -> u8 {
        sys.regbit_get(self.config.tws) << 3
    }

    /// CPU cycles per SCL period: `16 + 2 * TWBR * 4^TWPS`.
    pub fn bit_cycles(&self, sys: &System) -> u64 {
        let twbr = sys.default_read(self.config.r_twbr) as u64;
        let twps = sys.regbit_get_array(&self.config.twps) as u64;
        16 + 2 * twbr * (1 << (2 * twps))
    }

    fn power_on(&mut self, sys: &mut System) {
        sys.default_write(self.config.r_twcr, 0);
        sys.default_write(self.config.r_twbr, 0);
        sys.default_write(self.config.r_twdr, 0xFF);
        sys.default_write(self.config.r_twar, 0xFE);
        sys.default_write(self.config.r_twsr, status::NO_INFO);
        self.state = TwiCond::empty();
        self.acked = false;
        self.pending = None;
    }

    fn set_status(&self, sys: &mut System, code: u8) {
        sys.regbit_setto(self.config.tws, code >> 3);
    }

    fn send(&mut self, sys: &mut System, msg: TwiMessage) {
        trace!(peripheral = %self.name, cond = ?msg.cond, addr = msg.addr, data = msg.data, "bus message");
        sys.raise(self.lines.get(Self::OUTPUT), msg.pack());
    }

    fn complete_after(&mut self, sys: &mut System, bits: u64, status: PendingStatus) {
        self.pending = Some(status);
        let delay = bits * self.bit_cycles(sys);
        sys.cancel(self.id, EVENT_STATUS);
        sys.schedule(delay, self.id, EVENT_STATUS);
    }

    fn write_twcr(&mut self, sys: &mut System, value: u8) {
        let old = sys.default_read(self.config.r_twcr);
        let cfg = self.config;
        let twint = cfg.vector.raised;
        let was_enabled = cfg.twen.from_value(old) != 0;
        let old_sta = cfg.twsta.from_value(old) != 0;
        let old_sto = cfg.twsto.from_value(old) != 0;

        // TWINT is write-one-to-clear, the rest is stored as written
        let cleared = twint.from_value(value) != 0;
        let keep_int = twint.from_value(old) != 0 && !cleared;
        sys.default_write(cfg.r_twcr, twint.insert(value, keep_int as u8));

        let enabled = sys.regbit_get(cfg.twen) != 0;
        if enabled != was_enabled {
            debug!(peripheral = %self.name, enabled, "TWI enable changed");
            if !enabled {
                sys.regbit_clear(cfg.twea);
                sys.regbit_clear(cfg.twsta);
                sys.regbit_clear(cfg.twsto);
                sys.clear_interrupt(&cfg.vector);
                sys.cancel(self.id, EVENT_STATUS);
                sys.default_write(cfg.r_twdr, 0xFF);
                self.set_status(sys, status::NO_INFO);
                self.state = TwiCond::empty();
                self.pending = None;
            }
        }
        if !enabled {
            return;
        }
        if cleared {
            sys.clear_interrupt(&cfg.vector);
        }

        let sta = sys.regbit_get(cfg.twsta) != 0;
        let sto = sys.regbit_get(cfg.twsto) != 0;

        if sto && !old_sto {
            if self.state.contains(TwiCond::START) {
                let msg = TwiMessage::new(TwiCond::STOP, self.peer, 0);
                self.send(sys, msg);
            }
            self.state = TwiCond::empty();
            // cleared by hardware once STOP is on the bus
            sys.regbit_clear(cfg.twsto);
        }

        if sta && !old_sta {
            let code = if self.state.contains(TwiCond::START) {
                status::REPEATED_START
            } else {
                status::START
            };
            self.state = TwiCond::START;
            self.complete_after(sys, START_CYCLES, PendingStatus::Fixed(code));
            return;
        }

        if !cleared || sta || sto || !self.state.contains(TwiCond::START) {
            return;
        }

        let data = sys.default_read(cfg.r_twdr);
        self.acked = false;
        if self.state.contains(TwiCond::ADDR) {
            if self.state.contains(TwiCond::READ) {
                let ack = sys.regbit_get(cfg.twea) != 0;
                let mut cond = TwiCond::READ;
                if ack {
                    cond |= TwiCond::ACK;
                }
                let msg = TwiMessage::new(cond, self.peer, 0);
                self.send(sys, msg);
                let code = if ack {
                    status::MRX_DATA_ACK
                } else {
                    status::MRX_DATA_NACK
                };
                self.complete_after(sys, BYTE_CYCLES, PendingStatus::Fixed(code));
            } else {
                let msg = TwiMessage::new(TwiCond::WRITE, self.peer, data);
                self.send(sys, msg);
                self.complete_after(
                    sys,
                    BYTE_CYCLES,
                    PendingStatus::Acked {
                        ack: status::MTX_DATA_ACK,
                        nack: status::MTX_DATA_NACK,
                    },
                );
            }
        } else {
            self.peer = data;
            let read = data & 1 != 0;
            let dir = if read { TwiCond::READ } else { TwiCond::WRITE };
            self.state |= TwiCond::ADDR | dir;
            let msg = TwiMessage::new(TwiCond::START | TwiCond::ADDR | dir, data, 0);
            self.send(sys, msg);
            let pending = if read {
                PendingStatus::Acked {
                    ack: status::MRX_ADR_ACK,
                    nack: status::MRX_ADR_NACK,
                }
            } else {
                PendingStatus::Acked {
                    ack: status::MTX_ADR_ACK,
                    nack: status::MTX_ADR_NACK,
                }
            };
            self.complete_after(sys, BYTE_CYCLES, pending);
        }
    }
}

impl Peripheral for Twi {
    fn reset(&mut self, sys: &mut System) {
        sys.cancel(self.id, EVENT_STATUS);
        self.power_on(sys);
    }

    fn on_signal(&mut self, sys: &mut System, _input: u32, signal: Signal) {
        let msg = TwiMessage::unpack(signal.value);
        if msg.has(TwiCond::ACK) {
            self.acked = true;
        }
        if msg.has(TwiCond::READ) {
            sys.default_write(self.config.r_twdr, msg.data);
        }
    }

    fn on_event(&mut self, sys: &mut System, _token: u32, _when: u64) -> Option<u64> {
        let code = match self.pending.take()? {
            PendingStatus::Fixed(code) => code,
            PendingStatus::Acked { ack, nack } => {
                if self.acked {
                    ack
                } else {
                    nack
                }
            }
        };
        trace!(peripheral = %self.name, status = code, "bus phase complete");
        self.set_status(sys, code);
        sys.raise_interrupt(&self.config.vector);
        None
    }

    fn io_write(&mut self, sys: &mut System, addr: u16, value: u8, token: u32) {
        match token {
            HOOK_TWCR => self.write_twcr(sys, value),
            HOOK_TWSR => {
                // status bits are read-only
                let keep = sys.default_read(addr) & self.config.tws.raw_mask();
                sys.default_write(addr, (value & !self.config.tws.raw_mask()) | keep);
            }
            HOOK_TWDR => {
                if sys.regbit_get(self.config.vector.raised) == 0
                    && self.state.contains(TwiCond::START)
                {
                    // write collision: TWDR is only writable while TWINT is set
                    sys.regbit_set(self.config.twwc);
                    return;
                }
                sys.regbit_clear(self.config.twwc);
                sys.default_write(addr, value);
            }
            _ => sys.default_write(addr, value),
        }
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
