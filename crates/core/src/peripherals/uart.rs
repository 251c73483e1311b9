// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Asynchronous USART.
//!
//! Bytes written to UDR leave on the `OUTPUT` line immediately and the
//! transmitter reports UDRE/TXC one frame time later. Bytes raised on `INPUT`
//! are queued in a receive FIFO and surface through RXC one frame time apart.
//! `XON`/`XOFF` tell a host-side feeder when the FIFO drained or filled up.

use crate::bus::RegBit;
use crate::interrupt::InterruptVector;
use crate::signals::{LineFlags, LineId, LineSet, Signal};
use crate::{Peripheral, PeripheralId, System};
use serde::Serialize;
use std::any::Any;
use std::collections::VecDeque;
use tracing::{debug, trace, warn};

pub const RX_FIFO_DEPTH: usize = 64;

/// Character size for UCSZ2:0; the reserved codes frame as 8 bits.
const DATA_BITS: [u64; 8] = [5, 6, 7, 8, 8, 8, 8, 9];

const HOOK_UDR: u32 = 0;
const HOOK_UCSRA: u32 = 1;
const HOOK_UCSRB: u32 = 2;
const HOOK_UBRR: u32 = 3;

const EVENT_TX: u32 = 0;
const EVENT_RX: u32 = 1;

#[derive(Debug, Clone, Copy)]
pub struct UartConfig {
    pub r_udr: u16,
    pub r_ucsra: u16,
    pub r_ucsrb: u16,
    pub r_ucsrc: u16,
    pub r_ubrrl: u16,
    pub r_ubrrh: u16,
    pub rxen: RegBit,
    pub txen: RegBit,
    pub u2x: RegBit,
    /// Data overrun flag.
    pub dor: RegBit,
    /// UCSZ0, UCSZ1, UCSZ2.
    pub ucsz: [RegBit; 3],
    pub upm: RegBit,
    pub usbs: RegBit,
    pub rxc: InterruptVector,
    pub txc: InterruptVector,
    pub udrc: InterruptVector,
}

#[derive(Debug, Serialize)]
pub struct Uart {
    name: String,
    #[serde(skip)]
    config: UartConfig,
    id: PeripheralId,
    #[serde(skip)]
    data: LineSet,
    #[serde(skip)]
    flow: LineSet,
    rx_fifo: VecDeque<u8>,
    /// Transmitted text up to the next newline, for the log.
    tx_text: String,
    bytes_sent: u64,
    overruns: u64,
}

impl Uart {
    pub const INPUT: usize = 0;
    pub const OUTPUT: usize = 1;
    pub const XON: usize = 2;
    pub const XOFF: usize = 3;

    pub fn attach(sys: &mut System, name: &str, config: UartConfig) -> PeripheralId {
        sys.attach(name, |sys, id| {
            let data = sys.alloc_lines(Some(id), &["in", "out"], LineFlags::empty());
            let flow = sys.alloc_lines(
                Some(id),
                &["xon", "xoff"],
                LineFlags::FILTERED | LineFlags::BINARY,
            );
            sys.subscribe(data.get(Self::INPUT), id, Self::INPUT as u32);

            sys.bind_write(config.r_udr, id, HOOK_UDR);
            sys.bind_read(config.r_udr, id, HOOK_UDR);
            sys.bind_write(config.r_ucsra, id, HOOK_UCSRA);
            sys.bind_read(config.r_ucsra, id, HOOK_UCSRA);
            sys.bind_write(config.r_ucsrb, id, HOOK_UCSRB);
            sys.bind_write(config.r_ubrrl, id, HOOK_UBRR);
            sys.bind_write(config.r_ubrrh, id, HOOK_UBRR);
            for vector in [config.rxc, config.txc, config.udrc] {
                sys.register_vector(vector);
            }
            // 8N1, transmit buffer empty
            sys.default_write(config.r_ucsrc, 0x06);
            sys.regbit_set(config.udrc.raised);
            Self {
                name: name.to_string(),
                config,
                id,
                data,
                flow,
                rx_fifo: VecDeque::with_capacity(RX_FIFO_DEPTH),
                tx_text: String::new(),
                bytes_sent: 0,
                overruns: 0,
            }
        })
    }

    pub fn line(&self, index: usize) -> LineId {
        if index < Self::XON {
            self.data.get(index)
        } else {
            self.flow.get(index - Self::XON)
        }
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    pub fn rx_pending(&self) -> usize {
        self.rx_fifo.len()
    }

    /// Cycles one frame takes on the wire at the configured baud rate.
    pub fn frame_cycles(&self, sys: &System) -> u64 {
        let cfg = &self.config;
        let ubrr = (u64::from(sys.default_read(cfg.r_ubrrh) & 0x0F) << 8)
            | u64::from(sys.default_read(cfg.r_ubrrl));
        let per_bit = if sys.regbit_get(cfg.u2x) != 0 { 8 } else { 16 } * (ubrr + 1);
        let data = DATA_BITS[(sys.regbit_get_array(&cfg.ucsz) & 0x7) as usize];
        let parity = u64::from(sys.regbit_get(cfg.upm) != 0);
        let stop = 1 + u64::from(sys.regbit_get(cfg.usbs));
        (1 + data + parity + stop) * per_bit
    }

    fn transmit(&mut self, sys: &mut System, byte: u8) {
        let cfg = self.config;
        sys.default_write(cfg.r_udr, byte);
        if sys.regbit_get(cfg.txen) == 0 {
            trace!(peripheral = %self.name, byte, "write with transmitter disabled");
            return;
        }
        sys.clear_interrupt(&cfg.udrc);
        let delay = self.frame_cycles(sys);
        sys.cancel(self.id, EVENT_TX);
        sys.schedule(delay, self.id, EVENT_TX);

        self.bytes_sent += 1;
        if byte == b'\n' {
            debug!(peripheral = %self.name, text = %self.tx_text, "tx line");
            self.tx_text.clear();
        } else {
            self.tx_text
                .push(if byte.is_ascii_graphic() || byte == b' ' { byte as char } else { '.' });
        }
        sys.raise(self.data.get(Self::OUTPUT), u32::from(byte));
    }

    fn receive(&mut self, sys: &mut System) -> u8 {
        let cfg = self.config;
        sys.clear_interrupt(&cfg.rxc);
        if sys.regbit_get(cfg.rxen) == 0 {
            sys.default_write(cfg.r_udr, 0);
            return 0;
        }
        let byte = self.rx_fifo.pop_front().unwrap_or(0);
        sys.default_write(cfg.r_udr, byte);
        sys.regbit_clear(cfg.dor);
        if !self.rx_fifo.is_empty() {
            let delay = self.frame_cycles(sys);
            sys.schedule(delay, self.id, EVENT_RX);
        }
        sys.raise(self.line(Self::XOFF), 0);
        byte
    }

    fn write_ucsra(&mut self, sys: &mut System, value: u8) {
        let cfg = self.config;
        // only TXC is writable as a flag, RXC/UDRE/FE/DOR follow the hardware
        sys.clear_interrupt_if(&cfg.txc, value);
        let flags =
            cfg.rxc.raised.raw_mask() | cfg.txc.raised.raw_mask() | cfg.udrc.raised.raw_mask()
                | cfg.dor.raw_mask();
        let current = sys.default_read(cfg.r_ucsra);
        sys.default_write(cfg.r_ucsra, (current & flags) | (value & !flags));
    }

    fn write_ucsrb(&mut self, sys: &mut System, value: u8) {
        let cfg = self.config;
        let udrie = sys.regbit_get(cfg.udrc.enable) != 0;
        let rxen = sys.regbit_get(cfg.rxen) != 0;
        sys.default_write(cfg.r_ucsrb, value);
        // enabling UDRIE with an empty buffer interrupts right away
        if !udrie && sys.regbit_get(cfg.udrc.enable) != 0 && !sys.is_scheduled(self.id, EVENT_TX) {
            sys.raise_interrupt(&cfg.udrc);
        }
        if rxen && sys.regbit_get(cfg.rxen) == 0 {
            sys.cancel(self.id, EVENT_RX);
            sys.clear_interrupt(&cfg.rxc);
            self.rx_fifo.clear();
        }
    }
}

impl Peripheral for Uart {
    fn reset(&mut self, sys: &mut System) {
        let cfg = self.config;
        sys.cancel(self.id, EVENT_TX);
        sys.cancel(self.id, EVENT_RX);
        for reg in [cfg.r_udr, cfg.r_ucsra, cfg.r_ucsrb, cfg.r_ubrrl, cfg.r_ubrrh] {
            sys.default_write(reg, 0);
        }
        // 8N1
        sys.default_write(cfg.r_ucsrc, 0x06);
        for vector in [cfg.rxc, cfg.txc, cfg.udrc] {
            sys.clear_interrupt(&vector);
        }
        sys.regbit_set(cfg.udrc.raised);
        self.rx_fifo.clear();
        self.tx_text.clear();
    }

    /// Byte from the outside world.
    fn on_signal(&mut self, sys: &mut System, _input: u32, signal: Signal) {
        let cfg = self.config;
        if sys.regbit_get(cfg.rxen) == 0 {
            trace!(peripheral = %self.name, "receiver disabled, byte dropped");
            return;
        }
        if self.rx_fifo.len() >= RX_FIFO_DEPTH {
            warn!(peripheral = %self.name, byte = signal.value, "receive FIFO overrun");
            self.overruns += 1;
            sys.regbit_set(cfg.dor);
            return;
        }
        if self.rx_fifo.is_empty() {
            let delay = self.frame_cycles(sys);
            sys.schedule(delay, self.id, EVENT_RX);
        }
        self.rx_fifo.push_back(signal.value as u8);
        let full = self.rx_fifo.len() >= RX_FIFO_DEPTH;
        sys.raise(self.line(Self::XOFF), u32::from(full));
    }

    fn on_event(&mut self, sys: &mut System, token: u32, _when: u64) -> Option<u64> {
        let cfg = self.config;
        match token {
            EVENT_TX => {
                if sys.regbit_get(cfg.txen) != 0 {
                    sys.raise_interrupt(&cfg.udrc);
                    sys.raise_interrupt(&cfg.txc);
                }
            }
            EVENT_RX => {
                if sys.regbit_get(cfg.rxen) != 0 && !self.rx_fifo.is_empty() {
                    sys.raise_interrupt(&cfg.rxc);
                }
            }
            _ => {}
        }
        None
    }

    fn io_read(&mut self, sys: &mut System, addr: u16, token: u32) -> u8 {
        match token {
            HOOK_UDR => self.receive(sys),
            HOOK_UCSRA => {
                if sys.regbit_get(self.config.rxen) != 0 {
                    let empty = self.rx_fifo.is_empty();
                    sys.raise(self.line(Self::XON), u32::from(empty));
                }
                sys.default_read(addr)
            }
            _ => sys.default_read(addr),
        }
    }

    fn io_write(&mut self, sys: &mut System, addr: u16, value: u8, token: u32) {
        match token {
            HOOK_UDR => self.transmit(sys, value),
            HOOK_UCSRA => self.write_ucsra(sys, value),
            HOOK_UCSRB => self.write_ucsrb(sys, value),
            HOOK_UBRR => {
                sys.default_write(addr, value);
                let frame = self.frame_cycles(sys);
                debug!(peripheral = %self.name, frame_cycles = frame, "baud rate set");
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
