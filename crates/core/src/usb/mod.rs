// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! AT90USB-class USB device controller.
//!
//! The endpoint register file is shared between two threads: the simulation
//! thread, which reaches it through register hooks, and a host thread driving
//! transfers through [`UsbHost`]. Everything the host can observe lives in
//! [`UsbState`] behind one mutex; every guest-side mutation notifies the
//! condition variable the host waits on.
//!
//! The host thread never touches the [`System`]. Interrupts it causes are
//! latched in the shared state and raised by the controller's periodic sync
//! event on the simulation thread.

pub mod endpoint;
pub mod host;

pub use endpoint::{EpEvent, Endpoint, FifoError, Ueintx};
pub use host::{TransferStatus, UsbHost};

use crate::bus::RegBit;
use crate::config::ClearPolarity;
use crate::interrupt::InterruptVector;
use crate::signals::{LineFlags, LineId, LineSet};
use crate::{Peripheral, PeripheralId, System};
use std::any::Any;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace, warn};

pub const NUM_ENDPOINTS: usize = 5;

/// Register offsets from USBCON.
pub mod reg {
    pub const USBCON: u16 = 0;
    pub const UDCON: u16 = 8;
    pub const UDINT: u16 = 9;
    pub const UDIEN: u16 = 10;
    pub const UDADDR: u16 = 11;
    pub const UDFNUML: u16 = 12;
    pub const UDFNUMH: u16 = 13;
    pub const UDMFN: u16 = 14;
    pub const UEINTX: u16 = 16;
    pub const UENUM: u16 = 17;
    pub const UERST: u16 = 18;
    pub const UECONX: u16 = 19;
    pub const UECFG0X: u16 = 20;
    pub const UECFG1X: u16 = 21;
    pub const UESTA0X: u16 = 22;
    pub const UESTA1X: u16 = 23;
    pub const UEIENX: u16 = 24;
    pub const UEDATX: u16 = 25;
    pub const UEBCLX: u16 = 26;
    pub const UEINT: u16 = 28;
    pub const OTGTCON: u16 = 29;
}

/// UDINT / UDIEN bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    Suspend = 0,
    StartOfFrame = 2,
    EndOfReset = 3,
    Wakeup = 4,
    EndOfResume = 5,
    UpstreamResume = 6,
}

const UDCON_DETACH: u8 = 1 << 0;
const USBCON_USBE: u8 = 1 << 7;

const SOF_PERIOD_USEC: u64 = 1000;
const SYNC_PERIOD_USEC: u64 = 10;

const EVENT_SOF: u32 = 0;
const EVENT_SYNC: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbConfig {
    pub r_usbcon: u16,
    pub r_pllcsr: u16,
    pub com_vector: u8,
    pub gen_vector: u8,
}

/// Endpoint and device interrupt state shared with the host thread.
#[derive(Debug, Default)]
pub struct UsbState {
    pub endpoints: [Endpoint; NUM_ENDPOINTS],
    pub udint: u8,
    pub udien: u8,
    pub ueint: u8,
    pub attached: bool,
    /// Set by the host side, consumed by the sync event.
    pub pending_com: bool,
    pub pending_gen: bool,
    pub restart_sof: bool,
}

impl UsbState {
    /// Latches an endpoint condition; returns true when the endpoint vector
    /// should fire.
    pub fn raise_ep(&mut self, ep: usize, event: EpEvent) -> bool {
        self.ueint |= 1 << ep;
        self.endpoints[ep].latch(event)
    }

    /// Latches a device condition; returns true when the general vector
    /// should fire.
    pub fn raise_device(&mut self, event: DeviceEvent) -> bool {
        let bit = 1u8 << (event as u8);
        self.udint |= bit;
        self.udien & bit != 0
    }

    /// Host-initiated bus reset: every endpoint except 0 is cleared, and
    /// endpoint 0 keeps only its enable and configuration.
    pub fn bus_reset(&mut self) {
        let ep0 = self.endpoints[0];
        self.endpoints = Default::default();
        let ep = &mut self.endpoints[0];
        ep.ueconx = ep0.ueconx & endpoint::EPEN;
        ep.uecfg0x = ep0.uecfg0x;
        ep.uecfg1x = ep0.uecfg1x;
        ep.uesta0x = ep0.uesta0x & endpoint::CFGOK;
        self.ueint = 0;
    }
}

#[derive(Debug, Default)]
pub struct UsbShared {
    pub(crate) state: Mutex<UsbState>,
    pub(crate) cpu_action: Condvar,
}

impl UsbShared {
    pub(crate) fn lock(&self) -> MutexGuard<'_, UsbState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
pub struct UsbController {
    name: String,
    config: UsbConfig,
    id: PeripheralId,
    lines: LineSet,
    shared: Arc<UsbShared>,
    com: InterruptVector,
    gen: InterruptVector,
    polarity: ClearPolarity,
    sof_armed: bool,
}

impl UsbController {
    pub const ATTACH: usize = 0;

    pub fn attach(sys: &mut System, name: &str, config: UsbConfig) -> PeripheralId {
        sys.attach(name, |sys, id| {
            let lines = sys.alloc_lines(Some(id), &["attach"], LineFlags::BINARY);
            // both vectors are gated by USBE; their flags live in UDINT/UEINTX
            let usbe = RegBit::new(config.r_usbcon, 7);
            let com = InterruptVector::new(config.com_vector, usbe, RegBit::NONE);
            let gen = InterruptVector::new(config.gen_vector, usbe, RegBit::NONE);
            sys.register_vector(com);
            sys.register_vector(gen);

            let base = config.r_usbcon;
            for offset in [
                reg::UDCON,
                reg::UDINT,
                reg::UDIEN,
                reg::UDADDR,
                reg::UEINTX,
                reg::UENUM,
                reg::UECONX,
                reg::UECFG0X,
                reg::UECFG1X,
                reg::UESTA0X,
                reg::UESTA1X,
                reg::UEIENX,
                reg::UEDATX,
            ] {
                sys.bind_write(base + offset, id, offset as u32);
            }
            for offset in [
                reg::UDINT,
                reg::UDIEN,
                reg::UEINTX,
                reg::UECONX,
                reg::UECFG0X,
                reg::UECFG1X,
                reg::UESTA0X,
                reg::UESTA1X,
                reg::UEIENX,
                reg::UEDATX,
                reg::UEBCLX,
                reg::UEINT,
            ] {
                sys.bind_read(base + offset, id, offset as u32);
            }
            sys.bind_write(config.r_pllcsr, id, u32::from(u16::MAX));

            let sync = sys.usec_to_cycles(SYNC_PERIOD_USEC).max(1);
            sys.schedule(sync, id, EVENT_SYNC);

            let mut usb = Self {
                name: name.to_string(),
                config,
                id,
                lines,
                shared: Arc::new(UsbShared::default()),
                com,
                gen,
                polarity: sys.config().usb_clear_polarity,
                sof_armed: false,
            };
            usb.power_on(sys);
            usb
        })
    }

    pub fn line(&self, index: usize) -> LineId {
        self.lines.get(index)
    }

    /// Handle for a host thread. Clones share the same device.
    pub fn host(&self, sys: &System) -> UsbHost {
        UsbHost::new(
            self.shared.clone(),
            std::time::Duration::from_millis(sys.config().usb_control_timeout_ms),
            std::time::Duration::from_millis(sys.config().usb_transfer_timeout_ms),
        )
    }

    pub fn is_attached(&self) -> bool {
        self.shared.lock().attached
    }

    fn power_on(&mut self, sys: &mut System) {
        {
            let mut state = self.shared.lock();
            *state = UsbState::default();
            self.shared.cpu_action.notify_all();
        }
        for offset in 0..reg::OTGTCON {
            sys.default_write(self.config.r_usbcon + offset, 0);
        }
        sys.default_write(self.config.r_usbcon + reg::USBCON, 0x20);
        sys.default_write(self.config.r_usbcon + reg::UDCON, UDCON_DETACH);
        sys.cancel(self.id, EVENT_SOF);
        self.sof_armed = false;
    }

    /// Endpoint selected by UENUM.
    fn current_ep(&self, sys: &System) -> usize {
        (sys.default_read(self.config.r_usbcon + reg::UENUM) & 0x7) as usize
    }

    fn arm_sof(&mut self, sys: &mut System) {
        sys.cancel(self.id, EVENT_SOF);
        let period = sys.usec_to_cycles(SOF_PERIOD_USEC).max(1);
        sys.schedule(period, self.id, EVENT_SOF);
        self.sof_armed = true;
    }

    fn write_udcon(&mut self, sys: &mut System, addr: u16, value: u8) {
        let old = sys.default_read(addr);
        sys.default_write(addr, value);
        let detach = value & UDCON_DETACH != 0;
        if old & UDCON_DETACH != 0 && !detach {
            debug!(peripheral = %self.name, "attached to bus");
            self.shared.lock().attached = true;
            self.shared.cpu_action.notify_all();
            self.arm_sof(sys);
            sys.raise(self.lines.get(Self::ATTACH), 1);
        } else if old & UDCON_DETACH == 0 && detach {
            debug!(peripheral = %self.name, "detached from bus");
            self.shared.lock().attached = false;
            self.shared.cpu_action.notify_all();
            sys.raise(self.lines.get(Self::ATTACH), 0);
        }
    }

    fn write_endpoint(&mut self, sys: &mut System, offset: u16, value: u8) {
        let ep = self.current_ep(sys);
        if ep >= NUM_ENDPOINTS {
            return;
        }
        let mut fire = false;
        {
            let mut state = self.shared.lock();
            match offset {
                reg::UEINTX => {
                    let endpoint = &mut state.endpoints[ep];
                    let cleared = endpoint.write_ueintx(value, self.polarity);
                    if endpoint.ueintx.bits() & !Ueintx::RWAL.bits() == 0 {
                        state.ueint &= !(1 << ep);
                    }
                    trace!(peripheral = %self.name, ep, cleared = cleared.bits(), "UEINTX acknowledged");
                }
                reg::UECONX => state.endpoints[ep].write_ueconx(value),
                reg::UECFG0X => state.endpoints[ep].write_uecfg0x(value),
                reg::UECFG1X => state.endpoints[ep].write_uecfg1x(value),
                reg::UESTA0X => state.endpoints[ep].write_uesta0x(value),
                reg::UESTA1X => {}
                reg::UEIENX => state.endpoints[ep].ueienx = value,
                reg::UEDATX => match state.endpoints[ep].cpu_write_byte(value) {
                    Ok(()) => {}
                    Err(FifoError::Full) => fire = state.raise_ep(ep, EpEvent::Overflow),
                    Err(_) => {
                        warn!(peripheral = %self.name, ep, "write to unconfigured endpoint")
                    }
                },
                _ => {}
            }
            self.shared.cpu_action.notify_all();
        }
        if fire {
            sys.raise_interrupt(&self.com);
        }
    }

    fn read_endpoint(&mut self, sys: &mut System, offset: u16) -> u8 {
        let ep = self.current_ep(sys);
        if ep >= NUM_ENDPOINTS {
            return 0;
        }
        let mut fire = false;
        let value = {
            let mut state = self.shared.lock();
            let v = match offset {
                reg::UEINTX => state.endpoints[ep].read_ueintx(),
                reg::UECONX => state.endpoints[ep].ueconx,
                reg::UECFG0X => state.endpoints[ep].uecfg0x,
                reg::UECFG1X => state.endpoints[ep].uecfg1x,
                reg::UESTA0X => state.endpoints[ep].uesta0x,
                reg::UESTA1X => state.endpoints[ep].uesta1x,
                reg::UEIENX => state.endpoints[ep].ueienx,
                reg::UEBCLX => state.endpoints[ep].count() as u8,
                reg::UEDATX => match state.endpoints[ep].cpu_read_byte() {
                    Ok(v) => v,
                    Err(FifoError::Empty) => {
                        fire = state.raise_ep(ep, EpEvent::Underflow);
                        0
                    }
                    Err(_) => {
                        warn!(peripheral = %self.name, ep, "read from unconfigured endpoint");
                        0
                    }
                },
                _ => 0,
            };
            if offset == reg::UEDATX {
                self.shared.cpu_action.notify_all();
            }
            v
        };
        if fire {
            sys.raise_interrupt(&self.com);
        }
        value
    }

    /// Delivers interrupts latched by the host thread.
    fn sync(&mut self, sys: &mut System) {
        let (com, gen, restart) = {
            let mut state = self.shared.lock();
            let latched = (state.pending_com, state.pending_gen, state.restart_sof);
            state.pending_com = false;
            state.pending_gen = false;
            state.restart_sof = false;
            latched
        };
        if com {
            sys.raise_interrupt(&self.com);
        }
        if gen {
            sys.raise_interrupt(&self.gen);
        }
        if restart && self.shared.lock().attached {
            self.arm_sof(sys);
        }
    }
}

impl Peripheral for UsbController {
    fn reset(&mut self, sys: &mut System) {
        self.power_on(sys);
        sys.clear_interrupt(&self.com);
        sys.clear_interrupt(&self.gen);
    }

    fn on_event(&mut self, sys: &mut System, token: u32, _when: u64) -> Option<u64> {
        match token {
            EVENT_SOF => {
                if sys.default_read(self.config.r_usbcon + reg::UDCON) & UDCON_DETACH != 0 {
                    self.sof_armed = false;
                    return None;
                }
                let fire = self.shared.lock().raise_device(DeviceEvent::StartOfFrame);
                if fire {
                    sys.raise_interrupt(&self.gen);
                }
                Some(sys.usec_to_cycles(SOF_PERIOD_USEC).max(1))
            }
            EVENT_SYNC => {
                self.sync(sys);
                Some(sys.usec_to_cycles(SYNC_PERIOD_USEC).max(1))
            }
            _ => None,
        }
    }

    fn io_read(&mut self, sys: &mut System, addr: u16, token: u32) -> u8 {
        let offset = token as u16;
        match offset {
            reg::UDINT => self.shared.lock().udint,
            reg::UDIEN => self.shared.lock().udien,
            reg::UEINT => self.shared.lock().ueint,
            reg::UEINTX..=reg::UEBCLX => self.read_endpoint(sys, offset),
            _ => sys.default_read(addr),
        }
    }

    fn io_write(&mut self, sys: &mut System, addr: u16, value: u8, token: u32) {
        if token == u32::from(u16::MAX) {
            // PLOCK follows PLLE
            sys.default_write(addr, value | ((value >> 1) & 1));
            return;
        }
        let offset = token as u16;
        match offset {
            reg::UDCON => self.write_udcon(sys, addr, value),
            reg::UDINT => {
                // device flags are cleared by writing 0
                let mut state = self.shared.lock();
                state.udint &= value;
                sys.default_write(addr, state.udint);
            }
            reg::UDIEN => {
                self.shared.lock().udien = value;
                sys.default_write(addr, value);
            }
            reg::UDADDR => {
                if value & 0x80 != 0 {
                    debug!(peripheral = %self.name, address = value & 0x7F, "address enabled");
                }
                sys.default_write(addr, value);
            }
            reg::UENUM => {
                if (value as usize) < NUM_ENDPOINTS {
                    sys.default_write(addr, value);
                } else {
                    warn!(peripheral = %self.name, value, "UENUM selects a missing endpoint, ignored");
                }
            }
            reg::UEINTX..=reg::UEDATX => self.write_endpoint(sys, offset, value),
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
        let state = self.shared.lock();
        serde_json::json!({
            "name": self.name,
            "attached": state.attached,
            "udint": state.udint,
            "ueint": state.ueint,
            "sof_armed": self.sof_armed,
            "ueintx": state.endpoints.iter().map(|e| e.ueintx.bits()).collect::<Vec<_>>(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chips::atmega32u4;
    use crate::SimulationConfig;

    const USBCON: u16 = 0xD8;
    const UDCON: u16 = USBCON + reg::UDCON;
    const UDINT: u16 = USBCON + reg::UDINT;
    const UDIEN: u16 = USBCON + reg::UDIEN;
    const UENUM: u16 = USBCON + reg::UENUM;
    const UECONX: u16 = USBCON + reg::UECONX;
    const UECFG1X: u16 = USBCON + reg::UECFG1X;
    const UEDATX: u16 = USBCON + reg::UEDATX;
    const UESTA0X: u16 = USBCON + reg::UESTA0X;

    fn setup() -> (System, PeripheralId) {
        let config = SimulationConfig {
            frequency_hz: 1_000_000,
            ..SimulationConfig::default()
        };
        let mut sys = System::new(config, atmega32u4::IO_SIZE);
        let usb = UsbController::attach(&mut sys, "usb", atmega32u4::USB);
        (sys, usb)
    }

    #[test]
    fn test_power_on_values() {
        let (mut sys, _) = setup();
        assert_eq!(sys.read(USBCON), 0x20);
        assert_eq!(sys.read(UDCON), 0x01);
    }

    #[test]
    fn test_attach_raises_line_and_starts_frames() {
        let (mut sys, usb) = setup();
        let attach = sys.get::<UsbController>(usb).unwrap().line(UsbController::ATTACH);
        sys.write(USBCON, 0x80);
        sys.write(UDIEN, 1 << DeviceEvent::StartOfFrame as u8);
        sys.write(UDCON, 0x00);
        assert_eq!(sys.line_value(attach), 1);
        assert!(sys.get::<UsbController>(usb).unwrap().is_attached());

        // 1 MHz: one frame per 1000 cycles
        for _ in 0..1000 {
            sys.advance(1);
            sys.service();
        }
        assert_ne!(sys.read(UDINT) & 0x04, 0);
        assert!(sys.interrupts().is_pending(atmega32u4::USB.gen_vector));

        sys.write(UDINT, 0x00);
        assert_eq!(sys.read(UDINT), 0);
    }

    #[test]
    fn test_fifo_overflow_sets_flag() {
        let (mut sys, _) = setup();
        sys.write(UENUM, 1);
        sys.write(UECONX, endpoint::EPEN);
        // 8 byte bank
        sys.write(UECFG1X, 0x02);
        for i in 0..8 {
            sys.write(UEDATX, i);
        }
        assert_eq!(sys.read(UESTA0X) & endpoint::OVERFI, 0);
        sys.write(UEDATX, 8);
        assert_ne!(sys.read(UESTA0X) & endpoint::OVERFI, 0);
    }

    #[test]
    fn test_uenum_out_of_range_ignored() {
        let (mut sys, _) = setup();
        sys.write(UENUM, 2);
        sys.write(UENUM, 7);
        assert_eq!(sys.default_read(UENUM), 2);
    }
}
