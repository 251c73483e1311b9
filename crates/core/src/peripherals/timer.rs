// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::bus::RegBit;
use crate::interrupt::InterruptVector;
use crate::signals::{LineFlags, LineId, LineSet};
use crate::{Peripheral, PeripheralId, System};
use serde::Serialize;
use std::any::Any;
use tracing::{debug, warn};

const HOOK_TCCRA: u32 = 0;
const HOOK_TCCRB: u32 = 1;
const HOOK_TCNT: u32 = 2;
const HOOK_OCRA: u32 = 3;
const HOOK_OCRB: u32 = 4;
const HOOK_TIFR: u32 = 5;

const EVENT_OVF: u32 = 0;
const EVENT_COMPA: u32 = 1;
const EVENT_COMPB: u32 = 2;

const WGM_NORMAL: u8 = 0;
const WGM_CTC: u8 = 2;

/// Prescaler shift for a CS value; `None` when the clock is stopped or
/// external.
fn prescaler_shift(cs: u8) -> Option<u32> {
    match cs {
        1 => Some(0),
        2 => Some(3),
        3 => Some(6),
        4 => Some(8),
        5 => Some(10),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TimerConfig {
    pub r_tccra: u16,
    pub r_tccrb: u16,
    pub r_tcnt: u16,
    pub r_ocra: u16,
    pub r_ocrb: u16,
    /// WGM0..WGM2.
    pub wgm: [RegBit; 3],
    /// CS0..CS2.
    pub cs: [RegBit; 3],
    pub overflow: InterruptVector,
    pub compa: InterruptVector,
    pub compb: InterruptVector,
}

/// 8-bit timer/counter, normal and CTC modes.
///
/// The counter is not stepped. It is derived from the cycle at which it was
/// last zero (`base`), and overflow and compare matches are scheduler events
/// re-armed once per timer period.
#[derive(Debug, Serialize)]
pub struct Timer8 {
    name: String,
    #[serde(skip)]
    config: TimerConfig,
    id: PeripheralId,
    #[serde(skip)]
    lines: LineSet,
    base: u64,
    shift: Option<u32>,
    top: u8,
    ctc: bool,
    /// Counter value while the clock is stopped.
    held: u8,
    warned_mode: Option<u8>,
}

impl Timer8 {
    pub const OVERFLOW: usize = 0;
    pub const COMPA: usize = 1;
    pub const COMPB: usize = 2;

    pub fn attach(sys: &mut System, name: &str, config: TimerConfig) -> PeripheralId {
        sys.attach(name, |sys, id| {
            let lines = sys.alloc_lines(
                Some(id),
                &["overflow", "compa", "compb"],
                LineFlags::empty(),
            );
            sys.bind_write(config.r_tccra, id, HOOK_TCCRA);
            sys.bind_write(config.r_tccrb, id, HOOK_TCCRB);
            sys.bind_write(config.r_tcnt, id, HOOK_TCNT);
            sys.bind_read(config.r_tcnt, id, HOOK_TCNT);
            sys.bind_write(config.r_ocra, id, HOOK_OCRA);
            sys.bind_write(config.r_ocrb, id, HOOK_OCRB);
            sys.bind_write(config.overflow.raised.reg, id, HOOK_TIFR);
            for vector in [config.overflow, config.compa, config.compb] {
                sys.register_vector(vector);
            }
            Self {
                name: name.to_string(),
                config,
                id,
                lines,
                base: 0,
                shift: None,
                top: 0xFF,
                ctc: false,
                held: 0,
                warned_mode: None,
            }
        })
    }

    pub fn line(&self, index: usize) -> LineId {
        self.lines.get(index)
    }

    pub fn is_running(&self) -> bool {
        self.shift.is_some()
    }

    /// Cycles per full count, 0 while stopped.
    pub fn period(&self) -> u64 {
        match self.shift {
            Some(shift) => (self.top as u64 + 1) << shift,
            None => 0,
        }
    }

    pub fn count(&self, sys: &System) -> u8 {
        match self.shift {
            Some(shift) => {
                let ticks = sys.cycle().wrapping_sub(self.base) >> shift;
                (ticks % (self.top as u64 + 1)) as u8
            }
            None => self.held,
        }
    }

    fn set_count(&mut self, sys: &System, value: u8) {
        match self.shift {
            Some(shift) => self.base = sys.cycle().wrapping_sub((value as u64) << shift),
            None => self.held = value,
        }
    }

    /// Re-reads the mode and clock registers, keeping the current count.
    fn reconfigure(&mut self, sys: &mut System) {
        let count = self.count(sys);
        let cfg = self.config;

        let mut wgm = sys.regbit_get_array(&cfg.wgm);
        if wgm != WGM_NORMAL && wgm != WGM_CTC {
            if self.warned_mode != Some(wgm) {
                warn!(peripheral = %self.name, wgm, "waveform mode not modelled, counting in normal mode");
                self.warned_mode = Some(wgm);
            }
            wgm = WGM_NORMAL;
        }
        self.ctc = wgm == WGM_CTC;
        self.top = if self.ctc {
            sys.default_read(cfg.r_ocra)
        } else {
            0xFF
        };

        let cs = sys.regbit_get_array(&cfg.cs);
        let shift = prescaler_shift(cs);
        if shift.is_none() && cs >= 6 {
            warn!(peripheral = %self.name, cs, "external clock source not supported, timer stopped");
        }
        if shift != self.shift {
            debug!(peripheral = %self.name, cs, ctc = self.ctc, "clock changed");
        }
        self.shift = shift;
        let count = if count > self.top { 0 } else { count };
        self.set_count(sys, count);
        self.arm(sys);
    }

    fn arm(&mut self, sys: &mut System) {
        for token in [EVENT_OVF, EVENT_COMPA, EVENT_COMPB] {
            sys.cancel(self.id, token);
        }
        if self.shift.is_none() {
            return;
        }
        let ocra = sys.default_read(self.config.r_ocra);
        let ocrb = sys.default_read(self.config.r_ocrb);

        // in CTC the counter only reaches MAX when OCRA is MAX
        if !self.ctc || ocra == 0xFF {
            self.arm_at(sys, EVENT_OVF, self.top);
        }
        if ocra <= self.top {
            self.arm_at(sys, EVENT_COMPA, ocra);
        }
        if ocrb <= self.top {
            self.arm_at(sys, EVENT_COMPB, ocrb);
        }
    }

    /// Schedules `token` for the end of the next timer tick in which the
    /// counter holds `value`.
    fn arm_at(&mut self, sys: &mut System, token: u32, value: u8) {
        let Some(shift) = self.shift else {
            return;
        };
        let period = self.period();
        let offset = ((value as u64 + 1) << shift) % period;
        let phase = sys.cycle().wrapping_sub(self.base) % period;
        let delay = match (offset + period - phase) % period {
            0 => period,
            d => d,
        };
        sys.schedule(delay, self.id, token);
    }

    fn write_tifr(&mut self, sys: &mut System, value: u8) {
        for vector in [self.config.overflow, self.config.compa, self.config.compb] {
            sys.clear_interrupt_if(&vector, value);
        }
    }
}

impl Peripheral for Timer8 {
    fn reset(&mut self, sys: &mut System) {
        for token in [EVENT_OVF, EVENT_COMPA, EVENT_COMPB] {
            sys.cancel(self.id, token);
        }
        let cfg = self.config;
        for reg in [cfg.r_tccra, cfg.r_tccrb, cfg.r_tcnt, cfg.r_ocra, cfg.r_ocrb] {
            sys.default_write(reg, 0);
        }
        for vector in [cfg.overflow, cfg.compa, cfg.compb] {
            sys.clear_interrupt(&vector);
        }
        self.base = 0;
        self.shift = None;
        self.top = 0xFF;
        self.ctc = false;
        self.held = 0;
    }

    fn on_event(&mut self, sys: &mut System, token: u32, _when: u64) -> Option<u64> {
        let (vector, line) = match token {
            EVENT_OVF => (self.config.overflow, Self::OVERFLOW),
            EVENT_COMPA => (self.config.compa, Self::COMPA),
            EVENT_COMPB => (self.config.compb, Self::COMPB),
            _ => return None,
        };
        sys.raise_interrupt(&vector);
        sys.raise(self.lines.get(line), 1);
        Some(self.period())
    }

    fn io_read(&mut self, sys: &mut System, _addr: u16, _token: u32) -> u8 {
        self.count(sys)
    }

    fn io_write(&mut self, sys: &mut System, addr: u16, value: u8, token: u32) {
        match token {
            HOOK_TCNT => {
                sys.default_write(addr, value);
                let value = if value > self.top { 0 } else { value };
                self.set_count(sys, value);
                self.arm(sys);
            }
            HOOK_TIFR => self.write_tifr(sys, value),
            HOOK_TCCRA | HOOK_TCCRB | HOOK_OCRA | HOOK_OCRB => {
                sys.default_write(addr, value);
                self.reconfigure(sys);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chips::atmega328p;
    use crate::SimulationConfig;

    const TCCR0A: u16 = 0x44;
    const TCCR0B: u16 = 0x45;
    const TCNT0: u16 = 0x46;
    const OCR0A: u16 = 0x47;
    const TIFR0: u16 = 0x35;
    const TIMSK0: u16 = 0x6E;

    fn run_to(sys: &mut System, cycle: u64) {
        while sys.cycle() < cycle {
            sys.advance(1);
            sys.service();
        }
    }

    #[test]
    fn test_normal_mode_counts_and_overflows() {
        let mut sys = System::new(SimulationConfig::default(), atmega328p::IO_SIZE);
        Timer8::attach(&mut sys, "timer0", atmega328p::TIMER0);
        sys.write(TIMSK0, 0x01);
        sys.write(TCCR0B, 0x01);
        run_to(&mut sys, 100);
        assert_eq!(sys.read(TCNT0), 100);
        run_to(&mut sys, 255);
        assert_eq!(sys.default_read(TIFR0) & 0x01, 0);
        run_to(&mut sys, 256);
        assert_eq!(sys.default_read(TIFR0) & 0x01, 0x01);
        assert!(sys.interrupts().is_pending(16));
        assert_eq!(sys.read(TCNT0), 0);

        sys.write(TIFR0, 0x01);
        assert_eq!(sys.default_read(TIFR0) & 0x01, 0);
        assert!(!sys.interrupts().is_pending(16));
    }

    #[test]
    fn test_ctc_compare_match_period() {
        let mut sys = System::new(SimulationConfig::default(), atmega328p::IO_SIZE);
        let timer = Timer8::attach(&mut sys, "timer0", atmega328p::TIMER0);
        let compa = sys.get::<Timer8>(timer).unwrap().line(Timer8::COMPA);
        let fired = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let f = fired.clone();
        sys.register_notify(compa, move |sys, _| f.lock().unwrap().push(sys.cycle()));

        sys.write(OCR0A, 9);
        sys.write(TCCR0A, 0x02);
        // clk/8: 10 counts of 8 cycles
        sys.write(TCCR0B, 0x02);
        assert_eq!(sys.get::<Timer8>(timer).unwrap().period(), 80);
        run_to(&mut sys, 240);
        assert_eq!(*fired.lock().unwrap(), vec![80, 160, 240]);
        assert_eq!(sys.default_read(TIFR0) & 0x03, 0x02);
        run_to(&mut sys, 260);
        assert_eq!(sys.read(TCNT0), 2);
    }

    #[test]
    fn test_tcnt_write_moves_overflow() {
        let mut sys = System::new(SimulationConfig::default(), atmega328p::IO_SIZE);
        Timer8::attach(&mut sys, "timer0", atmega328p::TIMER0);
        sys.write(TCCR0B, 0x01);
        sys.write(TCNT0, 250);
        run_to(&mut sys, 5);
        assert_eq!(sys.default_read(TIFR0) & 0x01, 0);
        run_to(&mut sys, 6);
        assert_eq!(sys.default_read(TIFR0) & 0x01, 0x01);
    }

    #[test]
    fn test_stopped_clock_holds_count() {
        let mut sys = System::new(SimulationConfig::default(), atmega328p::IO_SIZE);
        Timer8::attach(&mut sys, "timer0", atmega328p::TIMER0);
        sys.write(TCCR0B, 0x01);
        run_to(&mut sys, 40);
        sys.write(TCCR0B, 0x00);
        run_to(&mut sys, 400);
        assert_eq!(sys.read(TCNT0), 40);
        assert_eq!(sys.default_read(TIFR0) & 0x01, 0);
    }
}
