// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Successive-approximation ADC.
//!
//! Channel inputs are signal lines carrying millivolts. Whoever feeds them
//! (a test harness, a sensor part) usually listens on `OUT_TRIGGER`, which is
//! raised with the encoded [`MuxMode`] at the start of every conversion, and
//! answers by raising the matching channel line.

use crate::bus::{RegBit, ResultPair};
use crate::interrupt::InterruptVector;
use crate::signals::{LineFlags, LineId, LineSet, Signal};
use crate::{Peripheral, PeripheralId, System};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::any::Any;
use tracing::{debug, warn};

/// ADC clocks for a regular conversion.
const CONVERSION_CLOCKS: u64 = 13;
/// ADC clocks for the first conversion after enabling (analog front-end start-up).
const FIRST_CONVERSION_CLOCKS: u64 = 25;
/// Reference used when a board leaves AREF/VCC/AVCC unset.
const FALLBACK_VREF_MV: u32 = 3300;

const HOOK_ADCSRA: u32 = 0;
const HOOK_ADCSRB: u32 = 1;
const HOOK_ADCL: u32 = 2;
const HOOK_ADCH: u32 = 3;
const EVENT_COMPLETE: u32 = 0;

/// What the converter samples for a given MUX selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum MuxMode {
    /// Reads zero.
    #[default]
    None,
    /// Pseudo-random value, seeded per system.
    Noise,
    Single(u8),
    /// `(src - diff) * gain`; a gain of 0 means 1.
    Diff { src: u8, diff: u8, gain: u8 },
    Temp,
    /// Fixed internal voltage in millivolts (0 is the GND channel).
    Ref(u16),
    Vcc4,
}

impl MuxMode {
    const KIND_NONE: u32 = 0;
    const KIND_NOISE: u32 = 1;
    const KIND_SINGLE: u32 = 2;
    const KIND_DIFF: u32 = 3;
    const KIND_TEMP: u32 = 4;
    const KIND_REF: u32 = 5;
    const KIND_VCC4: u32 = 6;

    /// Packs the descriptor into the `OUT_TRIGGER` value: kind in bits 0..3,
    /// gain in 3..11, diff in 11..19, src in 19..32.
    pub fn encode(self) -> u32 {
        let (kind, gain, diff, src) = match self {
            MuxMode::None => (Self::KIND_NONE, 0, 0, 0),
            MuxMode::Noise => (Self::KIND_NOISE, 0, 0, 0),
            MuxMode::Single(ch) => (Self::KIND_SINGLE, 0, 0, ch as u32),
            MuxMode::Diff { src, diff, gain } => {
                (Self::KIND_DIFF, gain as u32, diff as u32, src as u32)
            }
            MuxMode::Temp => (Self::KIND_TEMP, 0, 0, 0),
            MuxMode::Ref(mv) => (Self::KIND_REF, 0, 0, mv as u32),
            MuxMode::Vcc4 => (Self::KIND_VCC4, 0, 0, 0),
        };
        kind | (gain << 3) | (diff << 11) | (src << 19)
    }

    pub fn decode(value: u32) -> Self {
        let gain = ((value >> 3) & 0xFF) as u8;
        let diff = ((value >> 11) & 0xFF) as u8;
        let src = value >> 19;
        match value & 0x7 {
            Self::KIND_NOISE => MuxMode::Noise,
            Self::KIND_SINGLE => MuxMode::Single(src as u8),
            Self::KIND_DIFF => MuxMode::Diff {
                src: src as u8,
                diff,
                gain,
            },
            Self::KIND_TEMP => MuxMode::Temp,
            Self::KIND_REF => MuxMode::Ref(src as u16),
            Self::KIND_VCC4 => MuxMode::Vcc4,
            _ => MuxMode::None,
        }
    }
}

/// Where the conversion reference comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum VrefSource {
    #[default]
    Aref,
    Vcc,
    Avcc,
    /// Internal bandgap, millivolts.
    Internal(u32),
}

/// Auto-trigger source selected by ADTS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum TriggerSource {
    #[default]
    None,
    FreeRunning,
    AnalogComparator,
    ExternalInterrupt0,
    Timer0CompareA,
    Timer0Overflow,
    Timer1CompareB,
    Timer1Overflow,
    Timer1Capture,
    /// Selector with no implementation on this model.
    Reserved,
}

impl TriggerSource {
    /// Input line index that carries this source, for the external ones.
    fn line(self) -> Option<usize> {
        let offset = match self {
            TriggerSource::AnalogComparator => 0,
            TriggerSource::ExternalInterrupt0 => 1,
            TriggerSource::Timer0CompareA => 2,
            TriggerSource::Timer0Overflow => 3,
            TriggerSource::Timer1CompareB => 4,
            TriggerSource::Timer1Overflow => 5,
            TriggerSource::Timer1Capture => 6,
            _ => return None,
        };
        Some(Adc::TRIGGER_BASE + offset)
    }
}

/// Register layout of one ADC instance.
#[derive(Debug, Clone, Copy)]
pub struct AdcConfig {
    pub r_admux: u16,
    pub mux: [RegBit; 6],
    pub refs: [RegBit; 3],
    /// Indexed by the packed REFS value.
    pub ref_values: [VrefSource; 8],
    pub adlar: RegBit,
    pub r_adcsra: u16,
    pub aden: RegBit,
    pub adsc: RegBit,
    pub adate: RegBit,
    pub adps: [RegBit; 3],
    pub r_adcl: u16,
    pub r_adch: u16,
    pub r_adcsrb: u16,
    pub adts: [RegBit; 4],
    /// Indexed by the packed ADTS value.
    pub trigger_sources: [TriggerSource; 16],
    /// Input polarity reversal for differential channels, where present.
    pub ipr: RegBit,
    /// Indexed by the packed MUX value; missing entries read as `None`.
    pub muxmode: &'static [MuxMode],
    pub vector: InterruptVector,
}

/// Everything latched when a conversion starts.
#[derive(Debug, Clone, Copy, Serialize)]
struct Conversion {
    muxi: u8,
    mux: MuxMode,
    vref: VrefSource,
    reversed: bool,
    divider: u64,
}

#[derive(Debug, Serialize)]
pub struct Adc {
    name: String,
    #[serde(skip)]
    config: AdcConfig,
    id: PeripheralId,
    #[serde(skip)]
    lines: LineSet,
    result: ResultPair,
    first: bool,
    trigger: TriggerSource,
    current: Option<Conversion>,
    conversions: u64,
    #[serde(skip)]
    rng: StdRng,
}

impl Adc {
    pub const CHANNELS: usize = 8;
    pub const TEMP: usize = 8;
    pub const IN_TRIGGER: usize = 9;
    pub const OUT_TRIGGER: usize = 10;
    pub const TRIGGER_BASE: usize = 11;

    const LINE_NAMES: [&'static str; 18] = [
        "adc0",
        "adc1",
        "adc2",
        "adc3",
        "adc4",
        "adc5",
        "adc6",
        "adc7",
        "temp",
        "in_trigger",
        "out_trigger",
        "trigger_acomp",
        "trigger_int0",
        "trigger_t0_compa",
        "trigger_t0_ovf",
        "trigger_t1_compb",
        "trigger_t1_ovf",
        "trigger_t1_capt",
    ];

    /// Installs an ADC into `sys` and binds its registers.
    pub fn attach(sys: &mut System, name: &str, config: AdcConfig) -> PeripheralId {
        sys.attach(name, |sys, id| {
            let lines = sys.alloc_lines(Some(id), &Self::LINE_NAMES, LineFlags::empty());
            sys.subscribe(lines.get(Self::IN_TRIGGER), id, Self::IN_TRIGGER as u32);
            for input in Self::TRIGGER_BASE..lines.len() {
                sys.subscribe(lines.get(input), id, input as u32);
            }

            sys.bind_write(config.r_adcsra, id, HOOK_ADCSRA);
            sys.bind_write(config.r_adcsrb, id, HOOK_ADCSRB);
            sys.bind_read(config.r_adcl, id, HOOK_ADCL);
            sys.bind_read(config.r_adch, id, HOOK_ADCH);
            sys.register_vector(config.vector);

            let seed = sys.config().noise_seed;
            Self {
                name: name.to_string(),
                config,
                id,
                lines,
                result: ResultPair::new(config.r_adcl, config.r_adch),
                first: false,
                trigger: TriggerSource::None,
                current: None,
                conversions: 0,
                rng: StdRng::seed_from_u64(seed),
            }
        })
    }

    pub fn line(&self, index: usize) -> LineId {
        self.lines.get(index)
    }

    pub fn channel(&self, channel: usize) -> LineId {
        self.lines.get(channel)
    }

    pub fn lines(&self) -> LineSet {
        self.lines
    }

    pub fn is_converting(&self) -> bool {
        self.current.is_some()
    }

    pub fn conversions(&self) -> u64 {
        self.conversions
    }

    pub fn result_pair(&self) -> &ResultPair {
        &self.result
    }

    fn write_adcsra(&mut self, sys: &mut System, addr: u16, mut v: u8) {
        let cfg = self.config;
        let adsc = sys.regbit_get(cfg.adsc) != 0;
        let aden = sys.regbit_get(cfg.aden) != 0;

        // ADIF is write-one-to-clear and otherwise keeps its state
        let raised = cfg.vector.raised;
        if raised.reg == addr {
            sys.clear_interrupt_if(&cfg.vector, v);
            let mask = raised.raw_mask();
            v = (v & !mask) | (sys.default_read(addr) & mask);
        }
        sys.default_write(addr, v);

        let new_aden = sys.regbit_get(cfg.aden) != 0;
        // a running conversion cannot be stopped by writing ADSC low
        if adsc && sys.regbit_get(cfg.adsc) == 0 {
            sys.regbit_set(cfg.adsc);
        }
        if !aden && new_aden {
            self.first = true;
        }
        if aden && !new_aden {
            sys.cancel(self.id, EVENT_COMPLETE);
            sys.regbit_clear(cfg.adsc);
            self.current = None;
            debug!(peripheral = %self.name, "disabled");
            return;
        }
        self.update_trigger(sys);
        if new_aden && !adsc && sys.regbit_get(cfg.adsc) != 0 {
            self.start(sys);
        }
    }

    fn update_trigger(&mut self, sys: &mut System) {
        let cfg = &self.config;
        if sys.regbit_get(cfg.adate) == 0 {
            self.trigger = TriggerSource::None;
            return;
        }
        let adts = sys.regbit_get_array(&cfg.adts) as usize;
        let source = cfg.trigger_sources[adts & 0xF];
        if source != self.trigger {
            if source == TriggerSource::Reserved {
                // kept as Reserved so the warning fires once; it never matches a trigger
                warn!(
                    peripheral = %self.name,
                    adts,
                    "auto-trigger source not implemented, auto-trigger disabled"
                );
            } else {
                debug!(peripheral = %self.name, ?source, "auto-trigger source");
            }
        }
        self.trigger = source;
    }

    fn start(&mut self, sys: &mut System) {
        let cfg = self.config;
        let muxi = sys.regbit_get_array(&cfg.mux);
        let refi = sys.regbit_get_array(&cfg.refs) as usize;
        let mux = cfg
            .muxmode
            .get(muxi as usize)
            .copied()
            .unwrap_or_default();
        let mut prescale = sys.regbit_get_array(&cfg.adps) as u32;
        if prescale == 0 {
            prescale = 1;
        }
        let conversion = Conversion {
            muxi,
            mux,
            vref: cfg.ref_values[refi & 0x7],
            reversed: sys.regbit_get(cfg.ipr) != 0,
            divider: 1u64 << prescale,
        };
        let clocks = if self.first {
            FIRST_CONVERSION_CLOCKS
        } else {
            CONVERSION_CLOCKS
        };
        self.current = Some(conversion);
        sys.raise(self.lines.get(Self::OUT_TRIGGER), mux.encode());
        sys.schedule(conversion.divider * clocks, self.id, EVENT_COMPLETE);
    }

    fn vref_mv(&self, sys: &System, source: VrefSource) -> u32 {
        let (label, mv) = match source {
            VrefSource::Internal(mv) => return mv,
            VrefSource::Aref => ("AREF", sys.config().aref_mv),
            VrefSource::Vcc => ("VCC", sys.config().vcc_mv),
            VrefSource::Avcc => ("AVCC", sys.config().avcc_mv),
        };
        if mv == 0 {
            warn!(
                peripheral = %self.name,
                reference = label,
                "reference voltage not set, assuming {} mV",
                FALLBACK_VREF_MV
            );
            return FALLBACK_VREF_MV;
        }
        mv
    }

    /// Scales the latched input against the reference into a 10-bit field:
    /// unsigned for single-ended inputs, signed 9-bit for differential ones.
    fn convert(&mut self, sys: &System, conv: &Conversion) -> u16 {
        let lines = self.lines;
        let sample = |sys: &System, ch: u8| -> i64 {
            match ch as usize {
                index if index < Self::CHANNELS => sys.line_value(lines.get(index)) as i64,
                _ => 0,
            }
        };

        let mut differential = false;
        let mut reg: i64 = match conv.mux {
            MuxMode::None => 0,
            MuxMode::Noise => (self.rng.gen::<u16>() & 0x3FF) as i64,
            MuxMode::Single(ch) => sample(sys, ch),
            MuxMode::Diff { src, diff, gain } => {
                differential = true;
                let gain = if gain == 0 { 1 } else { gain as i64 };
                sample(sys, src) * gain - sample(sys, diff) * gain
            }
            MuxMode::Temp => sys.line_value(lines.get(Self::TEMP)) as i64,
            MuxMode::Ref(mv) => mv as i64,
            MuxMode::Vcc4 => sys.config().vcc_mv as i64 / 4,
        };
        if conv.mux == MuxMode::Noise {
            return reg as u16;
        }

        let vref = self.vref_mv(sys, conv.vref) as i64;
        if differential {
            // 9-bit magnitude plus sign, two's complement in the 10-bit field
            if conv.reversed {
                reg = -reg;
            }
            reg = reg * 0x1FF / vref;
            if reg > 0x1FF {
                warn!(peripheral = %self.name, value = reg, "differential result clipped to 0x1ff");
                reg = 0x1FF;
            } else if reg < -0x200 {
                warn!(peripheral = %self.name, value = reg, "differential result clipped to -0x200");
                reg = -0x200;
            }
        } else {
            reg = reg * 0x3FF / vref;
            if reg > 0x3FF {
                warn!(peripheral = %self.name, value = reg, "result clipped to 0x3ff");
                reg = 0x3FF;
            } else if reg < 0 {
                warn!(peripheral = %self.name, value = reg, "result clipped to 0");
                reg = 0;
            }
        }
        (reg & 0x3FF) as u16
    }

    fn complete(&mut self, sys: &mut System) {
        let cfg = self.config;
        let Some(conv) = self.current.take() else {
            return;
        };
        if sys.regbit_get(cfg.aden) == 0 {
            return;
        }
        let mut value = self.convert(sys, &conv);
        if sys.regbit_get(cfg.adlar) != 0 {
            value <<= 6;
        }
        if !self.result.publish(sys, value) {
            debug!(peripheral = %self.name, "result deferred until ADCH is read");
        }
        self.conversions += 1;
        self.first = false;

        sys.raise_interrupt(&cfg.vector);
        sys.regbit_clear(cfg.adsc);
        if self.trigger == TriggerSource::FreeRunning {
            sys.raise(self.lines.get(Self::IN_TRIGGER), 1);
        }
    }

    /// A trigger only starts a conversion when auto-trigger is on and the
    /// converter is idle; otherwise it is dropped.
    fn on_trigger(&mut self, sys: &mut System) {
        let cfg = self.config;
        if sys.regbit_get(cfg.adate) == 0 || sys.regbit_get(cfg.adsc) != 0 {
            return;
        }
        if matches!(self.trigger, TriggerSource::None | TriggerSource::Reserved) {
            return;
        }
        let v = sys.default_read(cfg.r_adcsra) | cfg.adsc.raw_mask();
        self.write_adcsra(sys, cfg.r_adcsra, v);
    }
}

impl Peripheral for Adc {
    fn reset(&mut self, sys: &mut System) {
        sys.cancel(self.id, EVENT_COMPLETE);
        for reg in [
            self.config.r_admux,
            self.config.r_adcsra,
            self.config.r_adcsrb,
            self.config.r_adcl,
            self.config.r_adch,
        ] {
            sys.default_write(reg, 0);
        }
        self.result.reset();
        self.first = false;
        self.trigger = TriggerSource::None;
        self.current = None;
    }

    fn on_signal(&mut self, sys: &mut System, input: u32, signal: Signal) {
        let input = input as usize;
        if signal.value == 0 {
            return;
        }
        if input == Self::IN_TRIGGER {
            self.on_trigger(sys);
        } else if self.trigger.line() == Some(input) {
            self.on_trigger(sys);
        }
    }

    fn on_event(&mut self, sys: &mut System, _token: u32, _when: u64) -> Option<u64> {
        self.complete(sys);
        None
    }

    fn io_read(&mut self, sys: &mut System, _addr: u16, token: u32) -> u8 {
        match token {
            HOOK_ADCL => self.result.read_lo(sys),
            _ => self.result.read_hi(sys),
        }
    }

    fn io_write(&mut self, sys: &mut System, addr: u16, value: u8, token: u32) {
        match token {
            HOOK_ADCSRA => self.write_adcsra(sys, addr, value),
            HOOK_ADCSRB => {
                sys.default_write(addr, value);
                self.update_trigger(sys);
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
