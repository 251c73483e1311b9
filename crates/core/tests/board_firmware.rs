// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Whole-board runs: a manifest-built board driven by a scripted executor
//! that pokes registers the way firmware would.

use labwired_avr_config::BoardManifest;
use labwired_avr_core::board::{build_board, Board};
use labwired_avr_core::parts::{ds1338, Cursor, Display, DisplayFlags, Ds1338};
use labwired_avr_core::{Cpu, Machine, SimResult, SimulationError, System};
use std::collections::VecDeque;

const DDRB: u16 = 0x24;
const PORTB: u16 = 0x25;
const SPCR: u16 = 0x4C;
const SPDR: u16 = 0x4E;
const TWSR: u16 = 0xB9;
const TWDR: u16 = 0xBB;
const TWCR: u16 = 0xBC;
const ADCL: u16 = 0x78;
const ADCH: u16 = 0x79;
const ADCSRA: u16 = 0x7A;
const ADMUX: u16 = 0x7C;

// TWCR values: TWINT | TWEN plus START, STOP or TWEA
const TW_START: u8 = 0xA4;
const TW_SEND: u8 = 0x84;
const TW_READ_ACK: u8 = 0xC4;
const TW_STOP: u8 = 0x94;

const BOARD: &str = r#"
schema_version: "1.0"
name: "bench-board"
chip: atmega328p
simulation:
  frequency_hz: 8000000
parts:
  - id: oled
    type: ssd1306
    bus: spi
    height: 32
  - id: clock
    type: ds1338
    bus: twi
wiring:
  - { part: oled, signal: reset, port: B, pin: 0 }
  - { part: oled, signal: dc, port: B, pin: 1 }
  - { part: oled, signal: cs, port: B, pin: 2 }
analog:
  - { channel: 3, millivolts: 1250 }
"#;

const TWI_BOARD: &str = r#"
name: "twi-board"
chip: atmega328p
simulation:
  frequency_hz: 8000000
parts:
  - id: oled
    type: ssd1306
    bus: twi
  - id: clock
    type: ds1338
wiring: []
"#;

#[derive(Debug, Clone, Copy)]
enum Op {
    Write(u16, u8),
    /// Spin for this many cycles.
    Idle(u32),
}

/// Executes one register write per step, one cycle each.
#[derive(Debug, Default)]
struct ScriptedCpu {
    script: VecDeque<Op>,
    idle: u32,
    resets: u32,
}

impl ScriptedCpu {
    fn is_done(&self) -> bool {
        self.script.is_empty() && self.idle == 0
    }
}

impl Cpu for ScriptedCpu {
    fn reset(&mut self, _sys: &mut System) -> SimResult<()> {
        self.resets += 1;
        self.script.clear();
        self.idle = 0;
        Ok(())
    }

    fn step(&mut self, sys: &mut System) -> SimResult<u32> {
        if self.idle > 0 {
            self.idle -= 1;
            return Ok(1);
        }
        match self.script.pop_front() {
            Some(Op::Write(addr, value)) => sys.write(addr, value),
            Some(Op::Idle(cycles)) => self.idle = cycles.saturating_sub(1),
            None => {}
        }
        Ok(1)
    }
}

struct Bench {
    machine: Machine<ScriptedCpu>,
    oled: labwired_avr_core::PeripheralId,
    clock: labwired_avr_core::PeripheralId,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

impl Bench {
    fn new(yaml: &str) -> Self {
        init_tracing();
        let manifest = BoardManifest::from_yaml(yaml).unwrap();
        let board = build_board(&manifest).unwrap();
        let oled = board.part("oled").unwrap();
        let clock = board.part("clock").unwrap();
        let Board { sys, .. } = board;
        Self {
            machine: Machine::new(ScriptedCpu::default(), sys),
            oled,
            clock,
        }
    }

    fn run(&mut self, ops: impl IntoIterator<Item = Op>) -> SimResult<()> {
        self.machine.cpu.script.extend(ops);
        while !self.machine.cpu.is_done() {
            self.machine.step()?;
        }
        Ok(())
    }

    fn sys(&mut self) -> &mut System {
        &mut self.machine.system
    }

    fn display(&self) -> &Display {
        self.machine.system.get::<Display>(self.oled).unwrap()
    }

    fn rtc(&self) -> &Ds1338 {
        self.machine.system.get::<Ds1338>(self.clock).unwrap()
    }
}

/// SPI byte at fosc/4 takes 32 cycles.
fn spi_byte(byte: u8) -> [Op; 2] {
    [Op::Write(SPDR, byte), Op::Idle(40)]
}

/// Address or data byte on the TWI bus: 9 bits at 16 cycles each.
fn twi_byte(byte: u8) -> [Op; 3] {
    [Op::Write(TWDR, byte), Op::Write(TWCR, TW_SEND), Op::Idle(160)]
}

fn twi_start() -> [Op; 2] {
    [Op::Write(TWCR, TW_START), Op::Idle(60)]
}

fn spi_setup() -> Vec<Op> {
    // reset high, CS low, DC low; SPI master at fosc/4
    vec![
        Op::Write(DDRB, 0x07),
        Op::Write(PORTB, 0x01),
        Op::Write(SPCR, 0x50),
    ]
}

#[test]
fn test_firmware_draws_on_spi_display() {
    let mut bench = Bench::new(BOARD);
    let mut ops = spi_setup();
    // display on, page 1, column 2
    for cmd in [0xAF, 0xB1, 0x02, 0x10] {
        ops.extend(spi_byte(cmd));
    }
    ops.push(Op::Write(PORTB, 0x03));
    for data in [0xFF, 0x81, 0x3C] {
        ops.extend(spi_byte(data));
    }
    bench.run(ops).unwrap();

    let display = bench.display();
    assert!(display.flags().contains(DisplayFlags::DISPLAY_ON));
    assert_eq!(&display.vram_page(1)[2..5], &[0xFF, 0x81, 0x3C]);
    assert_eq!(display.cursor(), Cursor { page: 1, column: 5 });
    assert!(display.pixel(2, 8));
    assert!(display.pixel(3, 15));
    assert!(!display.pixel(3, 9));
    assert!(display.is_dirty());
}

#[test]
fn test_deselected_display_ignores_bus() {
    let mut bench = Bench::new(BOARD);
    let mut ops = spi_setup();
    // CS high, data mode
    ops.push(Op::Write(PORTB, 0x07));
    ops.extend(spi_byte(0x55));
    bench.run(ops).unwrap();
    assert!(bench.display().vram().iter().all(|b| *b == 0));
    assert_eq!(bench.display().cursor(), Cursor { page: 0, column: 0 });
}

#[test]
fn test_reset_pin_clears_display() {
    let mut bench = Bench::new(BOARD);
    let mut ops = spi_setup();
    ops.push(Op::Write(PORTB, 0x03));
    ops.extend(spi_byte(0xAA));
    bench.run(ops).unwrap();
    assert_eq!(bench.display().vram_page(0)[0], 0xAA);

    // falling edge on PB0
    bench.run([Op::Write(PORTB, 0x02)]).unwrap();
    assert_eq!(bench.display().vram_page(0)[0], 0);
    assert_eq!(bench.display().cursor(), Cursor { page: 0, column: 0 });
}

#[test]
fn test_firmware_sets_and_reads_rtc_over_twi() {
    let mut bench = Bench::new(BOARD);
    assert!(!bench.rtc().is_running());

    let mut ops = Vec::new();
    ops.extend(twi_start());
    ops.extend(twi_byte(ds1338::TWI_ADDRESS));
    // word address, then 23:59:58 with the oscillator enabled
    for byte in [0x00, 0x58, 0x59, 0x23] {
        ops.extend(twi_byte(byte));
    }
    bench.run(ops).unwrap();
    assert_eq!(bench.sys().read(TWSR) & 0xF8, 0x28);
    bench.run([Op::Write(TWCR, TW_STOP), Op::Idle(4)]).unwrap();

    let time = bench.rtc().time();
    assert!(bench.rtc().is_running());
    assert_eq!((time.hours, time.minutes, time.seconds), (23, 59, 58));

    // point at the seconds, restart in read mode, read two registers
    let mut ops = Vec::new();
    ops.extend(twi_start());
    ops.extend(twi_byte(ds1338::TWI_ADDRESS));
    ops.extend(twi_byte(0x00));
    ops.extend(twi_start());
    ops.extend(twi_byte(ds1338::TWI_ADDRESS | 1));
    ops.extend([Op::Write(TWCR, TW_READ_ACK), Op::Idle(160)]);
    bench.run(ops).unwrap();
    assert_eq!(bench.sys().read(TWDR), 0x58);
    assert_eq!(bench.sys().read(TWSR) & 0xF8, 0x50);

    bench
        .run([Op::Write(TWCR, TW_SEND), Op::Idle(160)])
        .unwrap();
    assert_eq!(bench.sys().read(TWDR), 0x59);
    assert_eq!(bench.sys().read(TWSR) & 0xF8, 0x58);
    bench.run([Op::Write(TWCR, TW_STOP), Op::Idle(4)]).unwrap();

    // two seconds later the day has rolled over
    let sys = bench.sys();
    let half_period = sys.usec_to_cycles(ds1338::HALF_PERIOD_US);
    for _ in 0..ds1338::HALF_TICKS_PER_SECOND * 2 + 8 {
        sys.advance(half_period);
        sys.service();
    }
    let time = bench.rtc().time();
    assert_eq!((time.hours, time.minutes, time.seconds), (0, 0, 0));
    assert_eq!(time.day, 2);
}

#[test]
fn test_firmware_samples_board_analog_input() {
    let mut bench = Bench::new(BOARD);
    // AVCC reference, channel 3, enable and start
    bench
        .run([
            Op::Write(ADMUX, 0x43),
            Op::Write(ADCSRA, 0xC0),
            Op::Idle(60),
        ])
        .unwrap();
    // 1250 mV against 5000 mV
    let lo = bench.sys().read(ADCL);
    let hi = bench.sys().read(ADCH);
    assert_eq!(u16::from(lo) | u16::from(hi) << 8, 255);
    assert_eq!(bench.sys().default_read(ADCSRA) & 0x40, 0);
}

#[test]
fn test_machine_reset_keeps_battery_backed_clock() {
    let mut bench = Bench::new(BOARD);
    let mut ops = Vec::new();
    ops.extend(twi_start());
    ops.extend(twi_byte(ds1338::TWI_ADDRESS));
    ops.extend(twi_byte(0x02));
    ops.extend(twi_byte(0x17));
    ops.extend([Op::Write(TWCR, TW_STOP), Op::Write(ADCSRA, 0x80)]);
    bench.run(ops).unwrap();
    assert_eq!(bench.rtc().time().hours, 17);

    bench.machine.reset().unwrap();
    assert_eq!(bench.machine.cpu.resets, 1);
    assert_eq!(bench.rtc().time().hours, 17);
    assert_eq!(bench.sys().default_read(ADCSRA), 0);
    assert_eq!(bench.sys().default_read(TWCR), 0);
}

#[test]
fn test_bad_control_byte_halts_machine() {
    let mut bench = Bench::new(TWI_BOARD);

    let mut ops = Vec::new();
    ops.extend(twi_start());
    // 0x3C, write
    ops.extend(twi_byte(0x78));
    // Co bit set
    ops.extend(twi_byte(0x80));
    let err = bench.run(ops).unwrap_err();
    match err {
        SimulationError::Fatal { peripheral, .. } => assert_eq!(peripheral, "oled"),
        other => panic!("unexpected error {:?}", other),
    }
    assert!(bench.machine.step().is_err());
}
