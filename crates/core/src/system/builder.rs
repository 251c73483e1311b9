// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::chips::{self, ChipPeripherals};
use crate::parts::{display, Display, Ds1338};
use crate::peripherals::{Adc, IoPort, Spi, Twi};
use crate::{LineId, PeripheralId, SimulationConfig, SimulationError, System};
use anyhow::Context;
use labwired_avr_config::{BoardManifest, BusKind, PartConfig, PartKind, WireConfig};
use std::path::Path;
use tracing::{debug, info};

/// A chip plus the external parts of a board manifest, wired together.
#[derive(Debug)]
pub struct Board {
    pub name: String,
    pub sys: System,
    pub chip: ChipPeripherals,
    pub parts: Vec<(String, PeripheralId)>,
}

impl Board {
    pub fn part(&self, id: &str) -> Option<PeripheralId> {
        self.parts
            .iter()
            .find(|(name, _)| name == id)
            .map(|(_, pid)| *pid)
    }
}

/// Direction of a wiring row, seen from the MCU pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// The pin drives the part input.
    ToPart,
    /// The part output drives the pin.
    FromPart,
}

/// Loads a manifest from disk and builds it.
pub fn load_board(path: &Path) -> anyhow::Result<Board> {
    info!("Loading board manifest: {:?}", path);
    let manifest = BoardManifest::from_file(path)?;
    build_board(&manifest)
}

/// Instantiates the manifest's chip and parts and performs every connection
/// of its wiring table.
pub fn build_board(manifest: &BoardManifest) -> anyhow::Result<Board> {
    manifest.validate()?;
    let config = SimulationConfig::from(&manifest.simulation);
    let (mut sys, chip) = chips::build(chips::descriptor(manifest.chip), config);

    let mut parts = Vec::with_capacity(manifest.parts.len());
    for part in &manifest.parts {
        let id = attach_part(&mut sys, &chip, part)
            .with_context(|| format!("Failed to attach part '{}'", part.id))?;
        for wire in manifest.wires_for(&part.id) {
            wire_signal(&mut sys, &chip, part, id, wire).with_context(|| {
                format!(
                    "Failed to wire '{}.{}' to P{}{}",
                    wire.part, wire.signal, wire.port, wire.pin
                )
            })?;
        }
        parts.push((part.id.clone(), id));
    }

    if let Some(adc) = sys.get::<Adc>(chip.adc).map(|a| a.lines()) {
        for input in &manifest.analog {
            debug!(channel = input.channel, millivolts = input.millivolts, "analog input");
            sys.raise(adc.get(input.channel as usize), input.millivolts);
        }
    }

    sys.check()?;
    info!(
        board = %manifest.name,
        chip = ?manifest.chip,
        parts = parts.len(),
        wires = manifest.wiring.len(),
        "board built"
    );
    Ok(Board {
        name: manifest.name.clone(),
        sys,
        chip,
        parts,
    })
}

fn attach_part(
    sys: &mut System,
    chip: &ChipPeripherals,
    part: &PartConfig,
) -> anyhow::Result<PeripheralId> {
    let id = match part.r#type {
        PartKind::Ssd1306 | PartKind::Sh1106 => {
            let variant = if part.r#type == PartKind::Ssd1306 {
                &display::SSD1306
            } else {
                &display::SH1106
            };
            let id = Display::attach(
                sys,
                &part.id,
                variant,
                part.width.unwrap_or(128),
                part.height.unwrap_or(64),
            );
            let lines = part_lines(sys.get::<Display>(id).map(|d| {
                (
                    d.line(Display::SPI_IN),
                    d.line(Display::TWI_IN),
                    d.line(Display::TWI_OUT),
                )
            }))?;
            match part.bus.unwrap_or(BusKind::Spi) {
                BusKind::Spi => {
                    let mosi = chip_line(sys.get::<Spi>(chip.spi).map(|s| s.line(Spi::OUTPUT)))?;
                    sys.connect(mosi, lines.0);
                }
                BusKind::Twi => connect_twi(sys, chip, lines.1, lines.2)?,
            }
            id
        }
        PartKind::Ds1338 => {
            if part.bus == Some(BusKind::Spi) {
                anyhow::bail!("ds1338 only speaks TWI");
            }
            let id = Ds1338::attach(sys, &part.id);
            let lines = part_lines(
                sys.get::<Ds1338>(id)
                    .map(|r| (r.line(Ds1338::TWI_IN), r.line(Ds1338::TWI_OUT))),
            )?;
            connect_twi(sys, chip, lines.0, lines.1)?;
            id
        }
    };
    debug!(part = %part.id, kind = ?part.r#type, bus = ?part.bus, "part attached");
    Ok(id)
}

fn connect_twi(
    sys: &mut System,
    chip: &ChipPeripherals,
    part_in: LineId,
    part_out: LineId,
) -> anyhow::Result<()> {
    let (master_in, master_out) = chip_line(
        sys.get::<Twi>(chip.twi)
            .map(|t| (t.line(Twi::INPUT), t.line(Twi::OUTPUT))),
    )?;
    sys.connect(master_out, part_in);
    sys.connect(part_out, master_in);
    Ok(())
}

fn wire_signal(
    sys: &mut System,
    chip: &ChipPeripherals,
    part: &PartConfig,
    id: PeripheralId,
    wire: &WireConfig,
) -> anyhow::Result<()> {
    let unknown_line = || SimulationError::UnknownLine {
        peripheral: part.id.clone(),
        line: wire.signal.clone(),
    };
    let (line, direction) = match part.r#type {
        PartKind::Ssd1306 | PartKind::Sh1106 => {
            let index = match wire.signal.as_str() {
                "cs" => Display::CS,
                "dc" => Display::DC,
                "reset" => Display::RESET,
                _ => return Err(unknown_line().into()),
            };
            (
                part_lines(sys.get::<Display>(id).map(|d| d.line(index)))?,
                Direction::ToPart,
            )
        }
        PartKind::Ds1338 => match wire.signal.as_str() {
            "sqw" => (
                part_lines(sys.get::<Ds1338>(id).map(|r| r.line(Ds1338::SQW)))?,
                Direction::FromPart,
            ),
            _ => return Err(unknown_line().into()),
        },
    };

    let letter = wire
        .port_letter()
        .ok_or_else(|| SimulationError::UnknownPeripheral(format!("port{}", wire.port)))?;
    let port = chip
        .port(letter)
        .ok_or_else(|| SimulationError::UnknownPeripheral(format!("port{}", letter)))?;
    let pin = chip_line(sys.get::<IoPort>(port).map(|p| p.pin(wire.pin as usize)))?;
    match direction {
        Direction::ToPart => sys.connect(pin, line),
        Direction::FromPart => sys.connect(line, pin),
    }
    debug!(part = %part.id, signal = %wire.signal, port = %letter, pin = wire.pin, "wired");
    Ok(())
}

fn part_lines<T>(lines: Option<T>) -> anyhow::Result<T> {
    lines.context("part was not registered")
}

fn chip_line<T>(lines: Option<T>) -> anyhow::Result<T> {
    lines.context("chip peripheral is missing")
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOARD: &str = r#"
schema_version: "1.0"
name: "weather-station"
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
  - { part: oled, signal: cs, port: B, pin: 2 }
  - { part: oled, signal: dc, port: B, pin: 1 }
  - { part: oled, signal: reset, port: B, pin: 0 }
  - { part: clock, signal: sqw, port: D, pin: 2 }
analog:
  - { channel: 3, millivolts: 1250 }
"#;

    #[test]
    fn test_build_board_from_manifest() {
        let manifest = BoardManifest::from_yaml(BOARD).unwrap();
        let board = build_board(&manifest).unwrap();
        assert_eq!(board.sys.frequency(), 8_000_000);
        let oled = board.part("oled").unwrap();
        let display = board.sys.get::<Display>(oled).unwrap();
        assert_eq!(display.pages(), 4);
        assert!(board.part("clock").is_some());

        let adc = board.sys.get::<Adc>(board.chip.adc).unwrap();
        assert_eq!(board.sys.line_value(adc.channel(3)), 1250);
    }

    #[test]
    fn test_pin_drives_display_dc() {
        let manifest = BoardManifest::from_yaml(BOARD).unwrap();
        let mut board = build_board(&manifest).unwrap();
        let portb = board.chip.port('B').unwrap();
        let pb1 = board.sys.get::<IoPort>(portb).unwrap().pin(1);
        let dc = board
            .sys
            .get::<Display>(board.part("oled").unwrap())
            .unwrap()
            .line(Display::DC);
        board.sys.raise(pb1, 1);
        assert_eq!(board.sys.line_value(dc), 1);
    }

    #[test]
    fn test_unknown_signal_is_rejected() {
        let yaml = BOARD.replace("signal: dc", "signal: data");
        let manifest = BoardManifest::from_yaml(&yaml).unwrap();
        let err = build_board(&manifest).unwrap_err();
        assert!(format!("{:#}", err).contains("no line named 'data'"));
    }

    #[test]
    fn test_missing_port_is_rejected() {
        let yaml = BOARD.replace("port: D", "port: F");
        let manifest = BoardManifest::from_yaml(&yaml).unwrap();
        assert!(build_board(&manifest).is_err());
    }
}
