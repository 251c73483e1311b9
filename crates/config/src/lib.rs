// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Default schema version for YAML configs
fn default_schema_version() -> String {
    "1.0".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChipKind {
    #[serde(alias = "atmega328", alias = "m328p")]
    Atmega328p,
    #[serde(alias = "m32u4", alias = "at90usb")]
    Atmega32u4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartKind {
    Ssd1306,
    Sh1106,
    Ds1338,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Spi,
    #[serde(alias = "i2c")]
    Twi,
}

/// How a guest write acknowledges a flag in a write-to-clear register.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClearPolarity {
    #[default]
    #[serde(alias = "oneToClear")]
    WriteOneToClear,
    #[serde(alias = "zeroToClear")]
    WriteZeroToClear,
}

/// Clock, analog and framework limits. Every field is optional; the core
/// fills in its own defaults.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SimulationSettings {
    #[serde(default)]
    pub frequency_hz: Option<u64>,
    #[serde(default)]
    pub max_propagation_depth: Option<u32>,
    #[serde(default)]
    pub vcc_mv: Option<u32>,
    #[serde(default)]
    pub avcc_mv: Option<u32>,
    #[serde(default)]
    pub aref_mv: Option<u32>,
    #[serde(default)]
    pub noise_seed: Option<u64>,
    #[serde(default)]
    pub usb_clear_polarity: Option<ClearPolarity>,
    #[serde(default)]
    pub usb_control_timeout_ms: Option<u64>,
    #[serde(default)]
    pub usb_transfer_timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PartConfig {
    pub id: String,
    pub r#type: PartKind,
    #[serde(default)]
    pub bus: Option<BusKind>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

/// One row of the wiring table: a logical pin of a part tied to a port bit.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WireConfig {
    pub part: String,
    /// Part-side line name, e.g. `cs`, `dc`, `reset`, `sqw`.
    pub signal: String,
    /// Port letter, `B`, `C`, ...
    pub port: String,
    pub pin: u8,
}

/// Initial value injected on an ADC channel line after construction.
#[derive(Debug, Serialize, Deserialize, Clone, Copy)]
pub struct AnalogInput {
    pub channel: u8,
    pub millivolts: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BoardManifest {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    pub name: String,
    pub chip: ChipKind,
    #[serde(default)]
    pub simulation: SimulationSettings,
    #[serde(default)]
    pub parts: Vec<PartConfig>,
    #[serde(default)]
    pub wiring: Vec<WireConfig>,
    #[serde(default)]
    pub analog: Vec<AnalogInput>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ManifestError {
    #[error("unsupported schema_version '{0}', supported versions: '1.0'")]
    SchemaVersion(String),
    #[error("part id '{0}' is declared more than once")]
    DuplicatePart(String),
    #[error("wiring references unknown part '{0}'")]
    UnknownPart(String),
    #[error("wiring for '{part}.{signal}' uses invalid port '{port}'")]
    InvalidPort {
        part: String,
        signal: String,
        port: String,
    },
    #[error("wiring for '{part}.{signal}' uses pin {pin}, ports have 8 pins")]
    InvalidPin { part: String, signal: String, pin: u8 },
    #[error("analog channel {0} does not exist")]
    InvalidChannel(u8),
}

impl WireConfig {
    /// Upper-case port letter, if the field holds exactly one ASCII letter.
    pub fn port_letter(&self) -> Option<char> {
        let mut chars = self.port.trim().chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) if c.is_ascii_alphabetic() => Some(c.to_ascii_uppercase()),
            _ => None,
        }
    }
}

impl BoardManifest {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let f = std::fs::File::open(path)
            .with_context(|| format!("Failed to open board manifest at {:?}", path))?;
        let manifest: Self =
            serde_yaml::from_reader(f).context("Failed to parse Board Manifest YAML")?;
        manifest.validate()?;
        tracing::debug!(board = %manifest.name, parts = manifest.parts.len(), "loaded board manifest");
        Ok(manifest)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let manifest: Self =
            serde_yaml::from_str(yaml).context("Failed to parse Board Manifest YAML")?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> std::result::Result<(), ManifestError> {
        if self.schema_version != "1.0" {
            return Err(ManifestError::SchemaVersion(self.schema_version.clone()));
        }

        let mut ids = HashSet::new();
        for part in &self.parts {
            if !ids.insert(part.id.as_str()) {
                return Err(ManifestError::DuplicatePart(part.id.clone()));
            }
        }

        for wire in &self.wiring {
            if !ids.contains(wire.part.as_str()) {
                return Err(ManifestError::UnknownPart(wire.part.clone()));
            }
            if wire.port_letter().is_none() {
                return Err(ManifestError::InvalidPort {
                    part: wire.part.clone(),
                    signal: wire.signal.clone(),
                    port: wire.port.clone(),
                });
            }
            if wire.pin > 7 {
                return Err(ManifestError::InvalidPin {
                    part: wire.part.clone(),
                    signal: wire.signal.clone(),
                    pin: wire.pin,
                });
            }
        }

        if let Some(input) = self.analog.iter().find(|a| a.channel > 7) {
            return Err(ManifestError::InvalidChannel(input.channel));
        }

        Ok(())
    }

    pub fn part(&self, id: &str) -> Option<&PartConfig> {
        self.parts.iter().find(|p| p.id == id)
    }

    /// Wiring rows that belong to part `id`, in table order.
    pub fn wires_for<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a WireConfig> + 'a {
        self.wiring.iter().filter(move |w| w.part == id)
    }
}
