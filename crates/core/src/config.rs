// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

pub use labwired_avr_config::ClearPolarity;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// CPU clock in Hz; every cycle/microsecond conversion uses it.
    pub frequency_hz: u64,
    /// Nested `raise`/delivery depth after which propagation is declared
    /// runaway and the run is stopped with a fatal diagnostic.
    pub max_propagation_depth: u32,
    /// Supply and reference voltages in millivolts. Zero means "not wired".
    pub vcc_mv: u32,
    pub avcc_mv: u32,
    pub aref_mv: u32,
    /// Seed for the ADC noise pseudo-channel.
    pub noise_seed: u64,
    /// UEINTX acknowledgment convention of the USB controller.
    pub usb_clear_polarity: ClearPolarity,
    /// Host-side wait bounds of the USB bridge.
    pub usb_control_timeout_ms: u64,
    pub usb_transfer_timeout_ms: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            frequency_hz: 16_000_000,
            max_propagation_depth: 64,
            vcc_mv: 5000,
            avcc_mv: 5000,
            aref_mv: 0,
            noise_seed: 0x5EED,
            usb_clear_polarity: ClearPolarity::WriteOneToClear,
            usb_control_timeout_ms: 1000,
            usb_transfer_timeout_ms: 100,
        }
    }
}

impl From<&labwired_avr_config::SimulationSettings> for SimulationConfig {
    fn from(settings: &labwired_avr_config::SimulationSettings) -> Self {
        let defaults = Self::default();
        Self {
            frequency_hz: settings.frequency_hz.unwrap_or(defaults.frequency_hz),
            max_propagation_depth: settings
                .max_propagation_depth
                .unwrap_or(defaults.max_propagation_depth),
            vcc_mv: settings.vcc_mv.unwrap_or(defaults.vcc_mv),
            avcc_mv: settings.avcc_mv.unwrap_or(defaults.avcc_mv),
            aref_mv: settings.aref_mv.unwrap_or(defaults.aref_mv),
            noise_seed: settings.noise_seed.unwrap_or(defaults.noise_seed),
            usb_clear_polarity: settings
                .usb_clear_polarity
                .unwrap_or(defaults.usb_clear_polarity),
            usb_control_timeout_ms: settings
                .usb_control_timeout_ms
                .unwrap_or(defaults.usb_control_timeout_ms),
            usb_transfer_timeout_ms: settings
                .usb_transfer_timeout_ms
                .unwrap_or(defaults.usb_transfer_timeout_ms),
        }
    }
}
