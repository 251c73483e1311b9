// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! On-chip peripheral models. Each one binds its registers and allocates its
//! lines in `attach`, and is configured by a per-chip layout struct.

pub mod adc;
pub mod ioport;
pub mod spi;
pub mod timer;
pub mod twi;
pub mod uart;

pub use adc::{Adc, AdcConfig, MuxMode, TriggerSource, VrefSource};
pub use ioport::{IoPort, PortConfig};
pub use spi::{Spi, SpiConfig};
pub use timer::{Timer8, TimerConfig};
pub use twi::{Twi, TwiConfig, TwiCond, TwiMessage};
pub use uart::{Uart, UartConfig};
