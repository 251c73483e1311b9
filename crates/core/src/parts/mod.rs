// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Off-chip parts that talk to the MCU through its pins and serial buses.

pub mod display;
pub mod ds1338;

pub use display::{AddressingMode, Cursor, Display, DisplayFlags, DisplayVariant, SH1106, SSD1306};
pub use ds1338::{Ds1338, RtcTime};
