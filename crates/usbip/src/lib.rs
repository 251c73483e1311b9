// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Exposes the simulated USB device controller to a real host over USB/IP.
//!
//! The server runs on its own thread and talks to the simulation only
//! through [`UsbBackend`], which [`labwired_avr_core::usb::UsbHost`]
//! implements.

pub mod backend;
pub mod descriptor;
pub mod protocol;
pub mod server;

pub use backend::{read_transfer, InTransfer, UsbBackend};
pub use protocol::{ProtocolError, USBIP_PORT};
pub use server::{ExportedDevice, UsbipServer, BUSID};
