// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use labwired_avr_core::usb::{TransferStatus, UsbHost};

/// The device side the server forwards URBs to.
///
/// Every call may block until the device answers; implementations report a
/// device that never became ready as [`TransferStatus::Nak`].
pub trait UsbBackend: Send {
    fn is_attached(&self) -> bool;

    /// Bus reset.
    fn reset(&mut self);

    fn setup(&mut self, packet: &[u8; 8]) -> TransferStatus;

    /// One IN packet from `ep`.
    fn read(&mut self, ep: usize) -> TransferStatus;

    /// OUT transfer on `ep`; the backend splits it into packets.
    fn write(&mut self, ep: usize, data: &[u8]) -> TransferStatus;

    /// Packet size of `ep`, `None` while it is not configured.
    fn max_packet_size(&self, ep: usize) -> Option<usize>;
}

impl UsbBackend for UsbHost {
    fn is_attached(&self) -> bool {
        UsbHost::is_attached(self)
    }

    fn reset(&mut self) {
        UsbHost::reset(self)
    }

    fn setup(&mut self, packet: &[u8; 8]) -> TransferStatus {
        UsbHost::setup(self, 0, packet)
    }

    fn read(&mut self, ep: usize) -> TransferStatus {
        UsbHost::read(self, ep)
    }

    fn write(&mut self, ep: usize, data: &[u8]) -> TransferStatus {
        UsbHost::write(self, ep, data)
    }

    fn max_packet_size(&self, ep: usize) -> Option<usize> {
        UsbHost::max_packet_size(self, ep)
    }
}

/// Result of a multi-packet IN transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InTransfer {
    Data(Vec<u8>),
    /// Nothing arrived before the endpoint timed out.
    Nak,
    Stall,
}

/// Reads packets from `ep` until `length` bytes arrived or the device sent a
/// short packet. A NAK after some data ends the transfer with what arrived.
pub fn read_transfer<B: UsbBackend + ?Sized>(backend: &mut B, ep: usize, length: usize) -> InTransfer {
    let mut data = Vec::with_capacity(length);
    while data.len() < length {
        match backend.read(ep) {
            TransferStatus::Data(packet) => {
                let short = backend
                    .max_packet_size(ep)
                    .map_or(true, |size| packet.len() < size);
                let take = packet.len().min(length - data.len());
                data.extend_from_slice(&packet[..take]);
                if short {
                    break;
                }
            }
            TransferStatus::Stall => return InTransfer::Stall,
            TransferStatus::Nak | TransferStatus::Done => {
                if data.is_empty() {
                    return InTransfer::Nak;
                }
                break;
            }
        }
    }
    InTransfer::Data(data)
}
