// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! USB/IP server exporting one simulated device.
//!
//! A connection starts detached: the client lists devices or imports one.
//! After a successful import every message is an URB, answered synchronously
//! in arrival order. Attach from Linux with `usbip attach -r <host> -b 1-1`.

use crate::backend::{read_transfer, InTransfer, UsbBackend};
use crate::descriptor::{
    ConfigDescriptor, DeviceDescriptor, SetupPacket, CONFIG_DESCRIPTOR_SIZE,
    DESCRIPTOR_CONFIGURATION, DESCRIPTOR_DEVICE, DEVICE_DESCRIPTOR_SIZE,
};
use crate::protocol::{
    self, OpHeader, OpRequest, ProtocolError, ProtocolResult, RetSubmit, RetUnlink, Submit,
    UrbCommand, UsbDevice, UsbInterface, EPIPE, ETIMEDOUT, OP_REP_DEVLIST, OP_REP_IMPORT, ST_NA,
    ST_OK,
};
use anyhow::Context;
use labwired_avr_core::usb::TransferStatus;
use std::io::{Read, Write};
use std::net::{TcpListener, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

pub const BUSID: &str = "1-1";
const SYSFS_PATH: &str = "/sys/devices/pci0000:00/0000:00:01.2/usb1/1-1";
/// Full speed.
const SPEED_FULL: u32 = 2;
/// Time the firmware gets to handle a bus reset before enumeration starts.
const RESET_SETTLE: Duration = Duration::from_micros(2500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedDevice {
    pub device: UsbDevice,
    pub interfaces: Vec<UsbInterface>,
}

pub struct UsbipServer<B: UsbBackend> {
    backend: B,
    exported: Option<ExportedDevice>,
}

impl<B: UsbBackend> UsbipServer<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            exported: None,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Device found by the last enumeration.
    pub fn exported(&self) -> Option<&ExportedDevice> {
        self.exported.as_ref()
    }

    /// Accepts clients one at a time, forever.
    pub fn listen<A: ToSocketAddrs>(&mut self, addr: A) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).context("Failed to bind USB/IP listener")?;
        info!("USB/IP server listening on {}", listener.local_addr()?);
        for stream in listener.incoming() {
            let stream = stream.context("Failed to accept USB/IP client")?;
            info!("USB/IP client connected from {:?}", stream.peer_addr().ok());
            stream.set_nodelay(true).ok();
            if let Err(e) = self.handle_connection(stream) {
                warn!("USB/IP session ended: {:#}", e);
            }
        }
        Ok(())
    }

    /// Serves one client until it disconnects.
    pub fn handle_connection<S: Read + Write>(&mut self, mut stream: S) -> anyhow::Result<()> {
        let mut imported = false;
        loop {
            let result = if imported {
                self.serve_urb(&mut stream)
            } else {
                self.serve_op(&mut stream).map(|ok| imported = ok)
            };
            match result {
                Ok(()) => {}
                Err(ProtocolError::Disconnected) => {
                    info!("USB/IP client disconnected");
                    return Ok(());
                }
                Err(e) => return Err(e).context("USB/IP protocol error"),
            }
        }
    }

    /// Handles one connection-setup request. Returns true once a device was
    /// imported.
    fn serve_op<S: Read + Write>(&mut self, stream: &mut S) -> ProtocolResult<bool> {
        let request = OpRequest::read(stream)?;
        debug!(?request, "op request");
        let mut out = Vec::new();
        let imported = match request {
            OpRequest::DevList => {
                match self.enumerate() {
                    Some(exported) => {
                        OpHeader::reply(OP_REP_DEVLIST, ST_OK).encode(&mut out);
                        out.extend_from_slice(&1u32.to_be_bytes());
                        exported.device.encode(&mut out);
                        for interface in &exported.interfaces {
                            interface.encode(&mut out);
                        }
                    }
                    None => OpHeader::reply(OP_REP_DEVLIST, ST_NA).encode(&mut out),
                }
                false
            }
            OpRequest::Import { busid } => {
                let exported = if busid == BUSID {
                    self.enumerate()
                } else {
                    warn!(%busid, "import of unknown bus id");
                    None
                };
                match exported {
                    Some(exported) => {
                        OpHeader::reply(OP_REP_IMPORT, ST_OK).encode(&mut out);
                        exported.device.encode(&mut out);
                        info!(
                            vendor = exported.device.id_vendor,
                            product = exported.device.id_product,
                            "device imported"
                        );
                        true
                    }
                    None => {
                        OpHeader::reply(OP_REP_IMPORT, ST_NA).encode(&mut out);
                        false
                    }
                }
            }
        };
        protocol::send(stream, &out)?;
        Ok(imported)
    }

    fn serve_urb<S: Read + Write>(&mut self, stream: &mut S) -> ProtocolResult<()> {
        match UrbCommand::read(stream)? {
            UrbCommand::Submit(submit) => {
                let ret = self.submit(&submit);
                trace!(
                    seqnum = ret.seqnum,
                    status = ret.status,
                    len = ret.actual_length,
                    "ret submit"
                );
                protocol::send(stream, &ret.encode())
            }
            UrbCommand::Unlink { header, seqnum } => {
                // transfers complete before the next command is read, so the
                // target URB has already been answered
                debug!(seqnum, "unlink");
                let ret = RetUnlink {
                    seqnum: header.seqnum,
                    status: 0,
                };
                protocol::send(stream, &ret.encode())
            }
        }
    }

    fn submit(&mut self, submit: &Submit) -> RetSubmit {
        let ep = submit.ep();
        let length = submit.transfer_buffer_length as usize;
        let result = if ep == 0 {
            self.control(&submit.setup, &submit.data, length)
        } else if submit.is_in() {
            match read_transfer(&mut self.backend, ep, length) {
                InTransfer::Data(data) => Ok(data),
                // polled endpoints with nothing to send complete empty
                InTransfer::Nak => Ok(Vec::new()),
                InTransfer::Stall => Err(EPIPE),
            }
        } else {
            Self::out_status(self.backend.write(ep, &submit.data)).map(|()| Vec::new())
        };

        match result {
            Ok(data) => {
                let actual_length = if submit.is_in() {
                    data.len()
                } else {
                    submit.data.len()
                };
                RetSubmit {
                    seqnum: submit.header.seqnum,
                    status: 0,
                    actual_length: actual_length as u32,
                    data,
                }
            }
            Err(status) => {
                debug!(ep, status, "transfer failed");
                RetSubmit {
                    seqnum: submit.header.seqnum,
                    status,
                    actual_length: 0,
                    data: Vec::new(),
                }
            }
        }
    }

    fn out_status(status: TransferStatus) -> Result<(), i32> {
        match status {
            TransferStatus::Done | TransferStatus::Data(_) => Ok(()),
            TransferStatus::Stall => Err(EPIPE),
            TransferStatus::Nak => Err(ETIMEDOUT),
        }
    }

    /// Runs the setup, data and status stages of a control transfer on
    /// endpoint 0. Returns the IN data stage payload.
    fn control(&mut self, setup: &[u8; 8], data_out: &[u8], max_len: usize) -> Result<Vec<u8>, i32> {
        let packet = SetupPacket::parse(setup);
        trace!(?packet, "control");
        Self::out_status(self.backend.setup(setup))?;

        if packet.is_in() {
            let length = (packet.length as usize).min(max_len);
            let data = if length > 0 {
                match read_transfer(&mut self.backend, 0, length) {
                    InTransfer::Data(data) => data,
                    InTransfer::Nak => return Err(ETIMEDOUT),
                    InTransfer::Stall => return Err(EPIPE),
                }
            } else {
                Vec::new()
            };
            match self.backend.write(0, &[]) {
                TransferStatus::Stall => return Err(EPIPE),
                TransferStatus::Nak => debug!("status stage not acknowledged"),
                _ => {}
            }
            Ok(data)
        } else {
            if !data_out.is_empty() {
                Self::out_status(self.backend.write(0, data_out))?;
            }
            match self.backend.read(0) {
                TransferStatus::Stall => Err(EPIPE),
                TransferStatus::Nak => Err(ETIMEDOUT),
                _ => Ok(Vec::new()),
            }
        }
    }

    fn control_in(&mut self, setup: SetupPacket) -> Option<Vec<u8>> {
        self.control(&setup.to_bytes(), &[], setup.length as usize).ok()
    }

    /// Resets the device and reads its device and configuration
    /// descriptors.
    fn enumerate(&mut self) -> Option<ExportedDevice> {
        if !self.backend.is_attached() {
            warn!("device is not attached to the bus");
            return None;
        }
        self.backend.reset();
        std::thread::sleep(RESET_SETTLE);

        let raw = self.control_in(SetupPacket::get_descriptor(
            DESCRIPTOR_DEVICE,
            0,
            DEVICE_DESCRIPTOR_SIZE as u16,
        ));
        let Some(dd) = raw.as_deref().and_then(DeviceDescriptor::parse) else {
            warn!("get device descriptor failed");
            return None;
        };
        let raw = self.control_in(SetupPacket::get_descriptor(
            DESCRIPTOR_CONFIGURATION,
            0,
            CONFIG_DESCRIPTOR_SIZE as u16,
        ));
        let Some(header) = raw.as_deref().and_then(ConfigDescriptor::parse) else {
            warn!("get configuration descriptor failed");
            return None;
        };
        let full = self
            .control_in(SetupPacket::get_descriptor(
                DESCRIPTOR_CONFIGURATION,
                0,
                header.total_length,
            ))
            .as_deref()
            .and_then(ConfigDescriptor::parse)
            .unwrap_or(header);
        let ConfigDescriptor {
            num_interfaces,
            configuration_value,
            mut interfaces,
            ..
        } = full;
        // the export lists exactly num_interfaces records
        interfaces.resize(num_interfaces as usize, UsbInterface::default());

        let exported = ExportedDevice {
            device: UsbDevice {
                path: SYSFS_PATH.to_string(),
                busid: BUSID.to_string(),
                busnum: 1,
                devnum: 2,
                speed: SPEED_FULL,
                id_vendor: dd.id_vendor,
                id_product: dd.id_product,
                bcd_device: dd.bcd_device,
                device_class: dd.device_class,
                device_subclass: dd.device_subclass,
                device_protocol: dd.device_protocol,
                configuration_value,
                num_configurations: dd.num_configurations,
                num_interfaces,
            },
            interfaces,
        };
        debug!(?exported, "device enumerated");
        self.exported = Some(exported.clone());
        Some(exported)
    }
}
