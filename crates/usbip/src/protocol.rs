// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! USB/IP wire format, protocol version `0x0106`. Every integer is
//! big-endian.

use std::io::{self, Read, Write};

pub const USBIP_VERSION: u16 = 0x0106;
pub const USBIP_PORT: u16 = 3240;

pub const OP_REQUEST: u16 = 0x8000;
pub const OP_REPLY: u16 = 0x0000;
pub const OP_DEVLIST: u16 = 0x0005;
pub const OP_IMPORT: u16 = 0x0003;
pub const OP_REQ_DEVLIST: u16 = OP_REQUEST | OP_DEVLIST;
pub const OP_REP_DEVLIST: u16 = OP_REPLY | OP_DEVLIST;
pub const OP_REQ_IMPORT: u16 = OP_REQUEST | OP_IMPORT;
pub const OP_REP_IMPORT: u16 = OP_REPLY | OP_IMPORT;

pub const ST_OK: u32 = 0;
pub const ST_NA: u32 = 1;

pub const CMD_SUBMIT: u32 = 0x0001;
pub const CMD_UNLINK: u32 = 0x0002;
pub const RET_SUBMIT: u32 = 0x0003;
pub const RET_UNLINK: u32 = 0x0004;

pub const DIR_OUT: u32 = 0;
pub const DIR_IN: u32 = 1;

/// Negative errno values carried in `RET_SUBMIT.status`.
pub const EPIPE: i32 = -32;
pub const ETIMEDOUT: i32 = -110;

pub const PATH_SIZE: usize = 256;
pub const BUSID_SIZE: usize = 32;
/// Size of an exported device record.
pub const DEVICE_SIZE: usize = PATH_SIZE + BUSID_SIZE + 24;
/// Size of every URB header: common part plus the command-specific union.
pub const HEADER_SIZE: usize = 48;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("connection closed by peer")]
    Disconnected,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("protocol version {0:#06x} is not supported")]
    Version(u16),
    #[error("unknown operation {0:#06x}")]
    UnknownOp(u16),
    #[error("unknown URB command {0:#x}")]
    UnknownCommand(u32),
    #[error("transfer length {0} is out of range")]
    Length(i32),
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;

fn read_exact<R: Read>(r: &mut R, buf: &mut [u8]) -> ProtocolResult<()> {
    r.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => ProtocolError::Disconnected,
        _ => ProtocolError::Io(e),
    })
}

fn read_array<R: Read, const N: usize>(r: &mut R) -> ProtocolResult<[u8; N]> {
    let mut buf = [0; N];
    read_exact(r, &mut buf)?;
    Ok(buf)
}

fn be_u16(b: &[u8]) -> u16 {
    u16::from_be_bytes([b[0], b[1]])
}

fn be_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

fn be_i32(b: &[u8]) -> i32 {
    be_u32(b) as i32
}

/// Copies `s` into a NUL-padded field of `N` bytes.
fn fixed_str<const N: usize>(s: &str) -> [u8; N] {
    let mut out = [0; N];
    let len = s.len().min(N - 1);
    out[..len].copy_from_slice(&s.as_bytes()[..len]);
    out
}

fn parse_fixed_str(b: &[u8]) -> String {
    let end = b.iter().position(|c| *c == 0).unwrap_or(b.len());
    String::from_utf8_lossy(&b[..end]).into_owned()
}

/// Header of the connection-setup operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpHeader {
    pub version: u16,
    pub code: u16,
    pub status: u32,
}

impl OpHeader {
    pub fn reply(code: u16, status: u32) -> Self {
        Self {
            version: USBIP_VERSION,
            code,
            status,
        }
    }

    pub fn read<R: Read>(r: &mut R) -> ProtocolResult<Self> {
        let b: [u8; 8] = read_array(r)?;
        Ok(Self {
            version: be_u16(&b[0..]),
            code: be_u16(&b[2..]),
            status: be_u32(&b[4..]),
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(&self.code.to_be_bytes());
        out.extend_from_slice(&self.status.to_be_bytes());
    }
}

/// Connection-setup request, after its header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpRequest {
    DevList,
    Import { busid: String },
}

impl OpRequest {
    pub fn read<R: Read>(r: &mut R) -> ProtocolResult<Self> {
        let header = OpHeader::read(r)?;
        if header.version != USBIP_VERSION {
            return Err(ProtocolError::Version(header.version));
        }
        match header.code {
            OP_REQ_DEVLIST => Ok(Self::DevList),
            OP_REQ_IMPORT => {
                let busid: [u8; BUSID_SIZE] = read_array(r)?;
                Ok(Self::Import {
                    busid: parse_fixed_str(&busid),
                })
            }
            code => Err(ProtocolError::UnknownOp(code)),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Self::DevList => OpHeader::reply(OP_REQ_DEVLIST, ST_OK).encode(&mut out),
            Self::Import { busid } => {
                OpHeader::reply(OP_REQ_IMPORT, ST_OK).encode(&mut out);
                out.extend_from_slice(&fixed_str::<BUSID_SIZE>(busid));
            }
        }
        out
    }
}

/// Exported device record, as listed by `usbip list -r`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UsbDevice {
    pub path: String,
    pub busid: String,
    pub busnum: u32,
    pub devnum: u32,
    pub speed: u32,
    pub id_vendor: u16,
    pub id_product: u16,
    pub bcd_device: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub configuration_value: u8,
    pub num_configurations: u8,
    pub num_interfaces: u8,
}

impl UsbDevice {
    /// `(busnum << 16) | devnum`, the id URBs are addressed with.
    pub fn devid(&self) -> u32 {
        (self.busnum << 16) | self.devnum
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&fixed_str::<PATH_SIZE>(&self.path));
        out.extend_from_slice(&fixed_str::<BUSID_SIZE>(&self.busid));
        out.extend_from_slice(&self.busnum.to_be_bytes());
        out.extend_from_slice(&self.devnum.to_be_bytes());
        out.extend_from_slice(&self.speed.to_be_bytes());
        out.extend_from_slice(&self.id_vendor.to_be_bytes());
        out.extend_from_slice(&self.id_product.to_be_bytes());
        out.extend_from_slice(&self.bcd_device.to_be_bytes());
        out.extend_from_slice(&[
            self.device_class,
            self.device_subclass,
            self.device_protocol,
            self.configuration_value,
            self.num_configurations,
            self.num_interfaces,
        ]);
    }

    pub fn decode(b: &[u8]) -> Option<Self> {
        if b.len() < DEVICE_SIZE {
            return None;
        }
        let n = PATH_SIZE + BUSID_SIZE;
        Some(Self {
            path: parse_fixed_str(&b[..PATH_SIZE]),
            busid: parse_fixed_str(&b[PATH_SIZE..n]),
            busnum: be_u32(&b[n..]),
            devnum: be_u32(&b[n + 4..]),
            speed: be_u32(&b[n + 8..]),
            id_vendor: be_u16(&b[n + 12..]),
            id_product: be_u16(&b[n + 14..]),
            bcd_device: be_u16(&b[n + 16..]),
            device_class: b[n + 18],
            device_subclass: b[n + 19],
            device_protocol: b[n + 20],
            configuration_value: b[n + 21],
            num_configurations: b[n + 22],
            num_interfaces: b[n + 23],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UsbInterface {
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

impl UsbInterface {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&[self.class, self.subclass, self.protocol, 0]);
    }
}

/// Common 20-byte prefix of every URB message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UrbHeader {
    pub command: u32,
    pub seqnum: u32,
    pub devid: u32,
    pub direction: u32,
    pub ep: u32,
}

impl UrbHeader {
    fn decode(b: &[u8]) -> Self {
        Self {
            command: be_u32(&b[0..]),
            seqnum: be_u32(&b[4..]),
            devid: be_u32(&b[8..]),
            direction: be_u32(&b[12..]),
            ep: be_u32(&b[16..]),
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        for v in [self.command, self.seqnum, self.devid, self.direction, self.ep] {
            out.extend_from_slice(&v.to_be_bytes());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submit {
    pub header: UrbHeader,
    pub transfer_flags: u32,
    pub transfer_buffer_length: u32,
    pub start_frame: i32,
    pub number_of_packets: i32,
    pub interval: i32,
    pub setup: [u8; 8],
    /// OUT payload; empty for IN transfers.
    pub data: Vec<u8>,
}

impl Submit {
    pub fn is_in(&self) -> bool {
        self.header.direction == DIR_IN
    }

    pub fn ep(&self) -> usize {
        self.header.ep as usize
    }
}

/// An URB command sent by the client once a device is imported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrbCommand {
    Submit(Submit),
    Unlink { header: UrbHeader, seqnum: u32 },
}

/// Largest transfer the server buffers.
pub const MAX_TRANSFER: u32 = 1 << 20;

impl UrbCommand {
    pub fn read<R: Read>(r: &mut R) -> ProtocolResult<Self> {
        let b: [u8; HEADER_SIZE] = read_array(r)?;
        let header = UrbHeader::decode(&b);
        let body = &b[20..];
        match header.command {
            CMD_SUBMIT => {
                let length = be_i32(&body[4..]);
                if length < 0 || length as u32 > MAX_TRANSFER {
                    return Err(ProtocolError::Length(length));
                }
                let mut setup = [0; 8];
                setup.copy_from_slice(&body[20..28]);
                let mut submit = Submit {
                    header,
                    transfer_flags: be_u32(&body[0..]),
                    transfer_buffer_length: length as u32,
                    start_frame: be_i32(&body[8..]),
                    number_of_packets: be_i32(&body[12..]),
                    interval: be_i32(&body[16..]),
                    setup,
                    data: Vec::new(),
                };
                if !submit.is_in() && length > 0 {
                    submit.data = vec![0; length as usize];
                    read_exact(r, &mut submit.data)?;
                }
                Ok(Self::Submit(submit))
            }
            CMD_UNLINK => Ok(Self::Unlink {
                header,
                seqnum: be_u32(&body[0..]),
            }),
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE);
        match self {
            Self::Submit(s) => {
                s.header.encode(&mut out);
                out.extend_from_slice(&s.transfer_flags.to_be_bytes());
                out.extend_from_slice(&s.transfer_buffer_length.to_be_bytes());
                out.extend_from_slice(&s.start_frame.to_be_bytes());
                out.extend_from_slice(&s.number_of_packets.to_be_bytes());
                out.extend_from_slice(&s.interval.to_be_bytes());
                out.extend_from_slice(&s.setup);
                out.extend_from_slice(&s.data);
            }
            Self::Unlink { header, seqnum } => {
                header.encode(&mut out);
                out.extend_from_slice(&seqnum.to_be_bytes());
                out.resize(HEADER_SIZE, 0);
            }
        }
        out
    }
}

/// Reply to `CMD_SUBMIT`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetSubmit {
    pub seqnum: u32,
    pub status: i32,
    pub actual_length: u32,
    /// IN payload.
    pub data: Vec<u8>,
}

impl RetSubmit {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.data.len());
        UrbHeader {
            command: RET_SUBMIT,
            seqnum: self.seqnum,
            ..UrbHeader::default()
        }
        .encode(&mut out);
        out.extend_from_slice(&self.status.to_be_bytes());
        out.extend_from_slice(&self.actual_length.to_be_bytes());
        // start_frame, number_of_packets, error_count, padding
        out.resize(HEADER_SIZE, 0);
        out.extend_from_slice(&self.data);
        out
    }

    /// Parses a reply and its payload; used by clients and tests.
    pub fn read<R: Read>(r: &mut R, is_in: bool) -> ProtocolResult<Self> {
        let b: [u8; HEADER_SIZE] = read_array(r)?;
        let header = UrbHeader::decode(&b);
        if header.command != RET_SUBMIT {
            return Err(ProtocolError::UnknownCommand(header.command));
        }
        let status = be_i32(&b[20..]);
        let actual_length = be_u32(&b[24..]);
        let mut data = Vec::new();
        if is_in && actual_length > 0 {
            if actual_length > MAX_TRANSFER {
                return Err(ProtocolError::Length(actual_length as i32));
            }
            data = vec![0; actual_length as usize];
            read_exact(r, &mut data)?;
        }
        Ok(Self {
            seqnum: header.seqnum,
            status,
            actual_length,
            data,
        })
    }
}

/// Reply to `CMD_UNLINK`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetUnlink {
    pub seqnum: u32,
    pub status: i32,
}

impl RetUnlink {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE);
        UrbHeader {
            command: RET_UNLINK,
            seqnum: self.seqnum,
            ..UrbHeader::default()
        }
        .encode(&mut out);
        out.extend_from_slice(&self.status.to_be_bytes());
        out.resize(HEADER_SIZE, 0);
        out
    }
}

/// Writes a whole message in one call.
pub fn send<W: Write>(w: &mut W, bytes: &[u8]) -> ProtocolResult<()> {
    w.write_all(bytes)?;
    w.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_device_record_layout() {
        let dev = UsbDevice {
            path: "/sys/devices/usb1/1-1".into(),
            busid: "1-1".into(),
            busnum: 1,
            devnum: 2,
            speed: 2,
            id_vendor: 0x16C0,
            id_product: 0x05DC,
            num_interfaces: 1,
            ..UsbDevice::default()
        };
        let mut out = Vec::new();
        dev.encode(&mut out);
        assert_eq!(out.len(), DEVICE_SIZE);
        assert_eq!(&out[PATH_SIZE..PATH_SIZE + 4], b"1-1\0");
        assert_eq!(&out[PATH_SIZE + BUSID_SIZE..][..4], &[0, 0, 0, 1]);
        assert_eq!(UsbDevice::decode(&out), Some(dev.clone()));
        assert_eq!(dev.devid(), 0x0001_0002);
    }

    #[test]
    fn test_import_request_parses_busid() {
        let bytes = OpRequest::Import {
            busid: "1-1".into(),
        }
        .encode();
        assert_eq!(bytes.len(), 8 + BUSID_SIZE);
        let req = OpRequest::read(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(
            req,
            OpRequest::Import {
                busid: "1-1".into()
            }
        );
    }

    #[test]
    fn test_version_mismatch_is_rejected() {
        let mut bytes = OpRequest::DevList.encode();
        bytes[1] = 0x11;
        assert!(matches!(
            OpRequest::read(&mut Cursor::new(bytes)),
            Err(ProtocolError::Version(0x0111))
        ));
    }

    #[test]
    fn test_out_submit_carries_payload() {
        let cmd = UrbCommand::Submit(Submit {
            header: UrbHeader {
                command: CMD_SUBMIT,
                seqnum: 7,
                devid: 0x10002,
                direction: DIR_OUT,
                ep: 2,
            },
            transfer_flags: 0,
            transfer_buffer_length: 3,
            start_frame: 0,
            number_of_packets: 0,
            interval: 0,
            setup: [0; 8],
            data: vec![1, 2, 3],
        });
        let bytes = cmd.encode();
        assert_eq!(bytes.len(), HEADER_SIZE + 3);
        assert_eq!(UrbCommand::read(&mut Cursor::new(bytes)).unwrap(), cmd);
    }

    #[test]
    fn test_truncated_stream_is_a_disconnect() {
        let bytes = vec![0, 0, 0, 1, 0, 0];
        assert!(matches!(
            UrbCommand::read(&mut Cursor::new(bytes)),
            Err(ProtocolError::Disconnected)
        ));
    }

    #[test]
    fn test_ret_submit_layout() {
        let ret = RetSubmit {
            seqnum: 9,
            status: EPIPE,
            actual_length: 0,
            data: Vec::new(),
        };
        let bytes = ret.encode();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(&bytes[0..4], &RET_SUBMIT.to_be_bytes());
        assert_eq!(&bytes[20..24], &(-32i32).to_be_bytes());
        assert_eq!(RetSubmit::read(&mut Cursor::new(bytes), true).unwrap(), ret);
    }
}
