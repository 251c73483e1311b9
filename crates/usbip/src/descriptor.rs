// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Standard USB descriptors, as far as the device export needs them.
//! Descriptor fields are little-endian.

use crate::protocol::UsbInterface;

pub const REQTYPE_DEVICE_TO_HOST: u8 = 0x80;
pub const REQUEST_GET_DESCRIPTOR: u8 = 6;

pub const DESCRIPTOR_DEVICE: u8 = 1;
pub const DESCRIPTOR_CONFIGURATION: u8 = 2;
pub const DESCRIPTOR_INTERFACE: u8 = 4;

pub const DEVICE_DESCRIPTOR_SIZE: usize = 18;
pub const CONFIG_DESCRIPTOR_SIZE: usize = 9;

/// The 8-byte SETUP packet of a control transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub fn get_descriptor(kind: u8, index: u8, length: u16) -> Self {
        Self {
            request_type: REQTYPE_DEVICE_TO_HOST,
            request: REQUEST_GET_DESCRIPTOR,
            value: (kind as u16) << 8 | index as u16,
            index: 0,
            length,
        }
    }

    pub fn parse(b: &[u8; 8]) -> Self {
        Self {
            request_type: b[0],
            request: b[1],
            value: u16::from_le_bytes([b[2], b[3]]),
            index: u16::from_le_bytes([b[4], b[5]]),
            length: u16::from_le_bytes([b[6], b[7]]),
        }
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let v = self.value.to_le_bytes();
        let i = self.index.to_le_bytes();
        let l = self.length.to_le_bytes();
        [self.request_type, self.request, v[0], v[1], i[0], i[1], l[0], l[1]]
    }

    /// Data stage direction.
    pub fn is_in(&self) -> bool {
        self.request_type & REQTYPE_DEVICE_TO_HOST != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub max_packet_size0: u8,
    pub id_vendor: u16,
    pub id_product: u16,
    pub bcd_device: u16,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    pub fn parse(b: &[u8]) -> Option<Self> {
        if b.len() < DEVICE_DESCRIPTOR_SIZE || b[1] != DESCRIPTOR_DEVICE {
            return None;
        }
        Some(Self {
            device_class: b[4],
            device_subclass: b[5],
            device_protocol: b[6],
            max_packet_size0: b[7],
            id_vendor: u16::from_le_bytes([b[8], b[9]]),
            id_product: u16::from_le_bytes([b[10], b[11]]),
            bcd_device: u16::from_le_bytes([b[12], b[13]]),
            num_configurations: b[17],
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigDescriptor {
    pub total_length: u16,
    pub num_interfaces: u8,
    pub configuration_value: u8,
    /// Filled only when the full descriptor set was parsed.
    pub interfaces: Vec<UsbInterface>,
}

impl ConfigDescriptor {
    /// Parses the configuration header and any interface descriptors that
    /// follow it in `b`.
    pub fn parse(b: &[u8]) -> Option<Self> {
        if b.len() < CONFIG_DESCRIPTOR_SIZE || b[1] != DESCRIPTOR_CONFIGURATION {
            return None;
        }
        let mut interfaces = Vec::new();
        let mut offset = b[0] as usize;
        while offset + 2 <= b.len() {
            let len = b[offset] as usize;
            if len < 2 || offset + len > b.len() {
                break;
            }
            // alternate settings repeat the interface number
            if b[offset + 1] == DESCRIPTOR_INTERFACE && len >= 9 && b[offset + 3] == 0 {
                interfaces.push(UsbInterface {
                    class: b[offset + 5],
                    subclass: b[offset + 6],
                    protocol: b[offset + 7],
                });
            }
            offset += len;
        }
        Some(Self {
            total_length: u16::from_le_bytes([b[2], b[3]]),
            num_interfaces: b[4],
            configuration_value: b[5],
            interfaces,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_packet_bytes() {
        let setup = SetupPacket::get_descriptor(DESCRIPTOR_CONFIGURATION, 0, 9);
        assert_eq!(setup.to_bytes(), [0x80, 6, 0, 2, 0, 0, 9, 0]);
        assert_eq!(SetupPacket::parse(&setup.to_bytes()), setup);
        assert!(setup.is_in());
    }

    #[test]
    fn test_config_with_interfaces() {
        let bytes = [
            9, 2, 32, 0, 1, 1, 0, 0x80, 50, // configuration
            9, 4, 0, 0, 2, 0x03, 0x01, 0x02, 0, // interface 0, HID boot mouse
            7, 5, 0x81, 3, 8, 0, 10, // endpoint
            7, 5, 0x02, 3, 8, 0, 10,
        ];
        let cfg = ConfigDescriptor::parse(&bytes).unwrap();
        assert_eq!(cfg.total_length, 32);
        assert_eq!(cfg.num_interfaces, 1);
        assert_eq!(
            cfg.interfaces,
            vec![UsbInterface {
                class: 3,
                subclass: 1,
                protocol: 2
            }]
        );
    }

    #[test]
    fn test_wrong_descriptor_type_rejected() {
        assert!(DeviceDescriptor::parse(&[18, 2, 0, 2, 0, 0, 0, 64, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]).is_none());
    }
}
