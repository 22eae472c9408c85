//! Parsers for the USB descriptors the DFU class relies on.
//!
//! The configuration-descriptor walker operates on the raw byte buffer a
//! device returns for GET_DESCRIPTOR(CONFIGURATION): a 9-byte header
//! followed by concatenated sub-descriptors, each starting with
//! `bLength` and `bDescriptorType`.

use bytes::Buf;

use crate::error::DfuError;

pub(crate) const CONFIGURATION_DESC_TYPE: u8 = 0x02;
pub(crate) const INTERFACE_DESC_TYPE: u8 = 0x04;
pub(crate) const DFU_FUNCTIONAL_DESC_TYPE: u8 = 0x21;

pub(crate) const CONFIGURATION_DESC_LEN: usize = 9;
pub(crate) const INTERFACE_DESC_LEN: usize = 9;
pub(crate) const DFU_FUNCTIONAL_DESC_LEN: usize = 9;

pub const DFU_CLASS: u8 = 0xFE;
pub const DFU_SUBCLASS: u8 = 0x01;
/// Runtime mode: the device advertises DFU alongside its normal function.
pub const DFU_PROTOCOL_RUNTIME: u8 = 0x01;
/// DFU mode: the device is in its bootloader.
pub const DFU_PROTOCOL_DFU_MODE: u8 = 0x02;

/// `bcdDFUVersion` advertised by DfuSe (DFU 1.1a) devices.
pub const DFUSE_VERSION_NUMBER: u16 = 0x011A;

/// DFU functional descriptor, section 4.1.3 of the DFU 1.1 specification.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FunctionalDescriptor {
    pub will_detach: bool,
    pub manifestation_tolerant: bool,
    pub can_upload: bool,
    pub can_download: bool,
    pub detach_timeout: u16,
    pub transfer_size: u16,
    pub dfu_version: u16,
}

impl FunctionalDescriptor {
    const BIT_CAN_DNLOAD: u8 = 1 << 0;
    const BIT_CAN_UPLOAD: u8 = 1 << 1;
    const BIT_MANIFESTATION_TOLERANT: u8 = 1 << 2;
    const BIT_WILL_DETACH: u8 = 1 << 3;

    /// Parse a whole functional descriptor record, `bLength` included.
    pub fn from_bytes(mut bytes: &[u8]) -> Result<Self, DfuError> {
        if bytes.len() < DFU_FUNCTIONAL_DESC_LEN {
            return Err(DfuError::MalformedDescriptor(
                "functional descriptor shorter than 9 bytes",
            ));
        }

        bytes.advance(1);
        if bytes.get_u8() != DFU_FUNCTIONAL_DESC_TYPE {
            return Err(DfuError::MalformedDescriptor(
                "functional descriptor type is not 0x21",
            ));
        }

        let attributes = bytes.get_u8();
        let detach_timeout = bytes.get_u16_le();
        let transfer_size = bytes.get_u16_le();
        let dfu_version = bytes.get_u16_le();

        Ok(Self {
            will_detach: attributes & Self::BIT_WILL_DETACH != 0,
            manifestation_tolerant: attributes & Self::BIT_MANIFESTATION_TOLERANT != 0,
            can_upload: attributes & Self::BIT_CAN_UPLOAD != 0,
            can_download: attributes & Self::BIT_CAN_DNLOAD != 0,
            detach_timeout,
            transfer_size,
            dfu_version,
        })
    }
}

/// Standard interface descriptor with the DFU functional descriptor that
/// followed it, when any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
    pub string_index: u8,
    pub functional: Option<FunctionalDescriptor>,
}

impl InterfaceDescriptor {
    fn from_bytes(bytes: &[u8]) -> Result<Self, DfuError> {
        if bytes.len() < INTERFACE_DESC_LEN {
            return Err(DfuError::MalformedDescriptor(
                "interface descriptor shorter than 9 bytes",
            ));
        }

        Ok(Self {
            interface_number: bytes[2],
            alternate_setting: bytes[3],
            num_endpoints: bytes[4],
            interface_class: bytes[5],
            interface_subclass: bytes[6],
            interface_protocol: bytes[7],
            string_index: bytes[8],
            functional: None,
        })
    }

    pub fn is_dfu(&self) -> bool {
        self.interface_class == DFU_CLASS && self.interface_subclass == DFU_SUBCLASS
    }

    /// True for alternate settings the session can drive: DFU class with
    /// a runtime or DFU-mode protocol byte.
    pub fn is_dfu_candidate(&self) -> bool {
        self.is_dfu()
            && matches!(
                self.interface_protocol,
                DFU_PROTOCOL_RUNTIME | DFU_PROTOCOL_DFU_MODE
            )
    }
}

/// One record of a configuration descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescriptorRecord {
    Interface(InterfaceDescriptor),
    Functional(FunctionalDescriptor),
    /// Any other record, preserved verbatim with its type tag.
    Other { descriptor_type: u8, bytes: Vec<u8> },
}

/// Parsed configuration descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationDescriptor {
    pub configuration_value: u8,
    pub total_length: u16,
    pub num_interfaces: u8,
    pub records: Vec<DescriptorRecord>,
}

impl ConfigurationDescriptor {
    /// Walk a raw configuration descriptor buffer into typed records.
    ///
    /// A DFU functional descriptor is only recognized as such while the
    /// walker is inside a DFU interface (class 0xFE, subclass 0x01); a
    /// 0x21 record anywhere else stays opaque. The functional descriptor
    /// is attached both to the record list and to the interface that
    /// preceded it.
    pub fn parse(bytes: &[u8]) -> Result<Self, DfuError> {
        if bytes.len() < CONFIGURATION_DESC_LEN {
            return Err(DfuError::MalformedDescriptor(
                "configuration descriptor shorter than 9 bytes",
            ));
        }
        if bytes[1] != CONFIGURATION_DESC_TYPE {
            return Err(DfuError::MalformedDescriptor(
                "configuration descriptor type is not 0x02",
            ));
        }

        let total_length = u16::from_le_bytes([bytes[2], bytes[3]]);
        let num_interfaces = bytes[4];
        let configuration_value = bytes[5];

        let mut records = Vec::new();
        let mut in_dfu_interface = false;
        let mut offset = CONFIGURATION_DESC_LEN;

        while bytes.len() - offset >= 2 {
            let length = bytes[offset] as usize;
            if length < 2 {
                return Err(DfuError::MalformedDescriptor(
                    "descriptor record length below 2",
                ));
            }
            if offset + length > bytes.len() {
                return Err(DfuError::MalformedDescriptor(
                    "descriptor record exceeds the buffer",
                ));
            }

            let record = &bytes[offset..offset + length];
            let descriptor_type = record[1];
            match descriptor_type {
                INTERFACE_DESC_TYPE => {
                    let interface = InterfaceDescriptor::from_bytes(record)?;
                    in_dfu_interface = interface.is_dfu();
                    records.push(DescriptorRecord::Interface(interface));
                }
                DFU_FUNCTIONAL_DESC_TYPE if in_dfu_interface => {
                    let functional = FunctionalDescriptor::from_bytes(record)?;
                    if let Some(DescriptorRecord::Interface(interface)) = records
                        .iter_mut()
                        .rev()
                        .find(|r| matches!(r, DescriptorRecord::Interface(_)))
                    {
                        interface.functional = Some(functional);
                    }
                    records.push(DescriptorRecord::Functional(functional));
                }
                _ => {
                    records.push(DescriptorRecord::Other {
                        descriptor_type,
                        bytes: record.to_vec(),
                    });
                }
            }
            offset += length;
        }

        Ok(Self {
            configuration_value,
            total_length,
            num_interfaces,
            records,
        })
    }

    /// First DFU functional descriptor attached to this configuration.
    pub fn functional_descriptor(&self) -> Option<&FunctionalDescriptor> {
        self.records.iter().find_map(|record| match record {
            DescriptorRecord::Functional(functional) => Some(functional),
            _ => None,
        })
    }

    pub fn interfaces(&self) -> impl Iterator<Item = &InterfaceDescriptor> {
        self.records.iter().filter_map(|record| match record {
            DescriptorRecord::Interface(interface) => Some(interface),
            _ => None,
        })
    }

    /// Alternate settings the session can select.
    pub fn dfu_alternates(&self) -> impl Iterator<Item = &InterfaceDescriptor> {
        self.interfaces().filter(|i| i.is_dfu_candidate())
    }
}
