//! `L_Data` frame: TPCI/APCI parsing and the standard/extended frame layout.

use crate::addressing::{GroupAddress, IndividualAddress};
use crate::cemi::control::{ControlField1, ControlField2};
use crate::error::{CalimeroError, Result};

/// The APCI value of `A_Security`, the Secure Application Layer's own
/// transport service (§ security). Unlike short services it occupies the
/// full 10-bit APCI field rather than leaving 6 bits free for inline data.
pub const APCI_SECURE_SERVICE: u16 = 0x3F1;

/// TPCI (Transport Layer Protocol Control Information)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tpci {
    /// Unnumbered Data Packet (UDP)
    UnnumberedData,
    /// Numbered Data Packet (NDP) with sequence number
    NumberedData {
        /// Sequence number (0-15)
        sequence: u8,
    },
    /// Unnumbered Control Packet (UCP): connect, disconnect
    UnnumberedControl {
        /// Control sub-code: 0 = connect, 1 = disconnect
        control: u8,
    },
    /// Numbered Control Packet (NCP): ack, nak
    NumberedControl {
        /// Sequence number (0-15)
        sequence: u8,
        /// Control sub-code: 2 = ack, 3 = nak
        control: u8,
    },
}

impl Tpci {
    /// Parse TPCI from the first byte of the TPCI/APCI field.
    pub const fn from_byte(byte: u8) -> Self {
        let tpci = (byte >> 6) & 0x03;
        match tpci {
            0b00 => Self::UnnumberedData,
            0b01 => Self::NumberedData {
                sequence: (byte >> 2) & 0x0F,
            },
            0b10 => Self::UnnumberedControl { control: byte & 0x03 },
            _ => Self::NumberedControl {
                sequence: (byte >> 2) & 0x0F,
                control: byte & 0x03,
            },
        }
    }

    /// Encode back to the TPCI byte (APCI bits left as zero).
    pub const fn to_byte(self) -> u8 {
        match self {
            Self::UnnumberedData => 0b0000_0000,
            Self::NumberedData { sequence } => 0b0100_0000 | ((sequence & 0x0F) << 2),
            Self::UnnumberedControl { control } => 0b1000_0000 | (control & 0x03),
            Self::NumberedControl { sequence, control } => {
                0b1100_0000 | ((sequence & 0x0F) << 2) | (control & 0x03)
            }
        }
    }

    /// Check if this is a data packet (as opposed to connect/disconnect/ack/nak).
    pub const fn is_data(self) -> bool {
        matches!(self, Self::UnnumberedData | Self::NumberedData { .. })
    }

    /// Sequence number carried by a numbered packet, if any.
    pub const fn sequence(self) -> Option<u8> {
        match self {
            Self::NumberedData { sequence } | Self::NumberedControl { sequence, .. } => {
                Some(sequence)
            }
            _ => None,
        }
    }
}

/// APCI (Application Layer Protocol Control Information)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Apci {
    /// Group Value Read (`A_GroupValue_Read`)
    GroupValueRead,
    /// Group Value Response (`A_GroupValue_Response`)
    GroupValueResponse,
    /// Group Value Write (`A_GroupValue_Write`)
    GroupValueWrite,
    /// Individual Address Write
    IndividualAddressWrite,
    /// Individual Address Read
    IndividualAddressRead,
    /// Individual Address Response
    IndividualAddressResponse,
    /// Memory Read
    MemoryRead,
    /// Memory Response
    MemoryResponse,
    /// Memory Write
    MemoryWrite,
    /// Device Descriptor Read
    DeviceDescriptorRead,
    /// Device Descriptor Response
    DeviceDescriptorResponse,
    /// `A_Security`: the Secure Application Layer's secured-service wrapper.
    SecureService,
    /// Unknown/Unsupported APCI
    Unknown(u16),
}

impl Apci {
    /// Parse APCI from the TPCI/APCI byte pair.
    ///
    /// `A_Security` occupies the full 10-bit field; every other recognized
    /// service here is a "short" service that only uses the high 4 bits,
    /// leaving the low 6 bits of `byte2` free to carry an inline value.
    pub const fn from_bytes(byte1: u8, byte2: u8) -> Self {
        let full10 = ((byte1 as u16 & 0x03) << 8) | byte2 as u16;
        if full10 == APCI_SECURE_SERVICE {
            return Self::SecureService;
        }

        let short = ((byte1 as u16 & 0x03) << 8) | (byte2 as u16 & 0xC0);
        match short {
            0x000 => Self::GroupValueRead,
            0x040 => Self::GroupValueResponse,
            0x080 => Self::GroupValueWrite,
            0x0C0 => Self::IndividualAddressWrite,
            0x100 => Self::IndividualAddressRead,
            0x140 => Self::IndividualAddressResponse,
            0x200 => Self::MemoryRead,
            0x240 => Self::MemoryResponse,
            0x280 => Self::MemoryWrite,
            0x300 => Self::DeviceDescriptorRead,
            0x340 => Self::DeviceDescriptorResponse,
            _ => Self::Unknown(short),
        }
    }

    /// Convert APCI to its 10-bit wire value.
    pub const fn to_u16(self) -> u16 {
        match self {
            Self::GroupValueRead => 0x000,
            Self::GroupValueResponse => 0x040,
            Self::GroupValueWrite => 0x080,
            Self::IndividualAddressWrite => 0x0C0,
            Self::IndividualAddressRead => 0x100,
            Self::IndividualAddressResponse => 0x140,
            Self::MemoryRead => 0x200,
            Self::MemoryResponse => 0x240,
            Self::MemoryWrite => 0x280,
            Self::DeviceDescriptorRead => 0x300,
            Self::DeviceDescriptorResponse => 0x340,
            Self::SecureService => APCI_SECURE_SERVICE,
            Self::Unknown(val) => val,
        }
    }

    /// Split the 10-bit APCI value into the two TPCI/APCI wire bytes
    /// (with the TPCI high bits left as zero for the caller to OR in).
    pub const fn to_bytes(self) -> (u8, u8) {
        let val = self.to_u16();
        (((val >> 8) & 0x03) as u8, (val & 0xFF) as u8)
    }
}

/// cEMI `L_Data` frame: a single KNX telegram as carried between link and
/// transport layers.
#[derive(Debug, Clone)]
pub struct LDataFrame<'a> {
    /// Control field 1
    pub ctrl1: ControlField1,
    /// Control field 2
    pub ctrl2: ControlField2,
    /// Source address (individual)
    pub source: IndividualAddress,
    /// Destination address, raw 16 bits (kind given by `ctrl2.is_group_address()`)
    pub destination_raw: u16,
    /// NPDU length (TPCI/APCI + data)
    pub npdu_length: u8,
    /// TPCI
    pub tpci: Tpci,
    /// APCI
    pub apci: Apci,
    /// Application data, excluding the TPCI/APCI bytes themselves.
    pub data: &'a [u8],
}

impl<'a> LDataFrame<'a> {
    /// Minimum size of an `L_Data` frame (ctrl1 + ctrl2 + src(2) + dst(2) + npdu_len + tpci).
    pub const MIN_SIZE: usize = 8;

    /// Parse `L_Data` frame from bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer is too small or the frame is malformed.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        if data.len() < Self::MIN_SIZE {
            return Err(CalimeroError::buffer_too_small());
        }

        let ctrl1 = ControlField1::from(data[0]);
        let ctrl2 = ControlField2::from(data[1]);
        let source = IndividualAddress::from(u16::from_be_bytes([data[2], data[3]]));
        let destination_raw = u16::from_be_bytes([data[4], data[5]]);
        let npdu_length = data[6];

        let tpci_byte = data[7];
        let tpci = Tpci::from_byte(tpci_byte);

        let (apci, data_start) = if tpci.is_data() {
            if data.len() < 9 {
                return Err(CalimeroError::buffer_too_small());
            }
            (Apci::from_bytes(tpci_byte, data[8]), 9)
        } else {
            (Apci::Unknown(0), 8)
        };

        let npdu_end = 7 + npdu_length as usize;
        if data.len() < npdu_end {
            return Err(CalimeroError::invalid_frame());
        }

        Ok(Self {
            ctrl1,
            ctrl2,
            source,
            destination_raw,
            npdu_length,
            tpci,
            apci,
            data: &data[data_start..npdu_end],
        })
    }

    /// Encode this frame into `buf`, returning the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns an error if `buf` is too small or `data` exceeds 253 bytes.
    pub fn build(&self, buf: &mut [u8]) -> Result<usize> {
        if self.data.len() + 2 > u8::MAX as usize {
            return Err(CalimeroError::payload_too_large());
        }
        let data_start = if self.tpci.is_data() { 9 } else { 8 };
        let total = data_start + self.data.len();
        if buf.len() < total {
            return Err(CalimeroError::buffer_too_small());
        }

        buf[0] = self.ctrl1.raw();
        buf[1] = self.ctrl2.raw();
        buf[2..4].copy_from_slice(&u16::from(self.source).to_be_bytes());
        buf[4..6].copy_from_slice(&self.destination_raw.to_be_bytes());
        buf[6] = (data_start - 7 + self.data.len()) as u8;

        if self.tpci.is_data() {
            let (hi, lo) = self.apci.to_bytes();
            buf[7] = self.tpci.to_byte() | hi;
            buf[8] = lo;
        } else {
            buf[7] = self.tpci.to_byte();
        }

        buf[data_start..total].copy_from_slice(self.data);
        Ok(total)
    }

    /// Get destination as group address, if this frame targets one.
    #[inline]
    pub fn destination_group(&self) -> Option<GroupAddress> {
        self.ctrl2
            .is_group_address()
            .then(|| GroupAddress::from(self.destination_raw))
    }

    /// Get destination as individual address, if this frame targets one.
    #[inline]
    pub fn destination_individual(&self) -> Option<IndividualAddress> {
        (!self.ctrl2.is_group_address()).then(|| IndividualAddress::from(self.destination_raw))
    }

    /// Check if this is a group value write.
    #[inline(always)]
    pub const fn is_group_write(&self) -> bool {
        matches!(self.apci, Apci::GroupValueWrite)
    }

    /// Check if this is a group value read.
    #[inline(always)]
    pub const fn is_group_read(&self) -> bool {
        matches!(self.apci, Apci::GroupValueRead)
    }

    /// Check if this is a group value response.
    #[inline(always)]
    pub const fn is_group_response(&self) -> bool {
        matches!(self.apci, Apci::GroupValueResponse)
    }

    /// Check if this carries a secured APDU (`A_Security`).
    #[inline(always)]
    pub const fn is_secure(&self) -> bool {
        matches!(self.apci, Apci::SecureService)
    }
}

/// Extract a 6-bit inline value from the low bits of the APCI byte.
///
/// Short services (boolean switches, small scaled values) encode their
/// payload directly in the APCI byte rather than appending an NSDU byte.
pub const fn extract_6bit_value(apci_byte: u8) -> u8 {
    apci_byte & 0x3F
}
