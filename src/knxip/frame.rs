//! KNXnet/IP frame parsing and encoding.
//!
//! Zero-copy parsing of the KNXnet/IP header/body envelope that carries
//! every core, tunnelling, and secure service.

use crate::error::{CalimeroError, Result};
use crate::knxip::constants::*;

/// KNXnet/IP frame header (6 bytes)
///
/// ```text
/// ┌──────────────┬──────────────┬─────────────────────┐
/// │ Header Len   │ Protocol Ver │  Service Type ID    │
/// │   (1 byte)   │   (1 byte)   │     (2 bytes)       │
/// ├──────────────┴──────────────┴─────────────────────┤
/// │           Total Length (2 bytes)                   │
/// └────────────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy)]
pub struct KnxnetIpHeader {
    /// Header length (should be 0x06)
    pub header_length: u8,
    /// Protocol version (should be 0x10 for v1.0)
    pub protocol_version: u8,
    /// Service type identifier
    pub service_type: ServiceType,
    /// Total length of frame (header + body)
    pub total_length: u16,
}

impl KnxnetIpHeader {
    /// Size of the header in bytes
    pub const SIZE: usize = 6;

    /// Create a new header
    pub const fn new(service_type: ServiceType, body_length: u16) -> Self {
        Self {
            header_length: HEADER_SIZE_10,
            protocol_version: KNXNETIP_VERSION_10,
            service_type,
            total_length: Self::SIZE as u16 + body_length,
        }
    }

    /// Parse a header from a byte slice.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer is too small, the header length or
    /// protocol version field is wrong, or the service type is unknown.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(CalimeroError::buffer_too_small());
        }

        let header_length = data[0];
        let protocol_version = data[1];
        let service_type_raw = u16::from_be_bytes([data[2], data[3]]);
        let total_length = u16::from_be_bytes([data[4], data[5]]);

        if header_length != HEADER_SIZE_10 {
            return Err(CalimeroError::invalid_frame());
        }
        if protocol_version != KNXNETIP_VERSION_10 {
            return Err(CalimeroError::unsupported_version());
        }

        let service_type =
            ServiceType::from_u16(service_type_raw).ok_or_else(CalimeroError::unsupported_service_type)?;

        Ok(Self {
            header_length,
            protocol_version,
            service_type,
            total_length,
        })
    }

    /// Encode the header into a byte buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if `buf` is smaller than [`Self::SIZE`].
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < Self::SIZE {
            return Err(CalimeroError::buffer_too_small());
        }

        buf[0] = self.header_length;
        buf[1] = self.protocol_version;
        buf[2..4].copy_from_slice(&self.service_type.to_u16().to_be_bytes());
        buf[4..6].copy_from_slice(&self.total_length.to_be_bytes());

        Ok(Self::SIZE)
    }

    /// Get the expected body length from the header.
    pub const fn body_length(&self) -> u16 {
        self.total_length.saturating_sub(Self::SIZE as u16)
    }
}

/// Zero-copy view of a KNXnet/IP frame.
#[derive(Debug)]
pub struct KnxnetIpFrame<'a> {
    data: &'a [u8],
    header: KnxnetIpHeader,
}

impl<'a> KnxnetIpFrame<'a> {
    /// Parse a KNXnet/IP frame from a byte slice.
    ///
    /// # Errors
    ///
    /// Returns an error if the header is invalid or the frame is incomplete.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let header = KnxnetIpHeader::parse(data)?;

        if data.len() < header.total_length as usize {
            return Err(CalimeroError::invalid_frame());
        }

        Ok(Self { data, header })
    }

    /// Get the frame header.
    #[inline(always)]
    pub const fn header(&self) -> &KnxnetIpHeader {
        &self.header
    }

    /// Get the service type.
    #[inline(always)]
    pub const fn service_type(&self) -> ServiceType {
        self.header.service_type
    }

    /// Get the frame body (payload after header).
    #[inline(always)]
    pub fn body(&self) -> &'a [u8] {
        let start = KnxnetIpHeader::SIZE;
        let end = self.header.total_length as usize;
        &self.data[start..end]
    }

    /// Get the complete frame data, including header.
    #[inline(always)]
    pub fn data(&self) -> &'a [u8] {
        &self.data[..self.header.total_length as usize]
    }
}

/// Builder for creating KNXnet/IP frames.
pub struct FrameBuilder<'a> {
    service_type: ServiceType,
    body: &'a [u8],
}

impl<'a> FrameBuilder<'a> {
    /// Create a new frame builder.
    pub const fn new(service_type: ServiceType, body: &'a [u8]) -> Self {
        Self { service_type, body }
    }

    /// Build the frame into a buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame would exceed [`MAX_FRAME_SIZE`] or `buf`
    /// is too small.
    pub fn build(&self, buf: &mut [u8]) -> Result<usize> {
        let total_size = KnxnetIpHeader::SIZE + self.body.len();

        if total_size > MAX_FRAME_SIZE {
            return Err(CalimeroError::payload_too_large());
        }

        if buf.len() < total_size {
            return Err(CalimeroError::buffer_too_small());
        }

        let header = KnxnetIpHeader::new(self.service_type, self.body.len() as u16);
        header.encode(buf)?;

        buf[KnxnetIpHeader::SIZE..total_size].copy_from_slice(self.body);

        Ok(total_size)
    }

    /// Calculate the total frame size.
    pub const fn size(&self) -> usize {
        KnxnetIpHeader::SIZE + self.body.len()
    }
}

/// Host Protocol Address Information (HPAI)
///
/// ```text
/// ┌──────────────┬──────────────┬─────────────────────┐
/// │ Structure Len│ Host Protocol│   IP Address        │
/// │   (1 byte)   │   (1 byte)   │   (4 bytes IPv4)    │
/// ├──────────────┴──────────────┴─────────────────────┤
/// │                Port (2 bytes)                      │
/// └────────────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hpai {
    /// Structure length (should be 8 for IPv4)
    pub structure_length: u8,
    /// Host protocol code
    pub host_protocol: u8,
    /// IPv4 address (4 bytes)
    pub ip_address: [u8; 4],
    /// UDP port
    pub port: u16,
}

impl Hpai {
    /// Size of HPAI structure for IPv4
    pub const SIZE: usize = 8;

    /// Create a new HPAI for IPv4 UDP.
    pub const fn new(ip_address: [u8; 4], port: u16) -> Self {
        Self {
            structure_length: Self::SIZE as u8,
            host_protocol: IPV4_UDP,
            ip_address,
            port,
        }
    }

    /// Parse HPAI from bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` is too small or the structure length field
    /// is wrong.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(CalimeroError::buffer_too_small());
        }

        let structure_length = data[0];
        let host_protocol = data[1];

        if structure_length != Self::SIZE as u8 {
            return Err(CalimeroError::invalid_frame());
        }

        let ip_address = [data[2], data[3], data[4], data[5]];
        let port = u16::from_be_bytes([data[6], data[7]]);

        Ok(Self {
            structure_length,
            host_protocol,
            ip_address,
            port,
        })
    }

    /// Encode HPAI into bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if `buf` is smaller than [`Self::SIZE`].
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < Self::SIZE {
            return Err(CalimeroError::buffer_too_small());
        }

        buf[0] = self.structure_length;
        buf[1] = self.host_protocol;
        buf[2..6].copy_from_slice(&self.ip_address);
        buf[6..8].copy_from_slice(&self.port.to_be_bytes());

        Ok(Self::SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_parse() {
        let data = [0x06, 0x10, 0x02, 0x01, 0x00, 0x0E];

        let header = KnxnetIpHeader::parse(&data).unwrap();
        assert_eq!(header.header_length, 0x06);
        assert_eq!(header.protocol_version, 0x10);
        assert_eq!(header.service_type, ServiceType::SearchRequest);
        assert_eq!(header.total_length, 14);
        assert_eq!(header.body_length(), 8);
    }

    #[test]
    fn test_header_encode() {
        let header = KnxnetIpHeader::new(ServiceType::SearchRequest, 8);
        let mut buf = [0u8; 6];
        let size = header.encode(&mut buf).unwrap();

        assert_eq!(size, 6);
        assert_eq!(buf[0], 0x06);
        assert_eq!(buf[1], 0x10);
        assert_eq!(buf[2..4], [0x02, 0x01]);
        assert_eq!(buf[4..6], [0x00, 0x0E]);
    }

    #[test]
    fn test_frame_builder() {
        let body = [0x01, 0x02, 0x03, 0x04];
        let builder = FrameBuilder::new(ServiceType::SearchRequest, &body);

        let mut buf = [0u8; 32];
        let size = builder.build(&mut buf).unwrap();

        assert_eq!(size, 10);
        assert_eq!(buf[0], 0x06);
        assert_eq!(buf[1], 0x10);
        assert_eq!(buf[4..6], [0x00, 0x0A]);
        assert_eq!(&buf[6..10], &body);
    }

    #[test]
    fn test_hpai_parse() {
        let data = [0x08, 0x01, 192, 168, 1, 100, 0x0E, 0x57];

        let hpai = Hpai::parse(&data).unwrap();
        assert_eq!(hpai.ip_address, [192, 168, 1, 100]);
        assert_eq!(hpai.port, 3671);
    }

    #[test]
    fn test_hpai_encode() {
        let hpai = Hpai::new([192, 168, 1, 100], 3671);
        let mut buf = [0u8; 8];
        let size = hpai.encode(&mut buf).unwrap();

        assert_eq!(size, 8);
        assert_eq!(buf[0], 0x08);
        assert_eq!(buf[1], 0x01);
        assert_eq!(&buf[2..6], &[192, 168, 1, 100]);
        assert_eq!(&buf[6..8], &[0x0E, 0x57]);
    }

    #[test]
    fn test_frame_parse() {
        let data = [0x06, 0x10, 0x02, 0x01, 0x00, 0x0A, 0x01, 0x02, 0x03, 0x04];

        let frame = KnxnetIpFrame::parse(&data).unwrap();
        assert_eq!(frame.service_type(), ServiceType::SearchRequest);
        assert_eq!(frame.body(), &[0x01, 0x02, 0x03, 0x04]);
    }
}
