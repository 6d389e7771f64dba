//! KNX device serial number.
//!
//! A 6-byte opaque identifier burned into a physical device, used by the
//! Secure Application Layer to key broadcast tool keys (§ security) since a
//! broadcast frame has no individual destination address to key off of.

use crate::error::{CalimeroError, Result};
use std::fmt;

/// A 6-byte KNX device serial number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SerialNumber([u8; 6]);

impl SerialNumber {
    /// Build a serial number from its 6 raw bytes.
    #[inline]
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Raw bytes, big-endian, as carried on the wire.
    #[inline]
    pub const fn as_bytes(&self) -> [u8; 6] {
        self.0
    }

    /// Decode a serial number from a byte buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if `buf` is smaller than 6 bytes.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 6 {
            return Err(CalimeroError::buffer_too_small());
        }
        let mut bytes = [0u8; 6];
        bytes.copy_from_slice(&buf[..6]);
        Ok(Self(bytes))
    }

    /// Encode the serial number into a byte buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if `buf` is smaller than 6 bytes.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < 6 {
            return Err(CalimeroError::buffer_too_small());
        }
        buf[..6].copy_from_slice(&self.0);
        Ok(6)
    }
}

impl fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{b:02X}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let sn = SerialNumber::new([0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
        let mut buf = [0u8; 6];
        sn.encode(&mut buf).unwrap();
        assert_eq!(SerialNumber::decode(&buf).unwrap(), sn);
    }

    #[test]
    fn display_is_colon_separated_hex() {
        let sn = SerialNumber::new([0x00, 0x1A, 0x2B, 0x3C, 0x4D, 0xFF]);
        assert_eq!(sn.to_string(), "00:1A:2B:3C:4D:FF");
    }

    #[test]
    fn decode_rejects_short_buffer() {
        assert!(SerialNumber::decode(&[0u8; 5]).is_err());
    }
}
