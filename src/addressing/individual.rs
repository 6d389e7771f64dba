//! KNX Individual Address implementation.
//!
//! Individual addresses identify physical devices on the KNX bus.
//! Format: Area.Line.Device (e.g., 1.1.5)
//! - Area: 0-15 (4 bits)
//! - Line: 0-15 (4 bits)
//! - Device: 0-255 (8 bits)

use crate::error::{CalimeroError, Result};
use std::fmt;

/// KNX Individual Address (Area.Line.Device)
///
/// Used to identify physical devices on the KNX bus.
///
/// # Examples
///
/// ```
/// use calimero::IndividualAddress;
///
/// let addr = IndividualAddress::new(1, 1, 5).unwrap();
/// assert_eq!(addr.to_string(), "1.1.5");
///
/// let addr = IndividualAddress::from(0x1105u16);
/// assert_eq!(addr.area(), 1);
/// assert_eq!(addr.line(), 1);
/// assert_eq!(addr.device(), 5);
///
/// let addr: IndividualAddress = "1.1.5".parse().unwrap();
/// assert_eq!(u16::from(addr), 0x1105);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct IndividualAddress {
    raw: u16,
}

impl IndividualAddress {
    /// Maximum area value (4 bits)
    pub const MAX_AREA: u8 = 15;
    /// Maximum line value (4 bits)
    pub const MAX_LINE: u8 = 15;
    /// Maximum device value (8 bits)
    pub const MAX_DEVICE: u8 = 255;

    /// The unspecified/unknown individual address `0.0.0`, used as a
    /// placeholder that a link replaces with its configured device address.
    pub const UNSPECIFIED: Self = Self { raw: 0 };

    /// Create a new Individual Address from components.
    ///
    /// # Errors
    ///
    /// Returns an error if `area` or `line` is out of range.
    pub fn new(area: u8, line: u8, device: u8) -> Result<Self> {
        if area > Self::MAX_AREA {
            return Err(CalimeroError::invalid_address());
        }
        if line > Self::MAX_LINE {
            return Err(CalimeroError::invalid_address());
        }

        let raw = (u16::from(area) << 12) | (u16::from(line) << 8) | u16::from(device);
        Ok(Self { raw })
    }

    /// Create from a 3-element array `[area, line, device]`.
    pub fn from_array(parts: [u8; 3]) -> Result<Self> {
        Self::new(parts[0], parts[1], parts[2])
    }

    /// Get the raw u16 representation of the address.
    #[inline(always)]
    pub const fn raw(self) -> u16 {
        self.raw
    }

    /// Get the area component (0-15).
    #[inline(always)]
    pub const fn area(self) -> u8 {
        ((self.raw >> 12) & 0x0F) as u8
    }

    /// Get the line component (0-15).
    #[inline(always)]
    pub const fn line(self) -> u8 {
        ((self.raw >> 8) & 0x0F) as u8
    }

    /// Get the device component (0-255).
    #[inline(always)]
    pub const fn device(self) -> u8 {
        (self.raw & 0xFF) as u8
    }

    /// True if this is the `0.0.0` placeholder address.
    #[inline(always)]
    pub const fn is_unspecified(self) -> bool {
        self.raw == 0
    }

    /// Encode the address into a byte buffer (big-endian).
    ///
    /// # Errors
    ///
    /// Returns an error if `buf` is smaller than 2 bytes.
    #[inline]
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < 2 {
            return Err(CalimeroError::buffer_too_small());
        }
        buf[0..2].copy_from_slice(&self.raw.to_be_bytes());
        Ok(2)
    }

    /// Decode an address from a byte buffer (big-endian).
    ///
    /// # Errors
    ///
    /// Returns an error if `buf` is smaller than 2 bytes.
    #[inline]
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 2 {
            return Err(CalimeroError::buffer_too_small());
        }
        let raw = u16::from_be_bytes([buf[0], buf[1]]);
        Ok(Self { raw })
    }
}

impl fmt::Display for IndividualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.area(), self.line(), self.device())
    }
}

impl From<u16> for IndividualAddress {
    #[inline(always)]
    fn from(raw: u16) -> Self {
        Self { raw }
    }
}

impl From<IndividualAddress> for u16 {
    #[inline(always)]
    fn from(addr: IndividualAddress) -> u16 {
        addr.raw
    }
}

impl std::str::FromStr for IndividualAddress {
    type Err = CalimeroError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split('.');

        let area = parts
            .next()
            .and_then(|s| s.parse::<u8>().ok())
            .ok_or_else(CalimeroError::invalid_address)?;

        let line = parts
            .next()
            .and_then(|s| s.parse::<u8>().ok())
            .ok_or_else(CalimeroError::invalid_address)?;

        let device = parts
            .next()
            .and_then(|s| s.parse::<u8>().ok())
            .ok_or_else(CalimeroError::invalid_address)?;

        if parts.next().is_some() {
            return Err(CalimeroError::invalid_address());
        }

        Self::new(area, line, device)
    }
}
