//! KNX Group Address implementation.
//!
//! Group addresses represent logical groupings of devices for functional control.
//! Two formats are supported:
//! - 2-level: Main/Sub (e.g., 1/234)
//! - 3-level: Main/Middle/Sub (e.g., 1/2/3) - most common
//!
//! Internally stored as 16 bits:
//! - Main: 5 bits (0-31)
//! - Middle: 3 bits (0-7)
//! - Sub: 8 bits (0-255)

use crate::error::{CalimeroError, Result};
use std::fmt;

/// KNX Group Address
///
/// Used for logical grouping of devices and functions. The raw address
/// `0x0000` is reserved and denotes a system broadcast destination.
///
/// # Examples
///
/// ```
/// use calimero::GroupAddress;
///
/// let addr = GroupAddress::new(1, 2, 3).unwrap();
/// assert_eq!(addr.to_string(), "1/2/3");
///
/// let addr = GroupAddress::new_2level(1, 234).unwrap();
/// assert_eq!(addr.to_string_2level(), "1/234");
///
/// let addr = GroupAddress::from(0x0A03u16);
/// assert_eq!(addr.main(), 1);
/// assert_eq!(addr.middle(), 2);
/// assert_eq!(addr.sub(), 3);
///
/// let addr: GroupAddress = "1/2/3".parse().unwrap();
/// assert_eq!(u16::from(addr), 0x0A03);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct GroupAddress {
    raw: u16,
}

impl GroupAddress {
    /// Maximum main group value (5 bits)
    pub const MAX_MAIN: u8 = 31;
    /// Maximum middle group value (3 bits)
    pub const MAX_MIDDLE: u8 = 7;
    /// Maximum sub group value (8 bits)
    pub const MAX_SUB: u8 = 255;
    /// Maximum sub value for 2-level format (11 bits)
    pub const MAX_SUB_2LEVEL: u16 = 2047;

    /// Create a new 3-level Group Address (Main/Middle/Sub).
    ///
    /// # Errors
    ///
    /// Returns an error if `main` or `middle` is out of range.
    pub fn new(main: u8, middle: u8, sub: u8) -> Result<Self> {
        if main > Self::MAX_MAIN {
            return Err(CalimeroError::invalid_address());
        }
        if middle > Self::MAX_MIDDLE {
            return Err(CalimeroError::invalid_address());
        }

        let raw = (u16::from(main) << 11) | (u16::from(middle) << 8) | u16::from(sub);
        Ok(Self { raw })
    }

    /// Create a new 2-level Group Address (Main/Sub).
    ///
    /// # Errors
    ///
    /// Returns an error if `main` or `sub` is out of range.
    pub fn new_2level(main: u8, sub: u16) -> Result<Self> {
        if main > Self::MAX_MAIN {
            return Err(CalimeroError::invalid_address());
        }
        if sub > Self::MAX_SUB_2LEVEL {
            return Err(CalimeroError::invalid_address());
        }

        let raw = (u16::from(main) << 11) | sub;
        Ok(Self { raw })
    }

    /// Create from a 3-element array `[main, middle, sub]`.
    pub fn from_array(parts: [u8; 3]) -> Result<Self> {
        Self::new(parts[0], parts[1], parts[2])
    }

    /// Const constructor from a raw 16-bit value, used for the `BROADCAST`
    /// constant where validation can't run.
    pub(crate) const fn from_raw(raw: u16) -> Self {
        Self { raw }
    }

    /// Get the raw u16 representation of the address.
    #[inline(always)]
    pub const fn raw(self) -> u16 {
        self.raw
    }

    /// Get the main group component (0-31).
    #[inline(always)]
    pub const fn main(self) -> u8 {
        ((self.raw >> 11) & 0x1F) as u8
    }

    /// Get the middle group component for 3-level format (0-7).
    #[inline(always)]
    pub const fn middle(self) -> u8 {
        ((self.raw >> 8) & 0x07) as u8
    }

    /// Get the sub group component for 3-level format (0-255).
    #[inline(always)]
    pub const fn sub(self) -> u8 {
        (self.raw & 0xFF) as u8
    }

    /// Get the sub group component for 2-level format (0-2047).
    #[inline(always)]
    pub const fn sub_2level(self) -> u16 {
        self.raw & 0x07FF
    }

    /// Format as 3-level string (Main/Middle/Sub).
    pub fn to_string_3level(&self) -> String {
        format!("{}/{}/{}", self.main(), self.middle(), self.sub())
    }

    /// Format as 2-level string (Main/Sub).
    pub fn to_string_2level(&self) -> String {
        format!("{}/{}", self.main(), self.sub_2level())
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

impl From<u16> for GroupAddress {
    #[inline(always)]
    fn from(raw: u16) -> Self {
        Self { raw }
    }
}

impl From<GroupAddress> for u16 {
    #[inline(always)]
    fn from(addr: GroupAddress) -> u16 {
        addr.raw
    }
}

impl fmt::Display for GroupAddress {
    /// Format as 3-level address by default
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.main(), self.middle(), self.sub())
    }
}

impl std::str::FromStr for GroupAddress {
    type Err = CalimeroError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split('/');

        let main = parts
            .next()
            .and_then(|s| s.parse::<u8>().ok())
            .ok_or_else(CalimeroError::invalid_address)?;

        let middle = parts
            .next()
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or_else(CalimeroError::invalid_address)?;

        if let Some(sub_str) = parts.next() {
            // 3-level format: Main/Middle/Sub
            let sub = sub_str
                .parse::<u8>()
                .ok()
                .ok_or_else(CalimeroError::invalid_address)?;

            if parts.next().is_some() {
                return Err(CalimeroError::invalid_address());
            }

            if middle > 255 {
                return Err(CalimeroError::invalid_address());
            }

            Self::new(main, middle as u8, sub)
        } else {
            // 2-level format: Main/Sub
            if parts.next().is_some() {
                return Err(CalimeroError::invalid_address());
            }

            Self::new_2level(main, middle)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_3level_valid() {
        let addr = GroupAddress::new(1, 2, 3).unwrap();
        assert_eq!(addr.main(), 1);
        assert_eq!(addr.middle(), 2);
        assert_eq!(addr.sub(), 3);
    }

    #[test]
    fn test_new_3level_invalid_main() {
        assert!(GroupAddress::new(32, 0, 0).is_err());
    }

    #[test]
    fn test_new_3level_invalid_middle() {
        assert!(GroupAddress::new(0, 8, 0).is_err());
    }

    #[test]
    fn test_new_2level_valid() {
        let addr = GroupAddress::new_2level(1, 234).unwrap();
        assert_eq!(addr.main(), 1);
        assert_eq!(addr.sub_2level(), 234);
    }

    #[test]
    fn test_new_2level_invalid() {
        assert!(GroupAddress::new_2level(0, 2048).is_err());
    }

    #[test]
    fn test_from_raw() {
        let addr = GroupAddress::from(0x0A03u16);
        assert_eq!(addr.main(), 1);
        assert_eq!(addr.middle(), 2);
        assert_eq!(addr.sub(), 3);
    }

    #[test]
    fn test_to_raw() {
        let addr = GroupAddress::new(1, 2, 3).unwrap();
        assert_eq!(u16::from(addr), 0x0A03);
    }

    #[test]
    fn test_encode_decode() {
        let addr = GroupAddress::new(31, 7, 255).unwrap();
        let mut buf = [0u8; 2];
        addr.encode(&mut buf).unwrap();
        let decoded = GroupAddress::decode(&buf).unwrap();
        assert_eq!(addr, decoded);
    }

    #[test]
    fn test_display_3level() {
        let addr = GroupAddress::new(1, 2, 3).unwrap();
        assert_eq!(format!("{addr}"), "1/2/3");
    }

    #[test]
    fn test_to_string_2level() {
        let addr = GroupAddress::new_2level(1, 234).unwrap();
        assert_eq!(addr.to_string_2level(), "1/234");
    }

    #[test]
    fn test_from_str_3level() {
        let addr: GroupAddress = "1/2/3".parse().unwrap();
        assert_eq!(addr.main(), 1);
        assert_eq!(addr.middle(), 2);
        assert_eq!(addr.sub(), 3);
    }

    #[test]
    fn test_from_str_2level() {
        let addr: GroupAddress = "1/234".parse().unwrap();
        assert_eq!(addr.main(), 1);
        assert_eq!(addr.sub_2level(), 234);
    }

    #[test]
    fn test_from_str_invalid() {
        assert!("1".parse::<GroupAddress>().is_err());
        assert!("32/0/0".parse::<GroupAddress>().is_err());
        assert!("1/2/3/4".parse::<GroupAddress>().is_err());
        assert!("a/b/c".parse::<GroupAddress>().is_err());
        assert!("".parse::<GroupAddress>().is_err());
        assert!("1/2048".parse::<GroupAddress>().is_err());
    }
}
