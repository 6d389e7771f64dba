//! cEMI frame envelope: message code, additional info, and service info.
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │ Message Code (1 byte)                    │
//! ├──────────────────────────────────────────┤
//! │ Additional Info Length (1 byte)          │
//! ├──────────────────────────────────────────┤
//! │ Additional Info (variable)               │
//! ├──────────────────────────────────────────┤
//! │ Service Information (L_Data, M_PropX...) │
//! └──────────────────────────────────────────┘
//! ```

use crate::cemi::ldata::LDataFrame;
use crate::cemi::message_code::CEMIMessageCode;
use crate::error::{CalimeroError, Result};

/// cEMI Additional Information Type codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AdditionalInfoType {
    /// PL medium information
    PlMediumInfo = 0x01,
    /// RF medium information
    RfMediumInfo = 0x02,
    /// Busmonitor error flags
    BusmonitorErrorFlags = 0x03,
    /// Relative timestamp
    RelativeTimestamp = 0x04,
    /// Time delay
    TimeDelay = 0x05,
    /// Extended relative timestamp
    ExtendedRelativeTimestamp = 0x06,
    /// `BiBat` information
    BiBatInfo = 0x07,
}

impl AdditionalInfoType {
    /// Convert u8 to `AdditionalInfoType`.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::PlMediumInfo),
            0x02 => Some(Self::RfMediumInfo),
            0x03 => Some(Self::BusmonitorErrorFlags),
            0x04 => Some(Self::RelativeTimestamp),
            0x05 => Some(Self::TimeDelay),
            0x06 => Some(Self::ExtendedRelativeTimestamp),
            0x07 => Some(Self::BiBatInfo),
            _ => None,
        }
    }
}

/// A complete cEMI frame: message code, additional info, and service
/// information, borrowed from the underlying buffer.
#[derive(Debug, Clone, Copy)]
pub struct CEMIFrame<'a> {
    message_code: CEMIMessageCode,
    data: &'a [u8],
}

impl<'a> CEMIFrame<'a> {
    /// Minimum cEMI frame size (message code + add info length)
    pub const MIN_SIZE: usize = 2;

    /// Parse a cEMI frame from bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer is too small or the message code is
    /// not recognized.
    #[inline(always)]
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        if data.len() < Self::MIN_SIZE {
            return Err(CalimeroError::buffer_too_small());
        }

        let message_code =
            CEMIMessageCode::from_u8(data[0]).ok_or_else(CalimeroError::invalid_message_code)?;

        Ok(Self { message_code, data })
    }

    /// Get the message code.
    #[inline(always)]
    pub const fn message_code(&self) -> CEMIMessageCode {
        self.message_code
    }

    /// Get additional info length.
    #[inline(always)]
    pub fn additional_info_length(&self) -> u8 {
        // SAFETY: parse() guarantees data.len() >= MIN_SIZE = 2. Index 1 is
        // always valid.
        unsafe { *self.data.get_unchecked(1) }
    }

    /// Get the raw additional info bytes, if any.
    pub fn additional_info(&self) -> Result<&'a [u8]> {
        let len = self.additional_info_length() as usize;
        if self.data.len() < 2 + len {
            return Err(CalimeroError::invalid_frame());
        }
        Ok(&self.data[2..2 + len])
    }

    /// Get the service information (skipping message code and additional info).
    ///
    /// This returns the `L_Data`/`M_PropX` payload.
    #[inline]
    pub fn service_info(&self) -> Result<&'a [u8]> {
        let add_info_len = self.additional_info_length();
        let service_start = 2 + add_info_len as usize;

        if self.data.len() < service_start {
            return Err(CalimeroError::invalid_frame());
        }

        Ok(&self.data[service_start..])
    }

    /// Parse as `L_Data` frame (for `L_Data.req`, `L_Data.ind`, `L_Data.con`).
    ///
    /// # Errors
    ///
    /// Returns an error if this is not an `L_Data` frame or parsing fails.
    pub fn as_ldata(&self) -> Result<LDataFrame<'a>> {
        if !self.message_code.is_ldata() {
            return Err(CalimeroError::invalid_message_code());
        }
        LDataFrame::parse(self.service_info()?)
    }

    /// Check if this is an `L_Data` frame.
    #[inline(always)]
    pub const fn is_ldata(&self) -> bool {
        self.message_code.is_ldata()
    }

    /// Build a cEMI frame with no additional info wrapping an already-encoded
    /// `L_Data` service info buffer, returning the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns an error if `buf` is too small.
    pub fn build_ldata(message_code: CEMIMessageCode, ldata: &[u8], buf: &mut [u8]) -> Result<usize> {
        let total = 2 + ldata.len();
        if buf.len() < total {
            return Err(CalimeroError::buffer_too_small());
        }
        buf[0] = message_code.to_u8();
        buf[1] = 0;
        buf[2..total].copy_from_slice(ldata);
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addressing::{GroupAddress, IndividualAddress};

    #[test]
    fn test_cemi_frame_parse() {
        let data = [
            0x29, 0x00, 0xBC, 0xE0, 0x11, 0x01, 0x0A, 0x03, 0x02, 0x00, 0x80,
        ];

        let cemi = CEMIFrame::parse(&data).unwrap();
        assert_eq!(cemi.message_code(), CEMIMessageCode::LDataInd);
        assert_eq!(cemi.additional_info_length(), 0);
        assert!(cemi.is_ldata());

        let ldata = cemi.as_ldata().unwrap();
        assert!(ldata.is_group_write());
        assert_eq!(ldata.source, IndividualAddress::new(1, 1, 1).unwrap());
        assert_eq!(
            ldata.destination_group().unwrap(),
            GroupAddress::new(1, 2, 3).unwrap()
        );
    }

    #[test]
    fn test_cemi_frame_with_additional_info() {
        let data = [
            0x11, 0x04, 0x01, 0x02, 0x03, 0x04, 0xBC, 0xE0, 0x11, 0x01, 0x0A, 0x03, 0x01, 0x00,
            0x80,
        ];

        let cemi = CEMIFrame::parse(&data).unwrap();
        assert_eq!(cemi.additional_info_length(), 4);
        assert_eq!(cemi.additional_info().unwrap(), &[0x01, 0x02, 0x03, 0x04]);

        let service_info = cemi.service_info().unwrap();
        assert_eq!(service_info[0], 0xBC);
    }

    #[test]
    fn test_cemi_invalid_message_code() {
        let data = [0xFF, 0x00];
        assert!(CEMIFrame::parse(&data).is_err());
    }

    #[test]
    fn test_cemi_not_ldata() {
        let data = [0xFC, 0x00, 0x00, 0x00];
        let cemi = CEMIFrame::parse(&data).unwrap();
        assert!(!cemi.is_ldata());
        assert!(cemi.as_ldata().is_err());
    }
}
