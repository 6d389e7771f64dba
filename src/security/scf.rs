//! Secure Control Field (SCF): the one-octet header of every Data Secure APDU.

use crate::error::{CalimeroError, Result};

/// The `A_Security` service carried in the SCF's low 3 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecureService {
    /// Secured application data.
    Data,
    /// Directed or broadcast sequence-synchronization request.
    SyncRequest,
    /// Response to a sequence-synchronization request.
    SyncResponse,
}

impl SecureService {
    const fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::Data),
            2 => Some(Self::SyncRequest),
            3 => Some(Self::SyncResponse),
            _ => None,
        }
    }

    const fn to_bits(self) -> u8 {
        match self {
            Self::Data => 0,
            Self::SyncRequest => 2,
            Self::SyncResponse => 3,
        }
    }
}

/// CCM algorithm variant selected by the SCF's `algorithmId` bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    /// CCM authentication only (MAC, no encryption).
    CcmAuth,
    /// CCM authentication and confidentiality (MAC + encryption).
    CcmAuthConf,
}

impl Algorithm {
    const fn from_bit(bit: u8) -> Self {
        if bit == 0 {
            Self::CcmAuth
        } else {
            Self::CcmAuthConf
        }
    }

    const fn to_bit(self) -> u8 {
        match self {
            Self::CcmAuth => 0,
            Self::CcmAuthConf => 1,
        }
    }
}

/// Secure Control Field: tool access flag, algorithm, system-broadcast flag,
/// and the secure service being carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecureControlField {
    /// `true` if this APDU uses the tool key domain rather than a group key.
    pub tool_access: bool,
    /// CCM algorithm variant.
    pub algorithm: Algorithm,
    /// `true` if this is a system-broadcast frame (serial-keyed, not group-keyed).
    pub system_broadcast: bool,
    /// Secure service carried.
    pub service: SecureService,
}

impl SecureControlField {
    /// Construct a new SCF.
    #[must_use]
    pub const fn new(
        tool_access: bool,
        algorithm: Algorithm,
        system_broadcast: bool,
        service: SecureService,
    ) -> Self {
        Self {
            tool_access,
            algorithm,
            system_broadcast,
            service,
        }
    }

    /// Parse the SCF byte.
    ///
    /// # Errors
    ///
    /// Returns [`CalimeroError::invalid_scf`] if `algorithmId > 1` or the
    /// service field is not one of `{0, 2, 3}`.
    pub const fn parse(byte: u8) -> Result<Self> {
        let tool_access = (byte & 0x80) != 0;
        let algorithm_bit = (byte >> 4) & 0x07;
        if algorithm_bit > 1 {
            return Err(CalimeroError::invalid_scf());
        }
        let system_broadcast = (byte & 0x08) != 0;
        let service_bits = byte & 0x07;
        let service = match SecureService::from_bits(service_bits) {
            Some(s) => s,
            None => return Err(CalimeroError::invalid_scf()),
        };

        Ok(Self {
            tool_access,
            algorithm: Algorithm::from_bit(algorithm_bit),
            system_broadcast,
            service,
        })
    }

    /// Encode back to the SCF byte.
    #[must_use]
    pub const fn to_byte(self) -> u8 {
        let tool = if self.tool_access { 0x80 } else { 0 };
        let algo = self.algorithm.to_bit() << 4;
        let bcast = if self.system_broadcast { 0x08 } else { 0 };
        tool | algo | bcast | self.service.to_bits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_tool_access_data() {
        let scf = SecureControlField::new(true, Algorithm::CcmAuthConf, false, SecureService::Data);
        let byte = scf.to_byte();
        assert_eq!(SecureControlField::parse(byte).unwrap(), scf);
    }

    #[test]
    fn round_trips_group_sync_req() {
        let scf =
            SecureControlField::new(false, Algorithm::CcmAuth, true, SecureService::SyncRequest);
        let byte = scf.to_byte();
        assert_eq!(SecureControlField::parse(byte).unwrap(), scf);
    }

    #[test]
    fn rejects_invalid_algorithm_id() {
        let byte = 0b0010_0000;
        assert!(SecureControlField::parse(byte).is_err());
    }

    #[test]
    fn rejects_reserved_service() {
        let byte = 0b0000_0001;
        assert!(SecureControlField::parse(byte).is_err());
        let byte = 0b0000_0100;
        assert!(SecureControlField::parse(byte).is_err());
    }
}
