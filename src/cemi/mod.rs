//! Common External Message Interface (cEMI) implementation.
//!
//! cEMI is the wire format carried inside KNXnet/IP tunneling frames (and,
//! unchanged, across serial links): a message code identifying the service,
//! optional additional info, and a service-specific payload. This module
//! covers message codes, the `L_Data` frame used for application telegrams,
//! and the cEMI envelope that wraps it.

pub mod control;
pub mod frame;
pub mod ldata;
pub mod message_code;

pub use control::{ControlField1, ControlField2};
pub use frame::{AdditionalInfoType, CEMIFrame};
pub use ldata::{extract_6bit_value, Apci, LDataFrame, Tpci, APCI_SECURE_SERVICE};
pub use message_code::{CEMIMessageCode, Priority};
