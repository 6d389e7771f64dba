//! KNX Data Secure: AES-128-CCM authenticated encryption over the cEMI
//! `A_Security` service, sequence-counter replay protection, and the
//! sync.req/sync.res handshake that establishes initial sequence agreement.

pub mod ccm;
pub mod keys;
pub mod sal;
pub mod scf;
pub mod seq;

pub use keys::{AesKey, Security};
pub use sal::{AccessHook, FailureCounters, SecureApplicationLayer, SYNC_TIMEOUT};
pub use scf::{Algorithm, SecureControlField, SecureService};
pub use seq::{LastValidSeqTable, SequenceCounter};
