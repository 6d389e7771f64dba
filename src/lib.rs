#![doc = include_str!("../README.md")]

//! # calimero
//!
//! KNX building-automation protocol stack: Network Link, Transport Layer 4,
//! and the Secure Application Layer, for async Rust on `tokio`.
//!
//! ## Layers
//!
//! - [`link`] — `NetworkLink`, the KNXnet/IP tunneling implementation, and
//!   the reconnecting [`link::connector::Connector`] wrapper.
//! - [`transport`] — group/broadcast/connectionless services and the
//!   per-destination connection-oriented state machine.
//! - [`security`] — AES-128-CCM over cEMI `A_Security`, sequence-counter
//!   replay protection, and the sync.req/sync.res handshake.
//!
//! Addressing ([`addressing`]), cEMI framing ([`cemi`]), and KNXnet/IP wire
//! types ([`knxip`]) are shared building blocks used by all three.

pub mod addressing;
pub mod cemi;
pub mod config;
pub mod error;
pub mod knxip;
pub mod link;
pub mod net;
pub mod security;
pub mod transport;

// Macro module (must be declared before use)
#[macro_use]
pub mod macros;

// Re-export commonly used types
pub use addressing::{GroupAddress, IndividualAddress, KnxAddress};
pub use config::Config;
pub use error::{CalimeroError, Result};
