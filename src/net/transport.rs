//! Network transport abstraction for KNXnet/IP communication.
//!
//! `AsyncTransport` abstracts the underlying datagram transport so the link
//! layer can be driven by a real UDP socket in production and a
//! [`crate::net::mock_transport::MockTransport`] in tests, following the
//! Dependency Inversion Principle: both depend on this trait, neither on the
//! other.

use crate::error::Result;
use crate::net::IpEndpoint;

/// Asynchronous network transport abstraction.
///
/// Implementations can be real sockets ([`crate::net::udp::UdpTransport`]),
/// mock objects for testing, or alternative media.
#[allow(async_fn_in_trait)]
pub trait AsyncTransport {
    /// Bind the transport to a local port.
    ///
    /// # Errors
    ///
    /// Returns an error if the port is already in use or binding fails.
    ///
    /// Default implementation does nothing; override if your transport
    /// requires explicit binding before sending/receiving.
    fn bind(&mut self, _port: u16) -> Result<()> {
        Ok(())
    }

    /// Send data to a specific network endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the network is unavailable, the send buffer is
    /// full, or the transport is closed.
    async fn send_to(&mut self, data: &[u8], addr: IpEndpoint) -> Result<()>;

    /// Receive data from the network, blocking until data is available.
    ///
    /// # Errors
    ///
    /// Returns an error if the receive operation fails or the transport is
    /// closed.
    async fn recv_from(&mut self, buf: &mut [u8]) -> Result<(usize, IpEndpoint)>;

    /// Check if the transport is currently connected/ready.
    ///
    /// Default implementation returns `true`; override if your transport has
    /// connection state to track.
    fn is_ready(&self) -> bool {
        true
    }

    /// Close the transport and release resources.
    ///
    /// Default implementation does nothing.
    fn close(&mut self) {}
}
