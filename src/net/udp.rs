//! Tokio UDP socket transport for real KNXnet/IP communication.

use crate::error::{CalimeroError, Result};
use crate::net::transport::AsyncTransport;
use crate::net::IpEndpoint;
use tokio::net::UdpSocket;
use tracing::{debug, trace};

/// [`AsyncTransport`] backed by a `tokio::net::UdpSocket`.
#[derive(Debug)]
pub struct UdpTransport {
    socket: Option<UdpSocket>,
}

impl UdpTransport {
    /// Wrap an already-bound socket.
    pub fn new(socket: UdpSocket) -> Self {
        Self {
            socket: Some(socket),
        }
    }

    /// Bind a new socket to `0.0.0.0:port` (0 = any available port).
    ///
    /// # Errors
    ///
    /// Returns an error if the bind fails.
    pub async fn bind(port: u16) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port))
            .await
            .map_err(|_| CalimeroError::send_failed())?;
        debug!(local_addr = ?socket.local_addr().ok(), "bound udp transport");
        Ok(Self::new(socket))
    }

    fn socket(&self) -> Result<&UdpSocket> {
        self.socket.as_ref().ok_or_else(CalimeroError::link_closed)
    }
}

impl AsyncTransport for UdpTransport {
    async fn send_to(&mut self, data: &[u8], addr: IpEndpoint) -> Result<()> {
        let socket = self.socket()?;
        let target: std::net::SocketAddr = addr.into();
        trace!(%target, len = data.len(), "udp send_to");
        socket
            .send_to(data, target)
            .await
            .map_err(|_| CalimeroError::send_failed())?;
        Ok(())
    }

    async fn recv_from(&mut self, buf: &mut [u8]) -> Result<(usize, IpEndpoint)> {
        let socket = self.socket()?;
        let (len, from) = socket
            .recv_from(buf)
            .await
            .map_err(|_| CalimeroError::receive_failed())?;
        let endpoint = match from {
            std::net::SocketAddr::V4(v4) => IpEndpoint::from(v4),
            std::net::SocketAddr::V6(_) => return Err(CalimeroError::receive_failed()),
        };
        Ok((len, endpoint))
    }

    fn is_ready(&self) -> bool {
        self.socket.is_some()
    }

    fn close(&mut self) {
        self.socket = None;
    }
}
