//! Mock transport implementation for testing.
//!
//! A stand-in for [`crate::net::udp::UdpTransport`] that lets tests program
//! responses and inspect sent packets without any real network hardware.

use crate::error::{CalimeroError, Result};
use crate::net::transport::AsyncTransport;
use crate::net::IpEndpoint;
use std::collections::VecDeque;

/// Mock transport for testing KNX communication without real network.
///
/// Allows pre-programming responses returned by `recv_from()`, inspecting
/// packets sent via `send_to()`, and simulating a closed/unready transport.
#[derive(Debug, Default)]
pub struct MockTransport {
    responses: VecDeque<(Vec<u8>, IpEndpoint)>,
    sent_packets: Vec<(Vec<u8>, IpEndpoint)>,
    ready: bool,
}

impl MockTransport {
    /// Create a new mock transport, ready by default.
    pub fn new() -> Self {
        Self {
            responses: VecDeque::new(),
            sent_packets: Vec::new(),
            ready: true,
        }
    }

    /// Add a response returned by the next `recv_from()` call (FIFO order),
    /// as if it came from `192.168.1.10:3671`.
    pub fn add_response(&mut self, data: Vec<u8>) {
        self.add_response_from(data, IpEndpoint::new([192, 168, 1, 10].into(), 3671));
    }

    /// Add a response with a specific source endpoint.
    pub fn add_response_from(&mut self, data: Vec<u8>, from: IpEndpoint) {
        self.responses.push_back((data, from));
    }

    /// All packets sent via `send_to()`, as `(data, destination)` tuples.
    pub fn sent_packets(&self) -> &[(Vec<u8>, IpEndpoint)] {
        &self.sent_packets
    }

    /// The last packet sent, or `None` if none have been sent.
    pub fn last_sent(&self) -> Option<&(Vec<u8>, IpEndpoint)> {
        self.sent_packets.last()
    }

    /// Clear the sent-packet history.
    pub fn clear_sent(&mut self) {
        self.sent_packets.clear();
    }

    /// Clear all pending responses.
    pub fn clear_responses(&mut self) {
        self.responses.clear();
    }

    /// Set whether the transport reports itself as ready.
    pub fn set_ready(&mut self, ready: bool) {
        self.ready = ready;
    }

    /// Whether there are pending responses.
    pub fn has_responses(&self) -> bool {
        !self.responses.is_empty()
    }

    /// Number of pending responses.
    pub fn pending_responses(&self) -> usize {
        self.responses.len()
    }
}

impl AsyncTransport for MockTransport {
    async fn send_to(&mut self, data: &[u8], addr: IpEndpoint) -> Result<()> {
        self.sent_packets.push((data.to_vec(), addr));
        Ok(())
    }

    async fn recv_from(&mut self, buf: &mut [u8]) -> Result<(usize, IpEndpoint)> {
        if let Some((data, from)) = self.responses.pop_front() {
            let len = data.len().min(buf.len());
            buf[..len].copy_from_slice(&data[..len]);
            Ok((len, from))
        } else {
            Err(CalimeroError::Timeout)
        }
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    fn close(&mut self) {
        self.ready = false;
        self.responses.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_send_receive() {
        let mut mock = MockTransport::new();

        mock.add_response(vec![0x01, 0x02, 0x03]);

        let dest = IpEndpoint::new([192, 168, 1, 10].into(), 3671);
        mock.send_to(&[0xAA, 0xBB], dest).await.unwrap();

        assert_eq!(mock.sent_packets().len(), 1);
        assert_eq!(mock.sent_packets()[0].0, vec![0xAA, 0xBB]);
        assert_eq!(mock.sent_packets()[0].1, dest);

        let mut buf = [0u8; 10];
        let (n, _) = mock.recv_from(&mut buf).await.unwrap();
        assert_eq!(n, 3);
        assert_eq!(&buf[..3], &[0x01, 0x02, 0x03]);
    }

    #[tokio::test]
    async fn test_mock_no_response_returns_error() {
        let mut mock = MockTransport::new();

        let mut buf = [0u8; 10];
        let result = mock.recv_from(&mut buf).await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_mock_fifo_order() {
        let mut mock = MockTransport::new();

        mock.add_response(vec![0x01]);
        mock.add_response(vec![0x02]);
        mock.add_response(vec![0x03]);

        let mut buf = [0u8; 10];

        let (_n, _) = mock.recv_from(&mut buf).await.unwrap();
        assert_eq!(buf[0], 0x01);

        let (_n, _) = mock.recv_from(&mut buf).await.unwrap();
        assert_eq!(buf[0], 0x02);

        let (_n, _) = mock.recv_from(&mut buf).await.unwrap();
        assert_eq!(buf[0], 0x03);
    }

    #[test]
    fn test_mock_ready_state() {
        let mut mock = MockTransport::new();
        assert!(mock.is_ready());

        mock.set_ready(false);
        assert!(!mock.is_ready());

        mock.close();
        assert!(!mock.is_ready());
    }
}
