//! Per-destination Transport Layer 4 (TL4) connection-oriented state machine.
//!
//! One [`Destination`] owns the connection to a single remote individual
//! address: connect/disconnect handshake, numbered data with acknowledgment,
//! retransmission, and the inactivity timeout that tears a stale connection
//! down. [`crate::transport::TransportLayer`] is the aggregator that owns one
//! `Destination` per peer plus the connectionless/group/broadcast services.

use crate::addressing::IndividualAddress;
use crate::cemi::control::{ControlField1, ControlField2};
use crate::cemi::message_code::Priority;
use crate::cemi::{Apci, LDataFrame, Tpci};
use crate::error::{CalimeroError, Result};
use crate::link::NetworkLink;

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Inactivity timeout tearing down an idle or stalled connection.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(6);
/// Timeout waiting for `T_ACK` after sending `T_DATA`.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(3);
/// Maximum retransmissions of an unacknowledged `T_DATA` frame.
pub const MAX_RETRIES: u8 = 3;

/// Lifecycle state of a connection-oriented destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationState {
    /// No connection; `connect()` may be called.
    Disconnected,
    /// `T_CONNECT` sent, awaiting the peer's readiness.
    Connecting,
    /// Connected, no data frame outstanding.
    OpenIdle,
    /// A `T_DATA` frame was sent and is awaiting `T_ACK`.
    OpenWait,
    /// Destroyed; terminal, no further transitions.
    Destroyed,
}

enum Outcome {
    Ack,
    Nak,
    Disconnected,
}

struct Inner<L: NetworkLink> {
    link: Arc<L>,
    peer: IndividualAddress,
    our_address: IndividualAddress,
    state: Mutex<DestinationState>,
    send_seq: AtomicU8,
    recv_seq: AtomicU8,
    owner_token: AtomicU64,
    pending: Mutex<Option<oneshot::Sender<Outcome>>>,
    inactivity_task: Mutex<Option<JoinHandle<()>>>,
}

/// A connection-oriented destination: one per remote individual address.
pub struct Destination<L: NetworkLink + Send + Sync + 'static> {
    inner: Arc<Inner<L>>,
}

impl<L: NetworkLink + Send + Sync + 'static> Clone for Destination<L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<L: NetworkLink + Send + Sync + 'static> Destination<L> {
    pub(crate) fn new(link: Arc<L>, our_address: IndividualAddress, peer: IndividualAddress) -> Self {
        Self {
            inner: Arc::new(Inner {
                link,
                peer,
                our_address,
                state: Mutex::new(DestinationState::Disconnected),
                send_seq: AtomicU8::new(0),
                recv_seq: AtomicU8::new(0),
                owner_token: AtomicU64::new(0),
                pending: Mutex::new(None),
                inactivity_task: Mutex::new(None),
            }),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> DestinationState {
        *self.inner.state.lock()
    }

    /// The peer this destination talks to.
    #[must_use]
    pub fn peer(&self) -> IndividualAddress {
        self.inner.peer
    }

    /// Open the connection, claiming ownership for `token`. Fails with
    /// [`CalimeroError::already_connecting`] if another caller already owns
    /// an active connection to this peer.
    ///
    /// # Errors
    ///
    /// Returns an error if the destination is destroyed, already connecting,
    /// or the peer never responds within [`CONNECTION_TIMEOUT`].
    pub async fn connect(&self, token: u64) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            match *state {
                DestinationState::Destroyed => return Err(CalimeroError::disconnect()),
                DestinationState::Disconnected => {
                    self.inner.owner_token.store(token, Ordering::Release);
                    *state = DestinationState::Connecting;
                }
                _ => return Err(CalimeroError::already_connecting()),
            }
        }

        let (tx, rx) = oneshot::channel();
        *self.inner.pending.lock() = Some(tx);

        self.send_control(0).await?;
        self.arm_timeout(CONNECTION_TIMEOUT);

        let outcome = tokio::time::timeout(CONNECTION_TIMEOUT, rx).await;
        self.cancel_timeout();

        match outcome {
            Ok(Ok(Outcome::Ack)) => {
                *self.inner.state.lock() = DestinationState::OpenIdle;
                self.arm_timeout(CONNECTION_TIMEOUT);
                Ok(())
            }
            _ => {
                *self.inner.state.lock() = DestinationState::Disconnected;
                Err(CalimeroError::disconnect())
            }
        }
    }

    /// Send application data, retrying up to [`MAX_RETRIES`] times if
    /// unacknowledged, and failing the connection on exhaustion.
    ///
    /// # Errors
    ///
    /// Returns [`CalimeroError::not_connected`] if not in `OpenIdle`,
    /// [`CalimeroError::foreign_destination`] if `token` doesn't match the
    /// current owner, or a transport error if retries are exhausted.
    pub async fn send_data(&self, token: u64, apci: Apci, data: &[u8]) -> Result<()> {
        self.check_owner(token)?;

        {
            let mut state = self.inner.state.lock();
            if *state != DestinationState::OpenIdle {
                return Err(CalimeroError::not_connected());
            }
            *state = DestinationState::OpenWait;
        }

        let sequence = self.inner.send_seq.load(Ordering::Acquire) & 0x0F;
        let frame = LDataFrame {
            ctrl1: ControlField1::new(true, true, false, Priority::Normal, false, false),
            ctrl2: ControlField2::new(false, ControlField2::DEFAULT_HOP_COUNT, 0),
            source: self.inner.our_address,
            destination_raw: self.inner.peer.raw(),
            npdu_length: 0,
            tpci: Tpci::NumberedData { sequence },
            apci,
            data,
        };

        let mut attempt = 0u8;
        loop {
            let (tx, rx) = oneshot::channel();
            *self.inner.pending.lock() = Some(tx);

            self.inner.link.send(&frame).await?;

            match tokio::time::timeout(ACK_TIMEOUT, rx).await {
                Ok(Ok(Outcome::Ack)) => {
                    self.inner.send_seq.store(sequence.wrapping_add(1) & 0x0F, Ordering::Release);
                    *self.inner.state.lock() = DestinationState::OpenIdle;
                    self.arm_timeout(CONNECTION_TIMEOUT);
                    return Ok(());
                }
                Ok(Ok(Outcome::Disconnected)) => {
                    *self.inner.state.lock() = DestinationState::Disconnected;
                    return Err(CalimeroError::disconnect());
                }
                _ => {
                    attempt += 1;
                    if attempt >= MAX_RETRIES {
                        warn!(peer = %self.inner.peer, "T_DATA retries exhausted, disconnecting");
                        *self.inner.state.lock() = DestinationState::Disconnected;
                        return Err(CalimeroError::retries_exhausted());
                    }
                    debug!(peer = %self.inner.peer, attempt, "retransmitting T_DATA");
                }
            }
        }
    }

    /// Tear the connection down permanently. Idempotent.
    pub fn destroy(&self) {
        *self.inner.state.lock() = DestinationState::Destroyed;
        self.cancel_timeout();
        if let Some(pending) = self.inner.pending.lock().take() {
            let _ = pending.send(Outcome::Disconnected);
        }
    }

    /// Dispatch a frame addressed to us from this peer. Called by the
    /// aggregator's link listener.
    pub(crate) fn on_frame(&self, tpci: Tpci, data: &[u8]) {
        if *self.inner.state.lock() == DestinationState::Destroyed {
            return;
        }
        self.arm_timeout(CONNECTION_TIMEOUT);

        match tpci {
            Tpci::UnnumberedControl { control: 1 } => {
                debug!(peer = %self.inner.peer, "peer disconnected");
                *self.inner.state.lock() = DestinationState::Disconnected;
                if let Some(pending) = self.inner.pending.lock().take() {
                    let _ = pending.send(Outcome::Disconnected);
                }
            }
            Tpci::NumberedControl { sequence, control: 2 } => {
                let state = *self.inner.state.lock();
                if state == DestinationState::Connecting {
                    if let Some(pending) = self.inner.pending.lock().take() {
                        let _ = pending.send(Outcome::Ack);
                    }
                } else if state == DestinationState::OpenWait {
                    let expected = self.inner.send_seq.load(Ordering::Acquire) & 0x0F;
                    if sequence == expected {
                        if let Some(pending) = self.inner.pending.lock().take() {
                            let _ = pending.send(Outcome::Ack);
                        }
                    }
                }
            }
            Tpci::NumberedControl { control: 3, .. } => {
                if let Some(pending) = self.inner.pending.lock().take() {
                    let _ = pending.send(Outcome::Nak);
                }
            }
            Tpci::NumberedData { sequence } => {
                let expected = self.inner.recv_seq.load(Ordering::Acquire) & 0x0F;
                let link = Arc::clone(&self.inner.link);
                let peer = self.inner.peer;
                let our_address = self.inner.our_address;
                if sequence == expected {
                    self.inner.recv_seq.store(expected.wrapping_add(1) & 0x0F, Ordering::Release);
                    let ack = Self::control_frame(our_address, peer, Tpci::NumberedControl { sequence, control: 2 });
                    tokio::spawn(async move {
                        let _ = link.send(&ack).await;
                    });
                } else {
                    debug!(peer = %peer, expected, got = sequence, "T_DATA sequence mismatch, sending T_NAK");
                    let nak = Self::control_frame(our_address, peer, Tpci::NumberedControl { sequence, control: 3 });
                    tokio::spawn(async move {
                        let _ = link.send(&nak).await;
                    });
                }
                let _ = data;
            }
            _ => {}
        }
    }

    fn check_owner(&self, token: u64) -> Result<()> {
        if self.inner.owner_token.load(Ordering::Acquire) != token {
            return Err(CalimeroError::foreign_destination());
        }
        Ok(())
    }

    async fn send_control(&self, control: u8) -> Result<()> {
        let frame = Self::control_frame(
            self.inner.our_address,
            self.inner.peer,
            Tpci::UnnumberedControl { control },
        );
        self.inner.link.send(&frame).await
    }

    fn control_frame(source: IndividualAddress, dest: IndividualAddress, tpci: Tpci) -> LDataFrame<'static> {
        LDataFrame {
            ctrl1: ControlField1::new(true, true, false, Priority::System, false, false),
            ctrl2: ControlField2::new(false, ControlField2::DEFAULT_HOP_COUNT, 0),
            source,
            destination_raw: dest.raw(),
            npdu_length: 0,
            tpci,
            apci: Apci::Unknown(0),
            data: &[],
        }
    }

    fn arm_timeout(&self, duration: Duration) {
        self.cancel_timeout();
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let mut state = inner.state.lock();
            if matches!(*state, DestinationState::OpenIdle | DestinationState::OpenWait | DestinationState::Connecting) {
                debug!(peer = %inner.peer, "connection inactivity timeout");
                *state = DestinationState::Disconnected;
                drop(state);
                if let Some(pending) = inner.pending.lock().take() {
                    let _ = pending.send(Outcome::Disconnected);
                }
            }
        });
        *self.inner.inactivity_task.lock() = Some(handle);
    }

    fn cancel_timeout(&self) {
        if let Some(task) = self.inner.inactivity_task.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{FrameEvent, Listener};
    use dashmap::DashMap;
    use std::sync::atomic::AtomicUsize;

    struct MockLink {
        sent: Mutex<Vec<Tpci>>,
        auto_ack: AtomicUsize,
        listeners: DashMap<u64, Box<dyn Listener>>,
    }

    impl MockLink {
        fn new() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                auto_ack: AtomicUsize::new(1),
                listeners: DashMap::new(),
            }
        }
    }

    impl NetworkLink for MockLink {
        async fn send(&self, frame: &LDataFrame<'_>) -> Result<()> {
            self.sent.lock().push(frame.tpci);
            Ok(())
        }

        async fn send_request_wait(&self, frame: &LDataFrame<'_>) -> Result<()> {
            self.send(frame).await
        }

        fn add_listener(&self, listener: Box<dyn Listener>) -> u64 {
            let id = self.listeners.len() as u64 + 1;
            self.listeners.insert(id, listener);
            id
        }

        fn remove_listener(&self, id: u64) {
            self.listeners.remove(&id);
        }

        fn close(&self) {}
    }

    fn destination() -> (Destination<MockLink>, Arc<MockLink>) {
        let link = Arc::new(MockLink::new());
        let our = IndividualAddress::new(1, 1, 1).unwrap();
        let peer = IndividualAddress::new(1, 1, 2).unwrap();
        (Destination::new(Arc::clone(&link), our, peer), link)
    }

    #[tokio::test]
    async fn connect_succeeds_when_ack_arrives() {
        let (dest, _link) = destination();
        let d = dest.clone();
        let handle = tokio::spawn(async move { d.connect(1).await });

        tokio::task::yield_now().await;
        dest.on_frame(Tpci::NumberedControl { sequence: 0, control: 2 }, &[]);

        assert!(handle.await.unwrap().is_ok());
        assert_eq!(dest.state(), DestinationState::OpenIdle);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_times_out_without_ack() {
        let (dest, _link) = destination();
        let result = dest.connect(1).await;
        assert!(result.is_err());
        assert_eq!(dest.state(), DestinationState::Disconnected);
    }

    #[tokio::test]
    async fn send_data_rejects_foreign_token() {
        let (dest, _link) = destination();
        let d = dest.clone();
        let handle = tokio::spawn(async move { d.connect(1).await });
        tokio::task::yield_now().await;
        dest.on_frame(Tpci::NumberedControl { sequence: 0, control: 2 }, &[]);
        handle.await.unwrap().unwrap();

        let result = dest.send_data(999, Apci::GroupValueWrite, &[1]).await;
        assert!(matches!(result, Err(CalimeroError::Transport(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn send_data_retries_then_disconnects() {
        let (dest, _link) = destination();
        let d = dest.clone();
        let handle = tokio::spawn(async move { d.connect(1).await });
        tokio::task::advance(Duration::from_millis(1)).await;
        dest.on_frame(Tpci::NumberedControl { sequence: 0, control: 2 }, &[]);
        handle.await.unwrap().unwrap();

        let result = dest.send_data(1, Apci::GroupValueWrite, &[1]).await;
        assert!(result.is_err());
        assert_eq!(dest.state(), DestinationState::Disconnected);
    }

    #[test]
    fn destroy_is_terminal_and_idempotent() {
        let (dest, _link) = destination();
        dest.destroy();
        dest.destroy();
        assert_eq!(dest.state(), DestinationState::Destroyed);
    }

    #[tokio::test]
    async fn numbered_data_out_of_sequence_sends_nak() {
        let (dest, link) = destination();
        dest.on_frame(Tpci::NumberedData { sequence: 5 }, &[0x80]);
        tokio::task::yield_now().await;

        let sent = link.sent.lock();
        assert!(matches!(sent.last(), Some(Tpci::NumberedControl { sequence: 5, control: 3 })));
    }

    #[tokio::test]
    async fn numbered_data_in_sequence_sends_ack_not_nak() {
        let (dest, link) = destination();
        dest.on_frame(Tpci::NumberedData { sequence: 0 }, &[0x80]);
        tokio::task::yield_now().await;

        let sent = link.sent.lock();
        assert!(matches!(sent.last(), Some(Tpci::NumberedControl { sequence: 0, control: 2 })));
    }
}
