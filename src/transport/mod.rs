//! Transport Layer 4 (TL4): group/broadcast/individual-unconnected services
//! (stateless, one frame in, one frame out) and the data-connected service
//! (per-destination state machine, see [`destination`]).
//!
//! [`TransportLayer`] is the aggregator: it owns one [`Destination`] per
//! connected peer, multiplexing incoming frames from a single
//! [`NetworkLink`] to the right destination by source address, and forwards
//! every connectionless indication (group write/read/response, broadcast,
//! unconnected individual data) to its own registered listeners.

pub mod destination;

pub use destination::{Destination, DestinationState};

use crate::addressing::{GroupAddress, IndividualAddress, KnxAddress};
use crate::cemi::control::{ControlField1, ControlField2};
use crate::cemi::message_code::Priority;
use crate::cemi::{Apci, LDataFrame, Tpci};
use crate::error::Result;
use crate::link::{FrameEvent, Listener, NetworkLink};

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

struct Shared<L: NetworkLink + Send + Sync + 'static> {
    link: Arc<L>,
    our_address: IndividualAddress,
    destinations: DashMap<IndividualAddress, Destination<L>>,
    next_token: AtomicU64,
    listeners: DashMap<u64, Box<dyn Listener>>,
    next_listener_id: AtomicU64,
}

impl<L: NetworkLink + Send + Sync + 'static> Shared<L> {
    fn notify(&self, event: FrameEvent) {
        for entry in &self.listeners {
            entry.value().on_event(event.clone());
        }
    }

    fn dispatch_incoming(self: &Arc<Self>, raw: &[u8]) {
        let frame = match LDataFrame::parse(raw) {
            Ok(frame) => frame,
            Err(err) => {
                trace!(?err, "dropping malformed L_Data indication");
                return;
            }
        };

        if matches!(frame.tpci, Tpci::UnnumberedData) {
            self.notify(FrameEvent::Indication(raw.to_vec()));
            return;
        }

        if let Some(dest) = self.destinations.get(&frame.source) {
            dest.on_frame(frame.tpci, frame.data);
        }
    }
}

/// Handle to a connection-oriented peer, returned by [`TransportLayer::connect`].
///
/// Holds the ownership token established at connect time; calls through a
/// handle obtained by any other caller for the same peer fail with
/// [`crate::error::CalimeroError::foreign_destination`].
pub struct DestinationHandle<L: NetworkLink + Send + Sync + 'static> {
    destination: Destination<L>,
    token: u64,
}

impl<L: NetworkLink + Send + Sync + 'static> DestinationHandle<L> {
    /// The peer this handle is connected to.
    #[must_use]
    pub fn peer(&self) -> IndividualAddress {
        self.destination.peer()
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> DestinationState {
        self.destination.state()
    }

    /// Send application data over this connection, retrying and eventually
    /// disconnecting per the destination's retry policy.
    ///
    /// # Errors
    ///
    /// Returns an error if this handle no longer owns the connection or it
    /// isn't currently open.
    pub async fn send_data(&self, apci: Apci, data: &[u8]) -> Result<()> {
        self.destination.send_data(self.token, apci, data).await
    }

    /// Tear the connection down.
    pub fn disconnect(&self) {
        self.destination.destroy();
    }
}

/// Aggregates TL4 services over a single [`NetworkLink`].
pub struct TransportLayer<L: NetworkLink + Send + Sync + 'static> {
    shared: Arc<Shared<L>>,
    link_listener_id: u64,
}

impl<L: NetworkLink + Send + Sync + 'static> TransportLayer<L> {
    /// Wrap `link` for `our_address`, registering a listener that multiplexes
    /// incoming frames to connection state machines and connectionless
    /// subscribers.
    #[must_use]
    pub fn new(link: Arc<L>, our_address: IndividualAddress) -> Self {
        let shared = Arc::new(Shared {
            link: Arc::clone(&link),
            our_address,
            destinations: DashMap::new(),
            next_token: AtomicU64::new(1),
            listeners: DashMap::new(),
            next_listener_id: AtomicU64::new(1),
        });

        let dispatch_shared = Arc::clone(&shared);
        let link_listener_id = link.add_listener(Box::new(move |event: FrameEvent| {
            if let FrameEvent::Indication(raw) = event {
                dispatch_shared.dispatch_incoming(&raw);
            }
        }));

        Self {
            shared,
            link_listener_id,
        }
    }

    /// Register a listener for connectionless indications (group, broadcast,
    /// unconnected individual data). Returns an id usable with
    /// [`Self::remove_listener`].
    pub fn add_listener(&self, listener: Box<dyn Listener>) -> u64 {
        let id = self.shared.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.shared.listeners.insert(id, listener);
        id
    }

    /// Remove a previously registered connectionless listener.
    pub fn remove_listener(&self, id: u64) {
        self.shared.listeners.remove(&id);
    }

    /// Send a group-addressed service. Stateless: no acknowledgment is
    /// awaited beyond what the underlying link itself provides.
    ///
    /// # Errors
    ///
    /// Returns an error if the link send fails.
    pub async fn send_group(&self, group: GroupAddress, apci: Apci, data: &[u8]) -> Result<()> {
        let frame = Self::connectionless_frame(self.shared.our_address, KnxAddress::Group(group), apci, data);
        self.shared.link.send(&frame).await
    }

    /// Send a system-broadcast service (destination `0/0/0`).
    ///
    /// # Errors
    ///
    /// Returns an error if the link send fails.
    pub async fn send_broadcast(&self, apci: Apci, data: &[u8]) -> Result<()> {
        let frame = Self::connectionless_frame(self.shared.our_address, KnxAddress::BROADCAST, apci, data);
        self.shared.link.send(&frame).await
    }

    /// Send a connectionless service to an individual address (`T_Data_Individual`).
    ///
    /// # Errors
    ///
    /// Returns an error if the link send fails.
    pub async fn send_individual(&self, dest: IndividualAddress, apci: Apci, data: &[u8]) -> Result<()> {
        let frame = Self::connectionless_frame(self.shared.our_address, KnxAddress::Individual(dest), apci, data);
        self.shared.link.send(&frame).await
    }

    /// Open (or reclaim exclusive use of) a connection-oriented destination.
    ///
    /// Fails with [`crate::error::CalimeroError::already_connecting`] if
    /// another live handle currently owns the connection to `peer`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connect handshake doesn't complete within the
    /// connection timeout, or the destination is already owned.
    pub async fn connect(&self, peer: IndividualAddress) -> Result<DestinationHandle<L>> {
        let destination = self
            .shared
            .destinations
            .entry(peer)
            .or_insert_with(|| Destination::new(Arc::clone(&self.shared.link), self.shared.our_address, peer))
            .clone();

        let token = self.shared.next_token.fetch_add(1, Ordering::Relaxed);
        destination.connect(token).await?;

        Ok(DestinationHandle { destination, token })
    }

    fn connectionless_frame<'a>(
        source: IndividualAddress,
        dest: KnxAddress,
        apci: Apci,
        data: &'a [u8],
    ) -> LDataFrame<'a> {
        LDataFrame {
            ctrl1: ControlField1::new(true, true, dest.is_broadcast(), Priority::Low, false, false),
            ctrl2: ControlField2::new(dest.is_group(), ControlField2::DEFAULT_HOP_COUNT, 0),
            source,
            destination_raw: dest.raw(),
            npdu_length: 0,
            tpci: Tpci::UnnumberedData,
            apci,
            data,
        }
    }
}

impl<L: NetworkLink + Send + Sync + 'static> Drop for TransportLayer<L> {
    fn drop(&mut self) {
        self.shared.link.remove_listener(self.link_listener_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicU64 as StdAtomicU64;

    struct MockLink {
        sent: Mutex<Vec<(u16, Tpci)>>,
        listeners: DashMap<u64, Box<dyn Listener>>,
        next_id: StdAtomicU64,
    }

    impl MockLink {
        fn new() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                listeners: DashMap::new(),
                next_id: StdAtomicU64::new(1),
            }
        }

        fn deliver(&self, raw: &[u8]) {
            for entry in &self.listeners {
                entry.value().on_event(FrameEvent::Indication(raw.to_vec()));
            }
        }
    }

    impl NetworkLink for MockLink {
        async fn send(&self, frame: &LDataFrame<'_>) -> Result<()> {
            self.sent.lock().push((frame.destination_raw, frame.tpci));
            Ok(())
        }

        async fn send_request_wait(&self, frame: &LDataFrame<'_>) -> Result<()> {
            self.send(frame).await
        }

        fn add_listener(&self, listener: Box<dyn Listener>) -> u64 {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            self.listeners.insert(id, listener);
            id
        }

        fn remove_listener(&self, id: u64) {
            self.listeners.remove(&id);
        }

        fn close(&self) {}
    }

    #[tokio::test]
    async fn send_group_builds_group_addressed_unnumbered_frame() {
        let link = Arc::new(MockLink::new());
        let our = IndividualAddress::new(1, 1, 1).unwrap();
        let tl = TransportLayer::new(Arc::clone(&link), our);

        let group = GroupAddress::new(1, 2, 3).unwrap();
        tl.send_group(group, Apci::GroupValueWrite, &[1]).await.unwrap();

        let sent = link.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0], (group.raw(), Tpci::UnnumberedData));
    }

    #[tokio::test]
    async fn connectionless_indication_forwarded_to_listeners() {
        let link = Arc::new(MockLink::new());
        let our = IndividualAddress::new(1, 1, 1).unwrap();
        let tl = TransportLayer::new(Arc::clone(&link), our);

        let received = Arc::new(Mutex::new(0u32));
        let counted = Arc::clone(&received);
        tl.add_listener(Box::new(move |event: FrameEvent| {
            if matches!(event, FrameEvent::Indication(_)) {
                *counted.lock() += 1;
            }
        }));

        let group = GroupAddress::new(1, 2, 3).unwrap();
        let frame = TransportLayer::<MockLink>::connectionless_frame(
            IndividualAddress::new(1, 1, 2).unwrap(),
            KnxAddress::Group(group),
            Apci::GroupValueWrite,
            &[1],
        );
        let mut buf = [0u8; 32];
        let len = frame.build(&mut buf).unwrap();
        link.deliver(&buf[..len]);

        assert_eq!(*received.lock(), 1);
    }

    #[tokio::test]
    async fn connect_twice_without_disconnect_fails_second_caller() {
        let link = Arc::new(MockLink::new());
        let our = IndividualAddress::new(1, 1, 1).unwrap();
        let peer = IndividualAddress::new(1, 1, 2).unwrap();
        let tl = TransportLayer::new(Arc::clone(&link), our);

        let tl_arc = Arc::new(tl);
        let first = Arc::clone(&tl_arc);
        let handle = tokio::spawn(async move { first.connect(peer).await });

        tokio::task::yield_now().await;
        let ack = LDataFrame {
            ctrl1: ControlField1::new(true, true, false, Priority::System, false, false),
            ctrl2: ControlField2::new(false, ControlField2::DEFAULT_HOP_COUNT, 0),
            source: peer,
            destination_raw: our.raw(),
            npdu_length: 0,
            tpci: Tpci::NumberedControl { sequence: 0, control: 2 },
            apci: Apci::Unknown(0),
            data: &[],
        };
        let mut buf = [0u8; 32];
        let len = ack.build(&mut buf).unwrap();
        link.deliver(&buf[..len]);

        let first_result = handle.await.unwrap();
        assert!(first_result.is_ok());

        let second_result = tl_arc.connect(peer).await;
        assert!(second_result.is_err());
    }
}
