//! KNXnet/IP tunneling [`NetworkLink`] implementation.
//!
//! Owns a single tunnel connection to a KNXnet/IP gateway: it runs the
//! CONNECT/CONNECTIONSTATE/DISCONNECT state machine, assigns and tracks the
//! send/receive sequence counters, and dispatches incoming `L_Data`
//! indications to registered listeners from a single background task so a
//! link never has two concurrent readers racing the transport.

use crate::cemi::{CEMIFrame, CEMIMessageCode, LDataFrame};
use crate::error::{CalimeroError, Result};
use crate::knxip::{
    ConnectRequest, ConnectResponse, ConnectionHeader, ConnectionStateRequest, DisconnectRequest,
    Hpai, KnxnetIpFrame, ServiceType, TunnelingAck, TunnelingRequest,
};
use crate::net::transport::AsyncTransport;
use crate::net::IpEndpoint;

use super::{CloseInitiator, FrameEvent, Listener, MediumSettings, NetworkLink};

use crate::addressing::IndividualAddress;

use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Time allowed for a `CONNECT_RESPONSE` to arrive.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Time allowed for a `TUNNELING_ACK` to arrive after a `TUNNELING_REQUEST`.
const TUNNELING_ACK_TIMEOUT: Duration = Duration::from_secs(1);
/// Interval between `CONNECTIONSTATE_REQUEST` heartbeats.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

const BUFFER_SIZE: usize = crate::knxip::constants::MAX_FRAME_SIZE;

struct SharedState<T> {
    transport: Mutex<T>,
    gateway: IpEndpoint,
    channel_id: AtomicU8,
    send_sequence: AtomicU8,
    recv_sequence: AtomicU8,
    connected: AtomicBool,
    listeners: DashMap<u64, Box<dyn Listener>>,
    next_listener_id: AtomicU64,
    pending_acks: DashMap<u8, oneshot::Sender<bool>>,
    device_address: SyncMutex<Option<IndividualAddress>>,
    max_apdu_length: SyncMutex<Option<u16>>,
    domain_address: SyncMutex<Option<u16>>,
}

impl<T> SharedState<T> {
    fn notify(&self, event: FrameEvent) {
        for entry in self.listeners.iter() {
            entry.value().on_event(event.clone());
        }
    }

    /// Notify listeners of closure exactly once, on the `true -> false`
    /// transition of `connected`.
    fn close_once(&self, initiator: CloseInitiator, reason: &str) {
        if self
            .connected
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.notify(FrameEvent::LinkClosed {
                initiator,
                reason: reason.to_string(),
            });
        }
    }
}

/// A [`NetworkLink`] backed by a KNXnet/IP tunneling connection.
pub struct IpLink<T: AsyncTransport + Send + 'static> {
    shared: Arc<SharedState<T>>,
    dispatch_task: JoinHandle<()>,
}

impl<T: AsyncTransport + Send + 'static> IpLink<T> {
    /// Establish a tunnel connection over `transport` to `gateway`, using
    /// NAT mode (0.0.0.0:0 endpoints; the gateway replies to the observed
    /// source address).
    ///
    /// # Errors
    ///
    /// Returns an error if the `CONNECT_REQUEST`/`CONNECT_RESPONSE` exchange
    /// fails or times out.
    pub async fn connect(mut transport: T, gateway: IpEndpoint) -> Result<Self> {
        transport.bind(0)?;

        let nat = Hpai::new([0, 0, 0, 0], 0);
        let request = ConnectRequest::new(nat, nat);
        let mut buf = [0u8; BUFFER_SIZE];
        let len = request.build(&mut buf)?;
        transport.send_to(&buf[..len], gateway).await?;

        let mut rx = [0u8; BUFFER_SIZE];
        let (n, _) = tokio::time::timeout(CONNECT_TIMEOUT, transport.recv_from(&mut rx))
            .await
            .map_err(|_| CalimeroError::Timeout)??;

        let frame = KnxnetIpFrame::parse(&rx[..n])?;
        if frame.service_type() != ServiceType::ConnectResponse {
            return Err(CalimeroError::invalid_frame());
        }
        let response = ConnectResponse::parse(frame.body())?;
        if !response.is_ok() {
            return Err(CalimeroError::not_connected());
        }

        debug!(channel_id = response.channel_id, %gateway, "tunnel connected");

        let shared = Arc::new(SharedState {
            transport: Mutex::new(transport),
            gateway,
            channel_id: AtomicU8::new(response.channel_id),
            send_sequence: AtomicU8::new(0),
            recv_sequence: AtomicU8::new(0),
            connected: AtomicBool::new(true),
            listeners: DashMap::new(),
            next_listener_id: AtomicU64::new(1),
            pending_acks: DashMap::new(),
            device_address: SyncMutex::new(None),
            max_apdu_length: SyncMutex::new(None),
            domain_address: SyncMutex::new(None),
        });

        let dispatch_shared = Arc::clone(&shared);
        let dispatch_task = tokio::spawn(async move {
            dispatch_loop(dispatch_shared).await;
        });

        Ok(Self {
            shared,
            dispatch_task,
        })
    }

    /// Disconnect cleanly, sending `DISCONNECT_REQUEST` on a best-effort
    /// basis before tearing down the dispatch task.
    pub async fn disconnect(self) -> Result<()> {
        let channel_id = self.shared.channel_id.load(Ordering::Acquire);
        let control = Hpai::new([0, 0, 0, 0], 0);
        let request = DisconnectRequest::new(channel_id, control);
        let mut buf = [0u8; BUFFER_SIZE];
        if let Ok(len) = request.build(&mut buf) {
            let mut transport = self.shared.transport.lock().await;
            let _ = transport.send_to(&buf[..len], self.shared.gateway).await;
        }
        self.close();
        Ok(())
    }

    async fn send_tunneling_request(&self, cemi: &[u8]) -> Result<u8> {
        let channel_id = self.shared.channel_id.load(Ordering::Acquire);
        let sequence = self.shared.send_sequence.fetch_add(1, Ordering::AcqRel);
        let header = ConnectionHeader::new(channel_id, sequence);
        let request = TunnelingRequest::new(header, cemi);

        let mut buf = [0u8; BUFFER_SIZE];
        let len = request.build(&mut buf)?;

        let mut transport = self.shared.transport.lock().await;
        transport.send_to(&buf[..len], self.shared.gateway).await?;
        Ok(sequence)
    }

    fn encode_ldata(frame: &LDataFrame<'_>) -> Result<Vec<u8>> {
        let mut ldata_buf = [0u8; BUFFER_SIZE];
        let ldata_len = frame.build(&mut ldata_buf)?;

        let mut cemi_buf = vec![0u8; ldata_len + 2];
        let cemi_len =
            CEMIFrame::build_ldata(CEMIMessageCode::LDataReq, &ldata_buf[..ldata_len], &mut cemi_buf)?;
        cemi_buf.truncate(cemi_len);
        Ok(cemi_buf)
    }
}

impl<T: AsyncTransport + Send + 'static> NetworkLink for IpLink<T> {
    async fn send(&self, frame: &LDataFrame<'_>) -> Result<()> {
        if !self.shared.connected.load(Ordering::Acquire) {
            return Err(CalimeroError::link_closed());
        }
        let cemi = Self::encode_ldata(frame)?;
        self.send_tunneling_request(&cemi).await?;
        Ok(())
    }

    async fn send_request_wait(&self, frame: &LDataFrame<'_>) -> Result<()> {
        if !self.shared.connected.load(Ordering::Acquire) {
            return Err(CalimeroError::link_closed());
        }
        let cemi = Self::encode_ldata(frame)?;

        let (tx, rx) = oneshot::channel();
        let sequence = self.send_tunneling_request(&cemi).await?;
        self.shared.pending_acks.insert(sequence, tx);

        match tokio::time::timeout(TUNNELING_ACK_TIMEOUT, rx).await {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err(CalimeroError::ack_failed()),
            Ok(Err(_)) => Err(CalimeroError::ack_failed()),
            Err(_) => {
                self.shared.pending_acks.remove(&sequence);
                Err(CalimeroError::Timeout)
            }
        }
    }

    fn add_listener(&self, listener: Box<dyn Listener>) -> u64 {
        let id = self.shared.next_listener_id.fetch_add(1, Ordering::AcqRel);
        self.shared.listeners.insert(id, listener);
        id
    }

    fn remove_listener(&self, id: u64) {
        self.shared.listeners.remove(&id);
    }

    fn close(&self) {
        self.shared.close_once(CloseInitiator::User, "user requested");
        self.dispatch_task.abort();
    }

    fn medium_settings(&self) -> MediumSettings {
        MediumSettings {
            device_address: *self.shared.device_address.lock(),
            max_apdu_length: *self.shared.max_apdu_length.lock(),
            domain_address: *self.shared.domain_address.lock(),
        }
    }

    fn apply_medium_settings(&self, settings: MediumSettings) {
        if settings.device_address.is_some() {
            *self.shared.device_address.lock() = settings.device_address;
        }
        if settings.max_apdu_length.is_some() {
            *self.shared.max_apdu_length.lock() = settings.max_apdu_length;
        }
        if settings.domain_address.is_some() {
            *self.shared.domain_address.lock() = settings.domain_address;
        }
    }
}

async fn dispatch_loop<T: AsyncTransport + Send + 'static>(shared: Arc<SharedState<T>>) {
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    let mut buf = vec![0u8; BUFFER_SIZE];

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if let Err(err) = send_heartbeat(&shared).await {
                    warn!(?err, "heartbeat failed");
                }
            }
            received = recv_one(&shared, &mut buf) => {
                match received {
                    Ok(Some(n)) => {
                        handle_frame(&shared, &buf[..n]).await;
                        if !shared.connected.load(Ordering::Acquire) {
                            break;
                        }
                    }
                    Ok(None) => continue,
                    Err(err) => {
                        warn!(?err, "link receive failed, closing");
                        shared.close_once(CloseInitiator::Client, "transport receive failed");
                        break;
                    }
                }
            }
        }
    }
}

async fn recv_one<T: AsyncTransport>(
    shared: &Arc<SharedState<T>>,
    buf: &mut [u8],
) -> Result<Option<usize>> {
    let mut transport = shared.transport.lock().await;
    match transport.recv_from(buf).await {
        Ok((n, _from)) => Ok(Some(n)),
        Err(CalimeroError::Timeout) => Ok(None),
        Err(other) => Err(other),
    }
}

async fn handle_frame<T: AsyncTransport>(shared: &Arc<SharedState<T>>, data: &[u8]) {
    let frame = match KnxnetIpFrame::parse(data) {
        Ok(f) => f,
        Err(err) => {
            trace!(?err, "dropping malformed knxnet/ip frame");
            return;
        }
    };

    match frame.service_type() {
        ServiceType::TunnellingRequest => {
            let Ok(request) = TunnelingRequest::parse(frame.body()) else {
                return;
            };
            let expected = shared.recv_sequence.load(Ordering::Acquire);
            if request.connection_header.sequence_counter == expected {
                shared.recv_sequence.store(expected.wrapping_add(1), Ordering::Release);
                shared.notify(FrameEvent::Indication(request.cemi_data.to_vec()));
            }

            let channel_id = shared.channel_id.load(Ordering::Acquire);
            let header = ConnectionHeader::new(channel_id, request.connection_header.sequence_counter);
            let ack = TunnelingAck::new(header, 0);
            let mut ack_buf = [0u8; 16];
            if let Ok(len) = ack.build(&mut ack_buf) {
                let mut transport = shared.transport.lock().await;
                let _ = transport.send_to(&ack_buf[..len], shared.gateway).await;
            }
        }
        ServiceType::TunnellingAck => {
            let Ok(ack) = TunnelingAck::parse(frame.body()) else {
                return;
            };
            if let Some((_, tx)) = shared
                .pending_acks
                .remove(&ack.connection_header.sequence_counter)
            {
                let _ = tx.send(ack.is_ok());
            }
        }
        ServiceType::ConnectionstateResponse => {
            trace!("heartbeat acknowledged");
        }
        ServiceType::DisconnectRequest => {
            debug!("gateway requested disconnect");
            shared.close_once(CloseInitiator::Server, "gateway disconnect request");
        }
        other => {
            trace!(?other, "ignoring unhandled service type");
        }
    }
}

async fn send_heartbeat<T: AsyncTransport>(shared: &Arc<SharedState<T>>) -> Result<()> {
    let channel_id = shared.channel_id.load(Ordering::Acquire);
    let control = Hpai::new([0, 0, 0, 0], 0);
    let request = ConnectionStateRequest::new(channel_id, control);
    let mut buf = [0u8; 32];
    let len = request.build(&mut buf)?;
    let mut transport = shared.transport.lock().await;
    transport.send_to(&buf[..len], shared.gateway).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addressing::{GroupAddress, IndividualAddress};
    use crate::cemi::{Apci, ControlField1, ControlField2, Priority, Tpci};
    use crate::net::mock_transport::MockTransport;

    fn connect_response(channel_id: u8) -> Vec<u8> {
        let mut buf = vec![0u8; 20];
        let body = [
            channel_id,
            0x00,
            0x08,
            0x01,
            192,
            168,
            1,
            10,
            0x0E,
            0x57,
            0x04,
            0x04,
            0x02,
            0x00,
        ];
        buf[0] = 0x06;
        buf[1] = 0x10;
        buf[2..4].copy_from_slice(&ServiceType::ConnectResponse.to_u16().to_be_bytes());
        buf[4..6].copy_from_slice(&((6 + body.len()) as u16).to_be_bytes());
        buf[6..6 + body.len()].copy_from_slice(&body);
        buf.truncate(6 + body.len());
        buf
    }

    #[tokio::test]
    async fn connect_succeeds_with_valid_response() {
        let mut mock = MockTransport::new();
        mock.add_response(connect_response(7));
        let gateway = IpEndpoint::new([192, 168, 1, 10].into(), 3671);

        let link = IpLink::connect(mock, gateway).await.unwrap();
        assert_eq!(link.shared.channel_id.load(Ordering::Acquire), 7);
        link.close();
    }

    #[tokio::test]
    async fn send_encodes_group_write_and_bumps_sequence() {
        let mut mock = MockTransport::new();
        mock.add_response(connect_response(1));
        let gateway = IpEndpoint::new([192, 168, 1, 10].into(), 3671);
        let link = IpLink::connect(mock, gateway).await.unwrap();

        let frame = LDataFrame {
            ctrl1: ControlField1::new(true, true, false, Priority::Normal, false, false),
            ctrl2: ControlField2::new(true, 6, 0),
            source: IndividualAddress::new(1, 1, 1).unwrap(),
            destination_raw: GroupAddress::new(1, 2, 3).unwrap().raw(),
            npdu_length: 0,
            tpci: Tpci::UnnumberedData,
            apci: Apci::GroupValueWrite,
            data: &[],
        };

        link.send(&frame).await.unwrap();
        assert_eq!(link.shared.send_sequence.load(Ordering::Acquire), 1);
        link.close();
    }

    #[tokio::test]
    async fn close_is_idempotent_and_notifies_once() {
        let mut mock = MockTransport::new();
        mock.add_response(connect_response(3));
        let gateway = IpEndpoint::new([192, 168, 1, 10].into(), 3671);
        let link = IpLink::connect(mock, gateway).await.unwrap();

        let closures = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counted = Arc::clone(&closures);
        link.add_listener(Box::new(move |event: FrameEvent| {
            if matches!(event, FrameEvent::LinkClosed { .. }) {
                counted.fetch_add(1, Ordering::Relaxed);
            }
        }));

        link.close();
        link.close();
        link.close();

        assert_eq!(closures.load(Ordering::Relaxed), 1);
        assert!(!link.shared.connected.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn medium_settings_round_trip_through_apply() {
        let mut mock = MockTransport::new();
        mock.add_response(connect_response(9));
        let gateway = IpEndpoint::new([192, 168, 1, 10].into(), 3671);
        let link = IpLink::connect(mock, gateway).await.unwrap();

        let settings = MediumSettings {
            device_address: Some(IndividualAddress::new(1, 1, 50).unwrap()),
            max_apdu_length: Some(254),
            domain_address: Some(0x1234),
        };
        link.apply_medium_settings(settings);

        let read_back = link.medium_settings();
        assert_eq!(read_back.device_address, settings.device_address);
        assert_eq!(read_back.max_apdu_length, settings.max_apdu_length);
        assert_eq!(read_back.domain_address, settings.domain_address);

        link.close();
    }
}
