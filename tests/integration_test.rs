//! Integration tests exercising the public surface: addressing, the secure
//! application layer end to end, and the transport layer's group services
//! over a mock link.

use calimero::addressing::{GroupAddress, IndividualAddress, KnxAddress, SerialNumber};
use calimero::cemi::{Apci, ControlField1, ControlField2, LDataFrame, Priority, Tpci};
use calimero::error::Result;
use calimero::ga;
use calimero::link::{FrameEvent, Listener, NetworkLink};
use calimero::security::{AesKey, Algorithm, SecureApplicationLayer, Security};
use calimero::transport::TransportLayer;

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[test]
fn group_address_creation() {
    let addr = GroupAddress::new(1, 2, 3).expect("valid group address");
    assert_eq!(addr.raw(), 0x0A03);
    assert_eq!(addr.to_string(), "1/2/3");

    let addr = GroupAddress::from(0x0A03u16);
    assert_eq!(addr.main(), 1);
    assert_eq!(addr.middle(), 2);
    assert_eq!(addr.sub(), 3);
}

#[test]
fn individual_address_creation() {
    let addr = IndividualAddress::new(1, 1, 250).expect("valid individual address");
    assert_eq!(addr.raw(), 0x11FA);
    assert_eq!(addr.to_string(), "1.1.250");

    let addr = IndividualAddress::from(0x11FAu16);
    assert_eq!(addr.area(), 1);
    assert_eq!(addr.line(), 1);
    assert_eq!(addr.device(), 250);
}

#[test]
fn ga_macro_matches_runtime_constructor() {
    assert_eq!(ga!(1 / 2 / 3), GroupAddress::new(1, 2, 3).unwrap());
}

#[test]
fn secure_application_layer_round_trip_across_two_devices() {
    let group = GroupAddress::new(1, 2, 3).unwrap();

    let security_a = Arc::new(Security::new());
    security_a.set_group_key(group, AesKey::new([0x2B; 16]));
    let security_b = Arc::new(Security::new());
    security_b.set_group_key(group, AesKey::new([0x2B; 16]));

    let device_a = IndividualAddress::new(1, 1, 1).unwrap();
    let device_b = IndividualAddress::new(1, 1, 2).unwrap();

    let sal_a = SecureApplicationLayer::new(device_a, SerialNumber::new([0; 6]), security_a);
    let sal_b = SecureApplicationLayer::new(device_b, SerialNumber::new([0; 6]), security_b);

    let apdu = [0x00, 0x80]; // GroupValueWrite, value = 1
    let secured = sal_a
        .secure(
            false,
            Algorithm::CcmAuthConf,
            false,
            device_a,
            KnxAddress::Group(group),
            &apdu,
            0,
        )
        .expect("secure() succeeds with a provisioned group key");

    let plain = sal_b
        .extract(device_a, KnxAddress::Group(group), &secured[2..])
        .expect("extract() succeeds for a fresh, correctly keyed frame");

    assert_eq!(plain, apdu);
}

#[test]
fn secure_application_layer_rejects_replay() {
    let group = GroupAddress::new(1, 2, 3).unwrap();
    let security_a = Arc::new(Security::new());
    security_a.set_group_key(group, AesKey::new([0x2B; 16]));
    let security_b = Arc::new(Security::new());
    security_b.set_group_key(group, AesKey::new([0x2B; 16]));

    let device_a = IndividualAddress::new(1, 1, 1).unwrap();
    let device_b = IndividualAddress::new(1, 1, 2).unwrap();
    let sal_a = SecureApplicationLayer::new(device_a, SerialNumber::new([0; 6]), security_a);
    let sal_b = SecureApplicationLayer::new(device_b, SerialNumber::new([0; 6]), security_b);

    let secured = sal_a
        .secure(false, Algorithm::CcmAuthConf, false, device_a, KnxAddress::Group(group), &[0x80], 0)
        .unwrap();

    sal_b.extract(device_a, KnxAddress::Group(group), &secured[2..]).unwrap();
    let replayed = sal_b.extract(device_a, KnxAddress::Group(group), &secured[2..]);
    assert!(replayed.is_err());
}

struct MockLink {
    sent: Mutex<Vec<Vec<u8>>>,
    listeners: DashMap<u64, Box<dyn Listener>>,
    next_id: AtomicU64,
}

impl MockLink {
    fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            listeners: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    fn deliver(&self, raw: Vec<u8>) {
        for entry in &self.listeners {
            entry.value().on_event(FrameEvent::Indication(raw.clone()));
        }
    }
}

impl NetworkLink for MockLink {
    async fn send(&self, frame: &LDataFrame<'_>) -> Result<()> {
        let mut buf = [0u8; 64];
        let len = frame.build(&mut buf)?;
        self.sent.lock().push(buf[..len].to_vec());
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
async fn transport_layer_sends_group_write_as_unnumbered_frame() {
    let link = Arc::new(MockLink::new());
    let our = IndividualAddress::new(1, 1, 200).unwrap();
    let tl = TransportLayer::new(Arc::clone(&link), our);

    let group = GroupAddress::new(1, 2, 3).unwrap();
    tl.send_group(group, Apci::GroupValueWrite, &[0x80]).await.unwrap();

    let sent = link.sent.lock();
    assert_eq!(sent.len(), 1);
    // Destination address bytes sit right after the two control-field bytes
    // and the two-byte source address.
    let frame = &sent[0];
    let dest = u16::from_be_bytes([frame[4], frame[5]]);
    assert_eq!(dest, group.raw());
}

#[tokio::test]
async fn transport_layer_forwards_incoming_group_indication_to_listeners() {
    let link = Arc::new(MockLink::new());
    let our = IndividualAddress::new(1, 1, 200).unwrap();
    let tl = TransportLayer::new(Arc::clone(&link), our);

    let received = Arc::new(Mutex::new(Vec::new()));
    let collected = Arc::clone(&received);
    tl.add_listener(Box::new(move |event: FrameEvent| {
        if let FrameEvent::Indication(raw) = event {
            collected.lock().push(raw);
        }
    }));

    // A remote sensor reports a group write to 1/2/3.
    let remote = IndividualAddress::new(1, 1, 5).unwrap();
    let group = GroupAddress::new(1, 2, 3).unwrap();
    let frame = LDataFrame {
        ctrl1: ControlField1::new(true, true, false, Priority::Low, false, false),
        ctrl2: ControlField2::new(true, ControlField2::DEFAULT_HOP_COUNT, 0),
        source: remote,
        destination_raw: group.raw(),
        npdu_length: 0,
        tpci: Tpci::UnnumberedData,
        apci: Apci::GroupValueWrite,
        data: &[0x81],
    };
    let mut buf = [0u8; 64];
    let len = frame.build(&mut buf).unwrap();
    link.deliver(buf[..len].to_vec());

    assert_eq!(received.lock().len(), 1);
}
