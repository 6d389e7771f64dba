//! Secure Application Layer: `secure()`/`extract()` and the sync.req/sync.res
//! sequence-synchronization protocol.

use crate::addressing::{GroupAddress, IndividualAddress, KnxAddress, SerialNumber};
use crate::cemi::Apci;
use crate::error::{CalimeroError, Result};
use crate::security::ccm;
use crate::security::keys::Security;
use crate::security::scf::{Algorithm, SecureControlField, SecureService};
use crate::security::seq::{self, LastValidSeqTable, SequenceCounter};

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::RngCore;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::debug;

/// Minimum length of a secured APDU (TPCI/APCI(2) + SCF(1) + seq(6) + MAC(4) = 13,
/// plus at least one body byte brings this to 14 per the extract() contract).
const MIN_SECURE_APDU_LEN: usize = 14;

/// Throttle for responding to sync requests: at most once per second.
const SYNC_RESPONSE_THROTTLE: Duration = Duration::from_secs(1);

/// Timeout waiting for a `sync.res` after sending `sync.req`.
pub const SYNC_TIMEOUT: Duration = Duration::from_secs(6);

/// Saturating failure counters, one per error kind, exposed for diagnostics.
#[derive(Debug, Default)]
pub struct FailureCounters {
    invalid_scf: AtomicU16,
    seq_no_error: AtomicU16,
    crypto_error: AtomicU16,
    access_and_role_error: AtomicU16,
}

impl FailureCounters {
    fn bump(counter: &AtomicU16) {
        let mut current = counter.load(Ordering::Relaxed);
        while current < u16::MAX {
            match counter.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Current invalid-SCF count.
    #[must_use]
    pub fn invalid_scf(&self) -> u16 {
        self.invalid_scf.load(Ordering::Relaxed)
    }

    /// Current sequence-replay failure count.
    #[must_use]
    pub fn seq_no_error(&self) -> u16 {
        self.seq_no_error.load(Ordering::Relaxed)
    }

    /// Current MAC/decrypt failure count.
    #[must_use]
    pub fn crypto_error(&self) -> u16 {
        self.crypto_error.load(Ordering::Relaxed)
    }

    /// Current access/role rejection count.
    #[must_use]
    pub fn access_and_role_error(&self) -> u16 {
        self.access_and_role_error.load(Ordering::Relaxed)
    }
}

struct PendingSync {
    challenge: u64,
    responder: oneshot::Sender<(u64, u64)>,
    issued_at: Instant,
}

/// A decision callback consulted after a frame decrypts and authenticates
/// successfully, deciding whether the plain service is actually permitted.
pub trait AccessHook: Send + Sync {
    /// Return `true` if `dst` may receive `service` under `scf`.
    fn check_access(&self, dst: KnxAddress, service: Apci, scf: SecureControlField) -> bool;
}

impl<F> AccessHook for F
where
    F: Fn(KnxAddress, Apci, SecureControlField) -> bool + Send + Sync,
{
    fn check_access(&self, dst: KnxAddress, service: Apci, scf: SecureControlField) -> bool {
        self(dst, service, scf)
    }
}

struct AllowAll;
impl AccessHook for AllowAll {
    fn check_access(&self, _dst: KnxAddress, _service: Apci, _scf: SecureControlField) -> bool {
        true
    }
}

/// The Secure Application Layer: owns sequence counters, the pending-sync
/// table, and failure diagnostics on top of a [`Security`] key store.
pub struct SecureApplicationLayer {
    our_address: IndividualAddress,
    our_serial: SerialNumber,
    security: Arc<Security>,
    seq_plain: SequenceCounter,
    seq_tool: SequenceCounter,
    last_valid: LastValidSeqTable,
    pending_directed: DashMap<IndividualAddress, PendingSync>,
    pending_broadcast: DashMap<SerialNumber, PendingSync>,
    /// Last time a `sync.res` was sent, across all peers. The source device
    /// does not distinguish per-peer throttling from global; we match it.
    last_sync_response: Mutex<Option<Instant>>,
    access_hook: Box<dyn AccessHook>,
    failures: FailureCounters,
}

impl SecureApplicationLayer {
    /// Create a new SAL for `our_address`/`our_serial`, starting both
    /// counters at 1 (a tool-access sequence of 0 is never valid).
    #[must_use]
    pub fn new(our_address: IndividualAddress, our_serial: SerialNumber, security: Arc<Security>) -> Self {
        Self {
            our_address,
            our_serial,
            security,
            seq_plain: SequenceCounter::new(1),
            seq_tool: SequenceCounter::new(1),
            last_valid: LastValidSeqTable::new(),
            pending_directed: DashMap::new(),
            pending_broadcast: DashMap::new(),
            last_sync_response: Mutex::new(None),
            access_hook: Box::new(AllowAll),
            failures: FailureCounters::default(),
        }
    }

    /// Replace the access-control hook consulted by [`Self::extract`].
    pub fn set_access_hook(&mut self, hook: impl AccessHook + 'static) {
        self.access_hook = Box::new(hook);
    }

    /// Read-only access to failure diagnostics.
    #[must_use]
    pub fn failures(&self) -> &FailureCounters {
        &self.failures
    }

    /// Encode `apdu` as a secured service, encrypting with `key` under
    /// `algorithm`. Returns `None` if the caller must first synchronize
    /// (sequence at or below 1) — callers are expected to call
    /// [`Self::sync_with`] first.
    ///
    /// Returns `TPCI/APCI(SecureService) | SCF | seq(6) | body | MAC(4)`.
    pub fn secure(
        &self,
        tool_access: bool,
        algorithm: Algorithm,
        system_broadcast: bool,
        src: IndividualAddress,
        dst: KnxAddress,
        apdu: &[u8],
        extended_frame_format: u8,
    ) -> Result<Vec<u8>> {
        let counter = if tool_access { &self.seq_tool } else { &self.seq_plain };

        let key = self.select_send_key(tool_access, dst)?;
        let seq_value = counter.next();
        if tool_access && seq_value == 0 {
            return Err(CalimeroError::seq_no_error());
        }
        let seq_bytes = seq::encode(seq_value);

        let scf = SecureControlField::new(tool_access, algorithm, system_broadcast, SecureService::Data);
        let body = self.build_secured_body(&key, scf, seq_bytes, src, dst, apdu, extended_frame_format, None);

        let mut out = Vec::with_capacity(2 + body.len());
        let (hi, lo) = Apci::SecureService.to_bytes();
        out.push(hi);
        out.push(lo);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Build the secured body: `SCF | seq(6) | [serial(6) — syncReq only] |
    /// body | MAC(4)`. `serial` is `Some` only for `SyncRequest`, where both
    /// the wire body and the CCM associated data carry the destination's
    /// serial number (a broadcast sync.req has no individual address to
    /// authenticate against otherwise).
    fn build_secured_body(
        &self,
        key: &crate::security::keys::AesKey,
        scf: SecureControlField,
        seq_bytes: [u8; 6],
        src: IndividualAddress,
        dst: KnxAddress,
        apdu: &[u8],
        extended_frame_format: u8,
        serial: Option<SerialNumber>,
    ) -> Vec<u8> {
        let scf_byte = scf.to_byte();
        let at = ccm::address_type_byte(dst.is_group(), extended_frame_format);
        let (tpci_byte, apci_byte) = Apci::SecureService.to_bytes();

        let block0 = ccm::block0(
            seq_bytes,
            src.raw(),
            dst.raw(),
            at,
            tpci_byte,
            apci_byte,
            apdu.len() as u8,
        );

        let mut associated = Vec::with_capacity(7);
        associated.push(scf_byte);
        if let Some(serial) = serial {
            associated.extend_from_slice(&serial.as_bytes());
        }
        let raw_mac = ccm::compute_mac(key, block0, &associated, apdu);

        let mut out = Vec::with_capacity(1 + 6 + 6 + apdu.len() + 4);
        out.push(scf_byte);
        out.extend_from_slice(&seq_bytes);
        if let Some(serial) = serial {
            out.extend_from_slice(&serial.as_bytes());
        }

        match scf.algorithm {
            Algorithm::CcmAuth => {
                out.extend_from_slice(apdu);
                let masked = ccm::mask_mac(key, seq_bytes, src.raw(), dst.raw(), raw_mac);
                out.extend_from_slice(&masked);
            }
            Algorithm::CcmAuthConf => {
                let mut mac_and_payload = Vec::with_capacity(4 + apdu.len());
                mac_and_payload.extend_from_slice(&raw_mac);
                mac_and_payload.extend_from_slice(apdu);
                ccm::ctr_crypt(key, seq_bytes, src.raw(), dst.raw(), 1, &mut mac_and_payload);
                out.extend_from_slice(&mac_and_payload);
            }
        }

        out
    }

    fn select_send_key(
        &self,
        tool_access: bool,
        dst: KnxAddress,
    ) -> Result<Arc<crate::security::keys::AesKey>> {
        if tool_access {
            match dst {
                KnxAddress::Individual(addr) => {
                    self.security.tool_key(addr).ok_or_else(CalimeroError::no_key)
                }
                KnxAddress::Group(g) if g.raw() == 0 => {
                    self.security.broadcast_tool_key(self.our_serial).ok_or_else(CalimeroError::no_key)
                }
                KnxAddress::Group(_) => Err(CalimeroError::access_and_role_error()),
            }
        } else {
            match dst {
                KnxAddress::Group(group) => {
                    self.security.group_key(group).ok_or_else(CalimeroError::no_key)
                }
                KnxAddress::Individual(_) => Err(CalimeroError::no_key()),
            }
        }
    }

    /// Decrypt and validate a secured service. `src`/`dst` come from the
    /// already-parsed cEMI `L_Data` frame; `secure_body` is everything after
    /// the TPCI/APCI bytes (SCF onward).
    pub fn extract(
        &self,
        src: IndividualAddress,
        dst: KnxAddress,
        secure_body: &[u8],
    ) -> Result<Vec<u8>> {
        if secure_body.len() < MIN_SECURE_APDU_LEN - 2 {
            self.bump_crypto_error();
            return Err(CalimeroError::mac_error());
        }

        let scf = match SecureControlField::parse(secure_body[0]) {
            Ok(scf) => scf,
            Err(err) => {
                self.failures.invalid_scf.fetch_add(1, Ordering::Relaxed);
                return Err(err);
            }
        };

        let mut seq_bytes = [0u8; 6];
        seq_bytes.copy_from_slice(&secure_body[1..7]);

        match scf.service {
            SecureService::SyncRequest => {
                if secure_body.len() < 7 + 6 + 4 {
                    self.bump_crypto_error();
                    return Err(CalimeroError::mac_error());
                }
                let mut serial_bytes = [0u8; 6];
                serial_bytes.copy_from_slice(&secure_body[7..13]);
                let serial = SerialNumber::new(serial_bytes);
                let mac_offset = secure_body.len() - 4;
                let body = &secure_body[13..mac_offset];
                let received_mac: [u8; 4] = secure_body[mac_offset..].try_into().unwrap();
                self.handle_sync_request(src, dst, scf, seq_bytes, serial, body, received_mac)
            }
            SecureService::SyncResponse => {
                let mac_offset = secure_body.len() - 4;
                let body = &secure_body[7..mac_offset];
                let received_mac: [u8; 4] = secure_body[mac_offset..].try_into().unwrap();
                self.handle_sync_response(src, dst, scf, seq_bytes, body, received_mac)
            }
            SecureService::Data => {
                let mac_offset = secure_body.len() - 4;
                let body = &secure_body[7..mac_offset];
                let received_mac: [u8; 4] = secure_body[mac_offset..].try_into().unwrap();
                self.handle_data(src, dst, scf, seq_bytes, body, received_mac)
            }
        }
    }

    fn handle_data(
        &self,
        src: IndividualAddress,
        dst: KnxAddress,
        scf: SecureControlField,
        seq_bytes: [u8; 6],
        body: &[u8],
        received_mac: [u8; 4],
    ) -> Result<Vec<u8>> {
        if scf.tool_access {
            if let KnxAddress::Group(g) = dst {
                if g.raw() != 0 {
                    self.bump_access_error();
                    return Err(CalimeroError::access_and_role_error());
                }
            }
        } else if let KnxAddress::Group(group) = dst {
            if !self.security.is_allowed_sender(group, src) {
                self.bump_access_error();
                return Err(CalimeroError::access_and_role_error());
            }
        }

        let key = self.select_receive_key(scf.tool_access, src, dst)?;

        let received_seq = seq::decode(&seq_bytes);
        if !self.last_valid.is_acceptable(src, received_seq) {
            self.failures.seq_no_error.fetch_add(1, Ordering::Relaxed);
            return Err(CalimeroError::seq_no_error());
        }

        let plain = self.decrypt_body(&key, scf, seq_bytes, src, dst, body, received_mac, None)?;
        self.last_valid.record(src, received_seq);

        let service = if plain.len() >= 2 {
            Apci::from_bytes(plain[0], plain[1])
        } else {
            Apci::Unknown(0)
        };
        if !self.access_hook.check_access(dst, service, scf) {
            self.bump_access_error();
            return Err(CalimeroError::access_and_role_error());
        }

        Ok(plain)
    }

    fn decrypt_body(
        &self,
        key: &crate::security::keys::AesKey,
        scf: SecureControlField,
        seq_bytes: [u8; 6],
        src: IndividualAddress,
        dst: KnxAddress,
        body: &[u8],
        received_mac: [u8; 4],
        serial: Option<SerialNumber>,
    ) -> Result<Vec<u8>> {
        let at = ccm::address_type_byte(dst.is_group(), 0);
        let (tpci_byte, apci_byte) = Apci::SecureService.to_bytes();
        let mut associated = Vec::with_capacity(7);
        associated.push(scf.to_byte());
        if let Some(serial) = serial {
            associated.extend_from_slice(&serial.as_bytes());
        }

        match scf.algorithm {
            Algorithm::CcmAuth => {
                let block0 = ccm::block0(seq_bytes, src.raw(), dst.raw(), at, tpci_byte, apci_byte, body.len() as u8);
                let raw_mac = ccm::compute_mac(key, block0, &associated, body);
                let expected = ccm::mask_mac(key, seq_bytes, src.raw(), dst.raw(), raw_mac);
                if expected != received_mac {
                    self.bump_crypto_error();
                    return Err(CalimeroError::mac_error());
                }
                Ok(body.to_vec())
            }
            Algorithm::CcmAuthConf => {
                let mut mac_and_payload = Vec::with_capacity(4 + body.len());
                mac_and_payload.extend_from_slice(&received_mac);
                mac_and_payload.extend_from_slice(body);
                ccm::ctr_crypt(key, seq_bytes, src.raw(), dst.raw(), 1, &mut mac_and_payload);
                let raw_mac: [u8; 4] = mac_and_payload[..4].try_into().unwrap();
                let plain = mac_and_payload[4..].to_vec();

                let block0 = ccm::block0(seq_bytes, src.raw(), dst.raw(), at, tpci_byte, apci_byte, plain.len() as u8);
                let expected = ccm::compute_mac(key, block0, &associated, &plain);
                if expected != raw_mac {
                    self.bump_crypto_error();
                    return Err(CalimeroError::mac_error());
                }
                Ok(plain)
            }
        }
    }

    fn select_receive_key(
        &self,
        tool_access: bool,
        src: IndividualAddress,
        dst: KnxAddress,
    ) -> Result<Arc<crate::security::keys::AesKey>> {
        if tool_access {
            let individual_dst = match dst {
                KnxAddress::Individual(addr) => Some(addr),
                KnxAddress::Group(g) if g.raw() == 0 => {
                    return self.security.broadcast_tool_key(self.our_serial).ok_or_else(CalimeroError::no_key);
                }
                KnxAddress::Group(_) => None,
            };
            let peer = match (src == self.our_address, individual_dst) {
                (true, Some(addr)) => addr,
                (true, None) => return Err(CalimeroError::no_key()),
                (false, _) => src,
            };
            self.security.tool_key(peer).ok_or_else(CalimeroError::no_key)
        } else {
            match dst {
                KnxAddress::Group(group) => {
                    self.security.group_key(group).ok_or_else(CalimeroError::no_key)
                }
                KnxAddress::Individual(_) => Err(CalimeroError::no_key()),
            }
        }
    }

    fn handle_sync_request(
        &self,
        src: IndividualAddress,
        dst: KnxAddress,
        scf: SecureControlField,
        seq_bytes: [u8; 6],
        serial: SerialNumber,
        body: &[u8],
        received_mac: [u8; 4],
    ) -> Result<Vec<u8>> {
        let directed_to_us = matches!(dst, KnxAddress::Individual(addr) if addr == self.our_address);
        let broadcast_to_us = scf.system_broadcast && serial == self.our_serial;
        if !directed_to_us && !broadcast_to_us {
            self.bump_crypto_error();
            return Err(CalimeroError::mac_error());
        }

        {
            let last = self.last_sync_response.lock();
            if let Some(last) = *last {
                if last.elapsed() < SYNC_RESPONSE_THROTTLE {
                    debug!(%src, "dropping sync.req: throttled");
                    return Err(CalimeroError::sync_throttled());
                }
            }
        }

        let key = if scf.system_broadcast {
            self.security.broadcast_tool_key(serial).ok_or_else(CalimeroError::no_key)?
        } else {
            self.select_receive_key(true, src, dst)?
        };
        let plain = self.decrypt_body(&key, scf, seq_bytes, src, dst, body, received_mac, Some(serial))?;

        if plain.len() < 6 {
            return Err(CalimeroError::mac_error());
        }
        let mut remote_next = [0u8; 6];
        remote_next.copy_from_slice(&plain[..6]);
        let remote_next = seq::decode(&remote_next);

        self.seq_tool.advance_to_at_least(remote_next);
        *self.last_sync_response.lock() = Some(Instant::now());

        Ok(plain)
    }

    fn handle_sync_response(
        &self,
        src: IndividualAddress,
        dst: KnxAddress,
        scf: SecureControlField,
        seq_bytes: [u8; 6],
        body: &[u8],
        received_mac: [u8; 4],
    ) -> Result<Vec<u8>> {
        if let Some((_, pending)) = self.pending_directed.remove(&src) {
            let key = self.select_receive_key(true, src, dst)?;
            return self.complete_sync_response(&key, src, dst, scf, seq_bytes, body, received_mac, pending);
        }

        let candidates: Vec<SerialNumber> = self.pending_broadcast.iter().map(|entry| *entry.key()).collect();
        for serial in candidates {
            let key = match self.security.broadcast_tool_key(serial) {
                Some(key) => key,
                None => continue,
            };
            let challenge = match self.pending_broadcast.get(&serial) {
                Some(entry) => entry.challenge,
                None => continue,
            };
            let challenge_bytes = seq::encode(challenge);
            let mut recovered_rand = seq_bytes;
            for (b, c) in recovered_rand.iter_mut().zip(challenge_bytes.iter()) {
                *b ^= c;
            }
            let matches = self
                .decrypt_body(&key, scf, recovered_rand, src, dst, body, received_mac, None)
                .is_ok();
            if !matches {
                continue;
            }
            if let Some((_, pending)) = self.pending_broadcast.remove(&serial) {
                return self.complete_sync_response(&key, src, dst, scf, seq_bytes, body, received_mac, pending);
            }
        }

        Err(CalimeroError::sync_timeout())
    }

    fn complete_sync_response(
        &self,
        key: &crate::security::keys::AesKey,
        src: IndividualAddress,
        dst: KnxAddress,
        scf: SecureControlField,
        seq_bytes: [u8; 6],
        body: &[u8],
        received_mac: [u8; 4],
        pending: PendingSync,
    ) -> Result<Vec<u8>> {
        let challenge_bytes = seq::encode(pending.challenge);
        let mut recovered_rand = seq_bytes;
        for (b, c) in recovered_rand.iter_mut().zip(challenge_bytes.iter()) {
            *b ^= c;
        }

        let plain = self.decrypt_body(key, scf, recovered_rand, src, dst, body, received_mac, None)?;

        if plain.len() < 12 {
            return Err(CalimeroError::mac_error());
        }
        let mut our_next = [0u8; 6];
        our_next.copy_from_slice(&plain[0..6]);
        let mut their_next = [0u8; 6];
        their_next.copy_from_slice(&plain[6..12]);

        let our_next = seq::decode(&our_next);
        let their_next = seq::decode(&their_next);
        self.seq_tool.advance_to_at_least(our_next.max(their_next));

        let _ = pending.responder.send((our_next, their_next));
        Ok(plain)
    }

    /// Send `sync.req` to `peer` (whose serial number is `peer_serial`, used
    /// only in the associated data/wire body) and suspend up to
    /// [`SYNC_TIMEOUT`] for the matching `sync.res`. Returns the encoded
    /// `sync.req` APDU to be sent by the caller's transport path, and a
    /// future resolving once the response arrives via [`Self::extract`].
    pub fn begin_sync_with(
        &self,
        peer: IndividualAddress,
        peer_serial: SerialNumber,
    ) -> Result<(Vec<u8>, oneshot::Receiver<(u64, u64)>)> {
        let key = self.security.tool_key(peer).ok_or_else(CalimeroError::no_key)?;

        let mut rng = rand::thread_rng();
        let mut challenge_raw = [0u8; 8];
        rng.fill_bytes(&mut challenge_raw);
        let challenge = u64::from_be_bytes(challenge_raw) & seq::MAX_SEQUENCE;
        let challenge_bytes = seq::encode(challenge);

        let scf = SecureControlField::new(true, Algorithm::CcmAuthConf, false, SecureService::SyncRequest);
        let our_next = self.seq_tool.current();
        let payload = seq::encode(our_next);

        let body = self.build_secured_body(
            &key,
            scf,
            challenge_bytes,
            self.our_address,
            KnxAddress::Individual(peer),
            &payload,
            0,
            Some(peer_serial),
        );

        let mut apdu = Vec::with_capacity(2 + body.len());
        let (hi, lo) = Apci::SecureService.to_bytes();
        apdu.push(hi);
        apdu.push(lo);
        apdu.extend_from_slice(&body);

        let (tx, rx) = oneshot::channel();
        self.pending_directed.insert(
            peer,
            PendingSync {
                challenge,
                responder: tx,
                issued_at: Instant::now(),
            },
        );

        Ok((apdu, rx))
    }

    /// Send a broadcast `sync.req` (system broadcast, tool access) keyed by
    /// `serial`, the target device's serial number. Used to establish or
    /// re-synchronize a transient broadcast tool key rather than a
    /// peer-specific one.
    pub fn begin_broadcast_sync_with(
        &self,
        serial: SerialNumber,
    ) -> Result<(Vec<u8>, oneshot::Receiver<(u64, u64)>)> {
        let key = self.security.broadcast_tool_key(serial).ok_or_else(CalimeroError::no_key)?;

        let mut rng = rand::thread_rng();
        let mut challenge_raw = [0u8; 8];
        rng.fill_bytes(&mut challenge_raw);
        let challenge = u64::from_be_bytes(challenge_raw) & seq::MAX_SEQUENCE;
        let challenge_bytes = seq::encode(challenge);

        let scf = SecureControlField::new(true, Algorithm::CcmAuthConf, true, SecureService::SyncRequest);
        let our_next = self.seq_tool.current();
        let payload = seq::encode(our_next);

        let body = self.build_secured_body(
            &key,
            scf,
            challenge_bytes,
            self.our_address,
            KnxAddress::BROADCAST,
            &payload,
            0,
            Some(serial),
        );

        let mut apdu = Vec::with_capacity(2 + body.len());
        let (hi, lo) = Apci::SecureService.to_bytes();
        apdu.push(hi);
        apdu.push(lo);
        apdu.extend_from_slice(&body);

        let (tx, rx) = oneshot::channel();
        self.pending_broadcast.insert(
            serial,
            PendingSync {
                challenge,
                responder: tx,
                issued_at: Instant::now(),
            },
        );

        Ok((apdu, rx))
    }

    fn bump_crypto_error(&self) {
        FailureCounters::bump(&self.failures.crypto_error);
    }

    fn bump_access_error(&self) {
        FailureCounters::bump(&self.failures.access_and_role_error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::keys::AesKey;

    fn pair() -> (SecureApplicationLayer, SecureApplicationLayer, GroupAddress) {
        let group = GroupAddress::new(1, 2, 3).unwrap();
        let sender = IndividualAddress::new(1, 1, 1).unwrap();
        let receiver = IndividualAddress::new(1, 1, 2).unwrap();

        let sec_a = Arc::new(Security::new());
        sec_a.set_group_key(group, AesKey::new([0x11; 16]));
        let sal_a = SecureApplicationLayer::new(sender, SerialNumber::new([0; 6]), sec_a);

        let sec_b = Arc::new(Security::new());
        sec_b.set_group_key(group, AesKey::new([0x11; 16]));
        let sal_b = SecureApplicationLayer::new(receiver, SerialNumber::new([0; 6]), sec_b);

        (sal_a, sal_b, group)
    }

    #[test]
    fn group_round_trip_auth_conf() {
        let (sal_a, sal_b, group) = pair();
        let src = IndividualAddress::new(1, 1, 1).unwrap();
        let dst = KnxAddress::Group(group);
        let apdu = [0x80, 0x2A];

        let secured = sal_a
            .secure(false, Algorithm::CcmAuthConf, false, src, dst, &apdu, 0)
            .unwrap();

        let plain = sal_b.extract(src, dst, &secured[2..]).unwrap();
        assert_eq!(plain, apdu);
    }

    #[test]
    fn replay_is_rejected() {
        let (sal_a, sal_b, group) = pair();
        let src = IndividualAddress::new(1, 1, 1).unwrap();
        let dst = KnxAddress::Group(group);
        let apdu = [0x80, 0x2A];

        let secured = sal_a
            .secure(false, Algorithm::CcmAuthConf, false, src, dst, &apdu, 0)
            .unwrap();

        sal_b.extract(src, dst, &secured[2..]).unwrap();
        let replayed = sal_b.extract(src, dst, &secured[2..]);
        assert!(replayed.is_err());
    }

    #[test]
    fn tampered_ciphertext_fails_mac() {
        let (sal_a, sal_b, group) = pair();
        let src = IndividualAddress::new(1, 1, 1).unwrap();
        let dst = KnxAddress::Group(group);
        let apdu = [0x80, 0x2A];

        let mut secured = sal_a
            .secure(false, Algorithm::CcmAuthConf, false, src, dst, &apdu, 0)
            .unwrap();

        let last = secured.len() - 1;
        secured[last] ^= 0xFF;

        assert!(sal_b.extract(src, dst, &secured[2..]).is_err());
    }

    #[test]
    fn unknown_group_key_fails_with_no_key() {
        let (sal_a, _sal_b, _group) = pair();
        let unknown_group = GroupAddress::new(4, 4, 4).unwrap();
        let src = IndividualAddress::new(1, 1, 1).unwrap();

        let result = sal_a.secure(
            false,
            Algorithm::CcmAuthConf,
            false,
            src,
            KnxAddress::Group(unknown_group),
            &[0x80],
            0,
        );
        assert!(result.is_err());
    }

    #[test]
    fn tool_access_non_broadcast_group_is_rejected() {
        let (sal_a, _sal_b, _group) = pair();
        let src = IndividualAddress::new(1, 1, 1).unwrap();
        let group = GroupAddress::new(4, 4, 4).unwrap();

        let result = sal_a.secure(true, Algorithm::CcmAuthConf, false, src, KnxAddress::Group(group), &[0x80], 0);
        assert!(result.is_err());
    }

    #[test]
    fn tool_access_system_broadcast_data_round_trips() {
        let sender = IndividualAddress::new(1, 1, 1).unwrap();
        let receiver = IndividualAddress::new(1, 1, 2).unwrap();
        let serial_a = SerialNumber::new([1, 2, 3, 4, 5, 6]);
        let serial_b = SerialNumber::new([6, 5, 4, 3, 2, 1]);

        let sec_a = Arc::new(Security::new());
        sec_a.set_broadcast_tool_key(serial_a, AesKey::new([0x22; 16]));
        let sal_a = SecureApplicationLayer::new(sender, serial_a, sec_a);

        let sec_b = Arc::new(Security::new());
        sec_b.set_broadcast_tool_key(serial_b, AesKey::new([0x22; 16]));
        let sal_b = SecureApplicationLayer::new(receiver, serial_b, sec_b);

        let apdu = [0x80, 0x2A];
        let secured = sal_a
            .secure(true, Algorithm::CcmAuthConf, true, sender, KnxAddress::BROADCAST, &apdu, 0)
            .unwrap();

        let plain = sal_b.extract(sender, KnxAddress::BROADCAST, &secured[2..]).unwrap();
        assert_eq!(plain, apdu);
    }

    #[test]
    fn broadcast_sync_round_trips_via_serial() {
        let tool = IndividualAddress::new(1, 1, 1).unwrap();
        let device = IndividualAddress::new(1, 1, 2).unwrap();
        let device_serial = SerialNumber::new([9, 9, 9, 9, 9, 9]);

        let sec_tool = Arc::new(Security::new());
        sec_tool.set_broadcast_tool_key(device_serial, AesKey::new([0x55; 16]));
        let sal_tool = SecureApplicationLayer::new(tool, SerialNumber::new([0; 6]), sec_tool);

        let sec_device = Arc::new(Security::new());
        sec_device.set_broadcast_tool_key(device_serial, AesKey::new([0x55; 16]));
        let sal_device = SecureApplicationLayer::new(device, device_serial, sec_device);

        let (req, _rx) = sal_tool.begin_broadcast_sync_with(device_serial).unwrap();
        let plain = sal_device.extract(tool, KnxAddress::BROADCAST, &req[2..]).unwrap();
        assert_eq!(plain.len(), 6);
    }

    #[test]
    fn sync_response_throttle_is_global_across_peers() {
        let device_a = IndividualAddress::new(1, 1, 1).unwrap();
        let device_b = IndividualAddress::new(1, 1, 2).unwrap();
        let device_c = IndividualAddress::new(1, 1, 3).unwrap();
        let no_serial = SerialNumber::new([0; 6]);

        let sec_a = Arc::new(Security::new());
        sec_a.set_tool_key(device_b, AesKey::new([0x33; 16]));
        let sal_a = SecureApplicationLayer::new(device_a, no_serial, sec_a);

        let sec_c = Arc::new(Security::new());
        sec_c.set_tool_key(device_b, AesKey::new([0x44; 16]));
        let sal_c = SecureApplicationLayer::new(device_c, no_serial, sec_c);

        let sec_b = Arc::new(Security::new());
        sec_b.set_tool_key(device_a, AesKey::new([0x33; 16]));
        sec_b.set_tool_key(device_c, AesKey::new([0x44; 16]));
        let sal_b = SecureApplicationLayer::new(device_b, no_serial, sec_b);

        let (req_a, _rx_a) = sal_a.begin_sync_with(device_b, no_serial).unwrap();
        sal_b
            .extract(device_a, KnxAddress::Individual(device_b), &req_a[2..])
            .unwrap();

        let (req_c, _rx_c) = sal_c.begin_sync_with(device_b, no_serial).unwrap();
        let result = sal_b.extract(device_c, KnxAddress::Individual(device_b), &req_c[2..]);
        match result {
            Err(CalimeroError::Secure(e)) => assert!(e.is_sync_throttled()),
            other => panic!("expected throttled sync.req, got {other:?}"),
        }
    }
}
