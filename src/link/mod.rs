//! Network Link: the abstraction sitting between the Transport Layer and a
//! concrete medium (KNXnet/IP tunneling today; TP-UART/USB are external
//! collaborators, out of scope here).
//!
//! A [`NetworkLink`] sends `L_Data` frames and dispatches incoming frames
//! (and link status changes) to registered [`Listener`]s. [`ip::IpLink`] is
//! the concrete KNXnet/IP tunneling implementation; [`connector::Connector`]
//! wraps any link with reconnect-on-failure behavior.

pub mod connector;
pub mod ip;

use crate::cemi::LDataFrame;
use crate::error::Result;

/// Who or what triggered a link closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseInitiator {
    /// The owning application called `close()`/`disconnect()` directly.
    User,
    /// The remote gateway closed or reset the tunnel.
    Server,
    /// This side's transport raised a send/receive error.
    Client,
    /// An internal component (heartbeat, reconnect exhaustion) closed the link.
    Internal,
}

/// An event delivered to a [`Listener`].
#[derive(Debug, Clone)]
pub enum FrameEvent {
    /// A frame was received from the medium (`L_Data.ind`).
    Indication(Vec<u8>),
    /// A previously sent frame was confirmed by the medium (`L_Data.con`).
    Confirmation {
        /// The raw `L_Data` frame that was confirmed.
        frame: Vec<u8>,
        /// Whether the medium reported success.
        success: bool,
    },
    /// The link closed permanently. Emitted exactly once per link instance.
    LinkClosed {
        /// Who or what triggered the closure.
        initiator: CloseInitiator,
        /// Human-readable closure reason, e.g. `"heartbeat timeout"`.
        reason: String,
    },
}

/// Medium settings carried over from one link instance to its replacement on
/// a successful reconnect: device address, max APDU length, and PL/RF domain
/// address.
#[derive(Debug, Clone, Copy, Default)]
pub struct MediumSettings {
    /// The device's own individual address, if the medium assigns one.
    pub device_address: Option<crate::addressing::IndividualAddress>,
    /// Maximum APDU length negotiated with the medium.
    pub max_apdu_length: Option<u16>,
    /// PL/RF domain address, if the medium uses one.
    pub domain_address: Option<u16>,
}

/// Receives [`FrameEvent`]s from a [`NetworkLink`].
///
/// Implemented for any `Fn(FrameEvent) + Send + Sync`, so callers can
/// register closures directly.
pub trait Listener: Send + Sync {
    /// Handle a single event.
    fn on_event(&self, event: FrameEvent);
}

impl<F> Listener for F
where
    F: Fn(FrameEvent) + Send + Sync,
{
    fn on_event(&self, event: FrameEvent) {
        self(event)
    }
}

/// Abstraction over a KNX network link.
///
/// Implementations own a single physical or logical connection to a medium
/// and multiplex frames to/from it. All methods are async because a real
/// link always does I/O; [`Self::close`] is the only exception.
#[allow(async_fn_in_trait)]
pub trait NetworkLink {
    /// Send a frame and return immediately without waiting for confirmation.
    ///
    /// # Errors
    ///
    /// Returns an error if the link is closed or the frame is malformed.
    async fn send(&self, frame: &LDataFrame<'_>) -> Result<()>;

    /// Send a frame and wait for the medium's `L_Data.con` before returning.
    ///
    /// # Errors
    ///
    /// Returns an error if sending fails or a confirmation never arrives.
    async fn send_request_wait(&self, frame: &LDataFrame<'_>) -> Result<()>;

    /// Register a listener for incoming frames and status changes. Returns
    /// an opaque id usable with [`Self::remove_listener`].
    fn add_listener(&self, listener: Box<dyn Listener>) -> u64;

    /// Remove a previously registered listener.
    fn remove_listener(&self, id: u64);

    /// Close the link and release its resources.
    fn close(&self);

    /// Current medium settings, for carrying over to a replacement link on
    /// reconnect. Links with nothing to carry (e.g. test stubs) keep the
    /// default no-op implementation.
    fn medium_settings(&self) -> MediumSettings {
        MediumSettings::default()
    }

    /// Apply medium settings replayed from a previous link instance.
    fn apply_medium_settings(&self, _settings: MediumSettings) {}
}
