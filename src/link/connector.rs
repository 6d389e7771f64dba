//! Reconnection wrapper around any [`NetworkLink`].
//!
//! [`Connector`] holds no medium knowledge of its own: it owns a factory that
//! produces a fresh link on demand, and replays registered listeners onto
//! each new instance so the wrapping is transparent to callers.

use crate::cemi::LDataFrame;
use crate::error::{CalimeroError, Result};

use super::{CloseInitiator, FrameEvent, Listener, NetworkLink};

use dashmap::DashMap;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
type LinkFactory<L> = Box<dyn Fn() -> BoxFuture<Result<L>> + Send + Sync>;

/// How many times (and how fast) a [`Connector`] retries after its link closes.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// `None` means unbounded retries.
    pub max_attempts: Option<u32>,
    /// Delay between retries.
    pub reconnect_delay: Duration,
    /// Reconnect after the very first connection attempt fails.
    pub reconnect_on_initial_error: bool,
    /// Reconnect after the gateway closes the connection.
    pub reconnect_on_server_disconnect: bool,
    /// Reconnect after an internal error closes the link.
    pub reconnect_on_internal_disconnect: bool,
    /// A `send`/`send_request_wait` on a closed link triggers immediate
    /// reconnection instead of failing outright.
    pub connect_on_send: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Some(3),
            reconnect_delay: Duration::from_millis(500),
            reconnect_on_initial_error: true,
            reconnect_on_server_disconnect: true,
            reconnect_on_internal_disconnect: true,
            connect_on_send: true,
        }
    }
}

struct ArcListener(Arc<dyn Listener>);

impl Listener for ArcListener {
    fn on_event(&self, event: FrameEvent) {
        self.0.on_event(event);
    }
}

struct Shared<L> {
    factory: LinkFactory<L>,
    policy: ReconnectPolicy,
    current: Mutex<Option<Arc<L>>>,
    underlying_ids: Mutex<HashMap<u64, u64>>,
    attempts_remaining: AtomicI64,
    connecting: AtomicBool,
    listeners: DashMap<u64, Arc<dyn Listener>>,
    next_listener_id: AtomicU64,
    status_notifier: std::sync::Mutex<Option<Box<dyn Fn(bool) + Send + Sync>>>,
}

impl<L: NetworkLink + Send + Sync + 'static> Shared<L> {
    fn notify_status(&self, connected: bool) {
        if let Some(notifier) = self.status_notifier.lock().unwrap().as_ref() {
            notifier(connected);
        }
    }

    fn notify_frame_event(&self, event: FrameEvent) {
        for entry in &self.listeners {
            entry.value().on_event(event.clone());
        }
    }

    async fn register_on(self: &Arc<Self>, link: &Arc<L>) {
        let mut mapping = HashMap::new();
        for entry in &self.listeners {
            let adapted: Box<dyn Listener> = Box::new(ArcListener(Arc::clone(entry.value())));
            mapping.insert(*entry.key(), link.add_listener(adapted));
        }
        *self.underlying_ids.lock().await = mapping;

        let trigger_shared = Arc::clone(self);
        link.add_listener(Box::new(move |event: FrameEvent| {
            if let FrameEvent::LinkClosed { initiator, .. } = event {
                let should_reconnect = match initiator {
                    CloseInitiator::User => false,
                    CloseInitiator::Server => trigger_shared.policy.reconnect_on_server_disconnect,
                    CloseInitiator::Client | CloseInitiator::Internal => {
                        trigger_shared.policy.reconnect_on_internal_disconnect
                    }
                };
                if should_reconnect {
                    let shared = Arc::clone(&trigger_shared);
                    tokio::spawn(async move {
                        reconnect_loop(shared).await;
                    });
                }
            }
        }));
    }
}

/// Wraps a [`NetworkLink`] factory with automatic reconnection.
///
/// `L` is the concrete link type produced by the factory (typically
/// [`super::ip::IpLink`]); `Connector<L>` itself implements [`NetworkLink`],
/// so callers cannot tell it apart from the link it wraps.
pub struct Connector<L: NetworkLink + Send + Sync + 'static> {
    shared: Arc<Shared<L>>,
}

impl<L: NetworkLink + Send + Sync + 'static> Connector<L> {
    /// Create a connector around `factory` and perform the initial connect.
    ///
    /// # Errors
    ///
    /// Returns an error if the first connection attempt fails and
    /// `policy.reconnect_on_initial_error` is `false`. Otherwise a failed
    /// first attempt schedules background reconnection and returns `Ok`.
    pub async fn connect<F, Fut>(factory: F, policy: ReconnectPolicy) -> Result<Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<L>> + Send + 'static,
    {
        let boxed_factory: LinkFactory<L> = Box::new(move || Box::pin(factory()));
        let attempts_remaining = policy
            .max_attempts
            .map_or(-1, |n| i64::from(n));

        let shared = Arc::new(Shared {
            factory: boxed_factory,
            policy,
            current: Mutex::new(None),
            underlying_ids: Mutex::new(HashMap::new()),
            attempts_remaining: AtomicI64::new(attempts_remaining),
            connecting: AtomicBool::new(false),
            listeners: DashMap::new(),
            next_listener_id: AtomicU64::new(1),
            status_notifier: std::sync::Mutex::new(None),
        });

        match (shared.factory)().await {
            Ok(link) => {
                let link = Arc::new(link);
                shared.register_on(&link).await;
                *shared.current.lock().await = Some(link);
                shared.notify_status(true);
            }
            Err(err) => {
                if shared.policy.reconnect_on_initial_error {
                    debug!(?err, "initial connect failed, scheduling retry");
                    tokio::spawn(reconnect_loop(Arc::clone(&shared)));
                } else {
                    return Err(err);
                }
            }
        }

        Ok(Self { shared })
    }

    /// Install a callback invoked with `true`/`false` on every connect/disconnect.
    #[must_use]
    pub fn with_status_notifier(self, notifier: impl Fn(bool) + Send + Sync + 'static) -> Self {
        *self.shared.status_notifier.lock().unwrap() = Some(Box::new(notifier));
        self
    }

    async fn current_link(&self) -> Result<Arc<L>> {
        if let Some(link) = self.shared.current.lock().await.clone() {
            return Ok(link);
        }
        if self.shared.policy.connect_on_send {
            reconnect_loop(Arc::clone(&self.shared)).await;
            if let Some(link) = self.shared.current.lock().await.clone() {
                return Ok(link);
            }
        }
        Err(CalimeroError::link_closed())
    }
}

async fn reconnect_loop<L: NetworkLink + Send + Sync + 'static>(shared: Arc<Shared<L>>) {
    if shared
        .connecting
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }

    let carried_settings = shared
        .current
        .lock()
        .await
        .as_ref()
        .map(|link| link.medium_settings());

    shared.notify_status(false);

    loop {
        let remaining = shared.attempts_remaining.load(Ordering::Acquire);
        if remaining == 0 {
            warn!("connector: max reconnect attempts reached");
            shared.notify_frame_event(FrameEvent::LinkClosed {
                initiator: CloseInitiator::Internal,
                reason: "max attempts reached".to_string(),
            });
            shared.connecting.store(false, Ordering::Release);
            return;
        }

        tokio::time::sleep(shared.policy.reconnect_delay).await;

        match (shared.factory)().await {
            Ok(link) => {
                let link = Arc::new(link);
                if let Some(settings) = carried_settings {
                    link.apply_medium_settings(settings);
                }
                shared.register_on(&link).await;
                *shared.current.lock().await = Some(link);
                if let Some(max) = shared.policy.max_attempts {
                    shared
                        .attempts_remaining
                        .store(i64::from(max), Ordering::Release);
                }
                shared.notify_status(true);
                shared.connecting.store(false, Ordering::Release);
                return;
            }
            Err(err) => {
                debug!(?err, "reconnect attempt failed");
                if remaining > 0 {
                    shared.attempts_remaining.fetch_sub(1, Ordering::AcqRel);
                }
            }
        }
    }
}

impl<L: NetworkLink + Send + Sync + 'static> NetworkLink for Connector<L> {
    async fn send(&self, frame: &LDataFrame<'_>) -> Result<()> {
        let link = self.current_link().await?;
        link.send(frame).await
    }

    async fn send_request_wait(&self, frame: &LDataFrame<'_>) -> Result<()> {
        let link = self.current_link().await?;
        link.send_request_wait(frame).await
    }

    fn add_listener(&self, listener: Box<dyn Listener>) -> u64 {
        let id = self.shared.next_listener_id.fetch_add(1, Ordering::AcqRel);
        let shared_listener: Arc<dyn Listener> = Arc::from(listener);
        self.shared.listeners.insert(id, shared_listener);
        id
    }

    fn remove_listener(&self, id: u64) {
        self.shared.listeners.remove(&id);
    }

    fn close(&self) {
        self.shared.connecting.store(true, Ordering::Release);
        if let Ok(mut current) = self.shared.current.try_lock() {
            if let Some(link) = current.take() {
                link.close();
            }
        }
    }
}
