//! Device configuration: addressing, medium selection, reconnection policy,
//! and the timing constants used by the Transport Layer and Secure
//! Application Layer.

use crate::addressing::IndividualAddress;
use crate::link::connector::ReconnectPolicy;
use crate::net::IpEndpoint;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level device configuration, loaded once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// This device's own individual address.
    pub device_address: IndividualAddress,
    /// Selected network medium.
    pub medium: MediumConfig,
    /// Reconnection behavior for the underlying link.
    #[serde(default)]
    pub reconnect: ReconnectPolicyConfig,
    /// Transport Layer 4 connection-oriented timing.
    #[serde(default)]
    pub transport: TransportConfig,
    /// Secure Application Layer sync timing.
    #[serde(default)]
    pub security: SecurityConfig,
}

/// Which network medium to use to reach the KNX bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MediumConfig {
    /// KNXnet/IP tunneling over UDP.
    IpTunneling {
        /// Gateway address and port.
        gateway: IpEndpoint,
    },
}

/// Serializable mirror of [`ReconnectPolicy`] (which isn't itself
/// `Deserialize` since it embeds no closures, just timing and toggles).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectPolicyConfig {
    /// Maximum reconnection attempts before giving up permanently. `None` means unbounded.
    pub max_attempts: Option<u32>,
    /// Delay between reconnection attempts, in milliseconds.
    pub reconnect_delay_ms: u64,
    /// Reconnect if the very first connection attempt fails.
    pub reconnect_on_initial_error: bool,
    /// Reconnect if the gateway sends a disconnect.
    pub reconnect_on_server_disconnect: bool,
    /// Reconnect if an internal error drops the link.
    pub reconnect_on_internal_disconnect: bool,
    /// Attempt an on-demand reconnect from `send`/`send_request_wait` when disconnected.
    pub connect_on_send: bool,
}

impl Default for ReconnectPolicyConfig {
    fn default() -> Self {
        let defaults = ReconnectPolicy::default();
        Self {
            max_attempts: defaults.max_attempts,
            reconnect_delay_ms: defaults.reconnect_delay.as_millis() as u64,
            reconnect_on_initial_error: defaults.reconnect_on_initial_error,
            reconnect_on_server_disconnect: defaults.reconnect_on_server_disconnect,
            reconnect_on_internal_disconnect: defaults.reconnect_on_internal_disconnect,
            connect_on_send: defaults.connect_on_send,
        }
    }
}

impl From<ReconnectPolicyConfig> for ReconnectPolicy {
    fn from(cfg: ReconnectPolicyConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts,
            reconnect_delay: Duration::from_millis(cfg.reconnect_delay_ms),
            reconnect_on_initial_error: cfg.reconnect_on_initial_error,
            reconnect_on_server_disconnect: cfg.reconnect_on_server_disconnect,
            reconnect_on_internal_disconnect: cfg.reconnect_on_internal_disconnect,
            connect_on_send: cfg.connect_on_send,
        }
    }
}

/// TL4 connection-oriented timing, matching the 6s/3s/3-retry defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Inactivity timeout before a connection is torn down, in milliseconds.
    pub connection_timeout_ms: u64,
    /// Timeout waiting for `T_ACK` after `T_DATA`, in milliseconds.
    pub ack_timeout_ms: u64,
    /// Maximum retransmissions of an unacknowledged `T_DATA` frame.
    pub max_retries: u8,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connection_timeout_ms: 6_000,
            ack_timeout_ms: 3_000,
            max_retries: 3,
        }
    }
}

impl TransportConfig {
    /// Inactivity timeout as a [`Duration`].
    #[must_use]
    pub const fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// Ack timeout as a [`Duration`].
    #[must_use]
    pub const fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

/// Secure Application Layer sync timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Timeout waiting for `sync.res` after `sync.req`, in milliseconds.
    pub sync_timeout_ms: u64,
    /// Minimum interval between `sync.res` replies to the same peer, in milliseconds.
    pub sync_response_throttle_ms: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            sync_timeout_ms: 6_000,
            sync_response_throttle_ms: 1_000,
        }
    }
}

impl SecurityConfig {
    /// Sync timeout as a [`Duration`].
    #[must_use]
    pub const fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    /// Sync response throttle as a [`Duration`].
    #[must_use]
    pub const fn sync_response_throttle(&self) -> Duration {
        Duration::from_millis(self.sync_response_throttle_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::Ipv4Addr;

    #[test]
    fn reconnect_policy_config_round_trips_into_policy() {
        let cfg = ReconnectPolicyConfig::default();
        let policy: ReconnectPolicy = cfg.clone().into();
        assert_eq!(policy.max_attempts, cfg.max_attempts);
        assert_eq!(policy.reconnect_delay.as_millis() as u64, cfg.reconnect_delay_ms);
    }

    #[test]
    fn transport_config_defaults_match_spec_timings() {
        let cfg = TransportConfig::default();
        assert_eq!(cfg.connection_timeout(), Duration::from_secs(6));
        assert_eq!(cfg.ack_timeout(), Duration::from_secs(3));
        assert_eq!(cfg.max_retries, 3);
    }

    #[test]
    fn security_config_defaults_match_spec_timings() {
        let cfg = SecurityConfig::default();
        assert_eq!(cfg.sync_timeout(), Duration::from_secs(6));
        assert_eq!(cfg.sync_response_throttle(), Duration::from_secs(1));
    }

    #[test]
    fn config_constructs_with_ip_tunneling_medium() {
        let config = Config {
            device_address: IndividualAddress::new(1, 1, 1).unwrap(),
            medium: MediumConfig::IpTunneling {
                gateway: IpEndpoint::new(Ipv4Addr::new(192, 168, 1, 10), 3671),
            },
            reconnect: ReconnectPolicyConfig::default(),
            transport: TransportConfig::default(),
            security: SecurityConfig::default(),
        };

        let MediumConfig::IpTunneling { gateway } = config.medium;
        assert_eq!(gateway.port, 3671);
    }
}
