//! Tunnel settings

use iap_relay::config::duration_secs;
use iap_relay::RelayOptions;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Settings for tunnels created by a broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelSettings {
    /// Address local listeners bind to (port is always ephemeral)
    pub bind_address: IpAddr,

    /// Concurrent local connections per tunnel
    pub max_local_connections: usize,

    /// How long an unreferenced tunnel stays open
    #[serde(with = "duration_secs")]
    pub idle_grace_period: Duration,

    /// How long teardown waits for local connections to finish
    #[serde(with = "duration_secs")]
    pub drain_timeout: Duration,

    /// Bound on an interactive re-authorization
    #[serde(with = "duration_secs")]
    pub reauth_timeout: Duration,

    pub relay: RelayOptions,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            max_local_connections: 16,
            idle_grace_period: Duration::ZERO,
            drain_timeout: Duration::from_secs(5),
            reauth_timeout: Duration::from_secs(300),
            relay: RelayOptions::default(),
        }
    }
}

impl TunnelSettings {
    /// Take every value the provider has, and `defaults` for the rest
    pub fn resolve(provider: &dyn SettingsProvider, defaults: TunnelSettings) -> TunnelSettings {
        let mut settings = defaults;

        if let Some(limit) = provider.max_local_connections() {
            settings.max_local_connections = limit;
        }
        if let Some(timeout) = provider.connect_timeout() {
            settings.relay.connect_timeout = timeout;
        }
        if let Some(timeout) = provider.reauth_timeout() {
            settings.reauth_timeout = timeout;
        }
        if let Some(grace) = provider.idle_grace_period() {
            settings.idle_grace_period = grace;
        }
        if let Some(timeout) = provider.drain_timeout() {
            settings.drain_timeout = timeout;
        }
        if let Some(interval) = provider.keep_alive_interval() {
            settings.relay.keep_alive_interval = Some(interval);
        }

        settings
    }

    pub fn with_max_local_connections(mut self, limit: usize) -> Self {
        self.max_local_connections = limit;
        self
    }

    pub fn with_idle_grace_period(mut self, grace: Duration) -> Self {
        self.idle_grace_period = grace;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_reauth_timeout(mut self, timeout: Duration) -> Self {
        self.reauth_timeout = timeout;
        self
    }

    pub fn with_relay(mut self, relay: RelayOptions) -> Self {
        self.relay = relay;
        self
    }
}

/// User-editable settings, each of which may be unset
pub trait SettingsProvider: Send + Sync {
    fn max_local_connections(&self) -> Option<usize> {
        None
    }

    fn connect_timeout(&self) -> Option<Duration> {
        None
    }

    fn reauth_timeout(&self) -> Option<Duration> {
        None
    }

    fn idle_grace_period(&self) -> Option<Duration> {
        None
    }

    fn drain_timeout(&self) -> Option<Duration> {
        None
    }

    fn keep_alive_interval(&self) -> Option<Duration> {
        None
    }
}
