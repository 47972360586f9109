//! Link configuration and the timeout table.
//!
//! [`TimeoutTable::for_device`] is the single source of timer values; no
//! other module hard-codes a timeout.

use crate::device::DeviceClass;
use crate::error::{LinkError, Result};
use ghostlink_signal::{IcePolicy, IceServer};
use std::time::Duration;

/// Default relay endpoint (a locally run `ghostlink relay`)
pub const DEFAULT_RELAY_ENDPOINT: &str = "ws://127.0.0.1:9000/peerjs";

/// Default identity-issuing base for the managed broker
pub const DEFAULT_ID_ENDPOINT: &str = "http://127.0.0.1:9000/peerjs";

/// Default event log capacity
pub const DEFAULT_EVENT_LOG_CAPACITY: usize = 50;

/// Timer values for one device class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutTable {
    /// Direct relay: connect to `OPEN`
    pub relay_open: Duration,
    /// Managed broker: connect to `OPEN`
    pub broker_open: Duration,
    /// Direct relay heartbeat
    pub relay_heartbeat: Duration,
    /// Managed broker heartbeat
    pub broker_heartbeat: Duration,
    /// Negotiation must connect within this
    pub negotiation: Duration,
    /// Candidate gathering diagnostic deadline
    pub gathering: Duration,
    /// Connected-session stats sampling period
    pub stats_interval: Duration,
    /// Idle relay reconnect attempts (0 disables)
    pub reconnect_attempts: u32,
    /// Reconnect backoff unit; attempt `n` waits `n` units
    pub reconnect_backoff: Duration,
    /// Saved session identity lifetime
    pub identity_ttl: Duration,
    /// Candidates gathered ahead of negotiation
    pub candidate_pool_size: u8,
}

impl TimeoutTable {
    /// Timer values for `device`
    #[must_use]
    pub fn for_device(device: DeviceClass) -> Self {
        match device {
            DeviceClass::Handheld => Self {
                relay_open: Duration::from_secs(45),
                broker_open: Duration::from_secs(20),
                relay_heartbeat: Duration::from_secs(15),
                broker_heartbeat: Duration::from_secs(5),
                negotiation: Duration::from_secs(120),
                gathering: Duration::from_secs(60),
                stats_interval: Duration::from_secs(5),
                reconnect_attempts: 3,
                reconnect_backoff: Duration::from_secs(2),
                identity_ttl: Duration::from_secs(5 * 60),
                candidate_pool_size: 10,
            },
            DeviceClass::Desktop => Self {
                relay_open: Duration::from_secs(20),
                broker_open: Duration::from_secs(12),
                relay_heartbeat: Duration::from_secs(20),
                broker_heartbeat: Duration::from_secs(5),
                negotiation: Duration::from_secs(45),
                gathering: Duration::from_secs(30),
                stats_interval: Duration::from_secs(5),
                reconnect_attempts: 0,
                reconnect_backoff: Duration::from_secs(2),
                identity_ttl: Duration::from_secs(5 * 60),
                candidate_pool_size: 5,
            },
        }
    }

    /// Backoff before reconnect attempt `attempt` (1-based)
    #[must_use]
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        self.reconnect_backoff * attempt
    }
}

/// Direct strategy relay settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Relay endpoints in preference order
    pub endpoints: Vec<String>,
    /// Opaque auth token
    pub token: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            endpoints: vec![DEFAULT_RELAY_ENDPOINT.to_string()],
            token: ghostlink_signal::relay::DEFAULT_TOKEN.to_string(),
        }
    }
}

/// Managed strategy broker settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedConfig {
    /// Broker endpoints in preference order
    pub endpoints: Vec<String>,
    /// Base URL of the identity-issuing endpoint; self-assigned if `None`
    pub id_endpoint: Option<String>,
    /// Opaque auth token
    pub token: String,
}

impl Default for ManagedConfig {
    fn default() -> Self {
        Self {
            endpoints: vec![DEFAULT_RELAY_ENDPOINT.to_string()],
            id_endpoint: None,
            token: ghostlink_signal::relay::DEFAULT_TOKEN.to_string(),
        }
    }
}

/// ICE settings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IceSettings {
    /// User-supplied helper server, ranked last
    pub custom_server: Option<IceServer>,
    /// Transport policy for both strategies
    pub policy: IcePolicy,
}

/// Link configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    /// Direct strategy relay
    pub relay: RelayConfig,
    /// Managed strategy broker
    pub managed: ManagedConfig,
    /// ICE settings
    pub ice: IceSettings,
    /// Forced device class
    pub device_override: Option<DeviceClass>,
    /// Event log capacity
    pub event_log_capacity: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            relay: RelayConfig::default(),
            managed: ManagedConfig::default(),
            ice: IceSettings::default(),
            device_override: None,
            event_log_capacity: DEFAULT_EVENT_LOG_CAPACITY,
        }
    }
}

impl LinkConfig {
    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::InvalidConfig`] if an endpoint list is empty,
    /// an endpoint is not a URL, or the event log capacity is zero.
    pub fn validate(&self) -> Result<()> {
        if self.relay.endpoints.is_empty() {
            return Err(LinkError::invalid_config("no relay endpoints configured"));
        }
        if self.managed.endpoints.is_empty() {
            return Err(LinkError::invalid_config("no managed endpoints configured"));
        }
        for endpoint in self.relay.endpoints.iter().chain(&self.managed.endpoints) {
            if !endpoint.contains("://") {
                return Err(LinkError::invalid_config(format!(
                    "endpoint '{endpoint}' is not a URL"
                )));
            }
        }
        if self.event_log_capacity == 0 {
            return Err(LinkError::invalid_config("event log capacity must be non-zero"));
        }
        Ok(())
    }
}
