//! Per-session context.
//!
//! A [`SessionContext`] is created once per chat session and passed to the
//! selector and both strategies. It holds configuration, the device class
//! and timeout table, the identity store, the event log, diagnostics, and
//! the relay and negotiation seams. Clones share everything.

use crate::config::{LinkConfig, TimeoutTable};
use crate::device::{DeviceClass, EnvironmentSignals};
use crate::diagnostics::Diagnostics;
use crate::error::{LinkError, Result};
use crate::event_log::EventLog;
use crate::identity::{IdentityStore, MemoryIdentityStore};
use crate::negotiator::NegotiatorFactory;
use ghostlink_signal::relay::WsConnector;
use ghostlink_signal::{IceConfig, RelayConnector, nat};
use std::fmt;
use std::sync::Arc;

struct Inner {
    config: LinkConfig,
    device: DeviceClass,
    timeouts: TimeoutTable,
    identity: Arc<dyn IdentityStore>,
    events: EventLog,
    diagnostics: Diagnostics,
    connector: Arc<dyn RelayConnector>,
    negotiators: Arc<dyn NegotiatorFactory>,
}

/// Shared state for one chat session
#[derive(Clone)]
pub struct SessionContext {
    inner: Arc<Inner>,
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("device", &self.inner.device)
            .field("timeouts", &self.inner.timeouts)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl SessionContext {
    /// Start building a context
    #[must_use]
    pub fn builder() -> SessionContextBuilder {
        SessionContextBuilder::default()
    }

    /// Configuration
    #[must_use]
    pub fn config(&self) -> &LinkConfig {
        &self.inner.config
    }

    /// Local device class
    #[must_use]
    pub fn device(&self) -> DeviceClass {
        self.inner.device
    }

    /// Timer values for this device
    #[must_use]
    pub fn timeouts(&self) -> &TimeoutTable {
        &self.inner.timeouts
    }

    /// Session identity store
    #[must_use]
    pub fn identity_store(&self) -> &Arc<dyn IdentityStore> {
        &self.inner.identity
    }

    /// Event log
    #[must_use]
    pub fn events(&self) -> &EventLog {
        &self.inner.events
    }

    /// Diagnostics recorder
    #[must_use]
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.inner.diagnostics
    }

    /// Relay transport
    #[must_use]
    pub fn connector(&self) -> &Arc<dyn RelayConnector> {
        &self.inner.connector
    }

    /// Negotiation primitive factory
    #[must_use]
    pub fn negotiators(&self) -> &Arc<dyn NegotiatorFactory> {
        &self.inner.negotiators
    }

    /// ICE configuration for new negotiations
    #[must_use]
    pub fn ice_config(&self) -> IceConfig {
        let ice = &self.inner.config.ice;
        IceConfig {
            servers: nat::ranked_ice_servers(&nat::default_providers(), ice.custom_server.as_ref()),
            policy: ice.policy,
            candidate_pool_size: self.inner.timeouts.candidate_pool_size,
        }
    }
}

/// Builder for [`SessionContext`]
#[derive(Default)]
pub struct SessionContextBuilder {
    config: LinkConfig,
    device: Option<DeviceClass>,
    signals: Option<EnvironmentSignals>,
    timeouts: Option<TimeoutTable>,
    identity: Option<Arc<dyn IdentityStore>>,
    connector: Option<Arc<dyn RelayConnector>>,
    negotiators: Option<Arc<dyn NegotiatorFactory>>,
}

impl SessionContextBuilder {
    /// Set configuration
    #[must_use]
    pub fn config(mut self, config: LinkConfig) -> Self {
        self.config = config;
        self
    }

    /// Force the device class
    #[must_use]
    pub fn device(mut self, device: DeviceClass) -> Self {
        self.device = Some(device);
        self
    }

    /// Classify from these signals instead of the process environment
    #[must_use]
    pub fn signals(mut self, signals: EnvironmentSignals) -> Self {
        self.signals = Some(signals);
        self
    }

    /// Replace the device's timeout table
    #[must_use]
    pub fn timeouts(mut self, timeouts: TimeoutTable) -> Self {
        self.timeouts = Some(timeouts);
        self
    }

    /// Use a custom identity store
    #[must_use]
    pub fn identity_store(mut self, store: Arc<dyn IdentityStore>) -> Self {
        self.identity = Some(store);
        self
    }

    /// Use a custom relay transport
    #[must_use]
    pub fn connector(mut self, connector: Arc<dyn RelayConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Set the negotiation primitive factory
    #[must_use]
    pub fn negotiators(mut self, factory: Arc<dyn NegotiatorFactory>) -> Self {
        self.negotiators = Some(factory);
        self
    }

    /// Build the context
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::InvalidConfig`] if the configuration is invalid
    /// or no negotiator factory was set.
    pub fn build(self) -> Result<SessionContext> {
        self.config.validate()?;
        let negotiators = self
            .negotiators
            .ok_or_else(|| LinkError::invalid_config("no negotiator factory set"))?;

        let device = self
            .device
            .or(self.config.device_override)
            .unwrap_or_else(|| {
                DeviceClass::classify(&self.signals.unwrap_or_else(EnvironmentSignals::from_env))
            });
        let timeouts = self.timeouts.unwrap_or_else(|| TimeoutTable::for_device(device));
        let identity = self
            .identity
            .unwrap_or_else(|| Arc::new(MemoryIdentityStore::new(timeouts.identity_ttl)));
        let connector = self.connector.unwrap_or_else(|| Arc::new(WsConnector));

        tracing::debug!("Session context for {device} client");

        Ok(SessionContext {
            inner: Arc::new(Inner {
                events: EventLog::new(self.config.event_log_capacity),
                config: self.config,
                device,
                timeouts,
                identity,
                diagnostics: Diagnostics::new(),
                connector,
                negotiators,
            }),
        })
    }
}
