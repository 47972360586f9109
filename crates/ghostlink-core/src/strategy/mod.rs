//! Negotiation strategies.
//!
//! Both strategies run the same engine against a different relay and
//! timing profile:
//!
//! - [`DirectStrategy`]: self-assigned identity on the configured relay,
//!   device-dependent open and heartbeat timers, gathering diagnostics and
//!   idle reconnects on handheld clients.
//! - [`ManagedStrategy`]: broker endpoints with a short heartbeat and an
//!   optional server-assigned identity.

mod direct;
mod managed;

pub use direct::DirectStrategy;
pub use managed::ManagedStrategy;

use crate::error::Result;
use crate::handler::PeerHandler;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Strategy variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyKind {
    /// Self-managed relay
    Direct,
    /// Managed broker
    Managed,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Managed => write!(f, "managed"),
        }
    }
}

/// Negotiation engine adapter shared by both strategies
#[async_trait]
pub trait NegotiationStrategy: Send + Sync {
    /// Strategy variant
    fn kind(&self) -> StrategyKind;

    /// Session identity registered at the relay
    fn identity(&self) -> &str;

    /// Start as the offering side; resolves once connected
    ///
    /// # Errors
    ///
    /// Returns the relay, negotiation, or timeout failure.
    async fn initiate(&self, remote: &str, handler: Arc<dyn PeerHandler>) -> Result<()>;

    /// Apply a signal from `src`, answering if no session exists yet
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::TornDown`](crate::LinkError::TornDown) after
    /// teardown.
    async fn accept(&self, src: &str, signal: Value, handler: Arc<dyn PeerHandler>) -> Result<()>;

    /// Send `data` to every connected session; returns the number reached
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::TornDown`](crate::LinkError::TornDown) after
    /// teardown.
    async fn send(&self, data: &[u8]) -> Result<usize>;

    /// Remote identities with a connected session
    async fn connected_peers(&self) -> Vec<String>;

    /// Release all sessions and the relay client; idempotent
    async fn teardown(&self);
}
