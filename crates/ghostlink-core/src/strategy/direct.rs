//! Direct strategy: self-assigned identity on the configured relay.

use super::{NegotiationStrategy, StrategyKind};
use crate::context::SessionContext;
use crate::engine::{Engine, StrategyProfile};
use crate::error::{DisconnectReason, NegotiationFailure, Result};
use crate::handler::PeerHandler;
use async_trait::async_trait;
use ghostlink_signal::relay::{RelayClientConfig, SERVICE_TAG};
use serde_json::Value;
use std::sync::Arc;

/// Direct strategy
#[derive(Debug)]
pub struct DirectStrategy {
    engine: Engine,
}

impl DirectStrategy {
    /// Lease an identity and connect to the relay pool
    ///
    /// # Errors
    ///
    /// Returns the relay failure if no endpoint opens.
    pub async fn start(ctx: &SessionContext, handler: Arc<dyn PeerHandler>) -> Result<Self> {
        let identity = ctx.identity_store().lease();
        let engine = Engine::start(ctx, Self::profile(ctx), identity, handler).await?;
        Ok(Self { engine })
    }

    fn profile(ctx: &SessionContext) -> StrategyProfile {
        let timeouts = ctx.timeouts();
        let relay = &ctx.config().relay;
        StrategyProfile {
            kind: StrategyKind::Direct,
            endpoints: relay.endpoints.clone(),
            relay: RelayClientConfig {
                open_timeout: timeouts.relay_open,
                heartbeat_interval: timeouts.relay_heartbeat,
                token: relay.token.clone(),
                service_tag: SERVICE_TAG.to_string(),
            },
            ice: ctx.ice_config(),
            negotiation_timeout: timeouts.negotiation,
            gathering_timeout: Some(timeouts.gathering),
            stats_interval: timeouts.stats_interval,
            classify,
        }
    }
}

fn classify(_failure: &NegotiationFailure) -> DisconnectReason {
    DisconnectReason::NetworkError
}

#[async_trait]
impl NegotiationStrategy for DirectStrategy {
    fn kind(&self) -> StrategyKind {
        self.engine.kind()
    }

    fn identity(&self) -> &str {
        self.engine.identity()
    }

    async fn initiate(&self, remote: &str, handler: Arc<dyn PeerHandler>) -> Result<()> {
        self.engine.initiate(remote, handler).await
    }

    async fn accept(&self, src: &str, signal: Value, handler: Arc<dyn PeerHandler>) -> Result<()> {
        self.engine.accept(src, signal, handler)
    }

    async fn send(&self, data: &[u8]) -> Result<usize> {
        self.engine.send(data).await
    }

    async fn connected_peers(&self) -> Vec<String> {
        self.engine.connected_peers().await
    }

    async fn teardown(&self) {
        self.engine.teardown().await;
    }
}
