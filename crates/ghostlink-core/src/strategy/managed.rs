//! Managed strategy: broker endpoints with an optional server-assigned id.

use super::{NegotiationStrategy, StrategyKind};
use crate::context::SessionContext;
use crate::engine::{Engine, StrategyProfile};
use crate::error::{DisconnectReason, LinkError, NegotiationFailure, Result};
use crate::handler::PeerHandler;
use async_trait::async_trait;
use ghostlink_signal::relay::{RelayClientConfig, SERVICE_TAG, fetch_assigned_id};
use serde_json::Value;
use std::sync::Arc;

/// Managed strategy
#[derive(Debug)]
pub struct ManagedStrategy {
    engine: Engine,
}

impl ManagedStrategy {
    /// Obtain an identity and connect to the broker pool
    ///
    /// With an `id_endpoint` configured the identity is issued by the
    /// broker; otherwise it is leased from the identity store.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Identity`] if the broker cannot issue an id, or
    /// the relay failure if no endpoint opens.
    pub async fn start(ctx: &SessionContext, handler: Arc<dyn PeerHandler>) -> Result<Self> {
        let identity = match &ctx.config().managed.id_endpoint {
            Some(base) => {
                let id = fetch_assigned_id(base)
                    .await
                    .map_err(|e| LinkError::Identity(e.to_string()))?;
                tracing::debug!("Broker issued identity {id}");
                ctx.identity_store().save(&id);
                id
            }
            None => ctx.identity_store().lease(),
        };

        let engine = Engine::start(ctx, Self::profile(ctx), identity, handler).await?;
        Ok(Self { engine })
    }

    fn profile(ctx: &SessionContext) -> StrategyProfile {
        let timeouts = ctx.timeouts();
        let managed = &ctx.config().managed;
        StrategyProfile {
            kind: StrategyKind::Managed,
            endpoints: managed.endpoints.clone(),
            relay: RelayClientConfig {
                open_timeout: timeouts.broker_open,
                heartbeat_interval: timeouts.broker_heartbeat,
                token: managed.token.clone(),
                service_tag: SERVICE_TAG.to_string(),
            },
            ice: ctx.ice_config(),
            negotiation_timeout: timeouts.negotiation,
            gathering_timeout: None,
            stats_interval: timeouts.stats_interval,
            classify,
        }
    }
}

/// Path loss reads as the peer leaving; anything else is a network error
fn classify(failure: &NegotiationFailure) -> DisconnectReason {
    match failure {
        NegotiationFailure::IceFailed | NegotiationFailure::Disconnected => {
            DisconnectReason::PeerLeft
        }
        NegotiationFailure::Other(msg) => {
            let msg = msg.to_ascii_lowercase();
            if msg.contains("ice connection failed") || msg.contains("disconnected") {
                DisconnectReason::PeerLeft
            } else {
                DisconnectReason::NetworkError
            }
        }
    }
}

#[async_trait]
impl NegotiationStrategy for ManagedStrategy {
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
