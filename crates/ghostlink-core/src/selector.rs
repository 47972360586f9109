//! Protocol selector.
//!
//! Binds exactly one negotiation strategy per session context. Handheld
//! clients go straight to the managed strategy. Desktop clients try the
//! direct strategy first and fall back to managed once if it fails before
//! the relay opens or before the peer link connects; after a fallback the
//! managed strategy stays bound.

use crate::context::SessionContext;
use crate::error::{LinkError, Result};
use crate::event_log::LinkEvent;
use crate::handler::PeerHandler;
use crate::strategy::{DirectStrategy, ManagedStrategy, NegotiationStrategy, StrategyKind};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

/// Result of binding a strategy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOutcome {
    /// Session identity registered at the relay
    pub identity: String,
    /// Bound strategy
    pub strategy: StrategyKind,
    /// Whether direct failed and managed was bound instead
    pub fallback_used: bool,
}

/// Result of a successful `initiate`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Established {
    /// Remote peer
    pub peer: String,
    /// Strategy that connected
    pub strategy: StrategyKind,
    /// Whether the managed fallback was used
    pub fallback_used: bool,
}

/// Chooses and owns the session's negotiation strategy
pub struct ProtocolSelector {
    ctx: SessionContext,
    /// Handler for sessions answered on behalf of remote initiators
    handler: Arc<dyn PeerHandler>,
    bound: RwLock<Option<Arc<dyn NegotiationStrategy>>>,
    fallback_used: AtomicBool,
    torn_down: AtomicBool,
}

impl ProtocolSelector {
    /// Create a selector; nothing is bound until `start` or `initiate`
    pub fn new(ctx: SessionContext, handler: Arc<dyn PeerHandler>) -> Self {
        Self {
            ctx,
            handler,
            bound: RwLock::new(None),
            fallback_used: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
        }
    }

    /// Session context
    #[must_use]
    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    /// Bind a strategy and register at its relay
    ///
    /// Returns the existing binding if one is already bound.
    ///
    /// # Errors
    ///
    /// Returns the managed strategy's failure once both strategies (or,
    /// on handheld clients, managed alone) failed to start, and
    /// [`LinkError::TornDown`] after teardown.
    pub async fn start(&self) -> Result<StartOutcome> {
        self.ensure_live()?;
        let mut bound = self.bound.write().await;
        if let Some(strategy) = bound.as_ref() {
            return Ok(self.outcome(strategy.as_ref()));
        }

        let strategy: Arc<dyn NegotiationStrategy> = if self.ctx.device().is_handheld() {
            tracing::info!("Handheld client, using managed strategy");
            Arc::new(ManagedStrategy::start(&self.ctx, self.handler.clone()).await?)
        } else {
            match DirectStrategy::start(&self.ctx, self.handler.clone()).await {
                Ok(direct) => Arc::new(direct),
                Err(e) => {
                    self.record_fallback(&e);
                    Arc::new(ManagedStrategy::start(&self.ctx, self.handler.clone()).await?)
                }
            }
        };

        self.bind(&mut bound, strategy.clone());
        Ok(self.outcome(strategy.as_ref()))
    }

    /// Connect to `remote` as the offering side
    ///
    /// Binds a strategy first if none is bound. If the direct strategy
    /// fails, no fallback happened yet and direct has no connected peers,
    /// it is torn down and the attempt is repeated once on the managed
    /// strategy.
    ///
    /// # Errors
    ///
    /// Returns the failure of the last strategy tried.
    pub async fn initiate(&self, remote: &str, handler: Arc<dyn PeerHandler>) -> Result<Established> {
        self.start().await?;
        let strategy = self.current().await?;

        let err = match strategy.initiate(remote, handler.clone()).await {
            Ok(()) => return Ok(self.established(remote, strategy.kind())),
            Err(e) => e,
        };

        if strategy.kind() != StrategyKind::Direct
            || !err.is_transient()
            || self.fallback_used.load(Ordering::SeqCst)
        {
            return Err(err);
        }
        // Established direct sessions would die with the strategy
        let live = strategy.connected_peers().await;
        if !live.is_empty() {
            tracing::info!(
                "Not falling back for {remote}: direct still serves {} peer(s)",
                live.len()
            );
            return Err(err);
        }

        let managed = {
            let mut bound = self.bound.write().await;
            match bound.as_ref() {
                Some(current) if Arc::ptr_eq(current, &strategy) => {
                    self.record_fallback(&err);
                    strategy.teardown().await;
                    *bound = None;
                    let managed: Arc<dyn NegotiationStrategy> =
                        Arc::new(ManagedStrategy::start(&self.ctx, self.handler.clone()).await?);
                    self.bind(&mut bound, managed.clone());
                    managed
                }
                // Another caller already replaced the direct binding
                Some(current) => current.clone(),
                None => return Err(LinkError::TornDown),
            }
        };

        managed.initiate(remote, handler).await?;
        Ok(self.established(remote, managed.kind()))
    }

    /// Apply a signal from `src` on the bound strategy
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::NoStrategyBound`] before a strategy is bound.
    pub async fn accept(&self, src: &str, signal: Value, handler: Arc<dyn PeerHandler>) -> Result<()> {
        self.current().await?.accept(src, signal, handler).await
    }

    /// Send `data` to every connected peer
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::NoStrategyBound`] before a strategy is bound.
    pub async fn send(&self, data: &[u8]) -> Result<usize> {
        self.current().await?.send(data).await
    }

    /// Peers with a connected session
    pub async fn connected_peers(&self) -> Vec<String> {
        match self.current().await {
            Ok(strategy) => strategy.connected_peers().await,
            Err(_) => Vec::new(),
        }
    }

    /// Currently bound strategy
    pub async fn bound_strategy(&self) -> Option<StrategyKind> {
        self.bound.read().await.as_ref().map(|s| s.kind())
    }

    /// Identity registered by the bound strategy
    pub async fn identity(&self) -> Option<String> {
        self.bound.read().await.as_ref().map(|s| s.identity().to_string())
    }

    /// Whether the managed fallback was used
    #[must_use]
    pub fn fallback_used(&self) -> bool {
        self.fallback_used.load(Ordering::SeqCst)
    }

    /// Tear down the bound strategy; idempotent
    pub async fn teardown(&self) {
        self.torn_down.store(true, Ordering::SeqCst);
        let strategy = self.bound.write().await.take();
        if let Some(strategy) = strategy {
            strategy.teardown().await;
        }
    }

    async fn current(&self) -> Result<Arc<dyn NegotiationStrategy>> {
        self.ensure_live()?;
        self.bound
            .read()
            .await
            .clone()
            .ok_or(LinkError::NoStrategyBound)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.torn_down.load(Ordering::SeqCst) {
            return Err(LinkError::TornDown);
        }
        Ok(())
    }

    fn bind(&self, slot: &mut Option<Arc<dyn NegotiationStrategy>>, strategy: Arc<dyn NegotiationStrategy>) {
        tracing::info!("Bound {} strategy as {}", strategy.kind(), strategy.identity());
        self.ctx.events().record(LinkEvent::StrategyBound {
            kind: strategy.kind(),
        });
        *slot = Some(strategy);
    }

    fn record_fallback(&self, err: &LinkError) {
        self.fallback_used.store(true, Ordering::SeqCst);
        tracing::warn!(
            target: "ghostlink::telemetry",
            event = "fallback_used",
            device = %self.ctx.device(),
            reason = %err,
            "Direct strategy failed, falling back to managed"
        );
        self.ctx.events().record(LinkEvent::FallbackUsed {
            reason: err.to_string(),
        });
    }

    fn outcome(&self, strategy: &dyn NegotiationStrategy) -> StartOutcome {
        StartOutcome {
            identity: strategy.identity().to_string(),
            strategy: strategy.kind(),
            fallback_used: self.fallback_used(),
        }
    }

    fn established(&self, remote: &str, strategy: StrategyKind) -> Established {
        Established {
            peer: remote.to_string(),
            strategy,
            fallback_used: self.fallback_used(),
        }
    }
}
