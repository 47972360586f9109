//! In-process negotiation primitive.
//!
//! A [`LoopbackNetwork`] pairs offerers and answerers by a token carried
//! in the offer, so two session contexts in one process can negotiate
//! over a real relay (or a [`MemoryRelay`](ghostlink_signal::relay::MemoryRelay))
//! without any network path. Data sent on a connected pair is delivered
//! to the other side's sink in order.

use crate::diagnostics::LinkStats;
use crate::error::NegotiationFailure;
use crate::negotiator::{NegotiatorEvent, NegotiatorFactory, NegotiatorSink, PathNegotiator, Role};
use ghostlink_signal::{CandidateType, IceCandidate, IceConfig};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How negotiators from a factory behave
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopbackBehavior {
    /// Exchange offer/answer and connect
    Connect,
    /// Exchange offer/answer but never gather or connect
    Stall,
    /// Fail with the given failure on the first remote signal
    Fail(NegotiationFailure),
}

#[derive(Debug)]
struct Side {
    sink: NegotiatorSink,
    open: bool,
    willing: bool,
    received: u64,
}

#[derive(Debug, Default)]
struct Pairing {
    offerer: Option<Side>,
    answerer: Option<Side>,
    connected: bool,
}

impl Pairing {
    fn side(&mut self, role: Role) -> Option<&mut Side> {
        match role {
            Role::Offerer => self.offerer.as_mut(),
            Role::Answerer => self.answerer.as_mut(),
        }
    }

    fn other(&mut self, role: Role) -> Option<&mut Side> {
        match role {
            Role::Offerer => self.answerer.as_mut(),
            Role::Answerer => self.offerer.as_mut(),
        }
    }
}

#[derive(Debug, Default)]
struct Registry {
    next_token: u64,
    pairings: HashMap<u64, Pairing>,
}

/// Shared medium pairing loopback negotiators
#[derive(Debug, Clone, Default)]
pub struct LoopbackNetwork {
    registry: Arc<Mutex<Registry>>,
}

impl LoopbackNetwork {
    /// Create an empty network
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory whose negotiators connect and gather host + srflx candidates
    #[must_use]
    pub fn factory(&self) -> LoopbackFactory {
        LoopbackFactory {
            network: self.clone(),
            behavior: LoopbackBehavior::Connect,
            candidates: vec![CandidateType::Host, CandidateType::ServerReflexive],
            rtt: Duration::from_millis(20),
        }
    }

    /// Pairings with at least one open side
    #[must_use]
    pub fn live_pairings(&self) -> usize {
        self.registry()
            .pairings
            .values()
            .filter(|p| {
                p.offerer.as_ref().is_some_and(|s| s.open)
                    || p.answerer.as_ref().is_some_and(|s| s.open)
            })
            .count()
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Creates [`LoopbackNegotiator`]s on a shared network
#[derive(Debug, Clone)]
pub struct LoopbackFactory {
    network: LoopbackNetwork,
    behavior: LoopbackBehavior,
    candidates: Vec<CandidateType>,
    rtt: Duration,
}

impl LoopbackFactory {
    /// Set negotiator behavior
    #[must_use]
    pub fn with_behavior(mut self, behavior: LoopbackBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    /// Set the candidate types gathered per negotiation
    #[must_use]
    pub fn with_candidates(mut self, candidates: Vec<CandidateType>) -> Self {
        self.candidates = candidates;
        self
    }

    /// Set the round-trip time reported in stats
    #[must_use]
    pub fn with_rtt(mut self, rtt: Duration) -> Self {
        self.rtt = rtt;
        self
    }
}

impl NegotiatorFactory for LoopbackFactory {
    fn create(&self, role: Role, ice: &IceConfig, sink: NegotiatorSink) -> Box<dyn PathNegotiator> {
        tracing::trace!(
            "Loopback {role:?} negotiator with {} helper servers ({:?})",
            ice.servers.len(),
            ice.policy
        );

        let mut negotiator = LoopbackNegotiator {
            network: self.network.clone(),
            behavior: self.behavior.clone(),
            candidates: self.candidates.clone(),
            rtt: self.rtt,
            role,
            sink,
            token: None,
            closed: false,
            bytes_sent: 0,
        };

        if role == Role::Offerer {
            let token = {
                let mut registry = negotiator.network.registry();
                registry.next_token += 1;
                let token = registry.next_token;
                registry.pairings.insert(
                    token,
                    Pairing {
                        offerer: Some(Side {
                            sink: negotiator.sink.clone(),
                            open: true,
                            willing: negotiator.behavior == LoopbackBehavior::Connect,
                            received: 0,
                        }),
                        ..Default::default()
                    },
                );
                token
            };
            negotiator.token = Some(token);
            negotiator
                .sink
                .emit(NegotiatorEvent::LocalSignal(json!({"type": "offer", "token": token})));
        }

        Box::new(negotiator)
    }
}

/// Loopback negotiation primitive
#[derive(Debug)]
pub struct LoopbackNegotiator {
    network: LoopbackNetwork,
    behavior: LoopbackBehavior,
    candidates: Vec<CandidateType>,
    rtt: Duration,
    role: Role,
    sink: NegotiatorSink,
    token: Option<u64>,
    closed: bool,
    bytes_sent: u64,
}

impl LoopbackNegotiator {
    fn gather(&self) {
        if self.behavior == LoopbackBehavior::Stall {
            return;
        }
        for (n, kind) in self.candidates.iter().enumerate() {
            let port = 50_000 + u16::try_from(n).unwrap_or(0);
            let candidate = match kind {
                CandidateType::Host => IceCandidate::new(*kind, "192.168.1.10", port),
                _ => IceCandidate::new(*kind, "203.0.113.7", port).with_related("192.168.1.10", port),
            };
            let line = candidate.to_sdp_string();
            self.sink.emit(NegotiatorEvent::CandidateGathered(line.clone()));
            self.sink
                .emit(NegotiatorEvent::LocalSignal(json!({"type": "candidate", "candidate": line})));
        }
        self.sink.emit(NegotiatorEvent::GatheringComplete);
    }

    fn on_offer(&mut self, token: u64) -> Result<(), NegotiationFailure> {
        {
            let mut registry = self.network.registry();
            let pairing = registry
                .pairings
                .get_mut(&token)
                .ok_or_else(|| NegotiationFailure::Other(format!("unknown offer {token}")))?;
            if pairing.answerer.is_some() {
                return Err(NegotiationFailure::Other(format!("offer {token} already answered")));
            }
            pairing.answerer = Some(Side {
                sink: self.sink.clone(),
                open: true,
                willing: self.behavior == LoopbackBehavior::Connect,
                received: 0,
            });
        }
        self.token = Some(token);
        self.sink
            .emit(NegotiatorEvent::LocalSignal(json!({"type": "answer", "token": token})));
        self.gather();
        Ok(())
    }

    fn on_answer(&mut self, token: u64) -> Result<(), NegotiationFailure> {
        if self.token != Some(token) {
            return Err(NegotiationFailure::Other(format!("answer for foreign offer {token}")));
        }
        self.gather();
        if self.behavior != LoopbackBehavior::Connect {
            return Ok(());
        }

        let mut registry = self.network.registry();
        let Some(pairing) = registry.pairings.get_mut(&token) else {
            return Err(NegotiationFailure::Disconnected);
        };
        if !pairing.answerer.as_ref().is_some_and(|s| s.open && s.willing) {
            return Ok(());
        }
        pairing.connected = true;
        if let Some(side) = pairing.side(Role::Offerer) {
            side.sink.emit(NegotiatorEvent::Connected);
        }
        if let Some(side) = pairing.other(Role::Offerer).filter(|s| s.open) {
            side.sink.emit(NegotiatorEvent::Connected);
        }
        Ok(())
    }
}

fn token_of(signal: &Value) -> Result<u64, NegotiationFailure> {
    signal
        .get("token")
        .and_then(Value::as_u64)
        .ok_or_else(|| NegotiationFailure::Other("signal without token".to_string()))
}

impl PathNegotiator for LoopbackNegotiator {
    fn apply_remote(&mut self, signal: Value) -> Result<(), NegotiationFailure> {
        if self.closed {
            return Err(NegotiationFailure::Disconnected);
        }

        let kind = signal.get("type").and_then(Value::as_str).unwrap_or_default();
        if kind == "candidate" {
            tracing::trace!("Loopback remote candidate applied");
            return Ok(());
        }

        if let LoopbackBehavior::Fail(failure) = &self.behavior {
            self.sink.emit(NegotiatorEvent::Failed(failure.clone()));
            return Ok(());
        }

        match (self.role, kind) {
            (Role::Answerer, "offer") => self.on_offer(token_of(&signal)?),
            (Role::Offerer, "answer") => self.on_answer(token_of(&signal)?),
            (role, other) => Err(NegotiationFailure::Other(format!(
                "unexpected {other:?} signal for {role:?}"
            ))),
        }
    }

    fn send(&mut self, data: &[u8]) -> Result<(), NegotiationFailure> {
        let token = self.token.ok_or(NegotiationFailure::Disconnected)?;
        let mut registry = self.network.registry();
        let pairing = registry
            .pairings
            .get_mut(&token)
            .filter(|p| p.connected)
            .ok_or(NegotiationFailure::Disconnected)?;
        let remote = pairing
            .other(self.role)
            .filter(|s| s.open)
            .ok_or(NegotiationFailure::Disconnected)?;

        remote.sink.emit(NegotiatorEvent::Data(data.to_vec()));
        remote.received += data.len() as u64;
        self.bytes_sent += data.len() as u64;
        Ok(())
    }

    fn stats(&self) -> Option<LinkStats> {
        let registry = self.network.registry();
        let pairing = self
            .token
            .and_then(|t| registry.pairings.get(&t))
            .filter(|p| p.connected)?;
        let own = match self.role {
            Role::Offerer => pairing.offerer.as_ref(),
            Role::Answerer => pairing.answerer.as_ref(),
        };
        Some(LinkStats {
            rtt: Some(self.rtt),
            bytes_sent: self.bytes_sent,
            bytes_received: own.map_or(0, |s| s.received),
            selected_candidate: self.candidates.first().copied(),
        })
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let Some(token) = self.token else { return };
        let mut registry = self.network.registry();
        let Some(pairing) = registry.pairings.get_mut(&token) else {
            return;
        };
        if let Some(side) = pairing.side(self.role) {
            side.open = false;
        }
        let connected = pairing.connected;
        if let Some(remote) = pairing.other(self.role).filter(|s| s.open) {
            if connected {
                remote.sink.emit(NegotiatorEvent::Closed);
            }
            return;
        }
        registry.pairings.remove(&token);
    }
}

impl Drop for LoopbackNegotiator {
    fn drop(&mut self) {
        self.close();
    }
}
