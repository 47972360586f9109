//! Strategy engine.
//!
//! Each strategy instance runs one engine task that owns the relay client,
//! the per-peer session map and every timer. Callers talk to it through
//! [`Engine`], which queues inputs and awaits one-shot replies; the
//! connect future of `initiate` resolves when the session connects, fails
//! or times out.
//!
//! Timers hang off a cancellation tree: engine token → session token →
//! negotiation timer. Cancelling the engine token releases everything.

use crate::context::SessionContext;
use crate::error::{DisconnectReason, LinkError, NegotiationFailure, Result};
use crate::event_log::LinkEvent;
use crate::handler::{PeerHandler, TransportChannel};
use crate::negotiator::{NegotiatorEvent, NegotiatorSink, PathNegotiator, Role};
use crate::strategy::StrategyKind;
use ghostlink_signal::relay::{EndpointPool, RelayClient, RelayClientConfig, RelayError, RelayEvent};
use ghostlink_signal::IceConfig;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

/// Relay and timing profile a strategy runs the engine with
pub(crate) struct StrategyProfile {
    pub kind: StrategyKind,
    pub endpoints: Vec<String>,
    pub relay: RelayClientConfig,
    pub ice: IceConfig,
    pub negotiation_timeout: Duration,
    /// Candidate gathering diagnostic deadline; `None` disables it
    pub gathering_timeout: Option<Duration>,
    pub stats_interval: Duration,
    /// Maps a primitive failure to the reason reported to the handler
    pub classify: fn(&NegotiationFailure) -> DisconnectReason,
}

/// Commands queued to the engine task
pub(crate) enum Input {
    Initiate {
        remote: String,
        handler: Arc<dyn PeerHandler>,
        reply: oneshot::Sender<Result<()>>,
    },
    Accept {
        src: String,
        signal: Value,
        handler: Arc<dyn PeerHandler>,
    },
    Send {
        data: Vec<u8>,
        reply: oneshot::Sender<usize>,
    },
    SendTo {
        session: u64,
        data: Vec<u8>,
    },
    CloseSession {
        session: u64,
    },
    ConnectedPeers {
        reply: oneshot::Sender<Vec<String>>,
    },
    Teardown {
        reply: oneshot::Sender<()>,
    },
}

enum Timer {
    Negotiation(u64),
    Gathering(u64),
    Stats(u64),
    Reconnected {
        attempt: u32,
        endpoint: String,
        result: std::result::Result<RelayClient, RelayError>,
    },
}

enum Step {
    Cancelled,
    Input(Option<Input>),
    Negotiator(u64, NegotiatorEvent),
    Relay(RelayEvent),
    Timer(Timer),
    RefreshIdentity,
}

/// Handle to a running engine task
#[derive(Debug)]
pub(crate) struct Engine {
    kind: StrategyKind,
    identity: String,
    inputs: mpsc::UnboundedSender<Input>,
    cancel: CancellationToken,
}

impl Engine {
    /// Connect to the relay pool and spawn the engine task
    ///
    /// With a single endpoint, that endpoint's own failure is returned
    /// rather than pool exhaustion.
    pub(crate) async fn start(
        ctx: &SessionContext,
        profile: StrategyProfile,
        identity: String,
        default_handler: Arc<dyn PeerHandler>,
    ) -> Result<Self> {
        let events = ctx.events();
        let (relay_tx, relay_rx) = mpsc::unbounded_channel();
        let mut pool = EndpointPool::new(profile.endpoints.iter().cloned());

        if let Some(endpoint) = pool.get_current() {
            events.record(LinkEvent::RelayConnecting {
                endpoint: endpoint.to_string(),
            });
        }

        let mut last_error = None;
        let connected = RelayClient::connect_with_pool(
            ctx.connector().as_ref(),
            &mut pool,
            &identity,
            &profile.relay,
            relay_tx.clone(),
            |endpoint, err| {
                events.record(LinkEvent::RelayEndpointFailed {
                    endpoint: endpoint.to_string(),
                    error: err.to_string(),
                });
                last_error = Some(err.clone());
            },
        )
        .await;

        let relay = match connected {
            Ok(relay) => relay,
            Err(RelayError::AllEndpointsExhausted) if pool.len() == 1 => {
                return Err(last_error.map_or(LinkError::AllEndpointsExhausted, LinkError::from));
            }
            Err(e) => return Err(e.into()),
        };

        tracing::info!(
            "{} strategy registered as {identity} on {}",
            profile.kind,
            relay.endpoint()
        );
        ctx.identity_store().save(&identity);
        ctx.diagnostics().set_relay_connected(true);
        events.record(LinkEvent::RelayOpen {
            endpoint: relay.endpoint().to_string(),
            identity: identity.clone(),
        });

        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let (negotiator_tx, negotiator_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let kind = profile.kind;

        let actor = Actor {
            ctx: ctx.clone(),
            profile,
            identity: identity.clone(),
            pool,
            relay: Some(relay),
            relay_tx,
            relay_rx,
            inputs: inputs_rx,
            inputs_tx: inputs_tx.downgrade(),
            negotiator_tx,
            negotiator_rx,
            timer_tx,
            timer_rx,
            sessions: HashMap::new(),
            peers: HashMap::new(),
            next_session: 0,
            reconnect_attempt: 0,
            default_handler,
            cancel: cancel.clone(),
        };
        tokio::spawn(actor.run());

        Ok(Self {
            kind,
            identity,
            inputs: inputs_tx,
            cancel,
        })
    }

    pub(crate) fn kind(&self) -> StrategyKind {
        self.kind
    }

    pub(crate) fn identity(&self) -> &str {
        &self.identity
    }

    pub(crate) async fn initiate(&self, remote: &str, handler: Arc<dyn PeerHandler>) -> Result<()> {
        let (reply, connected) = oneshot::channel();
        self.inputs
            .send(Input::Initiate {
                remote: remote.to_string(),
                handler,
                reply,
            })
            .map_err(|_| LinkError::TornDown)?;
        connected.await.map_err(|_| LinkError::TornDown)?
    }

    pub(crate) fn accept(&self, src: &str, signal: Value, handler: Arc<dyn PeerHandler>) -> Result<()> {
        self.inputs
            .send(Input::Accept {
                src: src.to_string(),
                signal,
                handler,
            })
            .map_err(|_| LinkError::TornDown)
    }

    pub(crate) async fn send(&self, data: &[u8]) -> Result<usize> {
        let (reply, sent) = oneshot::channel();
        self.inputs
            .send(Input::Send {
                data: data.to_vec(),
                reply,
            })
            .map_err(|_| LinkError::TornDown)?;
        sent.await.map_err(|_| LinkError::TornDown)
    }

    pub(crate) async fn connected_peers(&self) -> Vec<String> {
        let (reply, peers) = oneshot::channel();
        if self.inputs.send(Input::ConnectedPeers { reply }).is_err() {
            return Vec::new();
        }
        peers.await.unwrap_or_default()
    }

    /// Tear the engine down; later calls return immediately
    pub(crate) async fn teardown(&self) {
        let (reply, done) = oneshot::channel();
        if self.inputs.send(Input::Teardown { reply }).is_ok() {
            let _ = done.await;
        }
        self.cancel.cancel();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Per-peer negotiation state
struct Session {
    number: u64,
    negotiator: Box<dyn PathNegotiator>,
    handler: Arc<dyn PeerHandler>,
    /// Stops this session's timers
    cancel: CancellationToken,
    /// Child of `cancel`; stopped on connect
    negotiation_timer: CancellationToken,
    /// Set once on connect, never cleared
    established: bool,
    /// Disconnect already delivered to the handler
    reported: bool,
    candidates: u32,
    /// Connect future of `initiate`
    pending: Option<oneshot::Sender<Result<()>>>,
}

struct Actor {
    ctx: SessionContext,
    profile: StrategyProfile,
    identity: String,
    pool: EndpointPool,
    relay: Option<RelayClient>,
    relay_tx: mpsc::UnboundedSender<RelayEvent>,
    relay_rx: mpsc::UnboundedReceiver<RelayEvent>,
    inputs: mpsc::UnboundedReceiver<Input>,
    inputs_tx: mpsc::WeakUnboundedSender<Input>,
    negotiator_tx: mpsc::UnboundedSender<(u64, NegotiatorEvent)>,
    negotiator_rx: mpsc::UnboundedReceiver<(u64, NegotiatorEvent)>,
    timer_tx: mpsc::UnboundedSender<Timer>,
    timer_rx: mpsc::UnboundedReceiver<Timer>,
    sessions: HashMap<String, Session>,
    /// Session number → peer
    peers: HashMap<u64, String>,
    next_session: u64,
    reconnect_attempt: u32,
    default_handler: Arc<dyn PeerHandler>,
    cancel: CancellationToken,
}

impl Actor {
    async fn run(mut self) {
        // The identity lifetime only runs down while the relay is away
        let period = self.profile.relay.heartbeat_interval.max(Duration::from_secs(1));
        let mut refresh = time::interval_at(Instant::now() + period, period);
        refresh.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            let step = tokio::select! {
                biased;

                () = self.cancel.cancelled() => Step::Cancelled,
                Some((session, event)) = self.negotiator_rx.recv() => Step::Negotiator(session, event),
                Some(event) = self.relay_rx.recv() => Step::Relay(event),
                Some(timer) = self.timer_rx.recv() => Step::Timer(timer),
                _ = refresh.tick() => Step::RefreshIdentity,
                input = self.inputs.recv() => Step::Input(input),
            };

            match step {
                Step::Cancelled | Step::Input(None) => {
                    self.shutdown().await;
                    return;
                }
                Step::Input(Some(Input::Teardown { reply })) => {
                    self.shutdown().await;
                    let _ = reply.send(());
                    return;
                }
                Step::Input(Some(input)) => self.handle_input(input),
                Step::Negotiator(session, event) => self.handle_negotiator(session, event),
                Step::Relay(event) => self.handle_relay(event),
                Step::Timer(timer) => self.handle_timer(timer),
                Step::RefreshIdentity => {
                    if self.relay.is_some() {
                        self.ctx.identity_store().save(&self.identity);
                    }
                }
            }
        }
    }

    fn handle_input(&mut self, input: Input) {
        match input {
            Input::Initiate {
                remote,
                handler,
                reply,
            } => {
                if self.sessions.contains_key(&remote) {
                    let _ = reply.send(Err(LinkError::SessionExists(remote)));
                    return;
                }
                if self.relay.is_none() {
                    let _ = reply.send(Err(LinkError::Relay(RelayError::Closed)));
                    return;
                }
                self.open_session(remote, Role::Offerer, handler, Some(reply));
            }
            Input::Accept {
                src,
                signal,
                handler,
            } => self.handle_signal(src, signal, handler),
            Input::Send { data, reply } => {
                let _ = reply.send(self.broadcast(&data));
            }
            Input::SendTo { session, data } => self.send_to(session, &data),
            Input::CloseSession { session } => self.close_session(session),
            Input::ConnectedPeers { reply } => {
                let mut peers: Vec<String> = self
                    .sessions
                    .iter()
                    .filter(|(_, s)| s.established)
                    .map(|(peer, _)| peer.clone())
                    .collect();
                peers.sort();
                let _ = reply.send(peers);
            }
            Input::Teardown { reply } => {
                // run() intercepts teardown before dispatch
                let _ = reply.send(());
            }
        }
    }

    fn open_session(
        &mut self,
        peer: String,
        role: Role,
        handler: Arc<dyn PeerHandler>,
        pending: Option<oneshot::Sender<Result<()>>>,
    ) -> u64 {
        self.next_session += 1;
        let number = self.next_session;

        let sink = NegotiatorSink::new(number, self.negotiator_tx.clone());
        let negotiator = self.ctx.negotiators().create(role, &self.profile.ice, sink);

        let cancel = self.cancel.child_token();
        let negotiation_timer = cancel.child_token();
        self.spawn_timer(
            negotiation_timer.clone(),
            self.profile.negotiation_timeout,
            Timer::Negotiation(number),
        );
        if let Some(after) = self.profile.gathering_timeout {
            self.spawn_timer(cancel.clone(), after, Timer::Gathering(number));
        }

        tracing::info!("Session {number} with {peer} created as {role:?}");
        self.ctx.events().record(LinkEvent::SessionCreated {
            peer: peer.clone(),
            role,
        });

        self.peers.insert(number, peer.clone());
        self.sessions.insert(
            peer,
            Session {
                number,
                negotiator,
                handler,
                cancel,
                negotiation_timer,
                established: false,
                reported: false,
                candidates: 0,
                pending,
            },
        );
        number
    }

    /// Apply a remote signal, creating one answering session for a new sender
    fn handle_signal(&mut self, src: String, signal: Value, handler: Arc<dyn PeerHandler>) {
        if !self.sessions.contains_key(&src) {
            self.open_session(src.clone(), Role::Answerer, handler, None);
        }

        let Some(session) = self.sessions.get_mut(&src) else {
            return;
        };
        if let Err(failure) = session.negotiator.apply_remote(signal) {
            tracing::warn!("Signal from {src} rejected: {failure}");
            self.fail(&src, failure);
        }
    }

    fn handle_negotiator(&mut self, number: u64, event: NegotiatorEvent) {
        let Some(peer) = self.peers.get(&number).cloned() else {
            tracing::trace!("Dropping event for finished session {number}");
            return;
        };

        match event {
            NegotiatorEvent::LocalSignal(signal) => match &self.relay {
                Some(relay) => {
                    if let Err(e) = relay.send_signal(&peer, signal) {
                        tracing::warn!("Failed to relay signal to {peer}: {e}");
                    }
                }
                None => tracing::warn!("Relay down, dropping signal for {peer}"),
            },
            NegotiatorEvent::CandidateGathered(line) => {
                let kind = self.ctx.diagnostics().record_candidate(&line);
                if let Some(session) = self.sessions.get_mut(&peer) {
                    session.candidates += 1;
                }
                self.ctx.events().record(LinkEvent::CandidateGathered { peer, kind });
            }
            NegotiatorEvent::GatheringComplete => {
                tracing::debug!("Candidate gathering complete for {peer}");
            }
            NegotiatorEvent::Connected => self.on_connected(&peer),
            NegotiatorEvent::Data(data) => {
                self.ctx.diagnostics().record_received(data.len());
                if let Some(session) = self.sessions.get(&peer) {
                    session.handler.on_message(&peer, &data);
                }
            }
            NegotiatorEvent::Closed => {
                let established = self.sessions.get(&peer).is_some_and(|s| s.established);
                let reason = if established {
                    DisconnectReason::PeerLeft
                } else {
                    DisconnectReason::ConnectionFailed
                };
                self.finish(&peer, reason, LinkError::PeerLeft);
            }
            NegotiatorEvent::Failed(failure) => self.fail(&peer, failure),
        }
    }

    fn on_connected(&mut self, peer: &str) {
        let Some(session) = self.sessions.get_mut(peer) else {
            return;
        };
        if session.established {
            return;
        }
        session.established = true;
        session.negotiation_timer.cancel();

        let number = session.number;
        let handler = session.handler.clone();
        let pending = session.pending.take();
        let timers = session.cancel.clone();

        tracing::info!("Connected to {peer}");
        self.spawn_stats(timers, number);
        self.ctx.diagnostics().set_p2p_connected(true);
        self.ctx.events().record(LinkEvent::Connected {
            peer: peer.to_string(),
        });

        if let Some(inputs) = self.inputs_tx.upgrade() {
            handler.on_connect(TransportChannel::new(peer.to_string(), number, inputs));
        }
        if let Some(pending) = pending {
            let _ = pending.send(Ok(()));
        }
    }

    fn fail(&mut self, peer: &str, failure: NegotiationFailure) {
        let reason = (self.profile.classify)(&failure);
        tracing::warn!("Negotiation with {peer} failed: {failure}");
        self.finish(peer, reason, LinkError::Negotiation(failure));
    }

    /// End a session: stop its timers, close the primitive, report once
    fn finish(&mut self, peer: &str, reason: DisconnectReason, error: LinkError) {
        let Some(mut session) = self.sessions.remove(peer) else {
            return;
        };
        self.peers.remove(&session.number);
        session.cancel.cancel();
        session.negotiator.close();
        self.ctx.diagnostics().forget_peer(peer);

        tracing::info!("Session with {peer} ended: {reason}");
        // A live initiate learns the failure from its connect future only
        let pending = session.pending.take().filter(|p| !p.is_closed());
        if !session.reported {
            session.reported = true;
            if pending.is_none() {
                session.handler.on_disconnect(peer, reason);
            }
            self.ctx.events().record(LinkEvent::Disconnected {
                peer: peer.to_string(),
                reason,
            });
        }
        if let Some(pending) = pending {
            let _ = pending.send(Err(error));
        }
        self.refresh_p2p();
    }

    fn close_session(&mut self, number: u64) {
        let Some(peer) = self.peers.remove(&number) else {
            return;
        };
        if let Some(mut session) = self.sessions.remove(&peer) {
            tracing::debug!("Closing session with {peer} locally");
            session.cancel.cancel();
            session.negotiator.close();
            self.ctx.diagnostics().forget_peer(&peer);
        }
        self.refresh_p2p();
    }

    fn refresh_p2p(&self) {
        let any = self.sessions.values().any(|s| s.established);
        self.ctx.diagnostics().set_p2p_connected(any);
    }

    fn send_to(&mut self, number: u64, data: &[u8]) {
        let Some(session) = self
            .peers
            .get(&number)
            .and_then(|peer| self.sessions.get_mut(peer))
            .filter(|s| s.established)
        else {
            tracing::debug!("Dropping {} bytes for closed session {number}", data.len());
            return;
        };
        match session.negotiator.send(data) {
            Ok(()) => self.ctx.diagnostics().record_sent(data.len()),
            Err(e) => tracing::warn!("Send on session {number} failed: {e}"),
        }
    }

    fn broadcast(&mut self, data: &[u8]) -> usize {
        let mut reached = 0;
        for (peer, session) in self.sessions.iter_mut().filter(|(_, s)| s.established) {
            match session.negotiator.send(data) {
                Ok(()) => {
                    reached += 1;
                    self.ctx.diagnostics().record_sent(data.len());
                }
                Err(e) => tracing::warn!("Send to {peer} failed: {e}"),
            }
        }
        reached
    }

    fn handle_relay(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Signal { src, signal } => {
                let handler = self.default_handler.clone();
                self.handle_signal(src, signal, handler);
            }
            RelayEvent::Closed => self.on_relay_closed(),
        }
    }

    fn on_relay_closed(&mut self) {
        tracing::warn!("Relay link closed");
        self.relay = None;
        self.ctx.diagnostics().set_relay_connected(false);
        self.ctx.events().record(LinkEvent::RelayClosed);

        if self.sessions.is_empty() {
            self.schedule_reconnect();
            return;
        }

        let peers: Vec<String> = self.sessions.keys().cloned().collect();
        for peer in peers {
            let Some(session) = self.sessions.get_mut(&peer) else {
                continue;
            };
            if !session.established {
                self.finish(
                    &peer,
                    DisconnectReason::ConnectionFailed,
                    LinkError::RelayClosedBeforeEstablished,
                );
            } else if !session.reported {
                // The path itself stays up until the primitive reports otherwise
                session.reported = true;
                session.handler.on_disconnect(&peer, DisconnectReason::PeerLeft);
                self.ctx.events().record(LinkEvent::Disconnected {
                    peer,
                    reason: DisconnectReason::PeerLeft,
                });
            }
        }
    }

    /// Reconnect an idle relay link under the same identity, with backoff
    fn schedule_reconnect(&mut self) {
        let timeouts = *self.ctx.timeouts();
        let attempt = self.reconnect_attempt + 1;
        if attempt > timeouts.reconnect_attempts {
            if timeouts.reconnect_attempts > 0 {
                tracing::warn!("Relay reconnect gave up after {} attempts", timeouts.reconnect_attempts);
            }
            return;
        }
        if !self.ctx.identity_store().is_current(&self.identity) {
            tracing::info!("Session identity {} expired, not reconnecting", self.identity);
            return;
        }
        if self.pool.get_current().is_none() {
            // Every endpoint failed this round; start over from the top
            self.pool.reset();
        }
        let Some(endpoint) = self.pool.get_current().map(str::to_owned) else {
            return;
        };

        self.reconnect_attempt = attempt;
        let delay = timeouts.reconnect_delay(attempt);
        tracing::info!("Reconnecting to {endpoint} in {delay:?} (attempt {attempt})");
        self.ctx.events().record(LinkEvent::RelayReconnect { attempt });

        let connector = self.ctx.connector().clone();
        let identity = self.identity.clone();
        let config = self.profile.relay.clone();
        let events = self.relay_tx.clone();
        let timers = self.timer_tx.clone();
        let cancel = self.cancel.child_token();

        tokio::spawn(async move {
            let reconnect = async {
                time::sleep(delay).await;
                RelayClient::connect(connector.as_ref(), &endpoint, &identity, &config, events).await
            };
            tokio::select! {
                () = cancel.cancelled() => {}
                result = reconnect => {
                    let _ = timers.send(Timer::Reconnected { attempt, endpoint, result });
                }
            }
        });
    }

    fn handle_timer(&mut self, timer: Timer) {
        match timer {
            Timer::Negotiation(number) => {
                let Some(peer) = self.peers.get(&number).cloned() else {
                    return;
                };
                if self.sessions.get(&peer).is_some_and(|s| !s.established) {
                    let timeout = self.profile.negotiation_timeout;
                    tracing::warn!("Negotiation with {peer} timed out after {timeout:?}");
                    self.finish(
                        &peer,
                        DisconnectReason::ConnectionTimeout,
                        LinkError::NegotiationTimeout(timeout),
                    );
                }
            }
            Timer::Gathering(number) => {
                let Some(peer) = self.peers.get(&number).cloned() else {
                    return;
                };
                if self.sessions.get(&peer).is_some_and(|s| s.candidates == 0) {
                    tracing::warn!("No candidates gathered for {peer}; check firewall settings");
                    self.ctx.events().record(LinkEvent::GatheringTimeout { peer });
                }
            }
            Timer::Stats(number) => {
                let Some(peer) = self.peers.get(&number) else {
                    return;
                };
                let stats = self.sessions.get(peer).and_then(|s| s.negotiator.stats());
                if let Some(stats) = stats {
                    self.ctx.diagnostics().record_stats(peer, &stats);
                }
            }
            Timer::Reconnected {
                attempt,
                endpoint,
                result,
            } => match result {
                Ok(relay) => {
                    tracing::info!("Relay reconnected to {endpoint} on attempt {attempt}");
                    self.ctx.identity_store().save(&self.identity);
                    self.ctx.diagnostics().set_relay_connected(true);
                    self.ctx.events().record(LinkEvent::RelayOpen {
                        endpoint: relay.endpoint().to_string(),
                        identity: self.identity.clone(),
                    });
                    self.relay = Some(relay);
                    self.reconnect_attempt = 0;
                }
                Err(e) => {
                    tracing::warn!("Relay reconnect attempt {attempt} to {endpoint} failed: {e}");
                    self.ctx.events().record(LinkEvent::RelayEndpointFailed {
                        endpoint: endpoint.clone(),
                        error: e.to_string(),
                    });
                    self.pool.mark_failed(&endpoint);
                    self.pool.advance();
                    self.schedule_reconnect();
                }
            },
        }
    }

    fn spawn_timer(&self, token: CancellationToken, after: Duration, timer: Timer) {
        let timers = self.timer_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = time::sleep(after) => {
                    let _ = timers.send(timer);
                }
            }
        });
    }

    fn spawn_stats(&self, token: CancellationToken, number: u64) {
        let period = self.profile.stats_interval;
        let timers = self.timer_tx.clone();
        tokio::spawn(async move {
            let mut ticks = time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticks.tick() => {
                        if timers.send(Timer::Stats(number)).is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Release every session and the relay link; nothing is reported
    async fn shutdown(&mut self) {
        self.cancel.cancel();

        for (peer, mut session) in self.sessions.drain() {
            session.negotiator.close();
            self.ctx.diagnostics().forget_peer(&peer);
            if let Some(pending) = session.pending.take() {
                let _ = pending.send(Err(LinkError::TornDown));
            }
            tracing::debug!("Released session with {peer}");
        }
        self.peers.clear();

        if let Some(relay) = self.relay.take() {
            relay.close().await;
        }
        self.ctx.identity_store().clear();
        self.ctx.diagnostics().set_relay_connected(false);
        self.ctx.diagnostics().set_p2p_connected(false);
        self.ctx.events().record(LinkEvent::TornDown {
            kind: self.profile.kind,
        });
        tracing::info!("{} strategy torn down", self.profile.kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimeoutTable;
    use crate::device::DeviceClass;
    use crate::loopback::{LoopbackBehavior, LoopbackNetwork};
    use crate::negotiator::NegotiatorFactory;
    use ghostlink_signal::relay::MemoryRelay;
    use serde_json::json;
    use std::sync::Mutex;

    const RELAY: &str = "mem://relay";

    #[derive(Default)]
    struct Recorder {
        connects: Mutex<Vec<TransportChannel>>,
        messages: Mutex<Vec<(String, Vec<u8>)>>,
        disconnects: Mutex<Vec<(String, DisconnectReason)>>,
    }

    impl PeerHandler for Recorder {
        fn on_connect(&self, channel: TransportChannel) {
            self.connects.lock().unwrap().push(channel);
        }

        fn on_message(&self, peer: &str, data: &[u8]) {
            self.messages.lock().unwrap().push((peer.to_string(), data.to_vec()));
        }

        fn on_disconnect(&self, peer: &str, reason: DisconnectReason) {
            self.disconnects.lock().unwrap().push((peer.to_string(), reason));
        }
    }

    impl Recorder {
        fn connect_count(&self) -> usize {
            self.connects.lock().unwrap().len()
        }

        fn disconnects(&self) -> Vec<(String, DisconnectReason)> {
            self.disconnects.lock().unwrap().clone()
        }
    }

    fn context(relay: &MemoryRelay, factory: impl NegotiatorFactory + 'static, device: DeviceClass) -> SessionContext {
        SessionContext::builder()
            .device(device)
            .connector(Arc::new(relay.clone()))
            .negotiators(Arc::new(factory))
            .build()
            .unwrap()
    }

    fn profile(ctx: &SessionContext) -> StrategyProfile {
        let t = ctx.timeouts();
        StrategyProfile {
            kind: StrategyKind::Direct,
            endpoints: vec![RELAY.to_string()],
            relay: RelayClientConfig {
                open_timeout: t.relay_open,
                heartbeat_interval: t.relay_heartbeat,
                ..Default::default()
            },
            ice: ctx.ice_config(),
            negotiation_timeout: t.negotiation,
            gathering_timeout: Some(t.gathering),
            stats_interval: t.stats_interval,
            classify: |_| DisconnectReason::NetworkError,
        }
    }

    async fn start(ctx: &SessionContext, id: &str, handler: Arc<Recorder>) -> Engine {
        ctx.identity_store().save(id);
        Engine::start(ctx, profile(ctx), id.to_string(), handler)
            .await
            .unwrap()
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_initiate_connects_both_sides() {
        let relay = MemoryRelay::new();
        relay.serve(RELAY);
        let network = LoopbackNetwork::new();

        let a_ctx = context(&relay, network.factory(), DeviceClass::Desktop);
        let b_ctx = context(&relay, network.factory(), DeviceClass::Desktop);
        let a_handler = Arc::new(Recorder::default());
        let b_handler = Arc::new(Recorder::default());
        let a = start(&a_ctx, "alice", a_handler.clone()).await;
        let b = start(&b_ctx, "bob", b_handler.clone()).await;

        a.initiate("bob", a_handler.clone()).await.unwrap();
        settle().await;

        assert_eq!(a_handler.connect_count(), 1);
        assert_eq!(b_handler.connect_count(), 1);
        assert_eq!(a.connected_peers().await, vec!["bob".to_string()]);
        assert_eq!(b.connected_peers().await, vec!["alice".to_string()]);
        assert_eq!(a.send(b"hi").await.unwrap(), 1);
        settle().await;
        assert_eq!(
            b_handler.messages.lock().unwrap().clone(),
            vec![("alice".to_string(), b"hi".to_vec())]
        );
        assert!(a_ctx.diagnostics().snapshot().p2p_connected);
        assert!(a_ctx.diagnostics().snapshot().candidates.total() > 0);

        time::sleep(a_ctx.timeouts().stats_interval + Duration::from_millis(10)).await;
        settle().await;
        let snap = a_ctx.diagnostics().snapshot();
        assert!(snap.quality_of("bob").is_some());
        assert_eq!(snap.peer_latency.len(), 1);

        a.teardown().await;
        assert!(a_ctx.diagnostics().snapshot().peer_latency.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_initiate_rejected() {
        let relay = MemoryRelay::new();
        relay.serve(RELAY);
        let network = LoopbackNetwork::new();
        let a_ctx = context(
            &relay,
            network.factory().with_behavior(LoopbackBehavior::Stall),
            DeviceClass::Desktop,
        );
        let handler = Arc::new(Recorder::default());
        let a = Arc::new(start(&a_ctx, "alice", handler.clone()).await);

        let first = {
            let a = a.clone();
            let handler = handler.clone();
            tokio::spawn(async move { a.initiate("bob", handler).await })
        };
        settle().await;
        let second = a.initiate("bob", handler.clone()).await;
        assert_eq!(second, Err(LinkError::SessionExists("bob".to_string())));
        a.teardown().await;
        assert_eq!(first.await.unwrap(), Err(LinkError::TornDown));
    }

    #[tokio::test(start_paused = true)]
    async fn test_signals_from_new_sender_create_one_session() {
        let relay = MemoryRelay::new();
        relay.serve(RELAY);
        let network = LoopbackNetwork::new();
        let ctx = context(&relay, network.factory(), DeviceClass::Desktop);
        let _b = start(&ctx, "bob", Arc::new(Recorder::default())).await;

        let (tx, _rx) = mpsc::unbounded_channel();
        let carol = RelayClient::connect(&relay, RELAY, "carol", &RelayClientConfig::default(), tx)
            .await
            .unwrap();
        let candidate = json!({"type": "candidate", "candidate": "candidate:1 1 udp 1 10.0.0.1 9 typ host"});
        carol.send_signal("bob", candidate.clone()).unwrap();
        carol.send_signal("bob", candidate).unwrap();
        settle().await;

        let created = ctx
            .events()
            .snapshot()
            .into_iter()
            .filter(|e| matches!(&e.event, LinkEvent::SessionCreated { peer, role: Role::Answerer } if peer == "carol"))
            .count();
        assert_eq!(created, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_negotiation_timeout() {
        let relay = MemoryRelay::new();
        relay.serve(RELAY);
        let network = LoopbackNetwork::new();
        let ctx = context(
            &relay,
            network.factory().with_behavior(LoopbackBehavior::Stall),
            DeviceClass::Desktop,
        );
        let handler = Arc::new(Recorder::default());
        let a = start(&ctx, "alice", handler.clone()).await;

        let started = Instant::now();
        let result = a.initiate("nobody", handler.clone()).await;
        let timeout = TimeoutTable::for_device(DeviceClass::Desktop).negotiation;
        assert_eq!(result, Err(LinkError::NegotiationTimeout(timeout)));
        assert!(started.elapsed() >= timeout);
        assert!(handler.disconnects().is_empty());
        assert!(ctx.events().any(|e| *e
            == LinkEvent::Disconnected {
                peer: "nobody".to_string(),
                reason: DisconnectReason::ConnectionTimeout,
            }));
        assert!(ctx.events().any(|e| matches!(e, LinkEvent::GatheringTimeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_classified_by_profile() {
        let relay = MemoryRelay::new();
        relay.serve(RELAY);
        let network = LoopbackNetwork::new();
        let a_ctx = context(&relay, network.factory(), DeviceClass::Desktop);
        let b_ctx = context(
            &relay,
            network
                .factory()
                .with_behavior(LoopbackBehavior::Fail(NegotiationFailure::IceFailed)),
            DeviceClass::Desktop,
        );
        let b_handler = Arc::new(Recorder::default());
        let a = start(&a_ctx, "alice", Arc::new(Recorder::default())).await;
        let _b = start(&b_ctx, "bob", b_handler.clone()).await;

        let pending = tokio::spawn(async move {
            let result = a.initiate("bob", Arc::new(Recorder::default())).await;
            (a, result)
        });
        settle().await;
        assert_eq!(
            b_handler.disconnects(),
            vec![("alice".to_string(), DisconnectReason::NetworkError)]
        );
        pending.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_close_before_established() {
        let relay = MemoryRelay::new();
        relay.serve(RELAY);
        let network = LoopbackNetwork::new();
        let ctx = context(
            &relay,
            network.factory().with_behavior(LoopbackBehavior::Stall),
            DeviceClass::Desktop,
        );
        let handler = Arc::new(Recorder::default());
        let a = Arc::new(start(&ctx, "alice", handler.clone()).await);

        let pending = {
            let a = a.clone();
            let handler = handler.clone();
            tokio::spawn(async move { a.initiate("bob", handler).await })
        };
        settle().await;
        assert!(relay.drop_session(RELAY, "alice").await);

        assert_eq!(
            pending.await.unwrap(),
            Err(LinkError::RelayClosedBeforeEstablished)
        );
        assert!(handler.disconnects().is_empty());
        assert!(ctx.events().any(|e| *e
            == LinkEvent::Disconnected {
                peer: "bob".to_string(),
                reason: DisconnectReason::ConnectionFailed,
            }));
        assert!(!ctx.diagnostics().snapshot().relay_connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_initiate_reports_disconnect() {
        let relay = MemoryRelay::new();
        relay.serve(RELAY);
        let network = LoopbackNetwork::new();
        let ctx = context(
            &relay,
            network.factory().with_behavior(LoopbackBehavior::Stall),
            DeviceClass::Desktop,
        );
        let handler = Arc::new(Recorder::default());
        let a = Arc::new(start(&ctx, "alice", handler.clone()).await);

        let pending = {
            let a = a.clone();
            let handler = handler.clone();
            tokio::spawn(async move { a.initiate("bob", handler).await })
        };
        settle().await;
        pending.abort();
        settle().await;

        // Nobody awaits the connect future, so the handler hears about it
        time::sleep(TimeoutTable::for_device(DeviceClass::Desktop).negotiation).await;
        settle().await;
        assert_eq!(
            handler.disconnects(),
            vec![("bob".to_string(), DisconnectReason::ConnectionTimeout)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_close_after_established_reports_once() {
        let relay = MemoryRelay::new();
        relay.serve(RELAY);
        let network = LoopbackNetwork::new();
        let a_ctx = context(&relay, network.factory(), DeviceClass::Desktop);
        let b_ctx = context(&relay, network.factory(), DeviceClass::Desktop);
        let a_handler = Arc::new(Recorder::default());
        let a = start(&a_ctx, "alice", a_handler.clone()).await;
        let b = start(&b_ctx, "bob", Arc::new(Recorder::default())).await;

        a.initiate("bob", a_handler.clone()).await.unwrap();
        relay.drop_session(RELAY, "alice").await;
        settle().await;
        assert_eq!(
            a_handler.disconnects(),
            vec![("bob".to_string(), DisconnectReason::PeerLeft)]
        );

        b.teardown().await;
        settle().await;
        assert_eq!(a_handler.disconnects().len(), 1);
        assert!(a.connected_peers().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_reconnect_on_handheld() {
        let relay = MemoryRelay::new();
        relay.serve(RELAY);
        let ctx = context(&relay, LoopbackNetwork::new().factory(), DeviceClass::Handheld);
        let _a = start(&ctx, "alice", Arc::new(Recorder::default())).await;

        relay.drop_session(RELAY, "alice").await;
        time::sleep(Duration::from_secs(3)).await;
        settle().await;

        assert_eq!(relay.attempts(RELAY), 2);
        assert!(ctx.events().any(|e| *e == LinkEvent::RelayReconnect { attempt: 1 }));
        assert!(ctx.diagnostics().snapshot().relay_connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_reconnect_after_long_uptime() {
        let relay = MemoryRelay::new();
        relay.serve(RELAY);
        let ctx = context(&relay, LoopbackNetwork::new().factory(), DeviceClass::Handheld);
        let _a = start(&ctx, "alice", Arc::new(Recorder::default())).await;

        // Connected well past the identity lifetime
        time::sleep(ctx.timeouts().identity_ttl + Duration::from_secs(60)).await;
        assert!(ctx.identity_store().is_current("alice"));

        relay.drop_session(RELAY, "alice").await;
        time::sleep(Duration::from_secs(3)).await;
        settle().await;

        assert_eq!(relay.attempts(RELAY), 2);
        assert!(ctx.diagnostics().snapshot().relay_connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_reconnect_moves_to_next_endpoint() {
        let relay = MemoryRelay::new();
        relay.serve("mem://a");
        relay.serve("mem://b");
        let ctx = context(&relay, LoopbackNetwork::new().factory(), DeviceClass::Handheld);
        ctx.identity_store().save("alice");
        let mut profile = profile(&ctx);
        profile.endpoints = vec!["mem://a".to_string(), "mem://b".to_string()];
        let _a = Engine::start(&ctx, profile, "alice".to_string(), Arc::new(Recorder::default()))
            .await
            .unwrap();

        assert!(relay.drop_session("mem://a", "alice").await);
        relay.refuse("mem://a");

        let t = ctx.timeouts();
        time::sleep(t.reconnect_delay(1) + t.reconnect_delay(2) + Duration::from_millis(100)).await;
        settle().await;

        assert_eq!(relay.attempts("mem://a"), 2);
        assert_eq!(relay.attempts("mem://b"), 1);
        assert!(ctx.events().any(|e| matches!(
            e,
            LinkEvent::RelayOpen { endpoint, .. } if endpoint == "mem://b"
        )));
        assert!(ctx.diagnostics().snapshot().relay_connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_idle_reconnect_on_desktop() {
        let relay = MemoryRelay::new();
        relay.serve(RELAY);
        let ctx = context(&relay, LoopbackNetwork::new().factory(), DeviceClass::Desktop);
        let _a = start(&ctx, "alice", Arc::new(Recorder::default())).await;

        relay.drop_session(RELAY, "alice").await;
        time::sleep(Duration::from_secs(30)).await;
        assert_eq!(relay.attempts(RELAY), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_endpoint_timeout_surfaces() {
        let relay = MemoryRelay::new();
        let ctx = context(&relay, LoopbackNetwork::new().factory(), DeviceClass::Desktop);
        let result = Engine::start(&ctx, profile(&ctx), "alice".to_string(), Arc::new(Recorder::default())).await;
        assert_eq!(result.err(), Some(LinkError::RelayConnectTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_idempotent() {
        let relay = MemoryRelay::new();
        relay.serve(RELAY);
        let ctx = context(&relay, LoopbackNetwork::new().factory(), DeviceClass::Desktop);
        let a = start(&ctx, "alice", Arc::new(Recorder::default())).await;

        a.teardown().await;
        a.teardown().await;
        assert_eq!(a.send(b"x").await, Err(LinkError::TornDown));
        assert_eq!(ctx.identity_store().load(), None);
        let torn_down = ctx
            .events()
            .snapshot()
            .into_iter()
            .filter(|e| matches!(e.event, LinkEvent::TornDown { .. }))
            .count();
        assert_eq!(torn_down, 1);
    }
}
