//! Relay session client.
//!
//! Owns one live link to a relay endpoint. The client waits for `OPEN`
//! within the open timeout, sends a `PING` immediately after, then keeps
//! pinging on the heartbeat interval until closed. Inbound `SIGNAL`
//! envelopes are surfaced as [`RelayEvent`]s keyed by sender identity.

use super::link::{RelayConnector, RelayLink};
use super::pool::EndpointPool;
use super::protocol::{ConnectParams, Envelope, RelayError, SERVICE_TAG};
use super::{DEFAULT_TOKEN, RELAY_HEARTBEAT_INTERVAL, RELAY_OPEN_TIMEOUT};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Relay client state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayClientState {
    /// Waiting for `OPEN`
    Connecting,
    /// Open and heartbeating
    Open,
    /// Closed by either side
    Closed,
}

/// Events surfaced to the owner of a relay client
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    /// `SIGNAL` from `src`
    Signal {
        /// Sender session identity
        src: String,
        /// Opaque payload
        signal: Value,
    },
    /// Relay side closed the link
    Closed,
}

/// Relay client configuration
#[derive(Debug, Clone)]
pub struct RelayClientConfig {
    /// Time allowed between connect and `OPEN`
    pub open_timeout: Duration,
    /// Interval between heartbeat pings
    pub heartbeat_interval: Duration,
    /// Opaque auth token
    pub token: String,
    /// Service tag
    pub service_tag: String,
}

impl Default for RelayClientConfig {
    fn default() -> Self {
        Self {
            open_timeout: RELAY_OPEN_TIMEOUT,
            heartbeat_interval: RELAY_HEARTBEAT_INTERVAL,
            token: DEFAULT_TOKEN.to_string(),
            service_tag: SERVICE_TAG.to_string(),
        }
    }
}

/// Relay session client
#[derive(Debug)]
pub struct RelayClient {
    /// Endpoint this client is connected to
    endpoint: String,
    /// Local session identity
    session_id: String,
    /// Envelopes handed to the driver task
    commands: mpsc::UnboundedSender<Envelope>,
    /// Current client state
    state: Arc<Mutex<RelayClientState>>,
    /// Stops the driver task
    cancel: CancellationToken,
}

impl RelayClient {
    /// Connect to a single relay endpoint
    ///
    /// Resolves once `OPEN` is received. Inbound signals and the relay-side
    /// close are delivered on `events`.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Timeout`] if `OPEN` does not arrive within
    /// `config.open_timeout`, or the transport error.
    pub async fn connect(
        connector: &dyn RelayConnector,
        endpoint: &str,
        session_id: &str,
        config: &RelayClientConfig,
        events: mpsc::UnboundedSender<RelayEvent>,
    ) -> Result<Self, RelayError> {
        let params = ConnectParams::new(&config.service_tag, session_id, &config.token);
        tracing::debug!("Connecting to relay {endpoint} as {session_id}");

        let link = time::timeout(config.open_timeout, open_link(connector, endpoint, &params))
            .await
            .map_err(|_| RelayError::Timeout)??;

        tracing::info!("Relay {endpoint} open for {session_id}");
        link.outbound
            .send(Envelope::Ping)
            .map_err(|_| RelayError::Closed)?;

        let (commands, command_rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(RelayClientState::Open));
        let cancel = CancellationToken::new();

        tokio::spawn(drive(
            link.outbound,
            link.inbound,
            command_rx,
            events,
            state.clone(),
            cancel.clone(),
            config.heartbeat_interval,
        ));

        Ok(Self {
            endpoint: endpoint.to_string(),
            session_id: session_id.to_string(),
            commands,
            state,
            cancel,
        })
    }

    /// Connect using the pool, failing over between endpoints
    ///
    /// Each failed endpoint is marked failed and the pool advances.
    /// `on_endpoint_failed` is called for every failure.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::AllEndpointsExhausted`] when no endpoint
    /// remains.
    pub async fn connect_with_pool<F>(
        connector: &dyn RelayConnector,
        pool: &mut EndpointPool,
        session_id: &str,
        config: &RelayClientConfig,
        events: mpsc::UnboundedSender<RelayEvent>,
        mut on_endpoint_failed: F,
    ) -> Result<Self, RelayError>
    where
        F: FnMut(&str, &RelayError),
    {
        loop {
            let Some(endpoint) = pool.get_current().map(str::to_owned) else {
                return Err(RelayError::AllEndpointsExhausted);
            };

            match Self::connect(connector, &endpoint, session_id, config, events.clone()).await {
                Ok(client) => return Ok(client),
                Err(e) => {
                    tracing::warn!("Relay endpoint {endpoint} failed: {e}");
                    on_endpoint_failed(&endpoint, &e);
                    pool.mark_failed(&endpoint);
                    if pool.advance().is_none() {
                        return Err(RelayError::AllEndpointsExhausted);
                    }
                }
            }
        }
    }

    /// Send a `SIGNAL` to `dst`
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Closed`] if the client is closed.
    pub fn send_signal(&self, dst: &str, signal: Value) -> Result<(), RelayError> {
        self.send(Envelope::signal(&self.session_id, dst, signal))
    }

    /// Send a raw envelope
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Closed`] if the client is closed.
    pub fn send(&self, envelope: Envelope) -> Result<(), RelayError> {
        if self.cancel.is_cancelled() {
            return Err(RelayError::Closed);
        }
        self.commands.send(envelope).map_err(|_| RelayError::Closed)
    }

    /// Close the client; idempotent
    ///
    /// No [`RelayEvent::Closed`] is emitted for a local close.
    pub async fn close(&self) {
        self.cancel.cancel();
        *self.state.lock().await = RelayClientState::Closed;
    }

    /// Get current client state
    pub async fn state(&self) -> RelayClientState {
        *self.state.lock().await
    }

    /// Endpoint this client is connected to
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Local session identity
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Connect and wait for `OPEN`
async fn open_link(
    connector: &dyn RelayConnector,
    endpoint: &str,
    params: &ConnectParams,
) -> Result<RelayLink, RelayError> {
    let mut link = connector.connect(endpoint, params).await?;
    loop {
        match link.inbound.recv().await {
            Some(Envelope::Open) => return Ok(link),
            Some(other) => tracing::trace!("Ignoring {} before OPEN", other.message_type()),
            None => return Err(RelayError::Closed),
        }
    }
}

/// Driver loop: heartbeat, outbound commands, inbound routing
async fn drive(
    outbound: mpsc::UnboundedSender<Envelope>,
    mut inbound: mpsc::UnboundedReceiver<Envelope>,
    mut commands: mpsc::UnboundedReceiver<Envelope>,
    events: mpsc::UnboundedSender<RelayEvent>,
    state: Arc<Mutex<RelayClientState>>,
    cancel: CancellationToken,
    period: Duration,
) {
    let mut heartbeat = time::interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => break,

            _ = heartbeat.tick() => {
                tracing::trace!("Relay heartbeat");
                if outbound.send(Envelope::Ping).is_err() {
                    break;
                }
            }

            cmd = commands.recv() => {
                let Some(env) = cmd else { break };
                if outbound.send(env).is_err() {
                    break;
                }
            }

            env = inbound.recv() => match env {
                Some(Envelope::Pong) => tracing::trace!("Relay PONG"),
                Some(Envelope::Signal { src: Some(src), signal, .. }) => {
                    let _ = events.send(RelayEvent::Signal { src, signal });
                }
                Some(Envelope::Signal { src: None, .. }) => {
                    tracing::debug!("Dropping SIGNAL without sender");
                }
                Some(other) => tracing::trace!("Ignoring {}", other.message_type()),
                None => {
                    tracing::info!("Relay link closed by remote");
                    *state.lock().await = RelayClientState::Closed;
                    let _ = events.send(RelayEvent::Closed);
                    return;
                }
            },
        }
    }

    *state.lock().await = RelayClientState::Closed;
}

/// Request a server-assigned session identity
///
/// Performs `GET <base>/id` and returns the trimmed body.
///
/// # Errors
///
/// Returns [`RelayError::Http`] if the request fails or the body is empty.
pub async fn fetch_assigned_id(base: &str) -> Result<String, RelayError> {
    let url = format!("{}/id", base.trim_end_matches('/'));
    let body = reqwest::get(&url)
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|e| RelayError::Http(e.to_string()))?
        .text()
        .await
        .map_err(|e| RelayError::Http(e.to_string()))?;

    let id = body.trim();
    if id.is_empty() {
        return Err(RelayError::Http(format!("{url} returned an empty identity")));
    }
    Ok(id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::memory::MemoryRelay;
    use serde_json::json;

    fn config() -> RelayClientConfig {
        RelayClientConfig {
            open_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(15),
            ..Default::default()
        }
    }

    fn pings(relay: &MemoryRelay, id: &str) -> usize {
        relay
            .sent_by(id)
            .iter()
            .filter(|e| **e == Envelope::Ping)
            .count()
    }

    #[test]
    fn test_client_config_default() {
        let config = RelayClientConfig::default();
        assert_eq!(config.open_timeout, Duration::from_secs(20));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(20));
        assert_eq!(config.service_tag, "peerjs");
        assert_eq!(config.token, "token");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_immediately_then_interval() {
        let relay = MemoryRelay::new();
        relay.serve("mem://a");
        let (tx, _rx) = mpsc::unbounded_channel();

        let client = RelayClient::connect(&relay, "mem://a", "alice", &config(), tx)
            .await
            .unwrap();
        assert_eq!(client.state().await, RelayClientState::Open);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pings(&relay, "alice"), 1);

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(pings(&relay, "alice"), 2);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(pings(&relay, "alice"), 4);

        client.close().await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(pings(&relay, "alice"), 4);
        assert_eq!(client.state().await, RelayClientState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_timeout() {
        let relay = MemoryRelay::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        let err = RelayClient::connect(&relay, "mem://void", "alice", &config(), tx)
            .await
            .unwrap_err();
        assert_eq!(err, RelayError::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_failover() {
        let relay = MemoryRelay::new();
        relay.serve("mem://b");
        let mut pool = EndpointPool::new(["mem://a", "mem://b"]);
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut failed = Vec::new();

        let client = RelayClient::connect_with_pool(
            &relay,
            &mut pool,
            "alice",
            &config(),
            tx,
            |endpoint, _| failed.push(endpoint.to_string()),
        )
        .await
        .unwrap();

        assert_eq!(client.endpoint(), "mem://b");
        assert_eq!(failed, vec!["mem://a".to_string()]);
        assert!(pool.endpoints()[0].failed);
        assert_eq!(pool.get_current(), Some("mem://b"));
    }

    #[tokio::test]
    async fn test_pool_exhausted() {
        let relay = MemoryRelay::new();
        relay.refuse("mem://a");
        relay.refuse("mem://b");
        let mut pool = EndpointPool::new(["mem://a", "mem://b"]);
        let (tx, _rx) = mpsc::unbounded_channel();

        let err = RelayClient::connect_with_pool(&relay, &mut pool, "alice", &config(), tx, |_, _| {})
            .await
            .unwrap_err();
        assert_eq!(err, RelayError::AllEndpointsExhausted);
        assert_eq!(relay.attempts("mem://a"), 1);
        assert_eq!(relay.attempts("mem://b"), 1);
    }

    #[tokio::test]
    async fn test_signal_routing_and_close_event() {
        let relay = MemoryRelay::new();
        relay.serve("mem://a");
        let (alice_tx, _alice_rx) = mpsc::unbounded_channel();
        let (bob_tx, mut bob_rx) = mpsc::unbounded_channel();

        let alice = RelayClient::connect(&relay, "mem://a", "alice", &config(), alice_tx)
            .await
            .unwrap();
        let _bob = RelayClient::connect(&relay, "mem://a", "bob", &config(), bob_tx)
            .await
            .unwrap();

        alice.send_signal("bob", json!({"sdp": "offer"})).unwrap();
        assert_eq!(
            bob_rx.recv().await,
            Some(RelayEvent::Signal {
                src: "alice".to_string(),
                signal: json!({"sdp": "offer"}),
            })
        );

        relay.drop_session("mem://a", "bob").await;
        assert_eq!(bob_rx.recv().await, Some(RelayEvent::Closed));
    }

    #[tokio::test]
    async fn test_send_after_close() {
        let relay = MemoryRelay::new();
        relay.serve("mem://a");
        let (tx, _rx) = mpsc::unbounded_channel();

        let client = RelayClient::connect(&relay, "mem://a", "alice", &config(), tx)
            .await
            .unwrap();
        client.close().await;
        client.close().await;

        assert_eq!(
            client.send_signal("bob", Value::Null),
            Err(RelayError::Closed)
        );
    }
}
