//! Relay server for routing signaling envelopes between peers.

use super::RELAY_OPEN_DELAY;
use super::hub::RelayHub;
use super::protocol::{Envelope, RelayError};
use axum::Router;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Close code for a link without session identity (policy violation)
const CLOSE_POLICY: u16 = 1008;

/// Close code when the server is at capacity (try again later)
const CLOSE_FULL: u16 = 1013;

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    /// Maximum number of concurrent identities
    pub max_clients: usize,
    /// Idle time after which a client is dropped
    pub client_timeout: Duration,
    /// Cleanup interval
    pub cleanup_interval: Duration,
    /// Delay before `OPEN` is sent to a new link
    pub open_delay: Duration,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            max_clients: 10_000,
            client_timeout: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(30),
            open_delay: RELAY_OPEN_DELAY,
        }
    }
}

/// Connect-time query parameters
#[derive(Debug, Deserialize)]
struct ConnectQuery {
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    token: Option<String>,
}

struct ServerState {
    hub: Arc<RelayHub>,
    config: RelayServerConfig,
}

/// Signaling relay server
pub struct RelayServer {
    listener: TcpListener,
    hub: Arc<RelayHub>,
    config: RelayServerConfig,
}

impl RelayServer {
    /// Bind a relay server
    ///
    /// # Errors
    ///
    /// Returns error if socket binding fails.
    pub async fn bind(bind_addr: SocketAddr) -> Result<Self, RelayError> {
        Self::bind_with_config(bind_addr, RelayServerConfig::default()).await
    }

    /// Bind a relay server with custom configuration
    ///
    /// # Errors
    ///
    /// Returns error if socket binding fails.
    pub async fn bind_with_config(
        bind_addr: SocketAddr,
        config: RelayServerConfig,
    ) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(bind_addr).await?;
        Ok(Self {
            listener,
            hub: Arc::new(RelayHub::new(config.max_clients)),
            config,
        })
    }

    /// Address the server is listening on
    ///
    /// # Errors
    ///
    /// Returns error if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.listener.local_addr()?)
    }

    /// Routing hub shared by every connection
    #[must_use]
    pub fn hub(&self) -> Arc<RelayHub> {
        self.hub.clone()
    }

    /// Build the HTTP router
    ///
    /// Routes: `/` banner, `/peerjs` WebSocket, `/peerjs/id` and `/id`
    /// identity issuing.
    fn router(&self) -> Router {
        let state = Arc::new(ServerState {
            hub: self.hub.clone(),
            config: self.config.clone(),
        });

        Router::new()
            .route("/", get(banner))
            .route("/peerjs", get(ws_handler))
            .route("/peerjs/id", get(issue_id))
            .route("/peerjs/peerjs/id", get(issue_id))
            .route("/id", get(issue_id))
            .with_state(state)
    }

    /// Run the relay server until `shutdown` is cancelled
    ///
    /// # Errors
    ///
    /// Returns error if the listener fails.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), RelayError> {
        let addr = self.local_addr()?;
        tracing::info!("Relay server listening on {addr}");

        self.spawn_cleanup_task(shutdown.clone());

        let router = self.router();
        axum::serve(self.listener, router)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await?;

        tracing::info!("Relay server on {addr} stopped");
        Ok(())
    }

    /// Spawn the idle-client reaper
    fn spawn_cleanup_task(&self, shutdown: CancellationToken) {
        let hub = self.hub.clone();
        let timeout = self.config.client_timeout;
        let period = self.config.cleanup_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let reaped = hub.reap(timeout).await;
                        if !reaped.is_empty() {
                            tracing::info!("Reaped {} idle client(s)", reaped.len());
                        }
                    }
                }
            }
        });
    }
}

async fn banner() -> &'static str {
    "GhostLink relay"
}

async fn issue_id() -> impl IntoResponse {
    (
        [
            (header::CONTENT_TYPE, "text/plain"),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        ],
        uuid::Uuid::new_v4().to_string(),
    )
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ConnectQuery>,
    State(state): State<Arc<ServerState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, query, state))
}

async fn handle_socket(mut socket: WebSocket, query: ConnectQuery, state: Arc<ServerState>) {
    let Some(id) = query.id.filter(|id| !id.is_empty()) else {
        tracing::debug!("Rejecting link without session identity");
        let _ = socket.send(close_frame(CLOSE_POLICY, "Missing peer ID")).await;
        return;
    };

    let mut registration = match state.hub.register(&id).await {
        Ok(registration) => registration,
        Err(e) => {
            tracing::warn!("Rejecting {id}: {e}");
            let _ = socket.send(close_frame(CLOSE_FULL, "Server at capacity")).await;
            return;
        }
    };
    tracing::info!(
        "Client {id} connected (key: {})",
        query.key.as_deref().unwrap_or("-")
    );

    let (mut ws_tx, mut ws_rx) = socket.split();

    tokio::time::sleep(state.config.open_delay).await;
    let opened = match Envelope::Open.to_text() {
        Ok(open) => ws_tx.send(Message::Text(open.into())).await.is_ok(),
        Err(_) => false,
    };
    if !opened {
        state.hub.unregister(&id, registration.conn_id).await;
        return;
    }

    loop {
        tokio::select! {
            frame = registration.frames.recv() => {
                let Some(frame) = frame else { break };
                if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = state.hub.handle_frame(&id, text.as_str()).await {
                            if ws_tx.send(Message::Text(reply.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!("Client {id} read error: {e}");
                        break;
                    }
                }
            }
        }
    }

    state.hub.unregister(&id, registration.conn_id).await;
    tracing::info!("Client {id} disconnected");
}

fn close_frame(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}
