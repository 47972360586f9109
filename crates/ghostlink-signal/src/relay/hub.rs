//! Relay-side routing table.
//!
//! Maps session identities to live connections and routes text frames
//! between them. Frames are forwarded verbatim; the hub only inspects the
//! `type` and `dst` fields.

use super::protocol::{Envelope, RelayError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, mpsc};

/// Live connection registered under a session identity
#[derive(Debug)]
struct ClientConnection {
    /// Distinguishes a replaced connection from its successor
    conn_id: u64,
    /// Frames to deliver to this connection
    tx: mpsc::UnboundedSender<String>,
    /// Last frame seen from this connection
    last_seen: Instant,
}

impl ClientConnection {
    /// Update last seen time
    fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Check if connection is alive
    fn is_alive(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() < timeout
    }
}

/// Registration handle for one connection
#[derive(Debug)]
pub struct Registration {
    /// Connection number, passed back to [`RelayHub::unregister`]
    pub conn_id: u64,
    /// Frames routed to this connection
    pub frames: mpsc::UnboundedReceiver<String>,
}

/// Relay routing hub
#[derive(Debug)]
pub struct RelayHub {
    clients: RwLock<HashMap<String, ClientConnection>>,
    max_clients: usize,
    next_conn: AtomicU64,
}

impl RelayHub {
    /// Create a hub accepting at most `max_clients` identities
    #[must_use]
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            max_clients,
            next_conn: AtomicU64::new(1),
        }
    }

    /// Register a connection under `id`
    ///
    /// An existing connection with the same identity is replaced; its frame
    /// channel closes.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::ServerFull`] if the hub is at capacity.
    pub async fn register(&self, id: &str) -> Result<Registration, RelayError> {
        let mut clients = self.clients.write().await;

        if clients.len() >= self.max_clients && !clients.contains_key(id) {
            return Err(RelayError::ServerFull);
        }

        let (tx, frames) = mpsc::unbounded_channel();
        let conn_id = self.next_conn.fetch_add(1, Ordering::Relaxed);
        let previous = clients.insert(
            id.to_string(),
            ClientConnection {
                conn_id,
                tx,
                last_seen: Instant::now(),
            },
        );
        if previous.is_some() {
            tracing::debug!("Replaced existing connection for {id}");
        }

        Ok(Registration { conn_id, frames })
    }

    /// Remove `id` if still held by `conn_id`
    pub async fn unregister(&self, id: &str, conn_id: u64) {
        let mut clients = self.clients.write().await;
        if clients.get(id).is_some_and(|c| c.conn_id == conn_id) {
            clients.remove(id);
        }
    }

    /// Forcibly drop the connection registered under `id`
    pub async fn disconnect(&self, id: &str) -> bool {
        self.clients.write().await.remove(id).is_some()
    }

    /// Handle a text frame received from `from`
    ///
    /// Returns the reply to send back to the sender, if any. `PING` is
    /// answered with `PONG`; frames carrying `dst` are forwarded verbatim;
    /// everything else is ignored.
    pub async fn handle_frame(&self, from: &str, text: &str) -> Option<String> {
        let mut clients = self.clients.write().await;
        if let Some(client) = clients.get_mut(from) {
            client.touch();
        }

        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                tracing::debug!("Unparseable frame from {from}: {e}");
                return None;
            }
        };

        if value.get("type").and_then(|t| t.as_str()) == Some("PING") {
            return Envelope::Pong.to_text().ok();
        }

        let Some(dst) = value.get("dst").and_then(|d| d.as_str()) else {
            return None;
        };

        match clients.get(dst) {
            Some(target) => {
                if target.tx.send(text.to_string()).is_err() {
                    tracing::debug!("Recipient {dst} is closing; frame dropped");
                }
            }
            None => tracing::debug!("Unknown recipient {dst}; frame from {from} dropped"),
        }
        None
    }

    /// Remove connections idle for longer than `timeout`
    ///
    /// Returns the identities removed.
    pub async fn reap(&self, timeout: Duration) -> Vec<String> {
        let mut clients = self.clients.write().await;
        let stale: Vec<String> = clients
            .iter()
            .filter(|(_, c)| !c.is_alive(timeout))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            clients.remove(id);
        }
        stale
    }

    /// Whether `id` is connected
    pub async fn contains(&self, id: &str) -> bool {
        self.clients.read().await.contains_key(id)
    }

    /// Number of connected identities
    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Whether no identity is connected
    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }
}
