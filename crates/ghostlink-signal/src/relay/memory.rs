//! In-process relay.
//!
//! Simulates a set of relay endpoints without sockets. Served endpoints
//! route through a [`RelayHub`] exactly like the network server; addresses
//! that are not served never answer, so connect attempts against them hit
//! the client's open timeout.

use super::hub::RelayHub;
use super::link::{RelayConnector, RelayLink};
use super::protocol::{ConnectParams, Envelope, RelayError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
enum Endpoint {
    Serving(Arc<RelayHub>),
    Refusing,
}

#[derive(Debug, Default)]
struct Inner {
    endpoints: HashMap<String, Endpoint>,
    attempts: HashMap<String, usize>,
    sent: HashMap<String, Vec<Envelope>>,
}

/// In-process relay network
#[derive(Debug, Clone, Default)]
pub struct MemoryRelay {
    inner: Arc<Mutex<Inner>>,
    open_delay: Duration,
}

impl MemoryRelay {
    /// Create an empty relay network
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay `OPEN` after accept
    #[must_use]
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    /// Serve `address` with its own hub
    pub fn serve(&self, address: &str) -> Arc<RelayHub> {
        let hub = Arc::new(RelayHub::new(usize::MAX));
        self.lock()
            .endpoints
            .insert(address.to_string(), Endpoint::Serving(hub.clone()));
        hub
    }

    /// Reject connects to `address` immediately
    pub fn refuse(&self, address: &str) {
        self.lock()
            .endpoints
            .insert(address.to_string(), Endpoint::Refusing);
    }

    /// Number of connect attempts made against `address`
    #[must_use]
    pub fn attempts(&self, address: &str) -> usize {
        self.lock().attempts.get(address).copied().unwrap_or(0)
    }

    /// Envelopes sent by the client with session identity `id`
    #[must_use]
    pub fn sent_by(&self, id: &str) -> Vec<Envelope> {
        self.lock().sent.get(id).cloned().unwrap_or_default()
    }

    /// Close the link of `id` on `address` from the relay side
    pub async fn drop_session(&self, address: &str, id: &str) -> bool {
        let hub = match self.lock().endpoints.get(address) {
            Some(Endpoint::Serving(hub)) => hub.clone(),
            _ => return false,
        };
        hub.disconnect(id).await
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, id: &str, env: &Envelope) {
        self.lock()
            .sent
            .entry(id.to_string())
            .or_default()
            .push(env.clone());
    }
}

#[async_trait]
impl RelayConnector for MemoryRelay {
    async fn connect(
        &self,
        endpoint: &str,
        params: &ConnectParams,
    ) -> Result<RelayLink, RelayError> {
        let target = {
            let mut inner = self.lock();
            *inner.attempts.entry(endpoint.to_string()).or_default() += 1;
            inner.endpoints.get(endpoint).cloned()
        };

        let hub = match target {
            Some(Endpoint::Serving(hub)) => hub,
            Some(Endpoint::Refusing) => {
                return Err(RelayError::Transport(format!("{endpoint} refused connection")));
            }
            None => return std::future::pending().await,
        };

        let id = params.session_id.clone();
        let mut registration = hub.register(&id).await?;

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Envelope>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let relay = self.clone();
        let open_delay = self.open_delay;

        tokio::spawn(async move {
            if !open_delay.is_zero() {
                tokio::time::sleep(open_delay).await;
            }
            let _ = in_tx.send(Envelope::Open);

            loop {
                tokio::select! {
                    env = out_rx.recv() => {
                        let Some(env) = env else { break };
                        relay.record(&id, &env);
                        let Ok(text) = env.to_text() else { continue };
                        if let Some(reply) = hub.handle_frame(&id, &text).await {
                            if let Ok(reply) = Envelope::from_text(&reply) {
                                let _ = in_tx.send(reply);
                            }
                        }
                    }
                    frame = registration.frames.recv() => {
                        let Some(frame) = frame else { break };
                        match Envelope::from_text(&frame) {
                            Ok(env) => {
                                if in_tx.send(env).is_err() {
                                    break;
                                }
                            }
                            Err(e) => tracing::debug!("Memory relay dropped frame for {id}: {e}"),
                        }
                    }
                }
            }

            hub.unregister(&id, registration.conn_id).await;
        });

        Ok(RelayLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
