//! Relay link transports.
//!
//! A [`RelayLink`] is a pair of envelope channels bound to one live
//! connection. Dropping the outbound sender closes the connection; the
//! inbound receiver yields `None` once the relay side closes.

use super::protocol::{ConnectParams, Envelope, RelayError};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// One live relay connection
#[derive(Debug)]
pub struct RelayLink {
    /// Envelopes to the relay
    pub outbound: mpsc::UnboundedSender<Envelope>,
    /// Envelopes from the relay
    pub inbound: mpsc::UnboundedReceiver<Envelope>,
}

/// Opens relay links
///
/// Implementations decide the transport; the relay session client only sees
/// envelopes.
#[async_trait]
pub trait RelayConnector: Send + Sync {
    /// Open a link to `endpoint` announcing `params`
    ///
    /// # Errors
    ///
    /// Returns error if the transport cannot be established.
    async fn connect(&self, endpoint: &str, params: &ConnectParams)
    -> Result<RelayLink, RelayError>;
}

/// WebSocket relay connector
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl RelayConnector for WsConnector {
    async fn connect(
        &self,
        endpoint: &str,
        params: &ConnectParams,
    ) -> Result<RelayLink, RelayError> {
        let url = params.connect_url(endpoint)?;
        let (stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?;
        let (mut ws_write, mut ws_read) = stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Envelope>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        let endpoint = endpoint.to_string();
        tokio::spawn(async move {
            while let Some(env) = out_rx.recv().await {
                let text = match env.to_text() {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!("Dropping unencodable envelope: {e}");
                        continue;
                    }
                };
                if ws_write.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                match frame {
                    Ok(Message::Text(text)) => match Envelope::from_text(text.as_str()) {
                        Ok(env) => {
                            if in_tx.send(env).is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::debug!("Ignoring frame from {endpoint}: {e}"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!("Relay link {endpoint} read error: {e}");
                        break;
                    }
                }
            }
        });

        Ok(RelayLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
