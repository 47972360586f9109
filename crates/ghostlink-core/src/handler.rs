//! Application-facing callbacks and the transport channel.

use crate::engine::Input;
use crate::error::{DisconnectReason, LinkError, Result};
use tokio::sync::mpsc;

/// Receives session lifecycle and data for the application layer
///
/// All methods are called from the strategy's engine task and must not
/// block.
pub trait PeerHandler: Send + Sync {
    /// Session reached "connected"; the channel is now owned by the caller
    fn on_connect(&self, channel: TransportChannel) {
        let _ = channel;
    }

    /// Data received from `peer`
    fn on_message(&self, peer: &str, data: &[u8]) {
        let _ = (peer, data);
    }

    /// Session with `peer` ended
    fn on_disconnect(&self, peer: &str, reason: DisconnectReason) {
        let _ = (peer, reason);
    }
}

/// Handler that ignores everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullHandler;

impl PeerHandler for NullHandler {}

/// Established direct path to one peer
///
/// Sends are queued to the engine in call order.
#[derive(Debug)]
pub struct TransportChannel {
    peer: String,
    session: u64,
    inputs: mpsc::UnboundedSender<Input>,
}

impl TransportChannel {
    pub(crate) fn new(peer: String, session: u64, inputs: mpsc::UnboundedSender<Input>) -> Self {
        Self {
            peer,
            session,
            inputs,
        }
    }

    /// Remote peer identity
    #[must_use]
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Queue `data` for the peer
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::TornDown`] if the strategy was torn down.
    pub fn send(&self, data: impl Into<Vec<u8>>) -> Result<()> {
        self.inputs
            .send(Input::SendTo {
                session: self.session,
                data: data.into(),
            })
            .map_err(|_| LinkError::TornDown)
    }

    /// Close the session without reporting a disconnect locally
    pub fn close(self) {
        let _ = self.inputs.send(Input::CloseSession {
            session: self.session,
        });
    }
}
