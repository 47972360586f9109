//! Peer negotiation primitive seam.
//!
//! Strategies drive a [`PathNegotiator`] per remote peer. The primitive
//! turns remote signals into a direct path and reports progress as
//! [`NegotiatorEvent`]s through its [`NegotiatorSink`]. Offer/answer and
//! candidate payloads are opaque JSON.

use crate::diagnostics::LinkStats;
use crate::error::NegotiationFailure;
use ghostlink_signal::IceConfig;
use serde_json::Value;
use tokio::sync::mpsc;

/// Local role in a negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Creates the offer
    Offerer,
    /// Answers a received offer
    Answerer,
}

/// Progress reported by a negotiation primitive
#[derive(Debug, Clone, PartialEq)]
pub enum NegotiatorEvent {
    /// Signal to relay to the remote peer
    LocalSignal(Value),
    /// Local candidate line gathered
    CandidateGathered(String),
    /// Gathering finished
    GatheringComplete,
    /// Direct path is up
    Connected,
    /// Application data received on the path
    Data(Vec<u8>),
    /// Remote closed the path
    Closed,
    /// Negotiation or path failed
    Failed(NegotiationFailure),
}

/// Event channel handed to a primitive at creation
#[derive(Debug, Clone)]
pub struct NegotiatorSink {
    session: u64,
    tx: mpsc::UnboundedSender<(u64, NegotiatorEvent)>,
}

impl NegotiatorSink {
    pub(crate) fn new(session: u64, tx: mpsc::UnboundedSender<(u64, NegotiatorEvent)>) -> Self {
        Self { session, tx }
    }

    /// Report an event; dropped silently once the session is gone
    pub fn emit(&self, event: NegotiatorEvent) {
        let _ = self.tx.send((self.session, event));
    }

    /// Session number this sink reports for
    #[must_use]
    pub fn session(&self) -> u64 {
        self.session
    }
}

/// One negotiation with one remote peer
pub trait PathNegotiator: Send {
    /// Apply a signal received from the remote peer
    ///
    /// # Errors
    ///
    /// Returns the failure if the signal cannot be applied.
    fn apply_remote(&mut self, signal: Value) -> Result<(), NegotiationFailure>;

    /// Send application data over the connected path
    ///
    /// # Errors
    ///
    /// Returns the failure if the path is not usable.
    fn send(&mut self, data: &[u8]) -> Result<(), NegotiationFailure>;

    /// Latest path statistics
    fn stats(&self) -> Option<LinkStats> {
        None
    }

    /// Close the path; idempotent
    fn close(&mut self);
}

/// Creates negotiation primitives
pub trait NegotiatorFactory: Send + Sync {
    /// Create a primitive for `role`
    ///
    /// An [`Role::Offerer`] emits its offer through `sink` promptly.
    fn create(&self, role: Role, ice: &IceConfig, sink: NegotiatorSink) -> Box<dyn PathNegotiator>;
}
