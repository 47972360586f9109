//! Relay protocol envelope definitions.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

/// Service tag announced as the `key` connect parameter
pub const SERVICE_TAG: &str = "peerjs";

/// Relay protocol envelopes
///
/// Encoded as JSON text frames tagged by `type`, e.g. `{"type":"PING"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum Envelope {
    /// Relay acknowledges the link; sent once after accept
    Open,

    /// Client heartbeat
    Ping,

    /// Relay heartbeat reply
    Pong,

    /// Opaque negotiation payload routed by `dst`
    Signal {
        /// Sender session identity (filled in by the sending client)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        src: Option<String>,
        /// Recipient session identity
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dst: Option<String>,
        /// Payload; only the negotiation layer interprets it
        #[serde(default)]
        signal: Value,
    },
}

impl Envelope {
    /// Build a `SIGNAL` envelope from `src` to `dst`
    #[must_use]
    pub fn signal(src: impl Into<String>, dst: impl Into<String>, signal: Value) -> Self {
        Self::Signal {
            src: Some(src.into()),
            dst: Some(dst.into()),
            signal,
        }
    }

    /// Serialize envelope to a text frame
    ///
    /// # Errors
    ///
    /// Returns error if the payload cannot be encoded.
    pub fn to_text(&self) -> Result<String, RelayError> {
        serde_json::to_string(self).map_err(|e| RelayError::Serialization(e.to_string()))
    }

    /// Deserialize envelope from a text frame
    ///
    /// # Errors
    ///
    /// Returns error if the frame is not a known envelope.
    pub fn from_text(text: &str) -> Result<Self, RelayError> {
        serde_json::from_str(text).map_err(|e| RelayError::InvalidMessage(e.to_string()))
    }

    /// Get the envelope type name
    #[must_use]
    pub fn message_type(&self) -> &'static str {
        match self {
            Envelope::Open => "OPEN",
            Envelope::Ping => "PING",
            Envelope::Pong => "PONG",
            Envelope::Signal { .. } => "SIGNAL",
        }
    }

    /// Recipient of a `SIGNAL`, if any
    #[must_use]
    pub fn dst(&self) -> Option<&str> {
        match self {
            Envelope::Signal { dst, .. } => dst.as_deref(),
            _ => None,
        }
    }
}

/// Connect-time parameters announced to the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    /// Fixed service tag (`key`)
    pub service_tag: String,
    /// Local session identity (`id`)
    pub session_id: String,
    /// Opaque auth token (`token`)
    pub token: String,
}

impl ConnectParams {
    /// Create connect parameters
    #[must_use]
    pub fn new(
        service_tag: impl Into<String>,
        session_id: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            service_tag: service_tag.into(),
            session_id: session_id.into(),
            token: token.into(),
        }
    }

    /// Build the connect URL for `endpoint`
    ///
    /// Existing query pairs on the endpoint are preserved.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidEndpoint`] if the endpoint is not a URL.
    pub fn connect_url(&self, endpoint: &str) -> Result<Url, RelayError> {
        let mut url =
            Url::parse(endpoint).map_err(|e| RelayError::InvalidEndpoint(format!("{endpoint}: {e}")))?;
        url.query_pairs_mut()
            .append_pair("key", &self.service_tag)
            .append_pair("id", &self.session_id)
            .append_pair("token", &self.token);
        Ok(url)
    }
}

/// Relay errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Frame is not a valid envelope
    #[error("Invalid message: {0}")]
    InvalidMessage(String),
    /// Endpoint address cannot be used
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
    /// Network I/O error
    #[error("I/O error: {0}")]
    Io(String),
    /// Transport-level failure (handshake, socket)
    #[error("Transport error: {0}")]
    Transport(String),
    /// HTTP request failure
    #[error("HTTP error: {0}")]
    Http(String),
    /// `OPEN` not received in time
    #[error("Relay open timeout")]
    Timeout,
    /// Link closed
    #[error("Relay link closed")]
    Closed,
    /// Every endpoint in the pool failed
    #[error("All relay endpoints exhausted")]
    AllEndpointsExhausted,
    /// Server at capacity
    #[error("Relay at capacity")]
    ServerFull,
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::Io(err.to_string())
    }
}
