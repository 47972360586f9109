//! Error types for connection establishment
//!
//! Errors are split by when they surface:
//!
//! - **Setup errors** ([`LinkError`]) are returned from `start` / `initiate`
//!   once local recovery (endpoint rotation, strategy fallback) is exhausted.
//! - **Disconnect reasons** ([`DisconnectReason`]) are reported through the
//!   peer handler after a session exists.
//!
//! # Example
//!
//! ```no_run
//! use ghostlink_core::LinkError;
//!
//! fn handle_error(err: LinkError) {
//!     if err.is_transient() {
//!         println!("Transient error, may retry: {err}");
//!     } else {
//!         println!("Permanent error: {err}");
//!     }
//! }
//! ```

use ghostlink_signal::RelayError;
use std::borrow::Cow;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Failure reported by the negotiation primitive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationFailure {
    /// ICE connectivity checks failed
    IceFailed,
    /// Path was lost after it had been up
    Disconnected,
    /// Any other primitive error
    Other(String),
}

impl fmt::Display for NegotiationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IceFailed => write!(f, "ICE connection failed"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Other(msg) => write!(f, "{msg}"),
        }
    }
}

/// Why a session ended, as reported to the peer handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// Remote peer went away after the link was up
    PeerLeft,
    /// Relay closed before the link was up
    ConnectionFailed,
    /// Negotiation did not connect in time
    ConnectionTimeout,
    /// Primitive reported a non-path error
    NetworkError,
}

impl DisconnectReason {
    /// Stable wire/log name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PeerLeft => "peer-left",
            Self::ConnectionFailed => "connection-failed",
            Self::ConnectionTimeout => "connection-timeout",
            Self::NetworkError => "network-error",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by strategies and the protocol selector
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LinkError {
    // ============ Relay Errors ============
    /// The only relay endpoint did not open in time
    #[error("Relay connect timed out")]
    RelayConnectTimeout,

    /// Relay link closed while the session was still negotiating
    #[error("Relay closed before the peer link was established")]
    RelayClosedBeforeEstablished,

    /// Every relay endpoint failed
    #[error("All relay endpoints exhausted")]
    AllEndpointsExhausted,

    /// Other relay failure
    #[error("Relay error: {0}")]
    Relay(RelayError),

    // ============ Negotiation Errors ============
    /// Negotiation did not connect in time
    #[error("Negotiation timed out after {0:?}")]
    NegotiationTimeout(Duration),

    /// Negotiation primitive failed
    #[error("Negotiation failed: {0}")]
    Negotiation(NegotiationFailure),

    /// Remote peer left
    #[error("Peer left")]
    PeerLeft,

    /// A live session for this peer already exists
    #[error("Session already active for peer {0}")]
    SessionExists(String),

    // ============ Lifecycle Errors ============
    /// No strategy bound yet
    #[error("No negotiation strategy bound")]
    NoStrategyBound,

    /// Strategy was torn down
    #[error("Strategy torn down")]
    TornDown,

    /// Session identity could not be obtained
    #[error("Identity error: {0}")]
    Identity(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),
}

impl LinkError {
    /// Whether a retry (new attempt, other strategy) may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RelayConnectTimeout
                | Self::RelayClosedBeforeEstablished
                | Self::AllEndpointsExhausted
                | Self::Relay(_)
                | Self::NegotiationTimeout(_)
                | Self::Negotiation(_)
                | Self::Identity(_)
        )
    }

    /// Create an invalid configuration error
    pub fn invalid_config(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}

impl From<RelayError> for LinkError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::Timeout => Self::RelayConnectTimeout,
            RelayError::AllEndpointsExhausted => Self::AllEndpointsExhausted,
            other => Self::Relay(other),
        }
    }
}

/// Result type for link operations
pub type Result<T> = std::result::Result<T, LinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_reason_names() {
        assert_eq!(DisconnectReason::PeerLeft.as_str(), "peer-left");
        assert_eq!(DisconnectReason::ConnectionFailed.as_str(), "connection-failed");
        assert_eq!(DisconnectReason::ConnectionTimeout.as_str(), "connection-timeout");
        assert_eq!(DisconnectReason::NetworkError.to_string(), "network-error");
    }

    #[test]
    fn test_relay_error_mapping() {
        assert_eq!(
            LinkError::from(RelayError::Timeout),
            LinkError::RelayConnectTimeout
        );
        assert_eq!(
            LinkError::from(RelayError::AllEndpointsExhausted),
            LinkError::AllEndpointsExhausted
        );
        assert_eq!(
            LinkError::from(RelayError::Closed),
            LinkError::Relay(RelayError::Closed)
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(LinkError::AllEndpointsExhausted.is_transient());
        assert!(LinkError::Negotiation(NegotiationFailure::IceFailed).is_transient());
        assert!(!LinkError::TornDown.is_transient());
        assert!(!LinkError::NoStrategyBound.is_transient());
        assert!(!LinkError::invalid_config("x").is_transient());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            LinkError::Negotiation(NegotiationFailure::IceFailed).to_string(),
            "Negotiation failed: ICE connection failed"
        );
        assert_eq!(
            LinkError::NegotiationTimeout(Duration::from_secs(45)).to_string(),
            "Negotiation timed out after 45s"
        );
    }
}
