//! Bounded structured event log.
//!
//! A fixed-capacity ring of typed [`LinkEvent`]s. When full, the oldest
//! entry is overwritten. Clones share the same ring.

use crate::error::DisconnectReason;
use crate::negotiator::Role;
use crate::strategy::StrategyKind;
use ghostlink_signal::CandidateType;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Connection lifecycle event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Connecting to a relay endpoint
    RelayConnecting {
        /// Endpoint address
        endpoint: String,
    },
    /// Relay answered `OPEN`
    RelayOpen {
        /// Endpoint address
        endpoint: String,
        /// Session identity registered
        identity: String,
    },
    /// Endpoint failed and was marked in the pool
    RelayEndpointFailed {
        /// Endpoint address
        endpoint: String,
        /// Failure description
        error: String,
    },
    /// Relay link closed by the remote side
    RelayClosed,
    /// Idle relay reconnect scheduled
    RelayReconnect {
        /// Attempt number (1-based)
        attempt: u32,
    },
    /// Strategy bound by the selector
    StrategyBound {
        /// Bound strategy
        kind: StrategyKind,
    },
    /// Direct strategy failed and managed was used instead
    FallbackUsed {
        /// Direct failure description
        reason: String,
    },
    /// Negotiation session created
    SessionCreated {
        /// Remote peer
        peer: String,
        /// Local role
        role: Role,
    },
    /// Local candidate gathered
    CandidateGathered {
        /// Remote peer
        peer: String,
        /// Candidate type, if recognizable
        kind: Option<CandidateType>,
    },
    /// Gathering deadline passed without candidates
    GatheringTimeout {
        /// Remote peer
        peer: String,
    },
    /// Session connected
    Connected {
        /// Remote peer
        peer: String,
    },
    /// Session ended
    Disconnected {
        /// Remote peer
        peer: String,
        /// Reported reason
        reason: DisconnectReason,
    },
    /// Strategy torn down
    TornDown {
        /// Strategy
        kind: StrategyKind,
    },
}

impl fmt::Display for LinkEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RelayConnecting { endpoint } => write!(f, "relay connecting {endpoint}"),
            Self::RelayOpen { endpoint, identity } => {
                write!(f, "relay open {endpoint} as {identity}")
            }
            Self::RelayEndpointFailed { endpoint, error } => {
                write!(f, "relay endpoint {endpoint} failed: {error}")
            }
            Self::RelayClosed => write!(f, "relay closed"),
            Self::RelayReconnect { attempt } => write!(f, "relay reconnect attempt {attempt}"),
            Self::StrategyBound { kind } => write!(f, "strategy bound: {kind}"),
            Self::FallbackUsed { reason } => write!(f, "fallback used: {reason}"),
            Self::SessionCreated { peer, role } => write!(f, "session {peer} created ({role:?})"),
            Self::CandidateGathered { peer, kind } => match kind {
                Some(kind) => write!(f, "candidate {kind} for {peer}"),
                None => write!(f, "candidate ? for {peer}"),
            },
            Self::GatheringTimeout { peer } => write!(f, "gathering timeout for {peer}"),
            Self::Connected { peer } => write!(f, "connected to {peer}"),
            Self::Disconnected { peer, reason } => write!(f, "disconnected from {peer}: {reason}"),
            Self::TornDown { kind } => write!(f, "{kind} torn down"),
        }
    }
}

/// Event with its offset from log creation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedEvent {
    /// Time since the log was created
    pub at: Duration,
    /// Event
    pub event: LinkEvent,
}

#[derive(Debug)]
struct Ring {
    capacity: usize,
    entries: VecDeque<LoggedEvent>,
    dropped: u64,
}

/// Bounded event log
#[derive(Debug, Clone)]
pub struct EventLog {
    origin: Instant,
    ring: Arc<Mutex<Ring>>,
}

impl EventLog {
    /// Create a log holding at most `capacity` events
    ///
    /// A capacity of zero is raised to one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            origin: Instant::now(),
            ring: Arc::new(Mutex::new(Ring {
                capacity,
                entries: VecDeque::with_capacity(capacity),
                dropped: 0,
            })),
        }
    }

    /// Append an event, evicting the oldest when full
    pub fn record(&self, event: LinkEvent) {
        let at = self.origin.elapsed();
        let mut ring = self.ring();
        if ring.entries.len() == ring.capacity {
            ring.entries.pop_front();
            ring.dropped += 1;
        }
        ring.entries.push_back(LoggedEvent { at, event });
    }

    /// Events oldest first
    #[must_use]
    pub fn snapshot(&self) -> Vec<LoggedEvent> {
        self.ring().entries.iter().cloned().collect()
    }

    /// Whether any retained event matches `pred`
    pub fn any(&self, pred: impl Fn(&LinkEvent) -> bool) -> bool {
        self.ring().entries.iter().any(|e| pred(&e.event))
    }

    /// Number of retained events
    #[must_use]
    pub fn len(&self) -> usize {
        self.ring().entries.len()
    }

    /// Whether the log is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ring().entries.is_empty()
    }

    /// Maximum retained events
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.ring().capacity
    }

    /// Events evicted since creation
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.ring().dropped
    }

    /// Remove all events
    pub fn clear(&self) {
        self.ring().entries.clear();
    }

    fn ring(&self) -> std::sync::MutexGuard<'_, Ring> {
        self.ring.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected(n: usize) -> LinkEvent {
        LinkEvent::Connected {
            peer: format!("peer{n}"),
        }
    }

    #[test]
    fn test_record_and_snapshot() {
        let log = EventLog::new(4);
        log.record(LinkEvent::RelayClosed);
        log.record(connected(1));

        let events: Vec<_> = log.snapshot().into_iter().map(|e| e.event).collect();
        assert_eq!(events, vec![LinkEvent::RelayClosed, connected(1)]);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_oldest_evicted_when_full() {
        let log = EventLog::new(3);
        for n in 0..5 {
            log.record(connected(n));
        }

        let events: Vec<_> = log.snapshot().into_iter().map(|e| e.event).collect();
        assert_eq!(events, vec![connected(2), connected(3), connected(4)]);
        assert_eq!(log.dropped(), 2);
        assert_eq!(log.capacity(), 3);
    }

    #[test]
    fn test_clones_share_ring() {
        let log = EventLog::new(8);
        let other = log.clone();
        other.record(LinkEvent::RelayClosed);

        assert!(log.any(|e| *e == LinkEvent::RelayClosed));
        log.clear();
        assert!(other.is_empty());
    }

    #[test]
    fn test_zero_capacity_raised() {
        let log = EventLog::new(0);
        log.record(connected(1));
        log.record(connected(2));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_display() {
        let event = LinkEvent::Disconnected {
            peer: "bob".to_string(),
            reason: DisconnectReason::PeerLeft,
        };
        assert_eq!(event.to_string(), "disconnected from bob: peer-left");
    }
}
