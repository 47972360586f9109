//! Connection diagnostics.
//!
//! Passive observer of candidate types, relay/peer link state, round-trip
//! time and traffic volume. Findings are derived on demand and never feed
//! back into negotiation.

use crate::device::DeviceClass;
use ghostlink_signal::{CandidateType, nat::candidate_type_of};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Finding severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Connection cannot work as-is
    Critical,
    /// Connection likely degraded or may fail
    Warning,
    /// Neutral observation
    Info,
    /// Healthy
    Success,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Critical => write!(f, "CRITICAL"),
            Self::Warning => write!(f, "WARNING"),
            Self::Info => write!(f, "INFO"),
            Self::Success => write!(f, "SUCCESS"),
        }
    }
}

/// One diagnostic finding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    /// Severity
    pub severity: Severity,
    /// What was observed
    pub message: String,
    /// Suggested remedy
    pub solution: Option<&'static str>,
}

impl Finding {
    fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            solution: None,
        }
    }

    fn with_solution(mut self, solution: &'static str) -> Self {
        self.solution = Some(solution);
        self
    }
}

/// Gathered candidate counts by type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CandidateCounts {
    /// Host candidates
    pub host: u32,
    /// Server-reflexive candidates
    pub server_reflexive: u32,
    /// Peer-reflexive candidates
    pub peer_reflexive: u32,
    /// Relay candidates
    pub relay: u32,
    /// Lines whose type could not be read
    pub unknown: u32,
}

impl CandidateCounts {
    /// Count one candidate
    pub fn add(&mut self, kind: Option<CandidateType>) {
        match kind {
            Some(CandidateType::Host) => self.host += 1,
            Some(CandidateType::ServerReflexive) => self.server_reflexive += 1,
            Some(CandidateType::PeerReflexive) => self.peer_reflexive += 1,
            Some(CandidateType::Relay) => self.relay += 1,
            None => self.unknown += 1,
        }
    }

    /// All candidates
    #[must_use]
    pub fn total(&self) -> u32 {
        self.host + self.server_reflexive + self.peer_reflexive + self.relay + self.unknown
    }
}

/// Periodic sample from a connected negotiation primitive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    /// Current round-trip time
    pub rtt: Option<Duration>,
    /// Bytes sent on the path
    pub bytes_sent: u64,
    /// Bytes received on the path
    pub bytes_received: u64,
    /// Type of the local candidate in the selected pair
    pub selected_candidate: Option<CandidateType>,
}

/// Link quality from round-trip time
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LinkQuality {
    /// Under 100 ms
    Excellent,
    /// Under 300 ms
    Good,
    /// Under 1 s
    Poor,
    /// 1 s or more
    Critical,
}

impl LinkQuality {
    /// Classify a round-trip time
    #[must_use]
    pub fn from_rtt(rtt: Duration) -> Self {
        match rtt.as_millis() {
            0..100 => Self::Excellent,
            100..300 => Self::Good,
            300..1000 => Self::Poor,
            _ => Self::Critical,
        }
    }
}

impl fmt::Display for LinkQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Poor => "poor",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Traffic totals since the first connected session
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Bandwidth {
    /// Application bytes sent
    pub bytes_sent: u64,
    /// Application bytes received
    pub bytes_received: u64,
    /// Messages sent
    pub messages_sent: u64,
    /// Messages received
    pub messages_received: u64,
    /// Messages per second over the metering window
    pub messages_per_second: f64,
    /// Mean message size in bytes
    pub average_message_size: f64,
}

/// Point-in-time diagnostic inputs
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiagnosticsSnapshot {
    /// Relay link is open
    pub relay_connected: bool,
    /// At least one peer session is connected
    pub p2p_connected: bool,
    /// Gathered candidates
    pub candidates: CandidateCounts,
    /// Latest round-trip time on any peer link
    pub latency: Option<Duration>,
    /// Latest round-trip time per connected peer
    pub peer_latency: BTreeMap<String, Duration>,
    /// Selected candidate type on the latest sample
    pub selected_candidate: Option<CandidateType>,
    /// Traffic totals
    pub bandwidth: Bandwidth,
}

impl DiagnosticsSnapshot {
    /// Link quality from the latest round-trip time
    #[must_use]
    pub fn quality(&self) -> Option<LinkQuality> {
        self.latency.map(LinkQuality::from_rtt)
    }

    /// Link quality to one peer
    #[must_use]
    pub fn quality_of(&self, peer: &str) -> Option<LinkQuality> {
        self.peer_latency.get(peer).copied().map(LinkQuality::from_rtt)
    }
}

#[derive(Debug, Default)]
struct State {
    relay_connected: bool,
    p2p_connected: bool,
    candidates: CandidateCounts,
    latency: Option<Duration>,
    peer_latency: BTreeMap<String, Duration>,
    selected_candidate: Option<CandidateType>,
    bytes_sent: u64,
    bytes_received: u64,
    messages_sent: u64,
    messages_received: u64,
    metering_since: Option<Instant>,
}

/// Shared diagnostics recorder
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    state: Arc<Mutex<State>>,
}

impl Diagnostics {
    /// Create an empty recorder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a gathered candidate line
    pub fn record_candidate(&self, line: &str) -> Option<CandidateType> {
        let kind = candidate_type_of(line);
        self.state().candidates.add(kind);
        kind
    }

    /// Record relay link state
    pub fn set_relay_connected(&self, connected: bool) {
        self.state().relay_connected = connected;
    }

    /// Record peer link state
    pub fn set_p2p_connected(&self, connected: bool) {
        let mut state = self.state();
        state.p2p_connected = connected;
        if connected && state.metering_since.is_none() {
            state.metering_since = Some(Instant::now());
        }
    }

    /// Record a stats sample from the link to `peer`
    pub fn record_stats(&self, peer: &str, stats: &LinkStats) {
        let mut state = self.state();
        if let Some(rtt) = stats.rtt {
            state.latency = Some(rtt);
            state.peer_latency.insert(peer.to_string(), rtt);
        }
        if stats.selected_candidate.is_some() {
            state.selected_candidate = stats.selected_candidate;
        }
    }

    /// Drop per-peer samples once the session with `peer` ends
    pub fn forget_peer(&self, peer: &str) {
        self.state().peer_latency.remove(peer);
    }

    /// Record an outgoing application message
    pub fn record_sent(&self, bytes: usize) {
        let mut state = self.state();
        state.bytes_sent += bytes as u64;
        state.messages_sent += 1;
    }

    /// Record an incoming application message
    pub fn record_received(&self, bytes: usize) {
        let mut state = self.state();
        state.bytes_received += bytes as u64;
        state.messages_received += 1;
    }

    /// Reset candidate counts and link state
    pub fn reset(&self) {
        *self.state() = State::default();
    }

    /// Current inputs
    #[must_use]
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        let state = self.state();
        let messages = state.messages_sent + state.messages_received;
        let bytes = state.bytes_sent + state.bytes_received;
        let elapsed = state
            .metering_since
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or_default();

        DiagnosticsSnapshot {
            relay_connected: state.relay_connected,
            p2p_connected: state.p2p_connected,
            candidates: state.candidates,
            latency: state.latency,
            peer_latency: state.peer_latency.clone(),
            selected_candidate: state.selected_candidate,
            bandwidth: Bandwidth {
                bytes_sent: state.bytes_sent,
                bytes_received: state.bytes_received,
                messages_sent: state.messages_sent,
                messages_received: state.messages_received,
                messages_per_second: if elapsed > 0.0 {
                    messages as f64 / elapsed
                } else {
                    0.0
                },
                average_message_size: if messages > 0 {
                    bytes as f64 / messages as f64
                } else {
                    0.0
                },
            },
        }
    }

    /// Findings for the current inputs
    #[must_use]
    pub fn findings(&self) -> Vec<Finding> {
        evaluate(&self.snapshot())
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Classify diagnostic inputs
#[must_use]
pub fn evaluate(snapshot: &DiagnosticsSnapshot) -> Vec<Finding> {
    let mut findings = Vec::new();

    if !snapshot.relay_connected {
        findings.push(
            Finding::new(Severity::Critical, "Cannot reach the signaling relay").with_solution(
                "Check the network connection; on a phone try switching between Wi-Fi and cellular.",
            ),
        );
    }

    let c = &snapshot.candidates;
    let total = c.total();
    if total == 0 {
        findings.push(
            Finding::new(Severity::Critical, "No ICE candidates gathered")
                .with_solution("Check firewall settings; UDP and TCP ports may be blocked."),
        );
    } else if c.relay > 0 {
        findings.push(Finding::new(
            Severity::Success,
            format!("Gathered {total} ICE candidates (including relay)"),
        ));
    } else if c.server_reflexive > 0 || c.peer_reflexive > 0 {
        findings.push(Finding::new(
            Severity::Info,
            format!("Gathered {total} ICE candidates"),
        ));
    } else if c.host > 0 {
        findings.push(
            Finding::new(
                Severity::Warning,
                "Only local network candidates; the peers may not reach each other",
            )
            .with_solution("The devices may be behind different NATs. Disable VPNs or configure a TURN relay."),
        );
    } else {
        findings.push(Finding::new(
            Severity::Info,
            format!("Gathered {total} ICE candidates of unrecognized type"),
        ));
    }

    if snapshot.p2p_connected {
        findings.push(Finding::new(Severity::Success, "Peer link established"));
    } else {
        findings.push(
            Finding::new(Severity::Warning, "Peer link not established")
                .with_solution("Wait for the other side to join, or make sure it opened the invite."),
        );
    }

    if let Some(latency) = snapshot.latency {
        let ms = latency.as_millis();
        if ms > 1000 {
            findings.push(
                Finding::new(Severity::Warning, format!("High latency: {ms}ms"))
                    .with_solution("Switch to a more stable network."),
            );
        } else if ms > 500 {
            findings.push(Finding::new(Severity::Info, format!("Latency: {ms}ms")));
        } else {
            findings.push(Finding::new(Severity::Success, format!("Latency good: {ms}ms")));
        }
    }

    findings
}

/// Device-specific connection advice
#[must_use]
pub fn advice(device: DeviceClass) -> Vec<&'static str> {
    let mut lines = match device {
        DeviceClass::Handheld => vec![
            "Handheld device:",
            "- Prefer a secure (wss) relay endpoint",
            "- Avoid public Wi-Fi",
            "- Disable VPNs that may block WebSockets",
            "- Keep the screen on; locking may drop the relay link",
        ],
        DeviceClass::Desktop => vec![
            "Desktop device:",
            "- Make sure the firewall allows WebRTC traffic",
            "- Try disabling privacy extensions",
            "- Check proxy and VPN settings",
        ],
    };
    lines.extend([
        "",
        "Security:",
        "- Verify the connection fingerprint",
        "- Confirm the peer's identity over a separate channel",
        "- Avoid untrusted networks",
    ]);
    lines
}

/// Plain-text diagnostic report
#[must_use]
pub fn report(snapshot: &DiagnosticsSnapshot, device: DeviceClass) -> String {
    use std::fmt::Write;

    let mut out = String::from("=== GhostLink connection report ===\n\nFindings:\n");
    for finding in evaluate(snapshot) {
        let _ = writeln!(out, "[{}] {}", finding.severity, finding.message);
        if let Some(solution) = finding.solution {
            let _ = writeln!(out, "   Fix: {solution}");
        }
    }

    out.push_str("\nAdvice:\n");
    for line in advice(device) {
        let _ = writeln!(out, "{line}");
    }

    let c = &snapshot.candidates;
    let _ = writeln!(out, "\nTechnical:");
    let _ = writeln!(out, "- Device: {device}");
    let _ = writeln!(
        out,
        "- Relay: {}",
        if snapshot.relay_connected { "connected" } else { "disconnected" }
    );
    let _ = writeln!(
        out,
        "- Candidates: {} (host {}, srflx {}, prflx {}, relay {}, unknown {})",
        c.total(),
        c.host,
        c.server_reflexive,
        c.peer_reflexive,
        c.relay,
        c.unknown
    );
    let _ = writeln!(
        out,
        "- Peer link: {}",
        if snapshot.p2p_connected { "established" } else { "not established" }
    );
    if let Some(latency) = snapshot.latency {
        let quality = LinkQuality::from_rtt(latency);
        let _ = writeln!(out, "- Latency: {}ms ({quality})", latency.as_millis());
    }
    for (peer, rtt) in &snapshot.peer_latency {
        let quality = LinkQuality::from_rtt(*rtt);
        let _ = writeln!(out, "  - {peer}: {}ms ({quality})", rtt.as_millis());
    }
    if let Some(kind) = snapshot.selected_candidate {
        let _ = writeln!(out, "- Selected candidate: {kind}");
    }
    let b = &snapshot.bandwidth;
    let _ = writeln!(
        out,
        "- Traffic: {} B sent, {} B received, {:.1} msg/s, {:.0} B avg",
        b.bytes_sent, b.bytes_received, b.messages_per_second, b.average_message_size
    );

    out
}
