//! ICE candidate lines.
//!
//! Parsing and formatting of `candidate:` attribute lines as carried inside
//! negotiation payloads. Diagnostics uses the candidate type to judge
//! whether a path is likely to succeed.

use std::fmt;
use std::str::FromStr;

/// ICE candidate type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateType {
    /// Host candidate (local interface address)
    Host,
    /// Server reflexive candidate (public address from STUN)
    ServerReflexive,
    /// Peer reflexive candidate (discovered during connectivity checks)
    PeerReflexive,
    /// Relay candidate (from TURN server)
    Relay,
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => write!(f, "host"),
            Self::ServerReflexive => write!(f, "srflx"),
            Self::PeerReflexive => write!(f, "prflx"),
            Self::Relay => write!(f, "relay"),
        }
    }
}

impl FromStr for CandidateType {
    type Err = CandidateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host" => Ok(Self::Host),
            "srflx" => Ok(Self::ServerReflexive),
            "prflx" => Ok(Self::PeerReflexive),
            "relay" => Ok(Self::Relay),
            other => Err(CandidateParseError::UnknownType(other.to_string())),
        }
    }
}

/// Candidate line parse errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CandidateParseError {
    /// Line does not start with `candidate:`
    #[error("not a candidate line")]
    NotCandidate,
    /// Too few fields
    #[error("truncated candidate line")]
    Truncated,
    /// Numeric field did not parse
    #[error("invalid {0} field")]
    InvalidField(&'static str),
    /// `typ` value not recognized
    #[error("unknown candidate type: {0}")]
    UnknownType(String),
}

/// ICE candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    /// Foundation - unique identifier for candidates that can be paired
    pub foundation: String,
    /// Component ID
    pub component_id: u32,
    /// Transport protocol (`udp` or `tcp`)
    pub transport: String,
    /// Priority for candidate selection
    pub priority: u32,
    /// Connection address (IP literal or mDNS hostname)
    pub address: String,
    /// Connection port
    pub port: u16,
    /// Candidate type
    pub candidate_type: CandidateType,
    /// Related address and port (for srflx/prflx/relay candidates)
    pub related: Option<(String, u16)>,
}

impl IceCandidate {
    /// Create a UDP candidate of the given type
    #[must_use]
    pub fn new(candidate_type: CandidateType, address: impl Into<String>, port: u16) -> Self {
        let address = address.into();
        Self {
            foundation: Self::compute_foundation(&address, candidate_type),
            component_id: 1,
            transport: "udp".to_string(),
            priority: Self::compute_priority(candidate_type, 65535, 1),
            address,
            port,
            candidate_type,
            related: None,
        }
    }

    /// Attach the related (base) address
    #[must_use]
    pub fn with_related(mut self, address: impl Into<String>, port: u16) -> Self {
        self.related = Some((address.into(), port));
        self
    }

    /// Parse a `candidate:` line
    ///
    /// An optional leading `a=` is accepted.
    ///
    /// # Errors
    ///
    /// Returns error if the line is malformed or the type is unknown.
    pub fn parse(line: &str) -> Result<Self, CandidateParseError> {
        let line = line.trim();
        let line = line.strip_prefix("a=").unwrap_or(line);
        let body = line
            .strip_prefix("candidate:")
            .ok_or(CandidateParseError::NotCandidate)?;

        let fields: Vec<&str> = body.split_whitespace().collect();
        if fields.len() < 8 || fields[6] != "typ" {
            return Err(CandidateParseError::Truncated);
        }

        let component_id = fields[1]
            .parse()
            .map_err(|_| CandidateParseError::InvalidField("component"))?;
        let priority = fields[3]
            .parse()
            .map_err(|_| CandidateParseError::InvalidField("priority"))?;
        let port = fields[5]
            .parse()
            .map_err(|_| CandidateParseError::InvalidField("port"))?;
        let candidate_type = fields[7].parse()?;

        let mut raddr = None;
        let mut rport = None;
        for pair in fields[8..].chunks(2) {
            match pair {
                ["raddr", value] => raddr = Some((*value).to_string()),
                ["rport", value] => {
                    rport = Some(
                        value
                            .parse()
                            .map_err(|_| CandidateParseError::InvalidField("rport"))?,
                    );
                }
                _ => {}
            }
        }

        Ok(Self {
            foundation: fields[0].to_string(),
            component_id,
            transport: fields[2].to_lowercase(),
            priority,
            address: fields[4].to_string(),
            port,
            candidate_type,
            related: raddr.zip(rport),
        })
    }

    /// Compute foundation (simplified - hash of type + address)
    fn compute_foundation(address: &str, typ: CandidateType) -> String {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        address.hash(&mut hasher);
        typ.hash(&mut hasher);
        format!("{:x}", hasher.finish()).chars().take(8).collect()
    }

    /// Compute priority (RFC 8445 Section 5.1.2)
    ///
    /// Priority = (2^24) * (type preference) + (2^8) * (local preference) + (256 - component ID)
    fn compute_priority(typ: CandidateType, local_pref: u32, component_id: u32) -> u32 {
        let type_pref = match typ {
            CandidateType::Host => 126,
            CandidateType::PeerReflexive => 110,
            CandidateType::ServerReflexive => 100,
            CandidateType::Relay => 0,
        };

        ((1 << 24) * type_pref) + ((1 << 8) * local_pref) + (256 - component_id)
    }

    /// Format as ICE candidate string (SDP format)
    #[must_use]
    pub fn to_sdp_string(&self) -> String {
        let mut s = format!(
            "candidate:{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component_id,
            self.transport,
            self.priority,
            self.address,
            self.port,
            self.candidate_type
        );

        if let Some((addr, port)) = &self.related {
            s.push_str(&format!(" raddr {addr} rport {port}"));
        }

        s
    }
}

/// Extract the candidate type from a candidate line, if recognizable
#[must_use]
pub fn candidate_type_of(line: &str) -> Option<CandidateType> {
    IceCandidate::parse(line).ok().map(|c| c.candidate_type)
}
