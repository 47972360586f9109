//! NAT traversal helpers.
//!
//! This module provides:
//! - Candidate line parsing (host, server-reflexive, peer-reflexive, relay)
//! - The ranked table of discovery (STUN) and relay (TURN) helper servers

pub mod ice;
pub mod servers;

pub use ice::{CandidateParseError, CandidateType, IceCandidate, candidate_type_of};
pub use servers::{
    HelperClass, HelperProvider, IceConfig, IcePolicy, IceServer, default_providers,
    ranked_ice_servers,
};
