//! # GhostLink Signal
//!
//! Signaling layer for GhostLink.
//!
//! This crate provides:
//! - The relay envelope protocol (`OPEN`, `PING`, `PONG`, `SIGNAL`)
//! - A pool of redundant relay endpoints with failover
//! - The relay session client (open handshake, heartbeat, inbound routing)
//! - A relay server and an in-process relay for tests
//! - Ranked NAT-traversal helper servers and candidate parsing
//!
//! ## Relay session
//!
//! A client opens one persistent link to a relay endpoint, announcing its
//! session identity as a connect-time parameter. The relay answers with
//! `OPEN`, after which the client pings on a fixed interval and exchanges
//! `SIGNAL` envelopes addressed by session identity.
//!
//! ## Example
//!
//! ```rust,no_run
//! use ghostlink_signal::relay::{EndpointPool, RelayClient, RelayClientConfig, WsConnector};
//! use tokio::sync::mpsc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut pool = EndpointPool::new(["wss://relay-a.example/peerjs", "wss://relay-b.example/peerjs"]);
//! let (events_tx, mut events) = mpsc::unbounded_channel();
//!
//! let client = RelayClient::connect_with_pool(
//!     &WsConnector,
//!     &mut pool,
//!     "k3j9x0p2a",
//!     &RelayClientConfig::default(),
//!     events_tx,
//!     |endpoint, err| eprintln!("{endpoint} failed: {err}"),
//! )
//! .await?;
//!
//! client.send_signal("q8w1e2r3t", serde_json::json!({"type": "offer"}))?;
//! let _event = events.recv().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod nat;
pub mod relay;

// Re-export commonly used types
pub use nat::{
    CandidateType, HelperClass, HelperProvider, IceCandidate, IceConfig, IcePolicy, IceServer,
    ranked_ice_servers,
};
pub use relay::{
    ConnectParams, EndpointPool, Envelope, RelayClient, RelayClientConfig, RelayClientState,
    RelayConnector, RelayError, RelayEvent, RelayLink,
};
