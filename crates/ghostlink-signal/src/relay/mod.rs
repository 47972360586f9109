//! # Relay Signaling Infrastructure
//!
//! Rendezvous relay used to exchange connection-setup metadata between
//! peers that cannot yet reach each other directly.
//!
//! ## Features
//!
//! - JSON envelope protocol with relay-side addressing by session identity
//! - Ordered endpoint pool with failure marking and rotation
//! - Open handshake with bounded timeout and periodic heartbeat
//! - WebSocket client transport and an axum-based relay server
//! - In-process relay for deterministic tests
//!
//! ## Architecture
//!
//! ```text
//!                    ┌─────────────────┐
//!                    │   Relay Server  │
//!                    │  (rendezvous)   │
//!                    └────────┬────────┘
//!                             │  SIGNAL {src, dst, signal}
//!              ┌──────────────┴──────────────┐
//!              │                              │
//!              ▼                              ▼
//!       ┌─────────────┐                ┌─────────────┐
//!       │   Peer A    │                │   Peer B    │
//!       │ id=k3j9x0p2a│                │ id=q8w1e2r3t│
//!       └─────────────┘                └─────────────┘
//! ```

pub mod client;
pub mod hub;
pub mod link;
pub mod memory;
pub mod pool;
pub mod protocol;
pub mod server;

pub use client::{RelayClient, RelayClientConfig, RelayClientState, RelayEvent, fetch_assigned_id};
pub use hub::RelayHub;
pub use link::{RelayConnector, RelayLink, WsConnector};
pub use memory::MemoryRelay;
pub use pool::{EndpointPool, PoolStatus, RelayEndpoint};
pub use protocol::{ConnectParams, Envelope, RelayError, SERVICE_TAG};
pub use server::{RelayServer, RelayServerConfig};

use std::time::Duration;

/// Default auth token sent with every connect
pub const DEFAULT_TOKEN: &str = "token";

/// Default relay open timeout (20 seconds)
pub const RELAY_OPEN_TIMEOUT: Duration = Duration::from_secs(20);

/// Default relay heartbeat interval (20 seconds)
pub const RELAY_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

/// Delay between accepting a link and sending `OPEN` (100 milliseconds)
pub const RELAY_OPEN_DELAY: Duration = Duration::from_millis(100);
