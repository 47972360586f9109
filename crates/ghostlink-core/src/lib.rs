//! # GhostLink Core
//!
//! Peer connection establishment for GhostLink.
//!
//! This crate provides:
//! - Two interchangeable negotiation strategies over a signaling relay
//! - The protocol selector binding one strategy per session, with a
//!   one-shot fallback from direct to managed
//! - Device classification and the timeout table derived from it
//! - Passive connection diagnostics and a bounded event log
//!
//! ## Example
//!
//! ```no_run
//! use ghostlink_core::{LoopbackNetwork, NullHandler, ProtocolSelector, SessionContext};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), ghostlink_core::LinkError> {
//! let ctx = SessionContext::builder()
//!     .negotiators(Arc::new(LoopbackNetwork::new().factory()))
//!     .build()?;
//! let selector = ProtocolSelector::new(ctx, Arc::new(NullHandler));
//!
//! let established = selector.initiate("remote-peer", Arc::new(NullHandler)).await?;
//! println!("connected via {}", established.strategy);
//! selector.send(b"hello").await?;
//! selector.teardown().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod context;
pub mod device;
pub mod diagnostics;
mod engine;
pub mod error;
pub mod event_log;
pub mod handler;
pub mod identity;
pub mod loopback;
pub mod negotiator;
pub mod selector;
pub mod strategy;

pub use config::{LinkConfig, TimeoutTable};
pub use context::{SessionContext, SessionContextBuilder};
pub use device::{DeviceClass, EnvironmentSignals};
pub use diagnostics::{Diagnostics, DiagnosticsSnapshot, Finding, LinkQuality, LinkStats, Severity};
pub use error::{DisconnectReason, LinkError, NegotiationFailure, Result};
pub use event_log::{EventLog, LinkEvent, LoggedEvent};
pub use handler::{NullHandler, PeerHandler, TransportChannel};
pub use identity::{IdentityStore, MemoryIdentityStore};
pub use loopback::{LoopbackBehavior, LoopbackFactory, LoopbackNetwork};
pub use negotiator::{NegotiatorEvent, NegotiatorFactory, NegotiatorSink, PathNegotiator, Role};
pub use selector::{Established, ProtocolSelector, StartOutcome};
pub use strategy::{DirectStrategy, ManagedStrategy, NegotiationStrategy, StrategyKind};
