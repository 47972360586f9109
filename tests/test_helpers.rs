//! Test helpers for multi-peer scenarios
//!
//! Builds session contexts over an in-process relay and records handler
//! callbacks so tests can assert on them.

use ghostlink_core::{
    DeviceClass, DisconnectReason, LinkConfig, LoopbackNetwork, PeerHandler, SessionContext,
    TransportChannel,
};
use ghostlink_signal::relay::MemoryRelay;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Direct relay address used by the scenarios
pub const DIRECT: &str = "mem://direct";

/// Managed broker address used by the scenarios
pub const BROKER: &str = "mem://broker";

/// Records every handler callback
#[derive(Default)]
pub struct RecordingHandler {
    connects: Mutex<Vec<TransportChannel>>,
    messages: Mutex<Vec<(String, Vec<u8>)>>,
    disconnects: Mutex<Vec<(String, DisconnectReason)>>,
}

impl RecordingHandler {
    /// New handler behind an `Arc`
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of `on_connect` calls
    pub fn connect_count(&self) -> usize {
        self.connects.lock().unwrap().len()
    }

    /// Take the most recent channel handed to `on_connect`
    pub fn take_channel(&self) -> Option<TransportChannel> {
        self.connects.lock().unwrap().pop()
    }

    /// Received payloads in arrival order
    pub fn messages(&self) -> Vec<(String, Vec<u8>)> {
        self.messages.lock().unwrap().clone()
    }

    /// Disconnect reports
    pub fn disconnects(&self) -> Vec<(String, DisconnectReason)> {
        self.disconnects.lock().unwrap().clone()
    }
}

impl PeerHandler for RecordingHandler {
    fn on_connect(&self, channel: TransportChannel) {
        self.connects.lock().unwrap().push(channel);
    }

    fn on_message(&self, peer: &str, data: &[u8]) {
        self.messages
            .lock()
            .unwrap()
            .push((peer.to_string(), data.to_vec()));
    }

    fn on_disconnect(&self, peer: &str, reason: DisconnectReason) {
        self.disconnects
            .lock()
            .unwrap()
            .push((peer.to_string(), reason));
    }
}

/// Config pointing the direct strategy at `direct` and managed at `broker`
pub fn link_config(direct: &[&str], broker: &[&str]) -> LinkConfig {
    let mut config = LinkConfig::default();
    config.relay.endpoints = direct.iter().map(|s| s.to_string()).collect();
    config.managed.endpoints = broker.iter().map(|s| s.to_string()).collect();
    config
}

/// Session context over the in-process relay and loopback negotiation
pub fn context(
    relay: &MemoryRelay,
    network: &LoopbackNetwork,
    device: DeviceClass,
    config: LinkConfig,
) -> SessionContext {
    SessionContext::builder()
        .config(config)
        .device(device)
        .connector(Arc::new(relay.clone()))
        .negotiators(Arc::new(network.factory()))
        .build()
        .unwrap()
}

/// Let spawned tasks run to quiescence
pub async fn settle() {
    for _ in 0..100 {
        tokio::task::yield_now().await;
    }
}

/// Poll `cond` every 10ms until it holds or `limit` passes
pub async fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
