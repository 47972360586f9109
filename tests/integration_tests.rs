//! End-to-end connection scenarios over the in-process relay.

use ghostlink_core::{
    DeviceClass, DisconnectReason, LinkError, LinkEvent, LoopbackNetwork, ProtocolSelector, Role,
    StrategyKind,
};
use ghostlink_integration_tests::test_helpers::{
    BROKER, DIRECT, RecordingHandler, context, link_config, settle, wait_until,
};
use ghostlink_signal::relay::{Envelope, MemoryRelay, RelayClient, RelayClientConfig};
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;

fn selector(
    relay: &MemoryRelay,
    network: &LoopbackNetwork,
    device: DeviceClass,
    handler: std::sync::Arc<RecordingHandler>,
) -> ProtocolSelector {
    let ctx = context(relay, network, device, link_config(&[DIRECT], &[BROKER]));
    ProtocolSelector::new(ctx, handler)
}

#[tokio::test(start_paused = true)]
async fn test_relay_failover_to_second_endpoint() {
    let relay = MemoryRelay::new();
    relay.serve("mem://b");
    let network = LoopbackNetwork::new();
    let ctx = context(
        &relay,
        &network,
        DeviceClass::Desktop,
        link_config(&["mem://a", "mem://b"], &[BROKER]),
    );
    let selector = ProtocolSelector::new(ctx.clone(), RecordingHandler::shared());

    let outcome = selector.start().await.unwrap();
    assert_eq!(outcome.strategy, StrategyKind::Direct);
    assert!(!outcome.fallback_used);
    assert_eq!(relay.attempts("mem://a"), 1);
    assert_eq!(relay.attempts("mem://b"), 1);
    assert_eq!(relay.attempts(BROKER), 0);

    assert!(ctx.events().any(|e| matches!(
        e,
        LinkEvent::RelayEndpointFailed { endpoint, .. } if endpoint == "mem://a"
    )));
    assert!(ctx.events().any(|e| matches!(
        e,
        LinkEvent::RelayOpen { endpoint, .. } if endpoint == "mem://b"
    )));
    assert!(ctx.diagnostics().snapshot().relay_connected);

    // First ping follows OPEN immediately, then one per heartbeat interval
    settle().await;
    assert_eq!(relay.sent_by(&outcome.identity), vec![Envelope::Ping]);
    tokio::time::sleep(ctx.timeouts().relay_heartbeat + Duration::from_millis(10)).await;
    let pings = relay
        .sent_by(&outcome.identity)
        .into_iter()
        .filter(|e| *e == Envelope::Ping)
        .count();
    assert_eq!(pings, 2);

    selector.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_handheld_uses_managed_only() {
    let relay = MemoryRelay::new();
    relay.serve(DIRECT);
    relay.serve(BROKER);
    let network = LoopbackNetwork::new();

    let answerer_handler = RecordingHandler::shared();
    let answerer = selector(&relay, &network, DeviceClass::Handheld, answerer_handler.clone());
    let offerer = selector(&relay, &network, DeviceClass::Handheld, RecordingHandler::shared());

    let bound = answerer.start().await.unwrap();
    assert_eq!(bound.strategy, StrategyKind::Managed);

    let established = offerer
        .initiate(&bound.identity, RecordingHandler::shared())
        .await
        .unwrap();
    assert_eq!(established.strategy, StrategyKind::Managed);
    assert!(!established.fallback_used);

    settle().await;
    assert_eq!(answerer_handler.connect_count(), 1);
    assert_eq!(relay.attempts(DIRECT), 0);
    assert!(!offerer
        .context()
        .events()
        .any(|e| matches!(e, LinkEvent::FallbackUsed { .. })));

    offerer.teardown().await;
    answerer.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_messages_delivered_in_order() {
    let relay = MemoryRelay::new();
    relay.serve(DIRECT);
    relay.serve(BROKER);
    let network = LoopbackNetwork::new();

    let receiver = RecordingHandler::shared();
    let answerer = selector(&relay, &network, DeviceClass::Desktop, receiver.clone());
    let offerer = selector(&relay, &network, DeviceClass::Desktop, RecordingHandler::shared());

    let bound = answerer.start().await.unwrap();
    let sender = RecordingHandler::shared();
    offerer.initiate(&bound.identity, sender.clone()).await.unwrap();

    let channel = sender.take_channel().expect("on_connect delivers a channel");
    assert_eq!(channel.peer(), bound.identity);
    for i in 0..50 {
        channel.send(format!("msg-{i:02}")).unwrap();
    }

    assert!(wait_until(Duration::from_secs(5), || receiver.messages().len() == 50).await);
    let expected: Vec<Vec<u8>> = (0..50).map(|i| format!("msg-{i:02}").into_bytes()).collect();
    let received: Vec<Vec<u8>> = receiver.messages().into_iter().map(|(_, data)| data).collect();
    assert_eq!(received, expected);

    let offerer_id = offerer.identity().await.unwrap();
    assert!(receiver.messages().iter().all(|(peer, _)| *peer == offerer_id));
    assert_eq!(offerer.context().diagnostics().snapshot().bandwidth.messages_sent, 50);

    offerer.teardown().await;
    answerer.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_initiate_falls_back_to_managed() {
    let relay = MemoryRelay::new();
    relay.serve(DIRECT);
    relay.serve(BROKER);
    let network = LoopbackNetwork::new();

    // The answerer is only reachable through the broker
    let answerer_handler = RecordingHandler::shared();
    let answerer = selector(&relay, &network, DeviceClass::Handheld, answerer_handler.clone());
    let bound = answerer.start().await.unwrap();

    let offerer = selector(&relay, &network, DeviceClass::Desktop, RecordingHandler::shared());
    assert_eq!(offerer.start().await.unwrap().strategy, StrategyKind::Direct);

    let offerer_handler = RecordingHandler::shared();
    let established = offerer
        .initiate(&bound.identity, offerer_handler.clone())
        .await
        .unwrap();
    assert_eq!(established.strategy, StrategyKind::Managed);
    assert!(established.fallback_used);
    assert_eq!(offerer.bound_strategy().await, Some(StrategyKind::Managed));

    let events = offerer.context().events();
    assert!(events.any(|e| matches!(e, LinkEvent::FallbackUsed { .. })));
    assert!(events.any(|e| matches!(e, LinkEvent::TornDown { kind: StrategyKind::Direct })));

    // The failed direct attempt surfaces only through the fallback
    settle().await;
    assert_eq!(answerer_handler.connect_count(), 1);
    assert_eq!(offerer_handler.connect_count(), 1);
    assert!(offerer_handler.disconnects().is_empty());

    offerer.teardown().await;
    answerer.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_no_fallback_while_direct_serves_peers() {
    let relay = MemoryRelay::new();
    relay.serve(DIRECT);
    relay.serve(BROKER);
    let network = LoopbackNetwork::new();

    let desktop_handler = RecordingHandler::shared();
    let desktop = selector(&relay, &network, DeviceClass::Desktop, desktop_handler.clone());
    let desktop_id = desktop.start().await.unwrap().identity;

    // Reachable only through the broker
    let handheld = selector(&relay, &network, DeviceClass::Handheld, RecordingHandler::shared());
    let handheld_id = handheld.start().await.unwrap().identity;

    let offerer = selector(&relay, &network, DeviceClass::Desktop, RecordingHandler::shared());
    offerer.initiate(&desktop_id, RecordingHandler::shared()).await.unwrap();
    settle().await;
    assert_eq!(desktop_handler.connect_count(), 1);

    let failed_handler = RecordingHandler::shared();
    let err = offerer
        .initiate(&handheld_id, failed_handler.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::NegotiationTimeout(_)));
    assert!(failed_handler.disconnects().is_empty());

    assert_eq!(offerer.bound_strategy().await, Some(StrategyKind::Direct));
    assert!(!offerer.fallback_used());
    assert_eq!(offerer.connected_peers().await, vec![desktop_id]);
    assert_eq!(relay.attempts(BROKER), 1);
    assert!(!offerer
        .context()
        .events()
        .any(|e| matches!(e, LinkEvent::FallbackUsed { .. })));

    settle().await;
    assert!(desktop_handler.disconnects().is_empty());

    offerer.teardown().await;
    handheld.teardown().await;
    desktop.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_no_second_fallback() {
    let relay = MemoryRelay::new();
    relay.refuse(DIRECT);
    relay.serve(BROKER);
    let network = LoopbackNetwork::new();

    let offerer = selector(&relay, &network, DeviceClass::Desktop, RecordingHandler::shared());
    assert!(offerer.start().await.unwrap().fallback_used);

    // Nobody answers on the broker either; the managed error surfaces
    let err = offerer
        .initiate("nobody", RecordingHandler::shared())
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::NegotiationTimeout(_)));
    assert_eq!(offerer.bound_strategy().await, Some(StrategyKind::Managed));
    assert_eq!(relay.attempts(DIRECT), 1);

    offerer.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_all_relays_unavailable() {
    let relay = MemoryRelay::new();
    relay.refuse(DIRECT);
    relay.refuse(BROKER);
    let network = LoopbackNetwork::new();

    let selector = selector(&relay, &network, DeviceClass::Desktop, RecordingHandler::shared());
    let err = selector.start().await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(selector.bound_strategy().await, None);
    assert!(!selector.context().diagnostics().snapshot().relay_connected);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_signals_create_one_session() {
    let relay = MemoryRelay::new();
    relay.serve(DIRECT);
    let network = LoopbackNetwork::new();

    let answerer = selector(&relay, &network, DeviceClass::Desktop, RecordingHandler::shared());
    let bound = answerer.start().await.unwrap();

    let (tx, _rx) = mpsc::unbounded_channel();
    let remote = RelayClient::connect(&relay, DIRECT, "remote", &RelayClientConfig::default(), tx)
        .await
        .unwrap();
    let candidate = json!({"type": "candidate", "candidate": "candidate:1 1 udp 1 10.0.0.2 9 typ host"});
    for _ in 0..3 {
        remote.send_signal(&bound.identity, candidate.clone()).unwrap();
    }
    settle().await;

    let created = answerer
        .context()
        .events()
        .snapshot()
        .into_iter()
        .filter(|e| {
            matches!(
                &e.event,
                LinkEvent::SessionCreated { peer, role: Role::Answerer } if peer == "remote"
            )
        })
        .count();
    assert_eq!(created, 1);

    remote.close().await;
    answerer.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_connect_and_disconnect_reported_once() {
    let relay = MemoryRelay::new();
    relay.serve(DIRECT);
    let network = LoopbackNetwork::new();

    let answerer_handler = RecordingHandler::shared();
    let answerer = selector(&relay, &network, DeviceClass::Desktop, answerer_handler.clone());
    let offerer = selector(&relay, &network, DeviceClass::Desktop, RecordingHandler::shared());

    let bound = answerer.start().await.unwrap();
    let offerer_handler = RecordingHandler::shared();
    offerer.initiate(&bound.identity, offerer_handler.clone()).await.unwrap();
    settle().await;

    assert_eq!(offerer_handler.connect_count(), 1);
    assert_eq!(answerer_handler.connect_count(), 1);

    offerer.teardown().await;
    offerer.teardown().await;
    settle().await;

    let disconnects = answerer_handler.disconnects();
    assert_eq!(disconnects.len(), 1);
    assert_eq!(disconnects[0].1, DisconnectReason::PeerLeft);
    assert!(offerer_handler.disconnects().len() <= 1);
    assert_eq!(answerer.connected_peers().await, Vec::<String>::new());

    answerer.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_event_log_stays_bounded() {
    let relay = MemoryRelay::new();
    relay.serve(DIRECT);
    let network = LoopbackNetwork::new();

    let mut config = link_config(&[DIRECT], &[BROKER]);
    config.event_log_capacity = 4;
    let answerer_ctx = context(&relay, &network, DeviceClass::Desktop, config.clone());
    let offerer_ctx = context(&relay, &network, DeviceClass::Desktop, config);
    let answerer = ProtocolSelector::new(answerer_ctx, RecordingHandler::shared());
    let offerer = ProtocolSelector::new(offerer_ctx.clone(), RecordingHandler::shared());

    let bound = answerer.start().await.unwrap();
    offerer.initiate(&bound.identity, RecordingHandler::shared()).await.unwrap();
    offerer.teardown().await;

    let events = offerer_ctx.events();
    assert_eq!(events.len(), 4);
    assert!(events.dropped() > 0);
    assert!(matches!(
        events.snapshot().last().map(|e| &e.event),
        Some(LinkEvent::TornDown { .. })
    ));

    answerer.teardown().await;
}
