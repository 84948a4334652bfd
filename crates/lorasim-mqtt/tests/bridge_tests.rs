//! ---
//! sim_section: "03-mqtt-bridge"
//! sim_subsection: "module"
//! sim_type: "test"
//! sim_scope: "code"
//! sim_description: "Bridge behaviour against the in-process broker."
//! sim_version: "v0.1.0"
//! sim_owner: "tbd"
//! ---
use std::time::Duration;

use lorasim_common::{QosLevel, ReconnectConfig, SimulatorError};
use lorasim_device::DownlinkCommand;
use lorasim_mqtt::{
    BridgeHandle, BridgeNotice, BridgeReport, BridgeSettings, BridgeState, MemoryBroker,
    MqttBridge, OutboundMessage,
};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

const FILTER: &str = "app/devices/+/down";

fn settings(buffer_capacity: usize, max_retries: u32) -> BridgeSettings {
    BridgeSettings {
        application_id: "app".into(),
        qos: QosLevel::AtLeastOnce,
        reconnect: ReconnectConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries,
            jitter: Duration::ZERO,
        },
        buffer_capacity,
        channel_capacity: 16,
        flush_grace: Duration::from_secs(2),
    }
}

fn message(seq: u32) -> OutboundMessage {
    OutboundMessage {
        topic: "app/devices/dev/up".into(),
        payload: seq.to_be_bytes().to_vec(),
        device_id: "dev".into(),
        seq,
    }
}

struct Harness {
    broker: MemoryBroker,
    handle: BridgeHandle,
    downlinks: mpsc::Receiver<DownlinkCommand>,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<lorasim_common::Result<BridgeReport>>,
}

fn start(broker: MemoryBroker, settings: BridgeSettings) -> Harness {
    let (downlink_tx, downlinks) = mpsc::channel(8);
    let (bridge, handle) = MqttBridge::new(settings, Box::new(broker.session()), downlink_tx);
    let (shutdown, shutdown_rx) = broadcast::channel(1);
    let task = bridge.spawn(shutdown_rx);
    Harness {
        broker,
        handle,
        downlinks,
        shutdown,
        task,
    }
}

async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..2_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held: {}", what);
}

/// Next notice that is not a state transition.
async fn next_incident(notices: &mut broadcast::Receiver<BridgeNotice>) -> BridgeNotice {
    loop {
        match notices.recv().await.expect("notice stream open") {
            BridgeNotice::StateChanged { .. } => continue,
            other => return other,
        }
    }
}

fn assert_gap(gap: Duration, expected: Duration) {
    assert!(
        gap >= expected && gap <= expected + Duration::from_millis(5),
        "gap {:?} expected {:?}",
        gap,
        expected
    );
}

#[tokio::test(start_paused = true)]
async fn startup_gives_up_after_retry_budget_with_doubling_delays() {
    let broker = MemoryBroker::new();
    broker.refuse_connects(true);
    let harness = start(broker, settings(8, 4));

    let result = harness.task.await.expect("bridge task joins");
    match result {
        Err(SimulatorError::Connectivity { attempts, .. }) => assert_eq!(attempts, 4),
        other => panic!("expected connectivity error, got {:?}", other.map(|r| r.metrics)),
    }
    assert_eq!(harness.handle.state(), BridgeState::Stopped);

    let times = harness.broker.connect_times();
    assert_eq!(times.len(), 4);
    let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
    assert_gap(gaps[0], Duration::from_secs(1));
    assert_gap(gaps[1], Duration::from_secs(2));
    assert_gap(gaps[2], Duration::from_secs(4));
}

#[tokio::test(start_paused = true)]
async fn lost_connection_reconnects_and_resubscribes() {
    let harness = start(MemoryBroker::new(), settings(8, 5));
    assert_eq!(
        harness.handle.wait_for(BridgeState::Connected).await,
        BridgeState::Connected
    );
    assert_eq!(harness.broker.subscriptions(), vec![FILTER.to_owned()]);

    harness.broker.fail_next_connects(2);
    harness.broker.drop_connection();
    assert_eq!(
        harness.handle.wait_for(BridgeState::Reconnecting).await,
        BridgeState::Reconnecting
    );
    assert_eq!(
        harness.handle.wait_for(BridgeState::Connected).await,
        BridgeState::Connected
    );

    let times = harness.broker.connect_times();
    assert_eq!(times.len(), 4);
    assert_gap(times[2] - times[1], Duration::from_secs(2));
    assert_gap(times[3] - times[2], Duration::from_secs(4));
    assert_eq!(harness.broker.subscriptions(), vec![FILTER.to_owned()]);
    assert_eq!(harness.handle.metrics().reconnects, 1);
}

#[tokio::test(start_paused = true)]
async fn every_transition_of_a_dropped_connection_is_announced() {
    let harness = start(MemoryBroker::new(), settings(8, 5));
    harness.handle.wait_for(BridgeState::Connected).await;
    let mut notices = harness.handle.notices();

    harness.broker.fail_next_connects(1);
    harness.broker.drop_connection();

    let mut transitions = Vec::new();
    while transitions.len() < 3 {
        if let BridgeNotice::StateChanged { from, to } =
            notices.recv().await.expect("notice stream open")
        {
            transitions.push((from, to));
        }
    }
    assert_eq!(
        transitions,
        vec![
            (BridgeState::Connected, BridgeState::Disconnected),
            (BridgeState::Disconnected, BridgeState::Reconnecting),
            (BridgeState::Reconnecting, BridgeState::Connected),
        ]
    );
    assert_eq!(harness.handle.metrics().reconnects, 1);
}

#[tokio::test(start_paused = true)]
async fn buffer_overflow_while_disconnected_drops_the_oldest() {
    let harness = start(MemoryBroker::new(), settings(2, 10));
    harness.handle.wait_for(BridgeState::Connected).await;
    let mut notices = harness.handle.notices();

    harness.broker.refuse_connects(true);
    harness.broker.drop_connection();
    harness.handle.wait_for(BridgeState::Reconnecting).await;

    let outbound = harness.handle.outbound();
    for seq in 1..=3 {
        outbound.send(message(seq)).await.expect("bridge accepts");
    }
    let handle = harness.handle.clone();
    eventually("buffer settles", move || {
        let metrics = handle.metrics();
        metrics.buffered == 2 && metrics.dropped == 1
    })
    .await;

    harness.broker.refuse_connects(false);
    harness.handle.wait_for(BridgeState::Connected).await;
    let broker = harness.broker.clone();
    eventually("buffer flushed", move || broker.published().len() == 2).await;

    let seqs: Vec<Vec<u8>> = harness
        .broker
        .published()
        .into_iter()
        .map(|p| p.payload)
        .collect();
    assert_eq!(seqs, vec![2u32.to_be_bytes().to_vec(), 3u32.to_be_bytes().to_vec()]);
    assert_eq!(harness.handle.metrics().dropped, 1);
    assert_eq!(
        next_incident(&mut notices).await,
        BridgeNotice::MessageDropped {
            device_id: "dev".into(),
            seq: 1,
            dropped_total: 1,
        }
    );
}

#[tokio::test(start_paused = true)]
async fn downlinks_are_routed_and_malformed_ones_counted() {
    let mut harness = start(MemoryBroker::new(), settings(8, 3));
    harness.handle.wait_for(BridgeState::Connected).await;
    let mut notices = harness.handle.notices();

    assert!(harness.broker.inject(
        "app/devices/dev/down",
        br#"{"confirmed":true,"data":"AQ==","correlationId":"c-9"}"#.to_vec(),
    ));
    let command = harness.downlinks.recv().await.expect("downlink routed");
    assert_eq!(command.device_id, "dev");
    assert_eq!(command.payload, vec![1]);
    assert_eq!(command.correlation_id, "c-9");

    assert!(harness
        .broker
        .inject("app/devices/dev/down", b"{not json".to_vec()));
    match next_incident(&mut notices).await {
        BridgeNotice::Malformed { topic, .. } => assert_eq!(topic, "app/devices/dev/down"),
        other => panic!("unexpected notice {:?}", other),
    }
    let metrics = harness.handle.metrics();
    assert_eq!(metrics.received, 2);
    assert_eq!(metrics.routed, 1);
    assert_eq!(metrics.malformed, 1);
    assert_eq!(harness.handle.state(), BridgeState::Connected);
}

#[tokio::test(start_paused = true)]
async fn shutdown_flushes_pending_publishes() {
    let harness = start(MemoryBroker::new(), settings(8, 3));
    harness.handle.wait_for(BridgeState::Connected).await;

    let outbound = harness.handle.outbound();
    for seq in 1..=3 {
        outbound.send(message(seq)).await.expect("bridge accepts");
    }
    harness.shutdown.send(()).expect("bridge listening");

    let report = harness
        .task
        .await
        .expect("bridge task joins")
        .expect("clean shutdown");
    assert_eq!(report.undelivered, 0);
    assert_eq!(report.metrics.published, 3);
    assert_eq!(harness.broker.published().len(), 3);
    assert!(!harness.broker.is_connected());
    assert_eq!(harness.handle.state(), BridgeState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn failed_publish_is_redelivered_in_order_after_reconnect() {
    let harness = start(MemoryBroker::new(), settings(8, 5));
    harness.handle.wait_for(BridgeState::Connected).await;
    harness.broker.fail_next_publishes(1);

    let outbound = harness.handle.outbound();
    outbound.send(message(1)).await.expect("bridge accepts");
    outbound.send(message(2)).await.expect("bridge accepts");

    let broker = harness.broker.clone();
    eventually("both delivered", move || broker.published().len() == 2).await;
    let payloads: Vec<Vec<u8>> = harness
        .broker
        .published()
        .into_iter()
        .map(|p| p.payload)
        .collect();
    assert_eq!(
        payloads,
        vec![1u32.to_be_bytes().to_vec(), 2u32.to_be_bytes().to_vec()]
    );
    assert_eq!(harness.handle.metrics().reconnects, 1);
}
