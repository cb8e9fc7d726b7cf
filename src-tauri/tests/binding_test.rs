use std::sync::Arc;
use std::time::Duration;

use channel_bridge_lib::channels::testing::{BridgeOp, RecordingBridge};
use channel_bridge_lib::host::HostConfig;
use channel_bridge_lib::{
    BindingOptions, ChannelBinding, ChannelClient, ChannelHost, ChannelStatus, StreamEvent,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Tick {
    value: f64,
}

fn client() -> (Arc<RecordingBridge>, Arc<ChannelClient>) {
    let bridge = Arc::new(RecordingBridge::new());
    let client = Arc::new(ChannelClient::new(bridge.clone()));
    (bridge, client)
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(1);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for condition");
        sleep(Duration::from_millis(5)).await;
    }
}

fn collector() -> (Arc<Mutex<Vec<Tick>>>, impl Fn(Tick) + Send + Sync + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    (seen, move |tick: Tick| sink.lock().push(tick))
}

#[tokio::test]
async fn connect_twice_registers_once() {
    let (bridge, client) = client();
    let (_seen, handler) = collector();
    let binding = ChannelBinding::mount(
        client.clone(),
        BindingOptions::new("c1").handler_id("ui"),
        Some(handler),
    )
    .await;

    binding.connect().await;
    binding.connect().await;

    assert!(binding.is_connected());
    assert_eq!(client.handler_count("c1"), 1);
    assert_eq!(bridge.count(BridgeOp::Register), 1);
}

#[tokio::test]
async fn connect_without_handler_id_does_nothing() {
    let (bridge, client) = client();
    let (_seen, handler) = collector();
    let binding = ChannelBinding::mount(client, BindingOptions::new("c1"), Some(handler)).await;

    binding.connect().await;

    assert!(!binding.is_connected());
    assert_eq!(bridge.count(BridgeOp::Register), 0);
}

#[tokio::test]
async fn connect_without_callback_does_nothing() {
    let (bridge, client) = client();
    let binding = ChannelBinding::<Tick>::mount(
        client,
        BindingOptions::new("c1").handler_id("ui"),
        None::<fn(Tick)>,
    )
    .await;

    binding.connect().await;

    assert!(!binding.is_connected());
    assert_eq!(bridge.count(BridgeOp::Register), 0);
}

#[tokio::test]
async fn auto_connect_and_auto_start() {
    let (bridge, client) = client();
    let (_seen, handler) = collector();
    let binding = ChannelBinding::mount(
        client,
        BindingOptions::new("c1")
            .handler_id("ui")
            .auto_connect(true)
            .auto_start(true),
        Some(handler),
    )
    .await;

    let snapshot = binding.snapshot();
    assert!(snapshot.is_connected);
    assert!(snapshot.is_started);
    assert!(snapshot.has_channel);
    assert!(snapshot.exists);
    assert_eq!(snapshot.handlers, vec!["ui"]);
    assert!(!snapshot.is_loading);
    assert_eq!(snapshot.error, None);
    // Registered channels already run.
    assert_eq!(bridge.count(BridgeOp::Start), 0);
}

#[tokio::test]
async fn messages_reach_the_current_callback() {
    let (bridge, client) = client();
    let (first, handler) = collector();
    let binding = ChannelBinding::mount(
        client,
        BindingOptions::new("c1").handler_id("ui").auto_connect(true),
        Some(handler),
    )
    .await;

    bridge.deliver("c1", &Tick { value: 1.5 }).unwrap();
    wait_until(|| first.lock().len() == 1).await;

    let (second, replacement) = collector();
    binding.set_handler(replacement);
    bridge.deliver("c1", &Tick { value: 2.5 }).unwrap();
    wait_until(|| second.lock().len() == 1).await;

    assert_eq!(first.lock().len(), 1);
    assert_eq!(second.lock()[0], Tick { value: 2.5 });
    assert_eq!(bridge.count(BridgeOp::Register), 1);
}

#[tokio::test]
async fn lifecycle_updates_snapshot() {
    let (bridge, client) = client();
    let (_seen, handler) = collector();
    let binding = ChannelBinding::mount(
        client,
        BindingOptions::new("c1").handler_id("ui").auto_connect(true),
        Some(handler),
    )
    .await;

    binding.pause().await;
    let paused = binding.snapshot();
    assert!(!paused.is_started);
    assert_eq!(paused.backend_paused, Some(true));
    assert!(binding.is_paused().await);

    binding.start().await;
    assert!(binding.is_started());
    assert!(binding.is_running().await);

    bridge.fail_on(BridgeOp::Pause);
    binding.pause().await;
    let failed = binding.snapshot();
    assert!(failed.error.is_some());
    assert!(failed.is_started);
    assert!(!failed.is_loading);

    bridge.recover(BridgeOp::Pause);
    binding.refresh_status().await;
    assert_eq!(binding.snapshot().error, None);
}

#[tokio::test]
async fn repeated_start_and_pause_are_no_ops() {
    let (bridge, client) = client();
    let (_seen, handler) = collector();
    let binding = ChannelBinding::mount(
        client,
        BindingOptions::new("c1").handler_id("ui").auto_connect(true),
        Some(handler),
    )
    .await;

    binding.pause().await;
    binding.pause().await;
    let paused = binding.snapshot();
    assert_eq!(paused.error, None);
    assert!(!paused.is_started);
    assert_eq!(paused.backend_paused, Some(true));
    assert_eq!(bridge.count(BridgeOp::Pause), 1);

    binding.start().await;
    binding.start().await;
    let running = binding.snapshot();
    assert_eq!(running.error, None);
    assert!(running.is_started);
    assert_eq!(running.backend_paused, Some(false));
    assert_eq!(bridge.count(BridgeOp::Start), 1);
}

#[tokio::test]
async fn recording_bridge_rejects_repeated_transitions() {
    let (bridge, client) = client();
    let (_seen, handler) = collector();
    let _binding = ChannelBinding::mount(
        client.clone(),
        BindingOptions::new("c1").handler_id("ui").auto_connect(true),
        Some(handler),
    )
    .await;

    assert!(client.start_channel("c1").await.is_err());
    client.pause_channel("c1").await.unwrap();
    assert!(client.pause_channel("c1").await.is_err());
    client.start_channel("c1").await.unwrap();
    assert_eq!(bridge.count(BridgeOp::Start), 2);
    assert_eq!(bridge.count(BridgeOp::Pause), 2);
}

#[tokio::test]
async fn auto_started_binding_over_host_tolerates_repeats() {
    let host = Arc::new(ChannelHost::new(HostConfig {
        emit_interval: Duration::from_millis(2),
    }));
    let client = Arc::new(ChannelClient::new(host.clone()));
    let binding = ChannelBinding::mount(
        client,
        BindingOptions::new("stream-1")
            .handler_id("chart")
            .auto_connect(true)
            .auto_start(true),
        Some(|_event: StreamEvent| {}),
    )
    .await;
    assert_eq!(binding.snapshot().error, None);
    assert!(binding.is_started());

    for _ in 0..2 {
        binding.pause().await;
        assert_eq!(binding.snapshot().error, None);
        assert!(binding.is_paused().await);
    }
    for _ in 0..2 {
        binding.start().await;
        assert_eq!(binding.snapshot().error, None);
        assert!(binding.is_running().await);
    }

    binding.close().await;
    host.shutdown().await;
}

#[tokio::test]
async fn ensure_running_reports_missing_channel() {
    let (bridge, client) = client();
    let binding = ChannelBinding::<Tick>::new(client, BindingOptions::new("c1"));

    assert!(!binding.ensure_running().await);
    assert_eq!(bridge.count(BridgeOp::Start), 0);

    bridge.set_status(ChannelStatus::live("c1", true));
    assert!(binding.ensure_running().await);
    assert_eq!(bridge.count(BridgeOp::Start), 1);
    assert!(binding.snapshot().is_started);
}

#[tokio::test]
async fn disconnect_tears_down_channel() {
    let (bridge, client) = client();
    let (_seen, handler) = collector();
    let binding = ChannelBinding::mount(
        client.clone(),
        BindingOptions::new("c1").handler_id("ui").auto_connect(true),
        Some(handler),
    )
    .await;

    binding.disconnect().await;
    binding.disconnect().await;

    let snapshot = binding.snapshot();
    assert!(!snapshot.is_connected);
    assert!(!snapshot.has_channel);
    assert!(!snapshot.exists);
    assert_eq!(bridge.count(BridgeOp::Unregister), 1);
    assert!(binding.get_channel().is_none());
    assert!(client.channel_ids().is_empty());
}

#[tokio::test]
async fn dropping_a_connected_binding_unregisters() {
    let (bridge, client) = client();
    let (_seen, handler) = collector();
    let binding = ChannelBinding::mount(
        client.clone(),
        BindingOptions::new("c1").handler_id("ui").auto_connect(true),
        Some(handler),
    )
    .await;

    drop(binding);

    wait_until(|| bridge.count(BridgeOp::Unregister) == 1).await;
    assert!(client.channel_ids().is_empty());
}

#[tokio::test]
async fn close_stops_polling() {
    let (bridge, client) = client();
    let (_seen, handler) = collector();
    let binding = ChannelBinding::mount(
        client,
        BindingOptions::new("c1")
            .handler_id("ui")
            .auto_connect(true)
            .poll_every(Duration::from_millis(10)),
        Some(handler),
    )
    .await;

    bridge.set_status(ChannelStatus::live("c1", true));
    wait_until(|| binding.snapshot().backend_paused == Some(true)).await;

    binding.close().await;
    let polled = bridge.count(BridgeOp::GetStatus);
    sleep(Duration::from_millis(50)).await;
    assert_eq!(bridge.count(BridgeOp::GetStatus), polled);
}

#[tokio::test]
async fn subscribers_see_changes() {
    let (_bridge, client) = client();
    let (_seen, handler) = collector();
    let binding = ChannelBinding::mount(
        client,
        BindingOptions::new("c1").handler_id("ui"),
        Some(handler),
    )
    .await;
    let mut updates = binding.subscribe();
    updates.borrow_and_update();

    binding.connect().await;

    assert!(updates.has_changed().unwrap());
    assert!(updates.borrow_and_update().is_connected);
}
