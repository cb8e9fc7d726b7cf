//! Backend side of the bridge: owns one emitting task per registered channel.
//!
//! Each channel keeps a pause flag next to its [`CancellableTask`]. The task
//! samples a value every `emit_interval` and pushes a [`StreamEvent`] through
//! the transport it was registered with, skipping ticks while paused and
//! exiting when cancelled or when the transport is closed.

pub mod error;
pub mod task;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{info, trace, warn};

use crate::channels::{BridgeError, ChannelBridge, Transport};
use crate::types::{ChannelStatus, StreamEvent};
pub use error::{HostError, Result};
pub use task::{CancellableTask, TaskError};

pub const DEFAULT_EMIT_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub emit_interval: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            emit_interval: DEFAULT_EMIT_INTERVAL,
        }
    }
}

struct HostedChannel {
    paused: Arc<AtomicBool>,
    task: CancellableTask<()>,
}

#[derive(Default)]
pub struct ChannelHost {
    config: HostConfig,
    channels: Mutex<HashMap<String, HostedChannel>>,
}

fn sample_value() -> f64 {
    let int_value: i32 = rand::rng().random_range(-100_000..=100_000);
    f64::from(int_value) / 10_000.0
}

fn spawn_emitter(id: String, transport: Transport, paused: Arc<AtomicBool>, interval: Duration) -> CancellableTask<()> {
    CancellableTask::new(move |token| async move {
        loop {
            tokio::select! {
                _ = sleep(interval) => {
                    if paused.load(Ordering::Relaxed) {
                        continue;
                    }

                    let event = StreamEvent {
                        id: id.clone(),
                        value: sample_value(),
                        timestamp: Utc::now(),
                    };

                    if let Err(err) = transport.send(&event) {
                        warn!("Failed to send event to channel '{id}': {err}");
                        break;
                    }

                    trace!("Sent to {id} - value: {}", event.value);
                }
                _ = token.cancelled() => {
                    info!("Task for channel '{id}' was cancelled");
                    break;
                }
            }
        }
    })
}

impl ChannelHost {
    pub fn new(config: HostConfig) -> Self {
        Self {
            config,
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub async fn register(&self, id: &str, transport: Transport) -> Result<()> {
        let mut channels = self.channels.lock().await;
        if channels.contains_key(id) {
            return Err(HostError::ChannelAlreadyExists { id: id.to_string() });
        }

        let paused = Arc::new(AtomicBool::new(false));
        let task = spawn_emitter(
            id.to_string(),
            transport,
            Arc::clone(&paused),
            self.config.emit_interval,
        );
        channels.insert(id.to_string(), HostedChannel { paused, task });
        info!("Successfully registered channel '{id}'");
        Ok(())
    }

    pub async fn unregister(&self, id: &str) -> Result<()> {
        match self.channels.lock().await.remove(id) {
            Some(channel) => {
                channel.task.cancel();
                info!("Successfully unregistered channel '{id}'");
                Ok(())
            }
            None => {
                warn!("Attempted to unregister non-existent channel '{id}'");
                Err(HostError::ChannelNotFound { id: id.to_string() })
            }
        }
    }

    pub async fn start(&self, id: &str) -> Result<()> {
        let channels = self.channels.lock().await;
        let channel = channels.get(id).ok_or_else(|| {
            warn!("Attempted to start non-existent channel '{id}'");
            HostError::ChannelNotFound { id: id.to_string() }
        })?;

        if channel.paused.swap(false, Ordering::Relaxed) {
            info!("Started channel '{id}'");
            Ok(())
        } else {
            warn!("Channel '{id}' was already running");
            Err(HostError::InvalidStateTransition { id: id.to_string() })
        }
    }

    pub async fn pause(&self, id: &str) -> Result<()> {
        let channels = self.channels.lock().await;
        let channel = channels.get(id).ok_or_else(|| {
            warn!("Attempted to pause non-existent channel '{id}'");
            HostError::ChannelNotFound { id: id.to_string() }
        })?;

        if channel.paused.swap(true, Ordering::Relaxed) {
            warn!("Channel '{id}' was already paused");
            Err(HostError::InvalidStateTransition { id: id.to_string() })
        } else {
            info!("Paused channel '{id}'");
            Ok(())
        }
    }

    pub async fn stop(&self, id: &str) -> Result<()> {
        match self.channels.lock().await.remove(id) {
            Some(channel) => {
                channel.task.cancel();
                info!("Successfully stopped channel '{id}'");
                Ok(())
            }
            None => {
                warn!("Attempted to stop non-existent channel '{id}'");
                Err(HostError::ChannelNotFound { id: id.to_string() })
            }
        }
    }

    pub async fn get_status(&self, id: &str) -> ChannelStatus {
        match self.channels.lock().await.get(id) {
            Some(channel) => ChannelStatus::live(id, channel.paused.load(Ordering::Relaxed)),
            None => ChannelStatus::missing(id),
        }
    }

    pub async fn list_channels(&self) -> Vec<ChannelStatus> {
        let mut statuses = self
            .channels
            .lock()
            .await
            .iter()
            .map(|(id, channel)| ChannelStatus::live(id.as_str(), channel.paused.load(Ordering::Relaxed)))
            .collect::<Vec<_>>();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    /// Cancels every channel task. Returns how many were running.
    pub async fn shutdown(&self) -> usize {
        let drained = self.channels.lock().await.drain().collect::<Vec<_>>();
        for (_, channel) in &drained {
            channel.task.cancel();
        }
        info!("Host shut down {} channel(s)", drained.len());
        drained.len()
    }
}

#[async_trait]
impl ChannelBridge for ChannelHost {
    async fn register(&self, channel_id: &str, transport: Transport) -> core::result::Result<(), BridgeError> {
        ChannelHost::register(self, channel_id, transport).await.map_err(BridgeError::from)
    }

    async fn unregister(&self, channel_id: &str) -> core::result::Result<(), BridgeError> {
        ChannelHost::unregister(self, channel_id).await.map_err(BridgeError::from)
    }

    async fn start(&self, channel_id: &str) -> core::result::Result<(), BridgeError> {
        ChannelHost::start(self, channel_id).await.map_err(BridgeError::from)
    }

    async fn pause(&self, channel_id: &str) -> core::result::Result<(), BridgeError> {
        ChannelHost::pause(self, channel_id).await.map_err(BridgeError::from)
    }

    async fn stop(&self, channel_id: &str) -> core::result::Result<(), BridgeError> {
        ChannelHost::stop(self, channel_id).await.map_err(BridgeError::from)
    }

    async fn get_status(&self, channel_id: &str) -> core::result::Result<ChannelStatus, BridgeError> {
        Ok(ChannelHost::get_status(self, channel_id).await)
    }

    async fn list_channels(&self) -> core::result::Result<Vec<ChannelStatus>, BridgeError> {
        Ok(ChannelHost::list_channels(self).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use serde_json::Value;

    fn host() -> ChannelHost {
        ChannelHost::new(HostConfig {
            emit_interval: Duration::from_millis(2),
        })
    }

    fn collecting_transport() -> (Transport, Arc<SyncMutex<Vec<Value>>>) {
        let received = Arc::new(SyncMutex::new(Vec::new()));
        let sink = received.clone();
        let transport = Transport::new();
        transport.set_onmessage(move |value| sink.lock().push(value));
        (transport, received)
    }

    #[tokio::test]
    async fn registered_channel_emits_events() {
        let host = host();
        let (transport, received) = collecting_transport();
        host.register("c1", transport).await.unwrap();

        sleep(Duration::from_millis(30)).await;

        let events = received.lock().clone();
        assert!(!events.is_empty());
        let event: StreamEvent = serde_json::from_value(events[0].clone()).unwrap();
        assert_eq!(event.id, "c1");
        assert!((-10.0..=10.0).contains(&event.value));
    }

    #[tokio::test]
    async fn duplicate_register_is_rejected() {
        let host = host();
        host.register("c1", Transport::new()).await.unwrap();
        assert!(matches!(
            host.register("c1", Transport::new()).await,
            Err(HostError::ChannelAlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn pause_and_start_transitions() {
        let host = host();
        host.register("c1", Transport::new()).await.unwrap();

        assert!(matches!(
            host.start("c1").await,
            Err(HostError::InvalidStateTransition { .. })
        ));
        host.pause("c1").await.unwrap();
        assert_eq!(host.get_status("c1").await, ChannelStatus::live("c1", true));
        assert!(matches!(
            host.pause("c1").await,
            Err(HostError::InvalidStateTransition { .. })
        ));
        host.start("c1").await.unwrap();
        assert_eq!(host.get_status("c1").await, ChannelStatus::live("c1", false));
    }

    #[tokio::test]
    async fn paused_channel_stays_quiet() {
        let host = host();
        let (transport, received) = collecting_transport();
        host.register("c1", transport).await.unwrap();
        host.pause("c1").await.unwrap();
        received.lock().clear();

        sleep(Duration::from_millis(20)).await;

        assert!(received.lock().is_empty());
    }

    #[tokio::test]
    async fn stop_removes_channel() {
        let host = host();
        host.register("c1", Transport::new()).await.unwrap();
        host.stop("c1").await.unwrap();

        assert_eq!(host.get_status("c1").await, ChannelStatus::missing("c1"));
        assert!(matches!(
            host.unregister("c1").await,
            Err(HostError::ChannelNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn closed_transport_ends_the_task() {
        let host = host();
        let transport = Transport::new();
        host.register("c1", transport.clone()).await.unwrap();
        transport.close();

        sleep(Duration::from_millis(20)).await;

        let channels = host.channels.lock().await;
        assert!(channels["c1"].task.is_finished());
    }

    #[tokio::test]
    async fn list_and_shutdown() {
        let host = host();
        host.register("b", Transport::new()).await.unwrap();
        host.register("a", Transport::new()).await.unwrap();

        let ids = host
            .list_channels()
            .await
            .into_iter()
            .map(|status| status.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["a", "b"]);

        assert_eq!(host.shutdown().await, 2);
        assert!(host.list_channels().await.is_empty());
    }
}
