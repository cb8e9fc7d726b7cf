//! Handler subscription API.
//!
//! [`ChannelClient`] composes the local [`ChannelRegistry`] with a
//! [`ChannelBridge`]. Mutating operations are serialized through a commit gate
//! that stays held across bridge awaits, so two registrations racing on the
//! same new channel cannot both create it or both register it remotely.
//!
//! Bridge calls come in two flavours:
//!
//! - best-effort (`*_best_effort`): registration of the first handler and
//!   teardown of a drained channel. Failures are logged and local state still
//!   reaches its final shape.
//! - primary (`start_channel`, `pause_channel`, `stop_channel`, status
//!   queries): the remote call is the whole point, so failures propagate.

use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::bridge::ChannelBridge;
use super::error::{ChannelError, Result};
use super::registry::{typed_handler, ChannelRegistry, Handler, HandlerError, Removal};
use super::transport::Transport;
use crate::types::{ChannelInfo, ChannelStatus};

pub struct ChannelClient {
    registry: ChannelRegistry,
    bridge: Arc<dyn ChannelBridge>,
    commit: Mutex<()>,
}

/// Removes an entry left empty when a registration or teardown does not run
/// to completion (error return or dropped future).
struct EmptyEntryGuard<'a> {
    registry: &'a ChannelRegistry,
    channel_id: &'a str,
    armed: bool,
}

impl EmptyEntryGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for EmptyEntryGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.registry.discard_if_empty(self.channel_id) {
            debug!("Auto-destroyed empty channel {}", self.channel_id);
        }
    }
}

impl ChannelClient {
    pub fn new(bridge: Arc<dyn ChannelBridge>) -> Self {
        Self {
            registry: ChannelRegistry::new(),
            bridge,
            commit: Mutex::new(()),
        }
    }

    /// Returns the channel's transport, creating the entry if needed.
    pub async fn ensure_channel(&self, channel_id: &str) -> Transport {
        let _commit = self.commit.lock().await;
        self.registry.ensure_channel(channel_id).0
    }

    pub async fn register_handler<T, F, Fut>(&self, channel_id: &str, handler_id: &str, handler: F) -> Result<String>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = core::result::Result<(), HandlerError>> + Send + 'static,
    {
        self.register_erased(channel_id, handler_id, typed_handler(handler))
            .await
    }

    pub async fn register_erased(&self, channel_id: &str, handler_id: &str, handler: Handler) -> Result<String> {
        let _commit = self.commit.lock().await;

        let (transport, created) = self.registry.ensure_channel(channel_id);
        let mut guard = EmptyEntryGuard {
            registry: &self.registry,
            channel_id,
            armed: created,
        };

        if self.registry.has_handler(channel_id, handler_id) {
            return Err(ChannelError::HandlerAlreadyExists {
                handler_id: handler_id.to_string(),
                channel_id: channel_id.to_string(),
            });
        }

        if self.registry.handler_count(channel_id) == 0 {
            self.register_best_effort(channel_id, transport).await;
        }

        let total = self.registry.insert_handler(channel_id, handler_id, handler)?;
        guard.disarm();

        debug!("Handler {handler_id} registered for channel {channel_id} (total: {total})");
        Ok(handler_id.to_string())
    }

    /// Removes a handler; tears the channel down once no handler is left.
    /// Unknown channels and handlers are tolerated.
    pub async fn unregister_handler(&self, channel_id: &str, handler_id: &str) {
        let _commit = self.commit.lock().await;

        match self.registry.remove_handler(channel_id, handler_id) {
            Removal::UnknownChannel => {
                warn!("Channel {channel_id} not found for handler unregistration");
            }
            Removal::UnknownHandler => {
                warn!("Handler {handler_id} not found in channel {channel_id}");
            }
            Removal::Remaining(remaining) => {
                debug!("Handler {handler_id} unregistered from channel {channel_id} (remaining: {remaining})");
            }
            Removal::Drained(transport) => {
                debug!("Handler {handler_id} unregistered from channel {channel_id} (remaining: 0)");
                let _guard = EmptyEntryGuard {
                    registry: &self.registry,
                    channel_id,
                    armed: true,
                };
                self.unregister_best_effort(channel_id).await;
                transport.detach();
            }
        }
    }

    pub fn get_channel(&self, channel_id: &str) -> Result<Transport> {
        self.registry
            .transport(channel_id)
            .ok_or_else(|| ChannelError::not_found(channel_id))
    }

    pub fn has_handler(&self, channel_id: &str, handler_id: &str) -> bool {
        self.registry.has_handler(channel_id, handler_id)
    }

    /// Like [`has_handler`](Self::has_handler) but reports which lookup failed.
    pub fn check_handler(&self, channel_id: &str, handler_id: &str) -> Result<()> {
        if !self.registry.contains(channel_id) {
            return Err(ChannelError::not_found(channel_id));
        }
        if !self.registry.has_handler(channel_id, handler_id) {
            return Err(ChannelError::HandlerNotFound {
                handler_id: handler_id.to_string(),
                channel_id: channel_id.to_string(),
            });
        }
        Ok(())
    }

    pub fn channel_ids(&self) -> Vec<String> {
        self.registry.channel_ids()
    }

    pub fn handler_count(&self, channel_id: &str) -> usize {
        self.registry.handler_count(channel_id)
    }

    pub async fn start_channel(&self, channel_id: &str) -> Result<()> {
        self.bridge.start(channel_id).await?;
        info!("Started channel {channel_id}");
        Ok(())
    }

    pub async fn pause_channel(&self, channel_id: &str) -> Result<()> {
        self.bridge.pause(channel_id).await?;
        info!("Paused channel {channel_id}");
        Ok(())
    }

    pub async fn stop_channel(&self, channel_id: &str) -> Result<()> {
        self.bridge.stop(channel_id).await?;
        info!("Stopped channel {channel_id}");
        Ok(())
    }

    pub async fn get_channel_status(&self, channel_id: &str) -> Result<ChannelStatus> {
        Ok(self.bridge.get_status(channel_id).await?)
    }

    pub async fn list_all_channel_statuses(&self) -> Result<Vec<ChannelStatus>> {
        Ok(self.bridge.list_channels().await?)
    }

    pub async fn get_channel_info(&self, channel_id: &str) -> Result<ChannelInfo> {
        let status = self.bridge.get_status(channel_id).await?;
        let handlers = self.registry.handler_ids(channel_id);
        Ok(ChannelInfo {
            channel_id: channel_id.to_string(),
            handler_count: handlers.len(),
            handlers,
            status,
        })
    }

    pub async fn is_channel_running(&self, channel_id: &str) -> Result<bool> {
        Ok(self.get_channel_status(channel_id).await?.is_running())
    }

    pub async fn is_channel_paused(&self, channel_id: &str) -> Result<bool> {
        Ok(self.get_channel_status(channel_id).await?.is_paused())
    }

    /// Starts the channel unless it already runs. Returns `false` without
    /// side effects when the backend has no such channel.
    pub async fn ensure_channel_running(&self, channel_id: &str) -> Result<bool> {
        let status = self.get_channel_status(channel_id).await?;
        if !status.exists {
            debug!("Channel {channel_id} does not exist on the backend");
            return Ok(false);
        }
        if !status.is_running() {
            self.start_channel(channel_id).await?;
        }
        Ok(true)
    }

    /// Detaches and tears down every channel. Used at shutdown.
    pub async fn cleanup(&self) {
        let _commit = self.commit.lock().await;
        for (channel_id, _transport) in self.registry.drain() {
            self.unregister_best_effort(&channel_id).await;
        }
        debug!("All channels cleaned up");
    }

    async fn register_best_effort(&self, channel_id: &str, transport: Transport) {
        if let Err(cause) = self.bridge.register(channel_id, transport).await {
            let err = ChannelError::Registration {
                channel_id: channel_id.to_string(),
                cause,
            };
            error!("{err}");
        }
    }

    async fn unregister_best_effort(&self, channel_id: &str) {
        if let Err(cause) = self.bridge.unregister(channel_id).await {
            let err = ChannelError::Cleanup {
                channel_id: channel_id.to_string(),
                cause,
            };
            error!("{err}");
        }
    }
}
