//! Backend lifecycle bridge contract.
//!
//! The only path from the client side to the backend's channel table. The
//! in-process implementation is [`crate::host::ChannelHost`]; tests use
//! [`super::testing::RecordingBridge`].

use async_trait::async_trait;
use thiserror::Error;

use super::transport::Transport;
use crate::types::ChannelStatus;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// The backend answered and refused the request.
    #[error("{0}")]
    Rejected(String),

    /// The backend could not be reached.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait ChannelBridge: Send + Sync {
    /// Establishes the backend channel and binds it to `transport`.
    async fn register(&self, channel_id: &str, transport: Transport) -> Result<(), BridgeError>;

    async fn unregister(&self, channel_id: &str) -> Result<(), BridgeError>;

    async fn start(&self, channel_id: &str) -> Result<(), BridgeError>;

    async fn pause(&self, channel_id: &str) -> Result<(), BridgeError>;

    /// Fully stops the channel. Unlike `pause` the backend drops it.
    async fn stop(&self, channel_id: &str) -> Result<(), BridgeError>;

    async fn get_status(&self, channel_id: &str) -> Result<ChannelStatus, BridgeError>;

    async fn list_channels(&self) -> Result<Vec<ChannelStatus>, BridgeError>;
}
