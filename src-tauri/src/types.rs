//! Wire types shared by the client, the host and the web daemon.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Point-in-time status of a backend channel.
///
/// `paused` is `None` when the backend has no opinion, which is the case for a
/// channel that does not exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStatus {
    pub id: String,
    pub exists: bool,
    pub paused: Option<bool>,
}

impl ChannelStatus {
    pub fn missing(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            exists: false,
            paused: None,
        }
    }

    pub fn live(id: impl Into<String>, paused: bool) -> Self {
        Self {
            id: id.into(),
            exists: true,
            paused: Some(paused),
        }
    }

    pub fn is_running(&self) -> bool {
        self.exists && self.paused == Some(false)
    }

    pub fn is_paused(&self) -> bool {
        self.exists && self.paused == Some(true)
    }
}

/// Local handler bookkeeping merged with the remote status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelInfo {
    pub channel_id: String,
    pub handler_count: usize,
    pub handlers: Vec<String>,
    pub status: ChannelStatus,
}

/// Sample emitted by a host channel task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub id: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}
