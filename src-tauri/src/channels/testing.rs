//! In-memory bridge for exercising the client without a backend.
//!
//! [`RecordingBridge`] records every call, keeps a small simulated channel
//! table (registered channels start running and repeated start/pause calls
//! are rejected, like the host does) and can be told to fail specific
//! operations.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;

use super::bridge::{BridgeError, ChannelBridge};
use super::transport::{Transport, TransportError};
use crate::types::ChannelStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BridgeOp {
    Register,
    Unregister,
    Start,
    Pause,
    Stop,
    GetStatus,
    ListChannels,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeCall {
    pub op: BridgeOp,
    pub channel_id: Option<String>,
}

#[derive(Default)]
pub struct RecordingBridge {
    calls: Mutex<Vec<BridgeCall>>,
    failing: Mutex<HashSet<BridgeOp>>,
    statuses: Mutex<HashMap<String, ChannelStatus>>,
    transports: Mutex<HashMap<String, Transport>>,
}

impl RecordingBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, op: BridgeOp) {
        self.failing.lock().insert(op);
    }

    pub fn recover(&self, op: BridgeOp) {
        self.failing.lock().remove(&op);
    }

    /// Seeds or overrides the simulated backend status for a channel.
    pub fn set_status(&self, status: ChannelStatus) {
        self.statuses.lock().insert(status.id.clone(), status);
    }

    pub fn calls(&self) -> Vec<BridgeCall> {
        self.calls.lock().clone()
    }

    pub fn count(&self, op: BridgeOp) -> usize {
        self.calls.lock().iter().filter(|call| call.op == op).count()
    }

    pub fn transport(&self, channel_id: &str) -> Option<Transport> {
        self.transports.lock().get(channel_id).cloned()
    }

    /// Pushes a message through the transport bound at registration, as the
    /// backend would.
    pub fn deliver<T: Serialize>(&self, channel_id: &str, message: &T) -> Result<(), TransportError> {
        match self.transport(channel_id) {
            Some(transport) => transport.send(message),
            None => Ok(()),
        }
    }

    fn record(&self, op: BridgeOp, channel_id: Option<&str>) -> Result<(), BridgeError> {
        self.calls.lock().push(BridgeCall {
            op,
            channel_id: channel_id.map(str::to_string),
        });
        if self.failing.lock().contains(&op) {
            return Err(BridgeError::Unavailable(format!("{op:?} failed")));
        }
        Ok(())
    }

    fn set_paused(&self, channel_id: &str, paused: bool) -> Result<(), BridgeError> {
        match self.statuses.lock().get_mut(channel_id) {
            Some(status) if status.exists && status.paused == Some(paused) => Err(BridgeError::Rejected(
                format!("Channel with id '{channel_id}' is already in the requested state"),
            )),
            Some(status) if status.exists => {
                status.paused = Some(paused);
                Ok(())
            }
            _ => Err(BridgeError::Rejected(format!(
                "Channel with id '{channel_id}' not found"
            ))),
        }
    }
}

#[async_trait]
impl ChannelBridge for RecordingBridge {
    async fn register(&self, channel_id: &str, transport: Transport) -> Result<(), BridgeError> {
        self.record(BridgeOp::Register, Some(channel_id))?;
        self.transports
            .lock()
            .insert(channel_id.to_string(), transport);
        self.set_status(ChannelStatus::live(channel_id, false));
        Ok(())
    }

    async fn unregister(&self, channel_id: &str) -> Result<(), BridgeError> {
        self.record(BridgeOp::Unregister, Some(channel_id))?;
        self.transports.lock().remove(channel_id);
        self.statuses.lock().remove(channel_id);
        Ok(())
    }

    async fn start(&self, channel_id: &str) -> Result<(), BridgeError> {
        self.record(BridgeOp::Start, Some(channel_id))?;
        self.set_paused(channel_id, false)
    }

    async fn pause(&self, channel_id: &str) -> Result<(), BridgeError> {
        self.record(BridgeOp::Pause, Some(channel_id))?;
        self.set_paused(channel_id, true)
    }

    async fn stop(&self, channel_id: &str) -> Result<(), BridgeError> {
        self.record(BridgeOp::Stop, Some(channel_id))?;
        self.transports.lock().remove(channel_id);
        self.statuses.lock().remove(channel_id);
        Ok(())
    }

    async fn get_status(&self, channel_id: &str) -> Result<ChannelStatus, BridgeError> {
        self.record(BridgeOp::GetStatus, Some(channel_id))?;
        Ok(self
            .statuses
            .lock()
            .get(channel_id)
            .cloned()
            .unwrap_or_else(|| ChannelStatus::missing(channel_id)))
    }

    async fn list_channels(&self) -> Result<Vec<ChannelStatus>, BridgeError> {
        self.record(BridgeOp::ListChannels, None)?;
        let mut statuses = self.statuses.lock().values().cloned().collect::<Vec<_>>();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(statuses)
    }
}
