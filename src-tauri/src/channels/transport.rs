//! Opaque message handle shared between a channel entry and the backend.
//!
//! The backend only ever calls [`Transport::send`]; the client side owns the
//! inbound callback. Detaching the callback silently drops later messages,
//! closing the transport makes `send` fail so the backend can stop emitting.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

pub type MessageCallback = Arc<dyn Fn(Value) + Send + Sync>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport {0} is closed")]
    Closed(Uuid),

    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

struct TransportInner {
    id: Uuid,
    onmessage: RwLock<Option<MessageCallback>>,
    closed: AtomicBool,
}

#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

impl Transport {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TransportInner {
                id: Uuid::new_v4(),
                onmessage: RwLock::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn set_onmessage<F>(&self, callback: F)
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        *self.inner.onmessage.write() = Some(Arc::new(callback));
    }

    /// Drops the inbound callback. Messages sent afterwards are discarded.
    pub fn detach(&self) {
        self.inner.onmessage.write().take();
    }

    pub fn is_attached(&self) -> bool {
        self.inner.onmessage.read().is_some()
    }

    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.detach();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn send<T: Serialize>(&self, message: &T) -> Result<(), TransportError> {
        let payload = serde_json::to_value(message)?;
        self.send_value(payload)
    }

    pub fn send_value(&self, payload: Value) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed(self.inner.id));
        }
        // Clone out of the lock so a callback may detach its own transport.
        let callback = self.inner.onmessage.read().clone();
        if let Some(callback) = callback {
            callback(payload);
        }
        Ok(())
    }
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Transport {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Transport {}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("id", &self.inner.id)
            .field("attached", &self.is_attached())
            .field("closed", &self.is_closed())
            .finish()
    }
}
