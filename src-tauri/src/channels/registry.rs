//! In-memory channel table and the fan-out dispatcher.
//!
//! Every mutation happens under the write lock and rebuilds the entry's
//! cached handler slice before the lock is released, so dispatch never sees a
//! handler set older than the last acknowledged mutation. No await point is
//! ever reached while the lock is held.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};

use futures_util::future::{join_all, BoxFuture};
use futures_util::FutureExt;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error, warn};

use super::error::{ChannelError, Result};
use super::transport::Transport;

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

pub type Handler = Arc<dyn Fn(Value) -> BoxFuture<'static, core::result::Result<(), HandlerError>> + Send + Sync>;

type ChannelMap = HashMap<String, ChannelEntry>;

/// Wraps a typed async handler into the registry's erased form.
///
/// The payload is decoded inside the returned future so decode failures and
/// panics are reported like any other handler failure.
pub fn typed_handler<T, F, Fut>(handler: F) -> Handler
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = core::result::Result<(), HandlerError>> + Send + 'static,
{
    let handler = Arc::new(handler);
    Arc::new(move |payload: Value| {
        let handler = Arc::clone(&handler);
        async move {
            let message: T = serde_json::from_value(payload)?;
            handler(message).await
        }
        .boxed()
    })
}

pub(crate) struct ChannelEntry {
    transport: Transport,
    handlers: HashMap<String, Handler>,
    handlers_array: Arc<[Handler]>,
}

impl ChannelEntry {
    fn new(transport: Transport) -> Self {
        Self {
            transport,
            handlers: HashMap::new(),
            handlers_array: Arc::from(Vec::new()),
        }
    }

    fn rebuild_cache(&mut self) {
        self.handlers_array = self.handlers.values().cloned().collect::<Vec<_>>().into();
    }
}

/// Outcome of removing a handler from the table.
#[derive(Debug)]
pub(crate) enum Removal {
    UnknownChannel,
    UnknownHandler,
    Remaining(usize),
    /// The last handler left; the entry is still present until teardown
    /// finishes and [`ChannelRegistry::discard_if_empty`] is called.
    Drained(Transport),
}

#[derive(Clone, Default)]
pub(crate) struct ChannelRegistry {
    channels: Arc<RwLock<ChannelMap>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the existing transport, or creates and commits a fresh entry.
    /// The boolean is `true` when this call created the entry.
    pub fn ensure_channel(&self, channel_id: &str) -> (Transport, bool) {
        let mut channels = self.channels.write();
        if let Some(entry) = channels.get(channel_id) {
            return (entry.transport.clone(), false);
        }

        let transport = Transport::new();
        transport.set_onmessage(dispatcher(Arc::downgrade(&self.channels), channel_id));
        channels.insert(channel_id.to_string(), ChannelEntry::new(transport.clone()));
        debug!("Auto-created channel {channel_id}");
        (transport, true)
    }

    pub fn transport(&self, channel_id: &str) -> Option<Transport> {
        self.channels
            .read()
            .get(channel_id)
            .map(|entry| entry.transport.clone())
    }

    pub fn contains(&self, channel_id: &str) -> bool {
        self.channels.read().contains_key(channel_id)
    }

    pub fn has_handler(&self, channel_id: &str, handler_id: &str) -> bool {
        self.channels
            .read()
            .get(channel_id)
            .is_some_and(|entry| entry.handlers.contains_key(handler_id))
    }

    pub fn handler_count(&self, channel_id: &str) -> usize {
        self.channels
            .read()
            .get(channel_id)
            .map_or(0, |entry| entry.handlers.len())
    }

    pub fn handler_ids(&self, channel_id: &str) -> Vec<String> {
        let mut ids = self
            .channels
            .read()
            .get(channel_id)
            .map(|entry| entry.handlers.keys().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn channel_ids(&self) -> Vec<String> {
        let mut ids = self.channels.read().keys().cloned().collect::<Vec<_>>();
        ids.sort();
        ids
    }

    /// Inserts a handler into an existing entry and returns the new count.
    pub fn insert_handler(&self, channel_id: &str, handler_id: &str, handler: Handler) -> Result<usize> {
        let mut channels = self.channels.write();
        let entry = channels
            .get_mut(channel_id)
            .ok_or_else(|| ChannelError::not_found(channel_id))?;

        if entry.handlers.contains_key(handler_id) {
            return Err(ChannelError::HandlerAlreadyExists {
                handler_id: handler_id.to_string(),
                channel_id: channel_id.to_string(),
            });
        }

        entry.handlers.insert(handler_id.to_string(), handler);
        entry.rebuild_cache();
        Ok(entry.handlers.len())
    }

    pub fn remove_handler(&self, channel_id: &str, handler_id: &str) -> Removal {
        let mut channels = self.channels.write();
        let Some(entry) = channels.get_mut(channel_id) else {
            return Removal::UnknownChannel;
        };
        if entry.handlers.remove(handler_id).is_none() {
            return Removal::UnknownHandler;
        }

        entry.rebuild_cache();
        match entry.handlers.len() {
            0 => Removal::Drained(entry.transport.clone()),
            remaining => Removal::Remaining(remaining),
        }
    }

    /// Deletes the entry when it holds no handlers, detaching its transport.
    pub fn discard_if_empty(&self, channel_id: &str) -> bool {
        let mut channels = self.channels.write();
        let empty = channels
            .get(channel_id)
            .is_some_and(|entry| entry.handlers.is_empty());
        if !empty {
            return false;
        }
        if let Some(entry) = channels.remove(channel_id) {
            entry.transport.detach();
        }
        true
    }

    /// Empties the table and hands back every transport, already detached.
    pub fn drain(&self) -> Vec<(String, Transport)> {
        let mut channels = self.channels.write();
        channels
            .drain()
            .map(|(channel_id, entry)| {
                entry.transport.detach();
                (channel_id, entry.transport)
            })
            .collect()
    }
}

fn dispatcher(channels: Weak<RwLock<ChannelMap>>, channel_id: &str) -> impl Fn(Value) + Send + Sync + 'static {
    let channel_id = channel_id.to_string();
    move |payload: Value| {
        let Some(channels) = channels.upgrade() else {
            return;
        };
        let handlers = match channels.read().get(&channel_id) {
            Some(entry) if !entry.handlers_array.is_empty() => Arc::clone(&entry.handlers_array),
            _ => return,
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(run_handlers(channel_id.clone(), handlers, payload));
            }
            Err(_) => warn!("Dropping message for channel {channel_id}: no async runtime"),
        }
    }
}

async fn run_handlers(channel_id: String, handlers: Arc<[Handler]>, payload: Value) {
    if handlers.len() == 1 {
        invoke(&channel_id, &handlers[0], payload).await;
        return;
    }

    join_all(
        handlers
            .iter()
            .map(|handler| invoke(&channel_id, handler, payload.clone())),
    )
    .await;
}

async fn invoke(channel_id: &str, handler: &Handler, payload: Value) {
    // Erased handlers may panic while building their future, not only when polled.
    let future = match std::panic::catch_unwind(AssertUnwindSafe(|| handler(payload))) {
        Ok(future) => future,
        Err(_) => {
            error!("Handler in channel {channel_id} panicked");
            return;
        }
    };
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!("Handler in channel {channel_id} failed: {err}"),
        Err(_) => error!("Handler in channel {channel_id} panicked"),
    }
}
