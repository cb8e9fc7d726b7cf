//! Per-consumer facade over [`ChannelClient`].
//!
//! A [`ChannelBinding`] owns no registry state. It tracks one consumer's
//! connection (`DISCONNECTED` / `CONNECTED`, started or not), mirrors the last
//! synced backend status into a [`BindingSnapshot`] and optionally polls that
//! status while connected. Operations never fail: errors land in
//! `BindingSnapshot::error`.
//!
//! ```text
//! DISCONNECTED --connect()--> CONNECTED(not started)
//! CONNECTED --start()--> CONNECTED(started)
//! CONNECTED(started) --pause()--> CONNECTED(not started)
//! CONNECTED --disconnect()--> DISCONNECTED
//! ```

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::client::ChannelClient;
use super::transport::Transport;
use crate::types::{ChannelInfo, ChannelStatus};

type Callback<T> = Arc<dyn Fn(T) + Send + Sync>;

#[derive(Debug, Clone, Default)]
pub struct BindingOptions {
    pub channel_id: String,
    pub handler_id: Option<String>,
    pub auto_connect: bool,
    /// Start the backend channel right after connecting.
    pub auto_start: bool,
    pub status_polling_interval: Option<Duration>,
}

impl BindingOptions {
    pub fn new(channel_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            ..Self::default()
        }
    }

    pub fn handler_id(mut self, handler_id: impl Into<String>) -> Self {
        self.handler_id = Some(handler_id.into());
        self
    }

    pub fn auto_connect(mut self, enabled: bool) -> Self {
        self.auto_connect = enabled;
        self
    }

    pub fn auto_start(mut self, enabled: bool) -> Self {
        self.auto_start = enabled;
        self
    }

    pub fn poll_every(mut self, interval: Duration) -> Self {
        self.status_polling_interval = Some(interval);
        self
    }
}

/// View state of a binding, as rendered by the consumer.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingSnapshot {
    pub channel_id: String,
    pub is_connected: bool,
    pub is_started: bool,
    /// Whether the local registry currently holds an entry for the channel.
    pub has_channel: bool,
    pub exists: bool,
    pub backend_paused: Option<bool>,
    pub handler_count: usize,
    pub handlers: Vec<String>,
    pub is_loading: bool,
    pub error: Option<String>,
    pub status: Option<ChannelStatus>,
    pub info: Option<ChannelInfo>,
}

impl BindingSnapshot {
    fn apply_info(&mut self, info: ChannelInfo) {
        self.is_started = info.status.is_running();
        self.exists = info.status.exists;
        self.backend_paused = info.status.paused;
        self.handler_count = info.handler_count;
        self.handlers = info.handlers.clone();
        self.status = Some(info.status.clone());
        self.info = Some(info);
    }
}

#[derive(Debug, Clone, Copy)]
enum Lifecycle {
    Start,
    Pause,
    Stop,
}

struct Shared<T> {
    client: Arc<ChannelClient>,
    options: BindingOptions,
    view: watch::Sender<BindingSnapshot>,
    handler: Arc<RwLock<Option<Callback<T>>>>,
    polling: Mutex<Option<CancellationToken>>,
    ops: tokio::sync::Mutex<()>,
}

pub struct ChannelBinding<T> {
    shared: Arc<Shared<T>>,
}

impl<T> ChannelBinding<T>
where
    T: DeserializeOwned + Send + 'static,
{
    pub fn new(client: Arc<ChannelClient>, options: BindingOptions) -> Self {
        let (view, _) = watch::channel(BindingSnapshot {
            channel_id: options.channel_id.clone(),
            ..BindingSnapshot::default()
        });
        Self {
            shared: Arc::new(Shared {
                client,
                options,
                view,
                handler: Arc::new(RwLock::new(None)),
                polling: Mutex::new(None),
                ops: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Builds a binding, performs the initial status sync and connects when
    /// `auto_connect` is set.
    pub async fn mount<F>(client: Arc<ChannelClient>, options: BindingOptions, handler: Option<F>) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let binding = Self::new(client, options);
        if let Some(handler) = handler {
            binding.set_handler(handler);
        }
        binding.refresh_status().await;
        if binding.shared.options.auto_connect {
            binding.connect().await;
        }
        binding
    }

    pub fn channel_id(&self) -> &str {
        &self.shared.options.channel_id
    }

    /// Replaces the consumer callback. Takes effect for the next message
    /// without re-registering.
    pub fn set_handler<F>(&self, handler: F)
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        *self.shared.handler.write() = Some(Arc::new(handler));
    }

    pub fn snapshot(&self) -> BindingSnapshot {
        self.shared.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<BindingSnapshot> {
        self.shared.view.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.view.borrow().is_connected
    }

    pub fn is_started(&self) -> bool {
        self.shared.view.borrow().is_started
    }

    pub async fn connect(&self) {
        let shared = &self.shared;
        let Some(handler_id) = shared.options.handler_id.clone() else {
            return;
        };
        if shared.handler.read().is_none() {
            return;
        }

        let _op = shared.ops.lock().await;
        if shared.view.borrow().is_connected {
            return;
        }

        shared.begin();
        let channel_id = shared.options.channel_id.clone();
        let slot = Arc::clone(&shared.handler);
        let registered = shared
            .client
            .register_handler(&channel_id, &handler_id, move |message: T| {
                let callback = slot.read().clone();
                async move {
                    if let Some(callback) = callback {
                        callback(message);
                    }
                    Ok(())
                }
            })
            .await;

        match registered {
            Ok(_) => {
                shared.view.send_modify(|view| view.is_connected = true);
                shared.start_polling();
                info!("Connected to channel {channel_id} with handler {handler_id}");
                shared.sync().await;
                if shared.options.auto_start {
                    shared.run_lifecycle(Lifecycle::Start).await;
                }
            }
            Err(err) => {
                error!("Failed to register handler {handler_id} for channel {channel_id}: {err}");
                shared.fail(err.to_string());
            }
        }
        shared.finish();
    }

    pub async fn disconnect(&self) {
        let shared = &self.shared;
        let Some(handler_id) = shared.options.handler_id.as_deref() else {
            return;
        };

        let _op = shared.ops.lock().await;
        if !shared.view.borrow().is_connected {
            return;
        }

        shared.begin();
        let channel_id = &shared.options.channel_id;
        shared.client.unregister_handler(channel_id, handler_id).await;
        shared.view.send_modify(|view| view.is_connected = false);
        shared.stop_polling();
        info!("Disconnected from channel {channel_id} handler {handler_id}");
        shared.sync().await;
        shared.finish();
    }

    pub async fn start(&self) {
        self.lifecycle(Lifecycle::Start).await;
    }

    pub async fn pause(&self) {
        self.lifecycle(Lifecycle::Pause).await;
    }

    pub async fn stop(&self) {
        self.lifecycle(Lifecycle::Stop).await;
    }

    /// Returns whether the backend channel exists and is (now) running.
    pub async fn ensure_running(&self) -> bool {
        let shared = &self.shared;
        shared.begin();
        let running = match shared.client.ensure_channel_running(&shared.options.channel_id).await {
            Ok(running) => {
                shared.sync().await;
                running
            }
            Err(err) => {
                shared.fail(err.to_string());
                false
            }
        };
        shared.finish();
        running
    }

    pub async fn refresh_status(&self) {
        self.shared.refresh().await;
    }

    pub async fn is_running(&self) -> bool {
        let channel_id = &self.shared.options.channel_id;
        self.shared
            .client
            .is_channel_running(channel_id)
            .await
            .unwrap_or_else(|err| {
                debug!("Running check for channel {channel_id} failed: {err}");
                false
            })
    }

    pub async fn is_paused(&self) -> bool {
        let channel_id = &self.shared.options.channel_id;
        self.shared
            .client
            .is_channel_paused(channel_id)
            .await
            .unwrap_or_else(|err| {
                debug!("Paused check for channel {channel_id} failed: {err}");
                false
            })
    }

    pub fn get_channel(&self) -> Option<Transport> {
        let transport = self.shared.client.get_channel(&self.shared.options.channel_id).ok();
        let has_channel = transport.is_some();
        self.shared
            .view
            .send_modify(|view| view.has_channel = has_channel);
        transport
    }

    /// Stops polling and disconnects. Dropping the binding does the same,
    /// with the unregistration spawned in the background.
    pub async fn close(self) {
        self.shared.stop_polling();
        self.disconnect().await;
    }

    async fn lifecycle(&self, action: Lifecycle) {
        self.shared.begin();
        self.shared.run_lifecycle(action).await;
        self.shared.finish();
    }
}

impl<T> Shared<T> {
    fn begin(&self) {
        self.view.send_modify(|view| {
            view.is_loading = true;
            view.error = None;
        });
    }

    fn finish(&self) {
        self.view.send_modify(|view| view.is_loading = false);
    }

    fn fail(&self, message: String) {
        self.view.send_modify(|view| view.error = Some(message));
    }

    async fn refresh(&self) {
        self.begin();
        self.sync().await;
        self.finish();
    }

    async fn run_lifecycle(&self, action: Lifecycle) {
        let channel_id = &self.options.channel_id;
        let result = if self.already_in(action).await {
            debug!("Channel {channel_id} already satisfies {action:?}");
            Ok(())
        } else {
            match action {
                Lifecycle::Start => self.client.start_channel(channel_id).await,
                Lifecycle::Pause => self.client.pause_channel(channel_id).await,
                Lifecycle::Stop => self.client.stop_channel(channel_id).await,
            }
        };

        match result {
            Ok(()) => {
                let started = matches!(action, Lifecycle::Start);
                self.view.send_modify(|view| view.is_started = started);
                self.sync().await;
            }
            Err(err) => {
                error!("Failed to {action:?} channel {channel_id}: {err}");
                self.fail(err.to_string());
            }
        }
    }

    /// Whether the backend already sits in the state `action` asks for.
    /// Backends reject repeated start/pause transitions.
    async fn already_in(&self, action: Lifecycle) -> bool {
        let wanted_paused = match action {
            Lifecycle::Start => false,
            Lifecycle::Pause => true,
            Lifecycle::Stop => return false,
        };
        match self.client.get_channel_status(&self.options.channel_id).await {
            Ok(status) => status.exists && status.paused == Some(wanted_paused),
            Err(err) => {
                debug!("Status check before {action:?} failed: {err}");
                false
            }
        }
    }

    /// Pulls local and remote state into the view.
    async fn sync(&self) {
        let channel_id = &self.options.channel_id;
        let has_channel = self.client.get_channel(channel_id).is_ok();
        self.view
            .send_modify(|view| view.has_channel = has_channel);

        match self.client.get_channel_info(channel_id).await {
            Ok(info) => self.view.send_modify(|view| view.apply_info(info)),
            Err(err) => {
                warn!("Status sync for channel {channel_id} failed: {err}");
                self.fail(err.to_string());
            }
        }

        let connected = self.view.borrow().is_connected;
        if let (true, Some(handler_id)) = (connected, self.options.handler_id.as_deref()) {
            if let Err(err) = self.client.check_handler(channel_id, handler_id) {
                warn!("Binding lost its registration: {err}");
                self.view.send_modify(|view| view.is_connected = false);
                self.stop_polling();
            }
        }
    }

    fn stop_polling(&self) {
        if let Some(token) = self.polling.lock().take() {
            token.cancel();
        }
    }
}

impl<T> Shared<T>
where
    T: Send + 'static,
{
    fn start_polling(self: &Arc<Self>) {
        let Some(interval) = self.options.status_polling_interval else {
            return;
        };
        let mut polling = self.polling.lock();
        if polling.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let shared: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(shared) = shared.upgrade() else {
                            break;
                        };
                        shared.refresh().await;
                    }
                }
            }
        });
        *polling = Some(token);
    }
}

impl<T> Drop for ChannelBinding<T> {
    fn drop(&mut self) {
        let shared = &self.shared;
        shared.stop_polling();

        let Some(handler_id) = shared.options.handler_id.clone() else {
            return;
        };
        if !shared.view.borrow().is_connected {
            return;
        }

        let client = Arc::clone(&shared.client);
        let channel_id = shared.options.channel_id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    client.unregister_handler(&channel_id, &handler_id).await;
                });
            }
            Err(_) => warn!("Handler {handler_id} on channel {channel_id} leaked: no async runtime"),
        }
    }
}
