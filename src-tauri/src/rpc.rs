//! JSON-RPC over WebSocket surface of the web daemon.
//!
//! Requests are `{ id, method, params }` text frames answered with
//! `{ id, result }` or `{ id, error: { message } }`. Channels registered by a
//! connection stream their events back to it as `channel-message`
//! notifications and are unregistered when the socket closes.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State as AxumState};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channels::Transport;
use crate::config::DaemonConfig;
use crate::host::{ChannelHost, HostConfig};
use crate::settings::{SettingsError, SettingsStore};

pub const CHANNEL_MESSAGE_METHOD: &str = "channel-message";

pub struct DaemonState {
    pub config: DaemonConfig,
    pub host: ChannelHost,
    pub settings: SettingsStore,
}

impl DaemonState {
    pub async fn load(config: DaemonConfig) -> Result<Self, SettingsError> {
        let settings = SettingsStore::open_in(&config.data_dir).await?;
        let host = ChannelHost::new(HostConfig {
            emit_interval: config.emit_interval,
        });
        Ok(Self {
            config,
            host,
            settings,
        })
    }
}

/// Per-socket bookkeeping: the outbound queue, whether the socket has
/// presented the daemon token, and the channels it registered with the host.
pub struct Connection {
    id: Uuid,
    authenticated: bool,
    out_tx: mpsc::UnboundedSender<String>,
    channels: HashMap<String, Transport>,
}

impl Connection {
    pub fn new(out_tx: mpsc::UnboundedSender<String>, authenticated: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            authenticated,
            out_tx,
            channels: HashMap::new(),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn channel_ids(&self) -> Vec<String> {
        let mut ids = self.channels.keys().cloned().collect::<Vec<_>>();
        ids.sort();
        ids
    }

    /// Answers `auth` itself and refuses everything else until the socket is
    /// authenticated. `None` hands the request on to the dispatcher.
    pub fn admit(&mut self, expected: Option<&str>, method: &str, params: &Value) -> Option<Result<Value, String>> {
        match (self.authenticated, method) {
            (true, "auth") => Some(acknowledged()),
            (true, _) => None,
            (false, "auth") if presented_token(params) == expected.unwrap_or_default() => {
                self.authenticated = true;
                info!("Connection {} authenticated", self.id);
                Some(acknowledged())
            }
            (false, "auth") => {
                warn!("Connection {} presented a wrong token", self.id);
                Some(Err("invalid token".to_string()))
            }
            (false, _) => Some(Err("unauthorized".to_string())),
        }
    }

    fn transport_for(&self, channel_id: &str) -> Transport {
        let transport = Transport::new();
        let out_tx = self.out_tx.clone();
        let channel_id = channel_id.to_string();
        transport.set_onmessage(move |payload| {
            let notification = json!({
                "method": CHANNEL_MESSAGE_METHOD,
                "params": { "channelId": channel_id, "payload": payload },
            });
            let _ = out_tx.send(notification.to_string());
        });
        transport
    }

    fn forget(&mut self, channel_id: &str) {
        if let Some(transport) = self.channels.remove(channel_id) {
            transport.close();
        }
    }

    /// Unregisters every channel this connection owns. Returns how many were
    /// released.
    pub async fn release(&mut self, host: &ChannelHost) -> usize {
        let owned = self.channels.drain().collect::<Vec<_>>();
        for (channel_id, transport) in &owned {
            transport.close();
            if let Err(err) = host.unregister(channel_id).await {
                debug!("Channel '{channel_id}' already gone on disconnect: {err}");
            }
        }
        if !owned.is_empty() {
            info!("Connection {} released {} channel(s)", self.id, owned.len());
        }
        owned.len()
    }
}

/// One inbound frame. Frames without an `id` are executed but not answered.
#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    method: String,
    #[serde(default)]
    params: Value,
}

/// Encodes the answer to request `id`.
fn reply(id: Option<u64>, outcome: Result<Value, String>) -> Option<String> {
    let id = id?;
    let frame = match outcome {
        Ok(result) => json!({ "id": id, "result": result }),
        Err(message) => json!({ "id": id, "error": { "message": message } }),
    };
    Some(frame.to_string())
}

/// `auth` takes the token bare or as `{ "token": ... }`.
fn presented_token(params: &Value) -> &str {
    params
        .as_str()
        .or_else(|| params.get("token").and_then(Value::as_str))
        .unwrap_or_default()
}

fn param<T: DeserializeOwned>(params: &Value, key: &str) -> Result<T, String> {
    let value = params.get(key).ok_or_else(|| format!("missing `{key}`"))?;
    T::deserialize(value).map_err(|err| format!("invalid `{key}`: {err}"))
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value, String> {
    serde_json::to_value(value).map_err(|err| err.to_string())
}

fn acknowledged() -> Result<Value, String> {
    Ok(json!({ "ok": true }))
}

pub async fn handle_rpc_request(
    state: &DaemonState,
    connection: &mut Connection,
    method: &str,
    params: Value,
) -> Result<Value, String> {
    match method {
        "ping" => acknowledged(),
        "register" => {
            let id = param::<String>(&params, "id")?;
            let transport = connection.transport_for(&id);
            state.host.register(&id, transport.clone()).await?;
            connection.channels.insert(id, transport);
            acknowledged()
        }
        "unregister" => {
            let id = param::<String>(&params, "id")?;
            state.host.unregister(&id).await?;
            connection.forget(&id);
            acknowledged()
        }
        "start" => {
            let id = param::<String>(&params, "id")?;
            state.host.start(&id).await?;
            acknowledged()
        }
        "pause" => {
            let id = param::<String>(&params, "id")?;
            state.host.pause(&id).await?;
            acknowledged()
        }
        "stop" => {
            let id = param::<String>(&params, "id")?;
            state.host.stop(&id).await?;
            connection.forget(&id);
            acknowledged()
        }
        "get_status" => {
            let id = param::<String>(&params, "id")?;
            to_value(state.host.get_status(&id).await)
        }
        "list_channels" => to_value(state.host.list_channels().await),
        "get_setting" => {
            let key = param::<String>(&params, "key")?;
            Ok(state.settings.get_setting::<Value>(&key).await?)
        }
        "get_setting_with_default" => {
            let key = param::<String>(&params, "key")?;
            let default_value = param::<Value>(&params, "defaultValue")?;
            Ok(state.settings.get_setting_or(&key, default_value).await?)
        }
        "set_setting" => {
            let key = param::<String>(&params, "key")?;
            let value = param::<Value>(&params, "value")?;
            state.settings.set_setting(&key, &value).await?;
            acknowledged()
        }
        "get_setting_or_default" => {
            let key = param::<String>(&params, "key")?;
            Ok(state.settings.get_setting_or_default::<Value>(&key).await?)
        }
        "set_string_setting" => {
            let key = param::<String>(&params, "key")?;
            let value = param::<String>(&params, "value")?;
            state.settings.set_setting(&key, &value).await?;
            acknowledged()
        }
        "get_string_setting" => {
            let key = param::<String>(&params, "key")?;
            to_value(state.settings.find_setting::<String>(&key).await?)
        }
        "set_bool_setting" => {
            let key = param::<String>(&params, "key")?;
            let value = param::<bool>(&params, "value")?;
            state.settings.set_setting(&key, &value).await?;
            acknowledged()
        }
        "get_bool_setting" => {
            let key = param::<String>(&params, "key")?;
            to_value(state.settings.find_setting::<bool>(&key).await?)
        }
        "set_number_setting" => {
            let key = param::<String>(&params, "key")?;
            let value = param::<f64>(&params, "value")?;
            state.settings.set_setting(&key, &value).await?;
            acknowledged()
        }
        "get_number_setting" => {
            let key = param::<String>(&params, "key")?;
            to_value(state.settings.find_setting::<f64>(&key).await?)
        }
        "delete_setting" => {
            let key = param::<String>(&params, "key")?;
            to_value(state.settings.delete_setting(&key).await?)
        }
        "setting_exists" => {
            let key = param::<String>(&params, "key")?;
            to_value(state.settings.setting_exists(&key).await)
        }
        "list_all_settings" => Ok(Value::Object(state.settings.list_settings().await)),
        "merge_settings" => {
            let key = param::<String>(&params, "key")?;
            let value = param::<Value>(&params, "value")?;
            state.settings.merge_settings(&key, value).await?;
            acknowledged()
        }
        "set_nested_setting" => {
            let key = param::<String>(&params, "key")?;
            let path = param::<String>(&params, "path")?;
            let value = param::<Value>(&params, "value")?;
            state.settings.set_nested_setting(&key, &path, value).await?;
            acknowledged()
        }
        "get_nested_setting" => {
            let key = param::<String>(&params, "key")?;
            let path = param::<String>(&params, "path")?;
            Ok(state.settings.get_nested_setting::<Value>(&key, &path).await?)
        }
        "count_settings" => to_value(state.settings.count_settings().await),
        "clear_all_settings" => to_value(state.settings.clear_settings().await?),
        _ => Err(format!("unknown method: {method}")),
    }
}

#[derive(Deserialize, Default)]
struct RpcQuery {
    token: Option<String>,
}

pub fn router(state: Arc<DaemonState>) -> Router {
    Router::new().route("/rpc", get(ws_rpc_route)).with_state(state)
}

async fn ws_rpc_route(
    ws: WebSocketUpgrade,
    AxumState(state): AxumState<Arc<DaemonState>>,
    Query(query): Query<RpcQuery>,
) -> impl IntoResponse {
    let authenticated = match state.config.token.as_deref() {
        None => true,
        Some(expected) => query.token.as_deref() == Some(expected),
    };
    ws.on_upgrade(move |socket| handle_ws_client(socket, state, authenticated))
}

/// Text carried by a data frame. Control frames and non-UTF-8 payloads
/// carry none.
fn frame_text(message: Message) -> Option<String> {
    match message {
        Message::Text(text) => Some(text.to_string()),
        Message::Binary(data) => String::from_utf8(data.to_vec()).ok(),
        Message::Ping(_) | Message::Pong(_) | Message::Close(_) => None,
    }
}

async fn handle_ws_client(socket: WebSocket, state: Arc<DaemonState>, authenticated: bool) {
    let (mut sender, mut receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

    let write_task = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if sender.send(Message::Text(message.into())).await.is_err() {
                break;
            }
        }
    });

    let mut connection = Connection::new(out_tx.clone(), authenticated);
    debug!("Connection {} opened", connection.id);

    while let Some(Ok(message)) = receiver.next().await {
        if matches!(message, Message::Close(_)) {
            break;
        }
        let Some(text) = frame_text(message) else {
            continue;
        };
        let line = text.trim();
        if line.is_empty() {
            continue;
        }

        let RpcRequest { id, method, params } = match serde_json::from_str::<RpcRequest>(line) {
            Ok(request) => request,
            Err(err) => {
                warn!("Dropping malformed frame on connection {}: {err}", connection.id);
                continue;
            }
        };

        let outcome = match connection.admit(state.config.token.as_deref(), &method, &params) {
            Some(outcome) => outcome,
            None => handle_rpc_request(&state, &mut connection, &method, params).await,
        };
        if let Err(message) = &outcome {
            debug!("Request `{method}` failed: {message}");
        }
        if let Some(frame) = reply(id, outcome) {
            let _ = out_tx.send(frame);
        }
    }

    connection.release(&state.host).await;
    drop(out_tx);
    write_task.abort();
    debug!("Connection {} closed", connection.id);
}
