//! Channel bridge library.
//!
//! Multiplexes named logical channels over a single backend bridge. The
//! `channels` module is the client side (registry, subscription API and the
//! per-consumer binding), `host` is the backend that owns emitting channel
//! tasks, and `rpc` exposes the host and settings over the web daemon.

pub mod channels;
pub mod config;
pub mod host;
pub mod rpc;
pub mod settings;
pub mod types;

pub use channels::{
    BindingOptions, BindingSnapshot, ChannelBinding, ChannelBridge, ChannelClient, ChannelError,
    Transport,
};
pub use host::ChannelHost;
pub use settings::SettingsStore;
pub use types::{ChannelInfo, ChannelStatus, StreamEvent};
