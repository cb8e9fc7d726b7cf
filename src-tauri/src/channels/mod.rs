//! Client side of the channel bridge.
//!
//! Logical channels are multiplexed over one [`ChannelBridge`]. The first
//! handler registered on a channel creates it on the backend, the last one to
//! leave tears it down, and every inbound message fans out to all handlers.

pub mod binding;
pub mod bridge;
pub mod client;
pub mod error;
mod registry;
pub mod testing;
pub mod transport;

pub use binding::{BindingOptions, BindingSnapshot, ChannelBinding};
pub use bridge::{BridgeError, ChannelBridge};
pub use client::ChannelClient;
pub use error::ChannelError;
pub use registry::{typed_handler, Handler, HandlerError};
pub use transport::{Transport, TransportError};
