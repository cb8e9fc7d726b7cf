use serde::Serialize;
use thiserror::Error;

use super::bridge::BridgeError;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Channel '{channel_id}' not found")]
    ChannelNotFound { channel_id: String },

    #[error("Handler '{handler_id}' not found in channel '{channel_id}'")]
    HandlerNotFound {
        handler_id: String,
        channel_id: String,
    },

    #[error("Handler '{handler_id}' already exists for channel '{channel_id}'")]
    HandlerAlreadyExists {
        handler_id: String,
        channel_id: String,
    },

    #[error("Registration failed for channel {channel_id}: {cause}")]
    Registration {
        channel_id: String,
        #[source]
        cause: BridgeError,
    },

    #[error("Cleanup failed for channel {channel_id}: {cause}")]
    Cleanup {
        channel_id: String,
        #[source]
        cause: BridgeError,
    },

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

impl ChannelError {
    pub(crate) fn not_found(channel_id: &str) -> Self {
        Self::ChannelNotFound {
            channel_id: channel_id.to_string(),
        }
    }
}

impl Serialize for ChannelError {
    fn serialize<S>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        serializer.serialize_str(self.to_string().as_ref())
    }
}

impl From<ChannelError> for String {
    fn from(err: ChannelError) -> Self {
        err.to_string()
    }
}

pub type Result<T> = core::result::Result<T, ChannelError>;
