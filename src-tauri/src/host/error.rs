use serde::Serialize;
use thiserror::Error;

use crate::channels::BridgeError;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("Channel with id '{id}' not found")]
    ChannelNotFound { id: String },

    #[error("Channel with id '{id}' already exists")]
    ChannelAlreadyExists { id: String },

    #[error("Channel with id '{id}' is already in the requested state")]
    InvalidStateTransition { id: String },
}

impl Serialize for HostError {
    fn serialize<S>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        serializer.serialize_str(self.to_string().as_ref())
    }
}

impl From<HostError> for String {
    fn from(err: HostError) -> Self {
        err.to_string()
    }
}

impl From<HostError> for BridgeError {
    fn from(err: HostError) -> Self {
        BridgeError::Rejected(err.to_string())
    }
}

pub type Result<T> = core::result::Result<T, HostError>;
