//! Errors raised by the client-side store, sync client, and state manager.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("local storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("server rejected protocol version: {0}")]
    ProtocolVersion(String),

    #[error("server returned error status {status}: {body}")]
    ServerError { status: u16, body: String },

    #[error("device is offline")]
    Offline,

    #[error("a sync is already in progress")]
    Busy,

    #[error(transparent)]
    Core(#[from] inbetweenies_core::CoreError),
}
