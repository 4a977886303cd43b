use serde_json::Value;
use std::{io, time::Duration};
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Errors that can occur while talking to the server or building content.
#[derive(Error, Debug)]
pub enum RpcError {
    /// Error occurred during I/O operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Error occurred during JSON serialization or deserialization.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The configuration file could not be parsed.
    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),

    /// A frame did not have the expected shape.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A tag was constructed with missing or malformed attributes.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A frame was submitted while the connection was not open and no outbound buffer is
    /// configured.
    #[error("not connected")]
    NotConnected,

    /// No response arrived for a call within its deadline.
    #[error("call '{action}' timed out after {after:?}")]
    Timeout { action: String, after: Duration },

    /// The connection closed while the call was pending.
    #[error("connection lost")]
    ConnectionLost,

    /// The server answered with a failure status.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// Establishing the websocket failed.
    #[error("connect failed: {source}")]
    Connect { source: Box<tungstenite::Error> },

    /// The websocket failed after it was established.
    #[error("transport error: {source}")]
    Transport { source: Box<tungstenite::Error> },
}

/// A failure status returned by the server for an API call.
///
/// Carries the raw `status` and `retcode` fields, the optional human readable message the
/// server attached (`wording`, falling back to `msg`), and whatever `data` came with it.
#[derive(Error, Debug, Clone, PartialEq)]
pub struct ApiError {
    pub status: String,
    pub retcode: i64,
    pub message: Option<String>,
    pub data: Value,
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "API error {} (retcode {})", self.status, self.retcode)?;
        if let Some(message) = &self.message {
            write!(f, ": {}", message)?;
        }
        Ok(())
    }
}

/// A tag attribute failed validation during construction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid {kind} tag field '{field}': {reason}")]
pub struct ValidationError {
    pub kind: String,
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    pub(crate) fn new(kind: &str, field: &str, reason: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<tungstenite::Error> for RpcError {
    fn from(source: tungstenite::Error) -> Self {
        RpcError::Transport {
            source: Box::new(source),
        }
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
