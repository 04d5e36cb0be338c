use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::StreamRole;

#[derive(Debug, Error)]
pub enum RosterError {
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("stream {stream_id} recorded as {recorded} but observed as {observed}")]
    RoleConflict {
        stream_id: String,
        recorded: StreamRole,
        observed: StreamRole,
    },
    #[error("unknown video type: {0}")]
    UnknownVideoType(String),
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("HTTP request failed: {0}")]
    Http(String),
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

/// Error reported by the underlying session client through a completion
/// callback. Surfaced to callers unmodified.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{name}: {message}")]
pub struct TransportError {
    pub name: String,
    #[serde(default)]
    pub code: Option<i32>,
    pub message: String,
}

impl TransportError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: i32) -> Self {
        self.code = Some(code);
        self
    }

    /// The completion callback was dropped without ever being called.
    pub(crate) fn completion_dropped() -> Self {
        Self::new(
            "CompletionDropped",
            "session client dropped the completion callback without reporting a result",
        )
    }
}
