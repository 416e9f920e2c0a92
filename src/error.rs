//! Error types for the annotation pipeline.
//!
//! Nothing here is ever surfaced to the host page. Callers log and degrade:
//! the visible effect of any failure is a missing flag.

use thiserror::Error;

/// Main error type for the crate.
#[derive(Debug, Error)]
pub enum FlagError {
    #[error("storage error: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("lookup request failed: {0}")]
    Lookup(#[from] reqwest::Error),

    #[error("bridge error: {0}")]
    Bridge(String),

    #[error("{0} channel closed")]
    ChannelClosed(&'static str),

    #[error("DOM error: {0}")]
    Dom(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl FlagError {
    pub(crate) fn storage(message: impl Into<String>, source: std::io::Error) -> Self {
        FlagError::Storage {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Copy of this error for fan-out to several waiters. Sources are
    /// flattened into the message.
    pub fn to_shared(&self) -> FlagError {
        match self {
            FlagError::ChannelClosed(name) => FlagError::ChannelClosed(name),
            other => FlagError::Bridge(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, FlagError>;
