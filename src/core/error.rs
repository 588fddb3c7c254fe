use thiserror::Error;

use crate::core::step::NegotiationStep;

#[derive(Error, Debug)]
pub enum NegotiationError {
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid step transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: NegotiationStep,
        to: NegotiationStep,
    },

    #[error("Session has ended")]
    SessionEnded,

    #[error("Usage limit reached")]
    UsageLimitReached,

    #[error("Session is owned by another context")]
    NotOwner,

    #[error("Input not accepted in step {0:?}")]
    InputRejected(NegotiationStep),

    #[error("Empty input")]
    EmptyInput,

    #[error("No active session")]
    NoSession,
}

#[derive(Error, Debug, Clone)]
pub enum RemoteError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Usage limit reached")]
    UsageLimit,

    #[error("Decode error: {0}")]
    Decode(String),
}

impl RemoteError {
    pub fn is_usage_limit(&self) -> bool {
        matches!(self, Self::UsageLimit)
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file error: {0}")]
    File(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
