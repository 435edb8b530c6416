//! Error types shared across the core crate.
//!
//! Backend and model failures are kept apart on purpose: a backend failure is
//! folded into a tool envelope and handed back to the model, while a model
//! failure ends the request.

use std::time::Duration;

/// Failure talking to the data gateway.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("failed to reach the data gateway: {0}")]
    Transport(String),
    #[error("data gateway call timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("the data gateway rejected the credential: {0}")]
    Unauthorized(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("the data gateway has no SQL execution endpoint")]
    Unsupported,
    #[error("{message}")]
    Api { status: u16, message: String },
    #[error("invalid response from the data gateway: {0}")]
    InvalidResponse(String),
}

impl BackendError {
    /// True when the gateway refused the supplied credential.
    pub fn is_auth_failure(&self) -> bool {
        match self {
            Self::Unauthorized(_) => true,
            Self::Api { status, message } => {
                *status == 401 || *status == 403 || mentions_invalid_key(message)
            }
            _ => false,
        }
    }
}

pub(crate) fn mentions_invalid_key(message: &str) -> bool {
    message.to_ascii_lowercase().contains("invalid api key")
}

/// Failure talking to the chat-completion service.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ModelError {
    #[error("API error: {0}")]
    Api(String),
    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("model call timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("model is not configured: {0}")]
    NotConfigured(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {name}={value:?} ({expected})")]
    Invalid {
        name: &'static str,
        value: String,
        expected: &'static str,
    },
    #[error("failed to read {name}: {source}")]
    Unreadable {
        name: &'static str,
        source: std::env::VarError,
    },
}
