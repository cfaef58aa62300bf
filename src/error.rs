//! Error types for the platform SDK
//!
//! Every failure surfaced by the core maps onto one of a small number of
//! categories (see [`ErrorKind`]). Wrapper calls surface the message verbatim,
//! so HTTP error bodies are kept as raw text rather than parsed.

use crate::roles::Role;
use crate::transport::mqtt::MqttError;
use thiserror::Error;

/// Main error type for SDK operations
#[derive(Debug, Error)]
pub enum SdkError {
    #[error("No SystemSecret/SystemKey combo, or {role} token found")]
    NoCredentials { role: Role },

    #[error("Error making request: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Invalid request URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("JSON encoding error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    /// Non-200 response from the platform; `body` is the raw response text.
    #[error("{body}")]
    Domain { status: u16, body: String },

    #[error("Unexpected response from platform: {message}")]
    UnexpectedResponse { message: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("MQTT error: {0}")]
    Mqtt(#[from] MqttError),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

/// Coarse classification of [`SdkError`] values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Neither a token nor a system key/secret pair was available
    NoCredentials,
    /// Network or connection failure
    Transport,
    /// The platform answered with a non-success status
    Domain,
    /// Malformed payload, unexpected response shape, or uninitialized connection
    Protocol,
    /// A connect or reply wait ran out of time
    Timeout,
    /// Caller supplied unusable arguments
    InvalidInput,
    /// Configuration could not be loaded or validated
    Configuration,
}

impl SdkError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            SdkError::NoCredentials { .. } => ErrorKind::NoCredentials,
            SdkError::Transport(e) if e.is_timeout() => ErrorKind::Timeout,
            SdkError::Transport(_) | SdkError::Tls(_) => ErrorKind::Transport,
            SdkError::InvalidUrl(_) | SdkError::InvalidInput { .. } => ErrorKind::InvalidInput,
            SdkError::Serialization(_) => ErrorKind::InvalidInput,
            SdkError::Domain { .. } => ErrorKind::Domain,
            SdkError::UnexpectedResponse { .. } => ErrorKind::Protocol,
            SdkError::Mqtt(e) => e.kind(),
            SdkError::Config(_) => ErrorKind::Configuration,
        }
    }

    /// HTTP status of a domain error
    pub fn status(&self) -> Option<u16> {
        match self {
            SdkError::Domain { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Create invalid input error
    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create unexpected response error
    pub fn unexpected_response<S: Into<String>>(message: S) -> Self {
        Self::UnexpectedResponse {
            message: message.into(),
        }
    }
}

/// Result type for SDK operations
pub type SdkResult<T> = Result<T, SdkError>;
