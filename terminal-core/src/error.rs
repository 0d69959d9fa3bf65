//! Error types for the terminal

use thiserror::Error;

/// Terminal-wide error type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TerminalError {
    /// The remote API answered with a non-zero status code
    #[error("API error ({code}): {message}")]
    Api { code: i64, message: String },

    #[error("Network error: {0}")]
    Network(String),

    /// Streaming connection dropped or produced an unusable frame
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Parse error: {0}")]
    Parse(String),

    /// Rejected locally before any remote call was attempted
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TerminalError {
    pub fn api(code: i64, message: impl Into<String>) -> Self {
        TerminalError::Api {
            code,
            message: message.into(),
        }
    }

    pub fn network(msg: impl Into<String>) -> Self {
        TerminalError::Network(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        TerminalError::Transport(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        TerminalError::Auth(msg.into())
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        TerminalError::Parse(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        TerminalError::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        TerminalError::NotFound(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        TerminalError::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        TerminalError::Internal(msg.into())
    }

    /// Remote status code, if this error came from an API rejection
    pub fn code(&self) -> Option<i64> {
        match self {
            TerminalError::Api { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Result type alias for terminal operations
pub type TerminalResult<T> = Result<T, TerminalError>;
