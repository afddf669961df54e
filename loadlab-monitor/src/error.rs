use thiserror::Error;

/// Errors that can occur in the monitor library
#[derive(Error, Debug, Clone)]
pub enum MonitorError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Push transport error (connect failure, socket fault)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Backend answered with a non-success status
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Request never produced a response
    #[error("Network error: {0}")]
    Network(String),

    /// Payload did not match the expected shape
    #[error("Decode error: {0}")]
    Decode(String),

    /// Invalid state error
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Timeout error
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

/// Result type alias using MonitorError
pub type Result<T> = std::result::Result<T, MonitorError>;

impl MonitorError {
    /// Whether a user-initiated retry of the same fetch can reasonably succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            MonitorError::Network(_) | MonitorError::Timeout(_) | MonitorError::Transport(_) => true,
            MonitorError::Http { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

impl From<String> for MonitorError {
    fn from(s: String) -> Self {
        MonitorError::Other(s)
    }
}

impl From<&str> for MonitorError {
    fn from(s: &str) -> Self {
        MonitorError::Other(s.to_string())
    }
}

impl From<serde_json::Error> for MonitorError {
    fn from(err: serde_json::Error) -> Self {
        MonitorError::Decode(err.to_string())
    }
}

impl From<reqwest::Error> for MonitorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            MonitorError::Timeout(err.to_string())
        } else if err.is_decode() {
            MonitorError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            MonitorError::Http {
                status: status.as_u16(),
                body: err.to_string(),
            }
        } else {
            MonitorError::Network(err.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for MonitorError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        MonitorError::Transport(err.to_string())
    }
}

impl From<config::ConfigError> for MonitorError {
    fn from(err: config::ConfigError) -> Self {
        MonitorError::Config(err.to_string())
    }
}
