//! Error types for dtrader

use thiserror::Error;

/// dtrader-wide error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DTraderError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection closed: {0}")]
    Closed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Event handler error ({topic}): {message}")]
    Handler { topic: String, message: String },
}

impl DTraderError {
    pub fn network(msg: impl Into<String>) -> Self {
        DTraderError::Network(msg.into())
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        DTraderError::Parse(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        DTraderError::Protocol(msg.into())
    }

    pub fn closed(msg: impl Into<String>) -> Self {
        DTraderError::Closed(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        DTraderError::Config(msg.into())
    }

    pub fn handler(topic: impl Into<String>, message: impl Into<String>) -> Self {
        DTraderError::Handler {
            topic: topic.into(),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for DTraderError {
    fn from(err: serde_json::Error) -> Self {
        DTraderError::Parse(err.to_string())
    }
}

/// Result type alias for dtrader operations
pub type DTraderResult<T> = Result<T, DTraderError>;
