//! Error types for datanode

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Dial failed: {0}")]
    DialFailed(String),

    #[error("Request timeout: {0}")]
    Timeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("No handler found for command: {0}")]
    Unimplemented(String),

    #[error("Container runtime error: {0}")]
    Runtime(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl NodeError {
    /// HTTP-equivalent status carried back in a command response.
    pub fn http_status(&self) -> u16 {
        match self {
            NodeError::BadRequest(_) | NodeError::Json(_) => 400,
            NodeError::Forbidden(_) => 403,
            NodeError::NotFound(_) | NodeError::PeerNotFound(_) | NodeError::DialFailed(_) => 404,
            NodeError::Timeout(_) => 504,
            NodeError::Unimplemented(_) => 501,
            _ => 500,
        }
    }
}

impl From<anyhow::Error> for NodeError {
    fn from(e: anyhow::Error) -> Self {
        NodeError::Internal(format!("{:#}", e))
    }
}

pub type NodeResult<T> = std::result::Result<T, NodeError>;
