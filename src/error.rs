//! Gateway error types.
//!
//! Defines error variants for backend connection, tool routing, registry
//! persistence, and configuration handling.

use thiserror::Error;

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Backend not found: {0}")]
    BackendNotFound(String),

    #[error("Backend disconnected: {0}")]
    BackendDisconnected(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Tool execution failed: {0}")]
    ToolExecution(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
