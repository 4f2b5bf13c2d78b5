// src/error.rs
//! Error types for the aviary runtime

use std::time::Duration;
use thiserror::Error;

/// Errors produced by the supervision runtime and its subsystems
#[derive(Debug, Error)]
pub enum AviaryError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("unknown agent implementation '{0}'")]
    UnknownImpl(String),

    #[error("role '{role}' is not an allowed child role of '{parent_role}'")]
    RoleNotAllowed { parent_role: String, role: String },

    #[error("agent '{0}' not found")]
    AgentNotFound(String),

    #[error("failed to spawn agent: {0}")]
    SpawnFailed(String),

    #[error("spawn request unanswered after {0:?}")]
    SpawnTimeout(Duration),

    #[error("timed out waiting for agent '{0}'")]
    WaitTimeout(String),

    #[error("worker channel closed")]
    ChannelClosed,

    #[error("invalid worker spec: {0}")]
    InvalidSpec(String),

    #[error("agent run failed: {0}")]
    AgentFailed(String),
}

/// Convenience result type used throughout the crate
pub type Result<T> = std::result::Result<T, AviaryError>;
