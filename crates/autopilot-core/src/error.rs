//! Error types shared by every Autopilot crate.

use thiserror::Error;

/// Unified error type.
#[derive(Debug, Error)]
pub enum AutopilotError {
    /// Malformed predicate, schedule, or event JSON.
    #[error("Parse error: {0}")]
    Parse(String),

    /// A value was well-formed but violates a shape invariant
    /// (multi-child NOT, empty AND/OR, min > max, non-positive goal...).
    #[error("Invalid construction: {0}")]
    Construction(String),

    #[error("Schedule not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Config error: {0}")]
    Config(String),

    /// The engine's background context is gone.
    #[error("Engine error: {0}")]
    Engine(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl AutopilotError {
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    pub fn construction(msg: impl Into<String>) -> Self {
        Self::Construction(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, AutopilotError>;
