use thiserror::Error;

use crate::models::TaskStatus;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("illegal transition: cannot {action} a task in state {from}")]
    IllegalTransition { action: &'static str, from: TaskStatus },

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} not installed")]
    ToolNotInstalled(String),

    #[error("{tool} timed out after {secs}s")]
    ToolTimeout { tool: String, secs: u64 },

    #[error("{tool} failed: {reason}")]
    ToolFailed { tool: String, reason: String },

    #[error("no node with spare capacity")]
    NodeUnavailable,

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("queue error: {0}")]
    Queue(String),

    #[error("persistence error: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl ScanError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Message that is safe to show outside the server.
    pub fn public_message(&self) -> String {
        match self {
            ScanError::Persistence(_) | ScanError::Migration(_) | ScanError::Queue(_) => {
                "internal error".to_string()
            }
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ScanError>;
