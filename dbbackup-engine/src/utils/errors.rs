//! Error taxonomy for the backup engine.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Invalid operator input (bad recovery target, key size, LSN, ...)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A precondition does not hold; raised before any side effect
    #[error("Preflight check failed: {0}")]
    Preflight(String),

    /// An external tool exited unsuccessfully
    #[error("{tool} failed (exit code {}): {stderr}", .exit_code.map(|c| c.to_string()).unwrap_or_else(|| "none".to_string()))]
    ToolFailure {
        tool: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Chain inconsistency: {0}")]
    ChainInconsistency(String),

    #[error("No changed files since the base backup")]
    NoChanges,

    #[error("{operation} partially failed: {} of {total} databases failed: {}", .failures.len(), .failures.join("; "))]
    PartialFailure {
        operation: String,
        total: usize,
        failures: Vec<String>,
        artifact: Option<PathBuf>,
    },

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// True for the clean-shutdown path (cancellation or deadline).
    pub fn is_interruption(&self) -> bool {
        matches!(self, EngineError::Cancelled | EngineError::TimedOut(_))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_failure_message_carries_stderr() {
        let err = EngineError::ToolFailure {
            tool: "pg_dump".to_string(),
            exit_code: Some(1),
            stderr: "pg_dump: error: connection failed".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("pg_dump"));
        assert!(msg.contains("exit code 1"));
        assert!(msg.contains("connection failed"));
    }

    #[test]
    fn test_partial_failure_enumerates_databases() {
        let err = EngineError::PartialFailure {
            operation: "cluster backup".to_string(),
            total: 5,
            failures: vec!["bad: pg_dump failed".to_string(), "worse: timed out".to_string()],
            artifact: None,
        };
        let msg = err.to_string();
        assert!(msg.contains("2 of 5"));
        assert!(msg.contains("bad: pg_dump failed"));
        assert!(msg.contains("worse: timed out"));
    }

    #[test]
    fn test_interruption_classification() {
        assert!(EngineError::Cancelled.is_interruption());
        assert!(EngineError::TimedOut(Duration::from_secs(1)).is_interruption());
        assert!(!EngineError::NoChanges.is_interruption());
    }
}
