//! Error types for the judgement engine.
//!
//! Library crates use [`JudgementError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type for all judgement engine operations.
#[derive(Debug, thiserror::Error)]
pub enum JudgementError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Structured LLM call failed (transport, API, or unusable output).
    #[error("llm error: {0}")]
    Llm(String),

    /// A retrieval collaborator failed.
    #[error("retrieval error: {0}")]
    Retrieval(String),

    /// A collaborator call exceeded its time budget.
    #[error("{operation} exceeded its time budget of {}ms", budget.as_millis())]
    Timeout {
        operation: String,
        budget: Duration,
    },

    /// A required upstream record does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// No context selector is registered for a move type.
    #[error("no context selector registered for move type '{0}'")]
    UnknownSelector(String),

    /// Data validation error (schema mismatch, invalid format, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, JudgementError>;

impl JudgementError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a not-found error for a record family and id.
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Create a timeout error for a named operation.
    pub fn timeout(operation: impl Into<String>, budget: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            budget,
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Fatal input errors abort a run with no partial artifact; every other
    /// kind is recovered locally by the caller.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. } | Self::UnknownSelector(_) | Self::Validation { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = JudgementError::config("missing API key");
        assert_eq!(err.to_string(), "config error: missing API key");

        let err = JudgementError::not_found("scenario", "sc-1");
        assert_eq!(err.to_string(), "scenario not found: sc-1");

        let err = JudgementError::timeout("llm call framing", Duration::from_millis(1500));
        assert!(err.to_string().contains("1500ms"));
    }

    #[test]
    fn fatal_classification() {
        assert!(JudgementError::not_found("framing", "f").is_fatal());
        assert!(JudgementError::UnknownSelector("framing".into()).is_fatal());
        assert!(!JudgementError::Llm("rate limited".into()).is_fatal());
        assert!(!JudgementError::Storage("locked".into()).is_fatal());
        assert!(!JudgementError::timeout("x", Duration::from_secs(1)).is_fatal());
    }
}
