use std::time::Duration;
use thiserror::Error;

/// Failure classes of the sync and summarization engine.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The session could not be (re)authenticated. Fatal to the current operation.
    #[error("not authenticated: {0}")]
    Auth(String),

    #[error("timed out after {timeout:?} waiting for {what}")]
    NavigationTimeout { what: String, timeout: Duration },

    #[error("{0} not found")]
    NotFound(String),

    /// Transient driver failure (connection reset, stale element, script error).
    #[error("web session error: {0}")]
    Session(String),

    /// The page did not decode into the expected records.
    #[error("failed to extract {what}: {reason}")]
    Extraction { what: String, reason: String },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("text generation failed: {0}")]
    Llm(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("background task failed: {0}")]
    Task(String),

    #[error("{failed} of {total} channels failed to sync")]
    PartialSync { failed: usize, total: usize },
}

impl SyncError {
    pub fn extraction(what: impl Into<String>, reason: impl ToString) -> Self {
        Self::Extraction {
            what: what.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether the orchestrator may re-run the whole crawler call.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NavigationTimeout { .. } | Self::Session(_) | Self::Extraction { .. }
        )
    }

    /// Errors that make every sibling operation fail the same way.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    /// Plain payload handed to end users instead of a stack trace.
    pub fn user_message(&self) -> String {
        format!("Error: {}", self)
    }
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Task(e.to_string())
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
