use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure raised by the per-job pipeline back to the claim loop.
///
/// Only transient/environmental failures surface as `Err`; failures clearly
/// attributable to the submission content are converted into a terminal
/// rejection inside the pipeline and never reach the retry policy.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("processing timed out after {0:?}")]
    TimedOut(Duration),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProcessError {
    /// Rate-limit failures never consume a retry. External collaborators are
    /// only required to produce a descriptive message, so generic errors are
    /// classified by message pattern as well.
    pub fn is_rate_limited(&self) -> bool {
        match self {
            ProcessError::RateLimited(_) => true,
            ProcessError::TimedOut(_) => false,
            ProcessError::Store(err) => looks_rate_limited(&err.to_string()),
            ProcessError::Other(err) => looks_rate_limited(&format!("{err:#}")),
        }
    }
}

pub fn looks_rate_limited(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("rate limit")
        || message.contains("rate-limit")
        || message.contains("too many requests")
        || message.contains("429")
}

/// Content fetcher failure, pre-classified by the fetcher implementation.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("content fetch timed out")]
    Timeout,

    #[error("rate limited by platform: {0}")]
    RateLimited(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("content extraction failed: {0}")]
    Extraction(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{0}")]
    Missing(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Terminal, non-retried failure attributable to the submission itself (or to
/// an exhausted retry budget). Drives the job's `error_message` prefix and the
/// user-facing notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionReason {
    ContentFetchFailed,
    ValidationFailed,
    DuplicateContent,
    ProcessingFailed,
}

impl RejectionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectionReason::ContentFetchFailed => "CONTENT_FETCH_FAILED",
            RejectionReason::ValidationFailed => "VALIDATION_FAILED",
            RejectionReason::DuplicateContent => "DUPLICATE_CONTENT",
            RejectionReason::ProcessingFailed => "PROCESSING_FAILED",
        }
    }
}

/// One failed validation requirement, phrased so the user can act on it
/// ("add the required mention @reviewhub").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub requirement: String,
    pub message: String,
}
