//! Error kinds surfaced by the fetch, store and pipeline layers.
//!
//! Extraction and normalization never produce these for malformed content;
//! unparseable listings are counted in the [`Extraction`](crate::extract::Extraction)
//! instead.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Debug, Error)]
pub enum IngestError {
    /// Bad input shape: malformed URL, non-positive count, empty file, bad rules.
    #[error("validation error: {0}")]
    Validation(String),

    /// A referenced local snapshot does not exist.
    #[error("snapshot not found: {}", .0.display())]
    NotFound(PathBuf),

    /// Connection failure, timeout, or non-success status.
    #[error("network error fetching {url}: {reason}")]
    Network {
        url: String,
        status: Option<u16>,
        reason: String,
    },

    /// The caller aborted the operation before a page was produced.
    #[error("operation cancelled")]
    Cancelled,

    /// Persistence layer unavailable or a write failed.
    #[error("storage error: {0}")]
    Storage(String),
}

impl IngestError {
    /// Whether a fetch that failed this way is worth another attempt.
    ///
    /// Transport failures and the status codes anti-bot layers answer with
    /// (403, 429, 5xx) qualify; everything else is final.
    pub fn is_retryable(&self) -> bool {
        match self {
            IngestError::Network { status: None, .. } => true,
            IngestError::Network {
                status: Some(code), ..
            } => matches!(code, 403 | 429) || (500..600).contains(code),
            _ => false,
        }
    }

    pub(crate) fn network(url: &str, err: &reqwest::Error) -> Self {
        let reason = if err.is_timeout() {
            format!("timed out: {err}")
        } else if err.is_connect() {
            format!("connection failed: {err}")
        } else {
            err.to_string()
        };
        IngestError::Network {
            url: url.to_string(),
            status: err.status().map(|s| s.as_u16()),
            reason,
        }
    }
}

impl From<sqlx::Error> for IngestError {
    fn from(err: sqlx::Error) -> Self {
        IngestError::Storage(err.to_string())
    }
}
