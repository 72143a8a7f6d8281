//! Error types for Podcatch core

use podcatch_types::EpisodeId;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Failure classes the retry orchestrator acts on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Timeouts, resets, HTTP 408/429/5xx
    TransientNetwork,
    /// 416 during a resume; recovered by restarting fresh
    RangeNotSatisfiable,
    /// Written size differs from the declared size beyond tolerance
    SizeMismatch,
    /// Malformed input, filesystem errors, other HTTP statuses
    NonTransient,
    Canceled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::TransientNetwork => "transient network error",
            Self::RangeNotSatisfiable => "range not satisfiable",
            Self::SizeMismatch => "size mismatch",
            Self::NonTransient => "non-transient error",
            Self::Canceled => "canceled",
        };
        f.write_str(name)
    }
}

/// Errors that can occur in Podcatch core
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("HTTP {status} from server")]
    Http {
        status: u16,
        /// Server-provided `Retry-After`, already converted to a delay
        retry_after: Option<Duration>,
    },

    #[error("Timed out waiting for response headers after {0:?}")]
    HeaderTimeout(Duration),

    #[error("No data received for {0:?}")]
    ReadTimeout(Duration),

    #[error("Stream error: {0}")]
    Stream(std::io::Error),

    #[error("Range not satisfiable when resuming from byte {offset}")]
    RangeNotSatisfiable { offset: u64 },

    #[error("Size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Episode not found: {0}")]
    EpisodeNotFound(EpisodeId),

    #[error("Download was canceled")]
    Canceled,

    #[error("Giving up after {attempts} attempts ({kind}): {message}")]
    RetriesExhausted {
        attempts: u32,
        kind: ErrorKind,
        message: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),
}

impl DownloadError {
    /// Classify this error for the retry orchestrator
    pub fn kind(&self) -> ErrorKind {
        match self {
            DownloadError::Network(e) => {
                if e.is_builder() {
                    ErrorKind::NonTransient
                } else {
                    ErrorKind::TransientNetwork
                }
            }
            DownloadError::Http { status, .. } => {
                if *status == 408 || *status == 429 || *status >= 500 {
                    ErrorKind::TransientNetwork
                } else {
                    ErrorKind::NonTransient
                }
            }
            DownloadError::HeaderTimeout(_)
            | DownloadError::ReadTimeout(_)
            | DownloadError::Stream(_) => ErrorKind::TransientNetwork,
            DownloadError::RangeNotSatisfiable { .. } => ErrorKind::RangeNotSatisfiable,
            DownloadError::SizeMismatch { .. } => ErrorKind::SizeMismatch,
            DownloadError::Canceled => ErrorKind::Canceled,
            DownloadError::RetriesExhausted { kind, .. } => *kind,
            DownloadError::Io(_)
            | DownloadError::InvalidUrl(_)
            | DownloadError::UnsupportedScheme(_)
            | DownloadError::EpisodeNotFound(_)
            | DownloadError::Serialization(_)
            | DownloadError::Config(_) => ErrorKind::NonTransient,
        }
    }

    /// Check if this error is worth another attempt
    pub fn is_retryable(&self) -> bool {
        if matches!(self, DownloadError::RetriesExhausted { .. }) {
            return false;
        }
        matches!(
            self.kind(),
            ErrorKind::TransientNetwork | ErrorKind::SizeMismatch
        )
    }

    /// Server-provided delay hint, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            DownloadError::Http { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, DownloadError::Canceled)
    }
}
