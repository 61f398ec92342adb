use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure outcomes of a documentation lookup.
///
/// The type is `Clone` because a single fetch outcome is handed to every
/// caller waiting on the same key.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DocError {
    #[error("Documentation not found: {0}")]
    NotFound(String),

    #[error("Upstream registry unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Failed to parse documentation: {0}")]
    ParseError(String),

    #[error("Timed out after {0} ms waiting for upstream")]
    Timeout(u64),

    #[error("Cache storage unreadable: {0}")]
    CacheCorrupt(String),

    #[error("Invalid request: {0}")]
    InvalidKey(String),
}

/// Kind tag of a [`DocError`], as reported in protocol error payloads.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    UpstreamUnavailable,
    ParseError,
    Timeout,
    CacheCorrupt,
    InvalidKey,
}

impl DocError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DocError::NotFound(_) => ErrorKind::NotFound,
            DocError::UpstreamUnavailable(_) => ErrorKind::UpstreamUnavailable,
            DocError::ParseError(_) => ErrorKind::ParseError,
            DocError::Timeout(_) => ErrorKind::Timeout,
            DocError::CacheCorrupt(_) => ErrorKind::CacheCorrupt,
            DocError::InvalidKey(_) => ErrorKind::InvalidKey,
        }
    }
}

impl From<url::ParseError> for DocError {
    fn from(err: url::ParseError) -> Self {
        DocError::InvalidKey(format!("cannot build request URL: {err}"))
    }
}
