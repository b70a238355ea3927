//! Error taxonomy for the download engine.
//!
//! Two layers are kept apart:
//! - [`RemoteError`]: what the remote collaborator reports for a single request
//!   (status codes, transport failures, undecodable payloads).
//! - [`Error`]: what the engine reports once local retry and re-authentication
//!   policy has been applied. Every variant of [`Error`] halts the run.

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failure of a single request against the remote API.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The server rejected the session (401/403, or a redirect back to login).
    #[error("session rejected by server")]
    Unauthorized,
    /// HTTP 429; `retry_after` is taken from the `Retry-After` header when present.
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    #[error("unexpected HTTP status {0}")]
    Status(u16),
    #[error("transport error: {0}")]
    Transport(String),
    /// Body shorter or longer than the advertised `Content-Length`.
    #[error("truncated body: expected {expected} bytes, got {actual}")]
    Truncated { expected: u64, actual: u64 },
    #[error("could not decode response: {0}")]
    Decode(String),
}

impl RemoteError {
    /// Whether retrying the same request could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::RateLimited { .. }
            | RemoteError::Transport(_)
            | RemoteError::Truncated { .. } => true,
            RemoteError::Status(code) => *code >= 500,
            RemoteError::Unauthorized | RemoteError::Decode(_) => false,
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return RemoteError::Status(status.as_u16());
        }
        if e.is_decode() {
            return RemoteError::Decode(e.to_string());
        }
        RemoteError::Transport(e.to_string())
    }
}

/// Engine-level error.
#[derive(Error, Debug)]
pub enum Error {
    /// Authentication failed or the session was rejected again after a fresh login.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Listing or asset retrieval failed after the retry budget was spent.
    #[error("fetching {what} failed after {attempts} attempt(s): {source}")]
    Fetch {
        what: String,
        attempts: u32,
        #[source]
        source: RemoteError,
    },

    /// A downloaded file disagrees with its expected size, twice in a row.
    #[error("size mismatch for {}: expected {expected} bytes, got {actual}", .path.display())]
    IntegrityMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    /// Local filesystem failure; progress cannot be recorded safely.
    #[error("storage error at {}: {source}", .path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub fn storage(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Storage {
            path: path.into(),
            source,
        }
    }
}

/// Fatal error annotated with the story that was in flight when the run halted.
#[derive(Error, Debug)]
#[error("{}{source}", .story_id.as_ref().map(|id| format!("story {id}: ")).unwrap_or_default())]
pub struct RunError {
    pub story_id: Option<String>,
    #[source]
    pub source: Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(RemoteError::RateLimited { retry_after: None }.is_transient());
        assert!(RemoteError::Status(503).is_transient());
        assert!(RemoteError::Transport("reset".into()).is_transient());
        assert!(!RemoteError::Status(404).is_transient());
        assert!(!RemoteError::Unauthorized.is_transient());
        assert!(!RemoteError::Decode("bad json".into()).is_transient());
    }

    #[test]
    fn test_run_error_mentions_story() {
        let err = RunError {
            story_id: Some("42".into()),
            source: Error::Authentication("rejected".into()),
        };
        assert_eq!(err.to_string(), "story 42: authentication failed: rejected");

        let err = RunError {
            story_id: None,
            source: Error::Config("missing".into()),
        };
        assert_eq!(err.to_string(), "invalid configuration: missing");
    }
}
