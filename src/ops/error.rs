use serde::Deserialize;
use thiserror::Error;

/// Typed failure of a single call against the hosting API.
#[derive(Debug, Error)]
pub enum RepoError {
    /// Branch, file or pull request is absent
    #[error("not found: {message}")]
    NotFound { message: String },

    /// Stale SHA, duplicate branch, empty diff, merge conflict or failed checks
    #[error("conflict (HTTP {status}): {message}")]
    Conflict { status: u16, message: String },

    /// Invalid or expired token, or missing permissions
    #[error("authorization failed (HTTP {status}): {message}")]
    Auth { status: u16, message: String },

    /// The request never produced an HTTP response
    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected HTTP {status}: {message}")]
    Unexpected { status: u16, message: String },

    /// The response arrived but its body could not be understood
    #[error("could not decode response: {0}")]
    Decode(String),
}

#[derive(Debug, Deserialize)]
struct HostError {
    message: String,
    #[serde(default)]
    #[allow(dead_code)]
    documentation_url: Option<String>,
}

impl RepoError {
    /// Map a non-2xx response onto an error kind.
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = match serde_json::from_str::<HostError>(body) {
            Ok(error) => error.message,
            Err(_) if body.trim().is_empty() => "empty response body".to_string(),
            Err(_) => body.trim().to_string(),
        };

        match status {
            401 | 403 => RepoError::Auth { status, message },
            404 => RepoError::NotFound { message },
            405 | 409 | 422 => RepoError::Conflict { status, message },
            _ => RepoError::Unexpected { status, message },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RepoError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, RepoError::Conflict { .. })
    }
}

impl From<serde_json::Error> for RepoError {
    fn from(err: serde_json::Error) -> Self {
        RepoError::Decode(err.to_string())
    }
}
