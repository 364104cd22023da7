//! Error type shared by the orchestrator modules.

use thiserror::Error;

/// Errors raised while composing, streaming, resolving or persisting a run.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The request could not be sent or the body could not be read.
    #[error("transport error: {0}")]
    Transport(String),
    /// The provider answered with a non-success status.
    #[error("completion endpoint returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Provider error message, or the raw body.
        body: String,
    },
    /// A payload did not parse.
    #[error("decode error: {0}")]
    Decode(String),
    /// The run was aborted.
    #[error("operation cancelled")]
    Cancelled,
    /// The storage collaborator failed.
    #[error("persistence error: {0}")]
    Persistence(String),
    /// An image could not be fetched or decoded.
    #[error("image error: {0}")]
    Image(String),
    /// Settings are missing or invalid.
    #[error("configuration error: {0}")]
    Config(String),
    /// A session, message or model is unknown.
    #[error("{0} not found")]
    NotFound(String),
    /// A run with the same key is still streaming.
    #[error("run already active: {0}")]
    RunActive(String),
}

impl OrchestratorError {
    /// `true` for failures that originate from cancellation rather than the provider.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<reqwest::Error> for OrchestratorError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => Self::Status {
                status: status.as_u16(),
                body: err.to_string(),
            },
            None => Self::Transport(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

impl From<image::ImageError> for OrchestratorError {
    fn from(err: image::ImageError) -> Self {
        Self::Image(err.to_string())
    }
}

/// Result alias used throughout the crate.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = OrchestratorError::Status {
            status: 429,
            body: "rate limited".into(),
        };
        assert_eq!(err.to_string(), "completion endpoint returned 429: rate limited");
        assert!(OrchestratorError::Cancelled.is_cancelled());
        assert!(!OrchestratorError::Decode("x".into()).is_cancelled());
    }

    #[test]
    fn test_from_serde_error() {
        let err: OrchestratorError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(matches!(err, OrchestratorError::Decode(_)));
    }
}
