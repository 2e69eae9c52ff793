//! Error types for the REST server.

use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur while hosting the REST endpoint.
///
/// Store-level failures (not-found, conflict, validation) never appear
/// here: they travel in-band as structured error bodies.
#[derive(Error, Debug)]
pub enum ServerError {
    /// The HTTP request could not be parsed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The request body exceeded the configured limit.
    #[error("request body too large: {size} > {limit}")]
    BodyTooLarge {
        /// Received size in bytes.
        size: usize,
        /// Configured limit in bytes.
        limit: usize,
    },

    /// Response serialization failed.
    #[error("failed to encode response: {0}")]
    Encode(#[from] serde_json::Error),

    /// I/O error on the listener or a connection.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Returns true if this is the client's fault (maps to 4xx).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServerError::InvalidRequest(_) | ServerError::BodyTooLarge { .. }
        )
    }
}
