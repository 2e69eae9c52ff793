//! Wire error kinds and patch application errors.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for patch application.
pub type PatchResult<T> = Result<T, PatchError>;

/// Error taxonomy carried on the wire.
///
/// `Transport` failures never appear here: they are a client-side concern
/// and never originate from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Requested entity id does not exist.
    NotFound,
    /// A commit's base version is stale.
    Conflict,
    /// Malformed entity, patch operation, or request.
    Validation,
    /// Unexpected server-side failure.
    Internal,
}

impl ErrorKind {
    /// Returns true if the error is the caller's fault.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ErrorKind::NotFound | ErrorKind::Conflict | ErrorKind::Validation
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Validation => "validation",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Errors raised while parsing or applying a patch operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PatchError {
    /// The path string could not be parsed.
    #[error("invalid patch path: {0}")]
    InvalidPath(String),

    /// The path does not resolve inside the target document.
    #[error("path {0} does not resolve in target document")]
    Unresolvable(String),

    /// The value at the path has the wrong shape for the operation.
    #[error("type mismatch at {path}: expected {expected}")]
    TypeMismatch {
        /// The offending path.
        path: String,
        /// What the operation required there.
        expected: &'static str,
    },

    /// The target is not a JSON object.
    #[error("entity document must be a JSON object")]
    NotAnObject,

    /// The operation would mutate the immutable `id` field.
    #[error("the id field is immutable")]
    IdImmutable,
}
