//! Error types for the client sync layer.

use entisync_protocol::{ErrorBody, ErrorKind, PatchError, VersionId};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in the client sync layer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// Network or transport failure.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The server reported the entity does not exist.
    #[error("entity {id} not found in {entity_name}")]
    NotFound {
        /// Collection name.
        entity_name: String,
        /// Requested id.
        id: String,
    },

    /// A commit was rejected because its base version is stale.
    ///
    /// Raised by the transport layer; the controller normally consumes
    /// this internally to drive reconciliation.
    #[error("commit conflicted with a newer server version")]
    Conflict {
        /// The server's current version, when reported.
        current_version: Option<VersionId>,
    },

    /// Reconciliation conflicted repeatedly and gave up.
    ///
    /// The offending record is retained in the operation log, flagged
    /// for manual retry.
    #[error("reconciliation for entity {id} gave up after {attempts} attempts")]
    ReconcileExhausted {
        /// Collection name.
        entity_name: String,
        /// Entity id.
        id: String,
        /// Attempts made.
        attempts: u32,
    },

    /// Malformed entity or patch operation; fails fast, never enqueued.
    #[error("validation error: {0}")]
    Validation(String),

    /// A patch operation could not be applied locally.
    #[error("patch rejected: {0}")]
    Patch(#[from] PatchError),

    /// The entity is not being followed by this controller.
    #[error("entity {id} in {entity_name} is not followed")]
    NotFollowed {
        /// Collection name.
        entity_name: String,
        /// Entity id.
        id: String,
    },

    /// The server returned something the client cannot interpret.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server failed internally.
    #[error("server error: {0}")]
    Server(String),

    /// The transport is not connected.
    #[error("not connected to server")]
    NotConnected,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    ///
    /// Only applies to idempotent reads: the controller never silently
    /// retries a commit, retryable or not.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Server(_) => true,
            _ => false,
        }
    }

    /// Maps a wire error body onto the client taxonomy.
    pub fn from_wire(body: &ErrorBody, entity_name: &str, id: &str) -> Self {
        match body.kind {
            ErrorKind::NotFound => SyncError::NotFound {
                entity_name: entity_name.to_string(),
                id: id.to_string(),
            },
            ErrorKind::Conflict => SyncError::Conflict {
                current_version: body.current_version,
            },
            ErrorKind::Validation => SyncError::Validation(body.message.clone()),
            ErrorKind::Internal => SyncError::Server(body.message.clone()),
        }
    }
}
