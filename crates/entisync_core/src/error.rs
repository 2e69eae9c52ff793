//! Error types for the entity store.

use entisync_protocol::{ErrorKind, PatchError, VersionId};
use thiserror::Error;

/// Result type for store operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in the entity store.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    /// The requested entity does not exist.
    #[error("entity {id} not found in {entity_name}")]
    NotFound {
        /// Collection name.
        entity_name: String,
        /// Requested id.
        id: String,
    },

    /// An insert reused an existing id.
    #[error("entity {id} already exists in {entity_name}")]
    DuplicateId {
        /// Collection name.
        entity_name: String,
        /// Offending id.
        id: String,
    },

    /// The entity name is not part of the store's schema.
    #[error("unknown entity collection: {0}")]
    UnknownEntity(String),

    /// A commit's base version does not match the current version.
    #[error("stale base version for entity {id}")]
    Conflict {
        /// Entity id.
        id: String,
        /// The entity's current version on this store.
        current_version: VersionId,
    },

    /// A malformed entity document.
    #[error("invalid entity document: {0}")]
    InvalidDocument(String),

    /// A patch operation could not be applied.
    #[error("patch rejected: {0}")]
    Patch(#[from] PatchError),
}

impl CoreError {
    /// Convenience constructor for `NotFound`.
    pub fn not_found(entity_name: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_name: entity_name.into(),
            id: id.into(),
        }
    }

    /// Maps this error onto the wire taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::NotFound { .. } => ErrorKind::NotFound,
            CoreError::Conflict { .. } => ErrorKind::Conflict,
            CoreError::DuplicateId { .. }
            | CoreError::UnknownEntity(_)
            | CoreError::InvalidDocument(_)
            | CoreError::Patch(_) => ErrorKind::Validation,
        }
    }
}
