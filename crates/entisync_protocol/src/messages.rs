//! Request and response bodies for the REST boundary.

use crate::error::ErrorKind;
use crate::operation::PatchOp;
use crate::query::WhereClause;
use crate::version::VersionId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Opaque session or credential handle.
///
/// Carried through requests untouched; the sync layer never interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionToken(String);

impl SessionToken {
    /// Wraps a raw token string.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Returns the raw token.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A request against one entity collection.
///
/// Wire shape: `{ entity_name, kind, payload }` plus an optional session
/// token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestBody {
    /// Name of the target entity collection.
    pub entity_name: String,
    /// Opaque session handle, passed through uninterpreted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionToken>,
    /// The operation to perform.
    #[serde(flatten)]
    pub kind: RequestKind,
}

impl RequestBody {
    /// Builds an insert-one request.
    pub fn insert_one(entity_name: impl Into<String>, value: Value) -> Self {
        Self {
            entity_name: entity_name.into(),
            session: None,
            kind: RequestKind::InsertOne { value },
        }
    }

    /// Builds an insert-multi request.
    pub fn insert_multi(entity_name: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            entity_name: entity_name.into(),
            session: None,
            kind: RequestKind::InsertMulti { values },
        }
    }

    /// Builds a find request.
    pub fn find(entity_name: impl Into<String>, filter: WhereClause) -> Self {
        Self {
            entity_name: entity_name.into(),
            session: None,
            kind: RequestKind::Find { filter },
        }
    }

    /// Builds a get request.
    pub fn get(entity_name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            entity_name: entity_name.into(),
            session: None,
            kind: RequestKind::Get { id: id.into() },
        }
    }

    /// Builds a commit request.
    pub fn commit(
        entity_name: impl Into<String>,
        id: impl Into<String>,
        base_version: VersionId,
        ops: Vec<PatchOp>,
    ) -> Self {
        Self {
            entity_name: entity_name.into(),
            session: None,
            kind: RequestKind::Commit {
                id: id.into(),
                base_version,
                ops,
            },
        }
    }

    /// Builds a pull request.
    pub fn pull(
        entity_name: impl Into<String>,
        id: impl Into<String>,
        version: Option<VersionId>,
    ) -> Self {
        Self {
            entity_name: entity_name.into(),
            session: None,
            kind: RequestKind::Pull {
                id: id.into(),
                version,
            },
        }
    }

    /// Builds a delete request.
    pub fn delete(entity_name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            entity_name: entity_name.into(),
            session: None,
            kind: RequestKind::Delete { id: id.into() },
        }
    }

    /// Attaches a session token.
    #[must_use]
    pub fn with_session(mut self, session: SessionToken) -> Self {
        self.session = Some(session);
        self
    }

    /// Returns true if the request is an idempotent read.
    ///
    /// Idempotent reads may be retried by transports; mutations must not.
    pub fn is_idempotent_read(&self) -> bool {
        matches!(
            self.kind,
            RequestKind::Find { .. } | RequestKind::Get { .. } | RequestKind::Pull { .. }
        )
    }
}

/// The operation kind and payload of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum RequestKind {
    /// Inserts a single entity.
    InsertOne {
        /// Entity document (must carry a string `id`).
        value: Value,
    },
    /// Inserts several entities atomically.
    InsertMulti {
        /// Entity documents.
        values: Vec<Value>,
    },
    /// Finds entities matching a predicate.
    Find {
        /// Structural predicate.
        filter: WhereClause,
    },
    /// Fetches one entity by id.
    Get {
        /// Entity id.
        id: String,
    },
    /// Commits patch operations against a known base version.
    Commit {
        /// Entity id.
        id: String,
        /// The version the operations were computed against.
        base_version: VersionId,
        /// Patch operations, applied atomically in order.
        ops: Vec<PatchOp>,
    },
    /// Fetches an entity unless the caller is already current.
    Pull {
        /// Entity id.
        id: String,
        /// The caller's last-known version, if any.
        version: Option<VersionId>,
    },
    /// Deletes an entity.
    Delete {
        /// Entity id.
        id: String,
    },
}

/// A response body, either a typed result or an in-band error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum ResponseBody {
    /// A single entity was inserted.
    Inserted {
        /// The stored entity.
        entity: Value,
        /// Its first version.
        version: VersionId,
    },
    /// Several entities were inserted.
    InsertedMulti {
        /// The stored entities, in request order.
        entities: Vec<Value>,
        /// Version identifiers keyed by entity id.
        versions_by_id: HashMap<String, VersionId>,
    },
    /// Result of a find.
    Found(FindResult),
    /// Result of a get.
    Got {
        /// The entity.
        entity: Value,
        /// Its current version.
        version: VersionId,
    },
    /// A commit was accepted.
    Committed(CommitAck),
    /// Result of a pull.
    Pulled(PullOutcome),
    /// An entity was deleted.
    Deleted {
        /// The removed entity id.
        id: String,
    },
    /// The request failed.
    Error(ErrorBody),
}

impl ResponseBody {
    /// Builds an error response.
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error(ErrorBody {
            kind,
            message: message.into(),
            current_version: None,
        })
    }

    /// Builds a conflict error carrying the entity's current version.
    pub fn conflict(message: impl Into<String>, current_version: VersionId) -> Self {
        Self::Error(ErrorBody {
            kind: ErrorKind::Conflict,
            message: message.into(),
            current_version: Some(current_version),
        })
    }

    /// Returns the error body if this response is an error.
    pub fn as_error(&self) -> Option<&ErrorBody> {
        match self {
            ResponseBody::Error(body) => Some(body),
            _ => None,
        }
    }
}

/// Entities matched by a find, with their versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindResult {
    /// Matching entity documents.
    pub entities: Vec<Value>,
    /// Version identifiers keyed by entity id.
    pub versions_by_id: HashMap<String, VersionId>,
}

/// Acknowledgment of a committed operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitAck {
    /// The committed entity id.
    pub id: String,
    /// The version assigned by this commit.
    pub version: VersionId,
}

/// Outcome of a pull.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PullOutcome {
    /// The entity changed since the caller's version.
    Entity {
        /// The current entity document.
        entity: Value,
        /// Its current version.
        version: VersionId,
    },
    /// The caller is already current; no payload transferred.
    NotModified,
}

/// A structured wire error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Error classification.
    pub kind: ErrorKind,
    /// Human-readable detail.
    pub message: String,
    /// For conflicts, the entity's current version on the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_version: Option<VersionId>,
}
