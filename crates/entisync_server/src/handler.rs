//! Request dispatch to the entity store.

use entisync_core::{CoreError, MemoryEntityStore};
use entisync_protocol::{CommitAck, RequestBody, RequestKind, ResponseBody};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Translates request bodies into entity store operations.
///
/// Dispatch is exhaustive over the request kinds; every store error maps
/// to a structured error body with the matching wire error kind. The
/// session token, if present, is ignored here: the dispatch layer carries
/// it but never interprets it.
pub struct RequestHandler {
    store: Arc<MemoryEntityStore>,
}

impl RequestHandler {
    /// Creates a handler over the given store.
    pub fn new(store: Arc<MemoryEntityStore>) -> Self {
        Self { store }
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &Arc<MemoryEntityStore> {
        &self.store
    }

    /// Handles one request, returning the response body.
    pub fn handle(&self, request: RequestBody) -> ResponseBody {
        let entity_name = request.entity_name;
        debug!(%entity_name, "dispatching request");

        let result = match request.kind {
            RequestKind::InsertOne { value } => self
                .store
                .insert_one(&entity_name, value)
                .map(|inserted| ResponseBody::Inserted {
                    entity: inserted.entity,
                    version: inserted.version,
                }),
            RequestKind::InsertMulti { values } => {
                self.store
                    .insert_multi(&entity_name, values)
                    .map(|inserted| {
                        let mut entities = Vec::with_capacity(inserted.len());
                        let mut versions_by_id = HashMap::new();
                        for item in inserted {
                            if let Some(id) =
                                item.entity.get("id").and_then(serde_json::Value::as_str)
                            {
                                versions_by_id.insert(id.to_string(), item.version);
                            }
                            entities.push(item.entity);
                        }
                        ResponseBody::InsertedMulti {
                            entities,
                            versions_by_id,
                        }
                    })
            }
            RequestKind::Find { filter } => self
                .store
                .find(&entity_name, &filter)
                .map(ResponseBody::Found),
            RequestKind::Get { id } => self
                .store
                .get(&entity_name, &id)
                .map(|(entity, version)| ResponseBody::Got { entity, version }),
            RequestKind::Commit {
                id,
                base_version,
                ops,
            } => self
                .store
                .commit(&entity_name, &id, base_version, &ops)
                .map(|(_, version)| ResponseBody::Committed(CommitAck { id, version })),
            RequestKind::Pull { id, version } => self
                .store
                .pull(&entity_name, &id, version)
                .map(ResponseBody::Pulled),
            RequestKind::Delete { id } => self
                .store
                .delete(&entity_name, &id)
                .map(|()| ResponseBody::Deleted { id }),
        };

        result.unwrap_or_else(error_response)
    }
}

fn error_response(err: CoreError) -> ResponseBody {
    match &err {
        // Conflicts carry the current version so clients can reconcile
        // without an extra round-trip.
        CoreError::Conflict {
            current_version, ..
        } => ResponseBody::conflict(err.to_string(), *current_version),
        _ => ResponseBody::error(err.kind(), err.to_string()),
    }
}
