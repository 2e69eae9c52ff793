//! In-memory versioned entity store.

use crate::config::StoreConfig;
use crate::error::{CoreError, CoreResult};
use entisync_protocol::{apply_all, FindResult, PatchOp, PullOutcome, VersionId, WhereClause};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

/// One stored revision of an entity.
#[derive(Debug, Clone)]
struct VersionedRecord {
    document: Value,
    version: VersionId,
    /// Internal write counter, never exposed on the wire.
    revision: u64,
}

/// A stored entity together with its assigned version.
#[derive(Debug, Clone, PartialEq)]
pub struct Inserted {
    /// The stored document.
    pub entity: Value,
    /// The version assigned on insert.
    pub version: VersionId,
}

/// Authoritative keyed storage for typed records, versioned per record.
///
/// Every mutating operation is atomic per entity: a commit either applies
/// all of its patch operations or none, and the version identifier changes
/// exactly when the document does. The store is the sole authority for
/// version identifiers.
pub struct MemoryEntityStore {
    config: StoreConfig,
    collections: RwLock<HashMap<String, HashMap<String, VersionedRecord>>>,
}

impl MemoryEntityStore {
    /// Creates a store serving the collections declared in `config`.
    pub fn new(config: StoreConfig) -> Self {
        let collections = config
            .entity_names()
            .iter()
            .map(|name| (name.clone(), HashMap::new()))
            .collect();
        Self {
            config,
            collections: RwLock::new(collections),
        }
    }

    /// Inserts a single entity, assigning its first version.
    pub fn insert_one(&self, entity_name: &str, value: Value) -> CoreResult<Inserted> {
        self.check_entity(entity_name)?;
        let id = require_id(&value)?;

        let mut collections = self.collections.write();
        let collection = collection_mut(&mut collections, entity_name);
        if collection.contains_key(&id) {
            return Err(CoreError::DuplicateId {
                entity_name: entity_name.to_string(),
                id,
            });
        }

        let version = VersionId::fresh();
        collection.insert(
            id.clone(),
            VersionedRecord {
                document: value.clone(),
                version,
                revision: 1,
            },
        );
        debug!(entity_name, %id, %version, "inserted entity");

        Ok(Inserted {
            entity: value,
            version,
        })
    }

    /// Inserts several entities atomically.
    ///
    /// If any document is malformed or reuses an id, nothing is inserted.
    pub fn insert_multi(&self, entity_name: &str, values: Vec<Value>) -> CoreResult<Vec<Inserted>> {
        self.check_entity(entity_name)?;

        let mut ids = Vec::with_capacity(values.len());
        for value in &values {
            ids.push(require_id(value)?);
        }

        let mut collections = self.collections.write();
        let collection = collection_mut(&mut collections, entity_name);

        for id in &ids {
            if collection.contains_key(id) {
                return Err(CoreError::DuplicateId {
                    entity_name: entity_name.to_string(),
                    id: id.clone(),
                });
            }
        }
        let mut seen = std::collections::HashSet::new();
        for id in &ids {
            if !seen.insert(id) {
                return Err(CoreError::DuplicateId {
                    entity_name: entity_name.to_string(),
                    id: id.clone(),
                });
            }
        }

        let mut inserted = Vec::with_capacity(values.len());
        for (id, value) in ids.into_iter().zip(values) {
            let version = VersionId::fresh();
            collection.insert(
                id,
                VersionedRecord {
                    document: value.clone(),
                    version,
                    revision: 1,
                },
            );
            inserted.push(Inserted {
                entity: value,
                version,
            });
        }
        debug!(entity_name, count = inserted.len(), "inserted entities");

        Ok(inserted)
    }

    /// Returns entities matching the predicate, with their versions.
    pub fn find(&self, entity_name: &str, filter: &WhereClause) -> CoreResult<FindResult> {
        self.check_entity(entity_name)?;

        let collections = self.collections.read();
        let collection = collections.get(entity_name).map(HashMap::iter);

        let mut entities = Vec::new();
        let mut versions_by_id = HashMap::new();
        if let Some(records) = collection {
            for (id, record) in records {
                if filter.matches(&record.document) {
                    entities.push(record.document.clone());
                    versions_by_id.insert(id.clone(), record.version);
                }
            }
        }

        Ok(FindResult {
            entities,
            versions_by_id,
        })
    }

    /// Fetches one entity by id.
    pub fn get(&self, entity_name: &str, id: &str) -> CoreResult<(Value, VersionId)> {
        self.check_entity(entity_name)?;

        let collections = self.collections.read();
        collections
            .get(entity_name)
            .and_then(|c| c.get(id))
            .map(|record| (record.document.clone(), record.version))
            .ok_or_else(|| CoreError::not_found(entity_name, id))
    }

    /// Applies patch operations against a known base version.
    ///
    /// Fails with `Conflict` when `base_version` is not the entity's
    /// current version; the operations are not applied in that case.
    /// Application is atomic: on any patch error the stored document is
    /// unchanged and the version identifier is not advanced.
    pub fn commit(
        &self,
        entity_name: &str,
        id: &str,
        base_version: VersionId,
        ops: &[PatchOp],
    ) -> CoreResult<(Value, VersionId)> {
        self.check_entity(entity_name)?;

        let mut collections = self.collections.write();
        let record = collections
            .get_mut(entity_name)
            .and_then(|c| c.get_mut(id))
            .ok_or_else(|| CoreError::not_found(entity_name, id))?;

        if record.version != base_version {
            debug!(entity_name, %id, "commit rejected: stale base version");
            return Err(CoreError::Conflict {
                id: id.to_string(),
                current_version: record.version,
            });
        }

        // Apply against a copy so a mid-sequence failure is not observable.
        let mut updated = record.document.clone();
        apply_all(ops, &mut updated)?;

        if current_id(&updated) != Some(id) {
            return Err(CoreError::InvalidDocument(
                "patch may not change the id field".into(),
            ));
        }

        let version = VersionId::fresh();
        record.document = updated.clone();
        record.version = version;
        record.revision += 1;
        debug!(entity_name, %id, %version, ops = ops.len(), "committed patch");

        Ok((updated, version))
    }

    /// Fetches an entity unless the caller's version is already current.
    pub fn pull(
        &self,
        entity_name: &str,
        id: &str,
        version: Option<VersionId>,
    ) -> CoreResult<PullOutcome> {
        self.check_entity(entity_name)?;

        let collections = self.collections.read();
        let record = collections
            .get(entity_name)
            .and_then(|c| c.get(id))
            .ok_or_else(|| CoreError::not_found(entity_name, id))?;

        if version == Some(record.version) {
            return Ok(PullOutcome::NotModified);
        }

        Ok(PullOutcome::Entity {
            entity: record.document.clone(),
            version: record.version,
        })
    }

    /// Removes an entity.
    pub fn delete(&self, entity_name: &str, id: &str) -> CoreResult<()> {
        self.check_entity(entity_name)?;

        let mut collections = self.collections.write();
        let removed = collections
            .get_mut(entity_name)
            .and_then(|c| c.remove(id));
        match removed {
            Some(_) => {
                debug!(entity_name, %id, "deleted entity");
                Ok(())
            }
            None => Err(CoreError::not_found(entity_name, id)),
        }
    }

    /// Returns the number of entities in a collection.
    pub fn count(&self, entity_name: &str) -> CoreResult<usize> {
        self.check_entity(entity_name)?;
        Ok(self
            .collections
            .read()
            .get(entity_name)
            .map_or(0, HashMap::len))
    }

    /// Returns the store's schema.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    #[cfg(test)]
    fn revision(&self, entity_name: &str, id: &str) -> Option<u64> {
        self.collections
            .read()
            .get(entity_name)
            .and_then(|c| c.get(id))
            .map(|r| r.revision)
    }

    fn check_entity(&self, entity_name: &str) -> CoreResult<()> {
        if self.config.allows(entity_name) {
            Ok(())
        } else {
            Err(CoreError::UnknownEntity(entity_name.to_string()))
        }
    }
}

impl std::fmt::Debug for MemoryEntityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let collections = self.collections.read();
        let counts: HashMap<&str, usize> = collections
            .iter()
            .map(|(name, c)| (name.as_str(), c.len()))
            .collect();
        f.debug_struct("MemoryEntityStore")
            .field("collections", &counts)
            .finish()
    }
}

fn collection_mut<'a>(
    collections: &'a mut HashMap<String, HashMap<String, VersionedRecord>>,
    entity_name: &str,
) -> &'a mut HashMap<String, VersionedRecord> {
    collections.entry(entity_name.to_string()).or_default()
}

fn current_id(value: &Value) -> Option<&str> {
    value.get("id").and_then(Value::as_str)
}

fn require_id(value: &Value) -> CoreResult<String> {
    if !value.is_object() {
        return Err(CoreError::InvalidDocument(
            "entity must be a JSON object".into(),
        ));
    }
    match current_id(value) {
        Some(id) if !id.is_empty() => Ok(id.to_string()),
        Some(_) => Err(CoreError::InvalidDocument("id must be non-empty".into())),
        None => Err(CoreError::InvalidDocument(
            "entity must carry a string id".into(),
        )),
    }
}
