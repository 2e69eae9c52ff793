//! Typed wrapper over one entity collection.

use crate::error::{CoreError, CoreResult};
use crate::store::MemoryEntityStore;
use entisync_protocol::{PatchOp, VersionId, WhereClause};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;

/// A typed handle to one collection of a store.
///
/// Instead of resolving behavior dynamically by entity-name string, each
/// concrete entity type gets its own handle; documents are encoded and
/// decoded at the boundary and decode failures surface as validation
/// errors.
pub struct TypedCollection<E> {
    store: Arc<MemoryEntityStore>,
    entity_name: String,
    _marker: PhantomData<fn() -> E>,
}

impl<E> TypedCollection<E>
where
    E: Serialize + DeserializeOwned,
{
    /// Creates a typed handle for `entity_name`.
    pub fn new(store: Arc<MemoryEntityStore>, entity_name: impl Into<String>) -> Self {
        Self {
            store,
            entity_name: entity_name.into(),
            _marker: PhantomData,
        }
    }

    /// Returns the collection name this handle serves.
    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    /// Inserts a typed entity.
    pub fn insert(&self, entity: &E) -> CoreResult<(E, VersionId)> {
        let value = encode(entity)?;
        let inserted = self.store.insert_one(&self.entity_name, value)?;
        Ok((decode(inserted.entity)?, inserted.version))
    }

    /// Fetches a typed entity by id.
    pub fn get(&self, id: &str) -> CoreResult<(E, VersionId)> {
        let (value, version) = self.store.get(&self.entity_name, id)?;
        Ok((decode(value)?, version))
    }

    /// Finds typed entities matching the predicate.
    pub fn find(&self, filter: &WhereClause) -> CoreResult<Vec<(E, VersionId)>> {
        let result = self.store.find(&self.entity_name, filter)?;
        let mut typed = Vec::with_capacity(result.entities.len());
        for entity in result.entities {
            let id = entity
                .get("id")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_string();
            let version = result
                .versions_by_id
                .get(&id)
                .copied()
                .ok_or_else(|| CoreError::not_found(&self.entity_name, &id))?;
            typed.push((decode(entity)?, version));
        }
        Ok(typed)
    }

    /// Commits patch operations against a typed entity.
    pub fn commit(
        &self,
        id: &str,
        base_version: VersionId,
        ops: &[PatchOp],
    ) -> CoreResult<(E, VersionId)> {
        let (value, version) = self.store.commit(&self.entity_name, id, base_version, ops)?;
        Ok((decode(value)?, version))
    }

    /// Deletes an entity.
    pub fn delete(&self, id: &str) -> CoreResult<()> {
        self.store.delete(&self.entity_name, id)
    }
}

fn encode<E: Serialize>(entity: &E) -> CoreResult<serde_json::Value> {
    serde_json::to_value(entity).map_err(|e| CoreError::InvalidDocument(e.to_string()))
}

fn decode<E: DeserializeOwned>(value: serde_json::Value) -> CoreResult<E> {
    serde_json::from_value(value).map_err(|e| CoreError::InvalidDocument(e.to_string()))
}
