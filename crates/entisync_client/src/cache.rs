//! Client-side mirror of followed entities.

use crate::error::{SyncError, SyncResult};
use entisync_protocol::{apply_all, PatchOp, VersionId};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;

/// One cached entity.
#[derive(Debug, Clone)]
struct CachedEntity {
    /// UI-facing snapshot, including optimistic patches.
    snapshot: Value,
    /// Last server-acknowledged document.
    acked_document: Value,
    /// Version of the last acknowledged document.
    acked_version: VersionId,
}

/// Local cache of followed entities.
///
/// The snapshot visible through `get` includes optimistic patches applied
/// before server acknowledgment. The stored version always reflects the
/// last *acknowledged* state: optimistic changes are tracked by the
/// operation log, never by touching the version. Snapshots are only
/// replaced by a server acknowledgment, a pull, or an optimistic patch —
/// never silently dropped.
#[derive(Debug, Default)]
pub struct LocalCache {
    entities: RwLock<HashMap<String, HashMap<String, CachedEntity>>>,
}

impl LocalCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the optimistic snapshot for an entity.
    pub fn get(&self, entity_name: &str, id: &str) -> Option<Value> {
        self.entities
            .read()
            .get(entity_name)
            .and_then(|c| c.get(id))
            .map(|e| e.snapshot.clone())
    }

    /// Returns the last acknowledged version for an entity.
    pub fn version(&self, entity_name: &str, id: &str) -> Option<VersionId> {
        self.entities
            .read()
            .get(entity_name)
            .and_then(|c| c.get(id))
            .map(|e| e.acked_version)
    }

    /// Returns the last acknowledged document and version.
    pub fn acknowledged(&self, entity_name: &str, id: &str) -> Option<(Value, VersionId)> {
        self.entities
            .read()
            .get(entity_name)
            .and_then(|c| c.get(id))
            .map(|e| (e.acked_document.clone(), e.acked_version))
    }

    /// Returns true if the entity is cached.
    pub fn contains(&self, entity_name: &str, id: &str) -> bool {
        self.entities
            .read()
            .get(entity_name)
            .is_some_and(|c| c.contains_key(id))
    }

    /// Stores a server-confirmed snapshot.
    ///
    /// Resets the optimistic snapshot to the confirmed document; callers
    /// with pending operations should use `rebase` instead.
    pub fn put(&self, entity_name: &str, id: &str, entity: Value, version: VersionId) {
        let mut entities = self.entities.write();
        entities.entry(entity_name.to_string()).or_default().insert(
            id.to_string(),
            CachedEntity {
                snapshot: entity.clone(),
                acked_document: entity,
                acked_version: version,
            },
        );
    }

    /// Applies patch operations to the optimistic snapshot only.
    ///
    /// The acknowledged document and version are untouched.
    pub fn apply_optimistic(
        &self,
        entity_name: &str,
        id: &str,
        ops: &[PatchOp],
    ) -> SyncResult<()> {
        let mut entities = self.entities.write();
        let entry = entities
            .get_mut(entity_name)
            .and_then(|c| c.get_mut(id))
            .ok_or_else(|| SyncError::NotFollowed {
                entity_name: entity_name.to_string(),
                id: id.to_string(),
            })?;

        // Validate against a copy so a mid-sequence failure leaves the
        // snapshot unchanged.
        let mut updated = entry.snapshot.clone();
        apply_all(ops, &mut updated)?;
        entry.snapshot = updated;
        Ok(())
    }

    /// Advances the acknowledged state after a commit acknowledgment.
    ///
    /// The acknowledged ops were already reflected in the snapshot
    /// optimistically, so only the acknowledged document and version move.
    pub fn acknowledge(
        &self,
        entity_name: &str,
        id: &str,
        ops: &[PatchOp],
        version: VersionId,
    ) -> SyncResult<()> {
        let mut entities = self.entities.write();
        let entry = entities
            .get_mut(entity_name)
            .and_then(|c| c.get_mut(id))
            .ok_or_else(|| SyncError::NotFollowed {
                entity_name: entity_name.to_string(),
                id: id.to_string(),
            })?;

        let mut updated = entry.acked_document.clone();
        apply_all(ops, &mut updated)?;
        entry.acked_document = updated;
        entry.acked_version = version;
        Ok(())
    }

    /// Rebases an entity on fresh server state, replaying pending ops.
    ///
    /// Used during reconciliation and by pulls racing pending commits:
    /// the acknowledged state becomes the server document, and the
    /// optimistic snapshot becomes the server document with the still
    /// pending operations replayed on top, in the order given.
    pub fn rebase(
        &self,
        entity_name: &str,
        id: &str,
        server_document: Value,
        version: VersionId,
        pending_ops: &[PatchOp],
    ) -> SyncResult<()> {
        let mut snapshot = server_document.clone();
        apply_all(pending_ops, &mut snapshot)?;

        let mut entities = self.entities.write();
        entities.entry(entity_name.to_string()).or_default().insert(
            id.to_string(),
            CachedEntity {
                snapshot,
                acked_document: server_document,
                acked_version: version,
            },
        );
        Ok(())
    }

    /// Removes an entity from the cache.
    pub fn remove(&self, entity_name: &str, id: &str) -> bool {
        self.entities
            .write()
            .get_mut(entity_name)
            .and_then(|c| c.remove(id))
            .is_some()
    }

    /// Returns every cached snapshot, keyed by entity name and id.
    ///
    /// This is the UI-facing view of local state.
    pub fn snapshot_state(&self) -> HashMap<String, HashMap<String, Value>> {
        self.entities
            .read()
            .iter()
            .map(|(name, collection)| {
                let snapshots = collection
                    .iter()
                    .map(|(id, e)| (id.clone(), e.snapshot.clone()))
                    .collect();
                (name.clone(), snapshots)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn seeded() -> (LocalCache, VersionId) {
        let cache = LocalCache::new();
        let version = VersionId::fresh();
        cache.put(
            "person",
            "PID-1",
            json!({ "id": "PID-1", "name": "a" }),
            version,
        );
        (cache, version)
    }

    #[test]
    fn put_and_get() {
        let (cache, version) = seeded();
        assert_eq!(
            cache.get("person", "PID-1").unwrap()["name"],
            json!("a")
        );
        assert_eq!(cache.version("person", "PID-1"), Some(version));
        assert!(cache.contains("person", "PID-1"));
        assert!(!cache.contains("person", "PID-2"));
    }

    #[test]
    fn optimistic_apply_keeps_acked_version() {
        let (cache, version) = seeded();
        let ops = vec![PatchOp::set("name", json!("b")).unwrap()];
        cache.apply_optimistic("person", "PID-1", &ops).unwrap();

        // Snapshot moved, acknowledged state did not.
        assert_eq!(cache.get("person", "PID-1").unwrap()["name"], json!("b"));
        let (acked, acked_version) = cache.acknowledged("person", "PID-1").unwrap();
        assert_eq!(acked["name"], json!("a"));
        assert_eq!(acked_version, version);
    }

    #[test]
    fn optimistic_apply_is_atomic() {
        let (cache, _) = seeded();
        let ops = vec![
            PatchOp::set("name", json!("b")).unwrap(),
            PatchOp::push("name", json!("x")).unwrap(), // fails: not a list
        ];
        assert!(cache.apply_optimistic("person", "PID-1", &ops).is_err());
        assert_eq!(cache.get("person", "PID-1").unwrap()["name"], json!("a"));
    }

    #[test]
    fn optimistic_apply_requires_followed_entity() {
        let cache = LocalCache::new();
        let ops = vec![PatchOp::set("name", json!("b")).unwrap()];
        assert!(matches!(
            cache.apply_optimistic("person", "PID-1", &ops),
            Err(SyncError::NotFollowed { .. })
        ));
    }

    #[test]
    fn acknowledge_advances_acked_state() {
        let (cache, _) = seeded();
        let ops = vec![PatchOp::set("name", json!("b")).unwrap()];
        cache.apply_optimistic("person", "PID-1", &ops).unwrap();

        let v2 = VersionId::fresh();
        cache.acknowledge("person", "PID-1", &ops, v2).unwrap();

        let (acked, acked_version) = cache.acknowledged("person", "PID-1").unwrap();
        assert_eq!(acked["name"], json!("b"));
        assert_eq!(acked_version, v2);
        // Snapshot and acknowledged state converge once acked.
        assert_eq!(cache.get("person", "PID-1").unwrap(), acked);
    }

    #[test]
    fn rebase_replays_pending_ops() {
        let (cache, _) = seeded();

        // Server moved on: someone else renamed the entity.
        let server_doc = json!({ "id": "PID-1", "name": "z", "tags": [] });
        let v2 = VersionId::fresh();
        let pending = vec![PatchOp::push("tags", json!("local")).unwrap()];

        cache
            .rebase("person", "PID-1", server_doc.clone(), v2, &pending)
            .unwrap();

        let snapshot = cache.get("person", "PID-1").unwrap();
        assert_eq!(snapshot["name"], json!("z"));
        assert_eq!(snapshot["tags"], json!(["local"]));

        let (acked, acked_version) = cache.acknowledged("person", "PID-1").unwrap();
        assert_eq!(acked, server_doc);
        assert_eq!(acked_version, v2);
    }

    #[test]
    fn remove_entity() {
        let (cache, _) = seeded();
        assert!(cache.remove("person", "PID-1"));
        assert!(!cache.remove("person", "PID-1"));
        assert!(cache.get("person", "PID-1").is_none());
    }

    #[test]
    fn snapshot_state_lists_everything() {
        let (cache, _) = seeded();
        cache.put(
            "task",
            "TID-1",
            json!({ "id": "TID-1", "name": "hands-on" }),
            VersionId::fresh(),
        );

        let state = cache.snapshot_state();
        assert_eq!(state.len(), 2);
        assert!(state["person"].contains_key("PID-1"));
        assert!(state["task"].contains_key("TID-1"));
    }
}
