//! Sync controller: commit/push/pull coordination.

use crate::cache::LocalCache;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::oplog::{OperationLog, PendingRecord, RecordState};
use crate::transport::Transport;
use entisync_protocol::{
    ErrorKind, PatchOp, PullOutcome, RequestBody, ResponseBody, VersionId, WhereClause,
};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Sync state of one followed entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntitySyncState {
    /// No unacknowledged operations.
    Synced,
    /// Operations are committed locally but not yet acknowledged.
    Pending,
    /// A rejected commit is being reconciled against fresh server state.
    Reconciling,
}

impl EntitySyncState {
    /// Returns true if every local operation has been acknowledged.
    pub fn is_settled(&self) -> bool {
        matches!(self, EntitySyncState::Synced)
    }
}

/// Result of a successful `commit_and_push`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOutcome {
    /// The acknowledged version after the push.
    pub version: VersionId,
    /// True if the push conflicted and was reconciled before succeeding.
    pub reconciled: bool,
}

/// Counters over the controller's lifetime.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Commits acknowledged by the server.
    pub commits_pushed: u64,
    /// Explicit pulls completed.
    pub pulls: u64,
    /// Conflicts resolved by reconciliation.
    pub conflicts_reconciled: u64,
    /// Reconciliations that gave up.
    pub reconciliations_exhausted: u64,
    /// Reads served from the cache after transport failure.
    pub reads_degraded: u64,
    /// Read retries performed.
    pub retries: u64,
    /// Last error message.
    pub last_error: Option<String>,
}

type EntityKey = (String, String);

/// Coordinates a local cache and operation log against one server.
///
/// Commits against the same entity id are serialized and pushed in FIFO
/// order; different ids proceed independently. Reads are never
/// serialized against commits: a pull that rebases cached state bumps
/// the entity's epoch, and an in-flight commit whose epoch was
/// superseded refreshes from the server instead of applying its stale
/// acknowledgment.
pub struct SyncController<T: Transport> {
    config: SyncConfig,
    transport: Arc<T>,
    cache: LocalCache,
    oplog: OperationLog,
    inflight: Mutex<HashMap<EntityKey, Arc<Mutex<()>>>>,
    epochs: RwLock<HashMap<EntityKey, u64>>,
    states: RwLock<HashMap<EntityKey, EntitySyncState>>,
    stats: RwLock<SyncStats>,
}

impl<T: Transport> SyncController<T> {
    /// Creates a controller over the given transport.
    pub fn new(config: SyncConfig, transport: T) -> Self {
        Self {
            config,
            transport: Arc::new(transport),
            cache: LocalCache::new(),
            oplog: OperationLog::new(),
            inflight: Mutex::new(HashMap::new()),
            epochs: RwLock::new(HashMap::new()),
            states: RwLock::new(HashMap::new()),
            stats: RwLock::new(SyncStats::default()),
        }
    }

    /// Returns the local cache.
    pub fn cache(&self) -> &LocalCache {
        &self.cache
    }

    /// Returns the transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Returns the sync state for an entity, if it is followed.
    pub fn state(&self, entity_name: &str, id: &str) -> Option<EntitySyncState> {
        self.states.read().get(&key(entity_name, id)).copied()
    }

    /// Returns a snapshot of the controller's counters.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Returns the number of unacknowledged records.
    pub fn pending_count(&self) -> usize {
        self.oplog.len()
    }

    /// Returns records whose reconciliation gave up, oldest first.
    pub fn conflicted_records(&self) -> Vec<PendingRecord> {
        self.oplog.conflicted()
    }

    /// Returns every cached snapshot, keyed by entity name and id.
    pub fn local_state(&self) -> HashMap<String, HashMap<String, Value>> {
        self.cache.snapshot_state()
    }

    /// Fetches an entity and starts following it.
    pub fn follow(&self, entity_name: &str, id: &str) -> SyncResult<Value> {
        let request = self.with_session(RequestBody::get(entity_name, id));
        match self.send_read(&request)? {
            ResponseBody::Got { entity, version } => {
                self.cache.put(entity_name, id, entity.clone(), version);
                self.set_state(entity_name, id, EntitySyncState::Synced);
                debug!(entity_name, id, "following entity");
                Ok(entity)
            }
            ResponseBody::Error(body) => Err(SyncError::from_wire(&body, entity_name, id)),
            other => Err(unexpected(&other)),
        }
    }

    /// Finds matching entities and follows all of them.
    pub fn find_and_follow(
        &self,
        entity_name: &str,
        filter: WhereClause,
    ) -> SyncResult<Vec<Value>> {
        let request = self.with_session(RequestBody::find(entity_name, filter));
        match self.send_read(&request)? {
            ResponseBody::Found(result) => {
                for entity in &result.entities {
                    let id = document_id(entity)?;
                    let version = result.versions_by_id.get(id).copied().ok_or_else(|| {
                        SyncError::Protocol(format!("find result missing version for {id}"))
                    })?;
                    self.cache.put(entity_name, id, entity.clone(), version);
                    self.set_state(entity_name, id, EntitySyncState::Synced);
                }
                debug!(entity_name, count = result.entities.len(), "following entities");
                Ok(result.entities)
            }
            ResponseBody::Error(body) => Err(SyncError::from_wire(&body, entity_name, "")),
            other => Err(unexpected(&other)),
        }
    }

    /// Inserts a new entity on the server and follows it.
    ///
    /// Inserts are writes and are never silently retried.
    pub fn insert_and_follow(&self, entity_name: &str, value: Value) -> SyncResult<VersionId> {
        let id = document_id(&value)?.to_string();
        let request = self.with_session(RequestBody::insert_one(entity_name, value));
        match self.transport.send(&request)? {
            ResponseBody::Inserted { entity, version } => {
                self.cache.put(entity_name, &id, entity, version);
                self.set_state(entity_name, &id, EntitySyncState::Synced);
                Ok(version)
            }
            ResponseBody::Error(body) => Err(SyncError::from_wire(&body, entity_name, &id)),
            other => Err(unexpected(&other)),
        }
    }

    /// Stops following an entity.
    ///
    /// Refused while unacknowledged operations remain; dropping them
    /// silently would lose committed changes.
    pub fn unfollow(&self, entity_name: &str, id: &str) -> SyncResult<()> {
        if !self.oplog.pending_for(entity_name, id).is_empty() {
            return Err(SyncError::Validation(format!(
                "entity {id} has unacknowledged operations"
            )));
        }
        self.cache.remove(entity_name, id);
        self.states.write().remove(&key(entity_name, id));
        Ok(())
    }

    /// Commits patch operations locally and pushes them to the server.
    ///
    /// The operations become visible in the local snapshot immediately.
    /// A stale base version triggers reconciliation: re-pull, replay
    /// still-pending operations in FIFO order on top, push again, at
    /// most `max_reconcile_attempts` times. A transport failure leaves
    /// the record queued and surfaces the error; it is never silently
    /// retried.
    pub fn commit_and_push(
        &self,
        entity_name: &str,
        id: &str,
        ops: Vec<PatchOp>,
    ) -> SyncResult<CommitOutcome> {
        let guard = self.id_guard(entity_name, id);
        let _serialized = guard.lock();

        if self
            .oplog
            .pending_for(entity_name, id)
            .iter()
            .any(|r| r.state == RecordState::Conflicted)
        {
            return Err(SyncError::Validation(format!(
                "entity {id} has conflicted operations awaiting manual retry"
            )));
        }

        let base_version =
            self.cache
                .version(entity_name, id)
                .ok_or_else(|| SyncError::NotFollowed {
                    entity_name: entity_name.to_string(),
                    id: id.to_string(),
                })?;

        // Fails fast on a malformed patch; nothing is enqueued.
        self.cache.apply_optimistic(entity_name, id, &ops)?;
        self.oplog.enqueue(entity_name, id, ops, base_version);
        self.set_state(entity_name, id, EntitySyncState::Pending);

        self.flush_locked(entity_name, id)
    }

    /// Retries unacknowledged records for an entity, oldest first.
    ///
    /// This is the manual recovery path for records left queued by a
    /// transport failure or flagged conflicted by an exhausted
    /// reconciliation. Returns `None` when nothing was pending.
    pub fn push_pending(
        &self,
        entity_name: &str,
        id: &str,
    ) -> SyncResult<Option<CommitOutcome>> {
        let guard = self.id_guard(entity_name, id);
        let _serialized = guard.lock();

        let pending = self.oplog.pending_for(entity_name, id);
        if pending.is_empty() {
            return Ok(None);
        }
        for record in &pending {
            self.oplog.set_state(record.record_id, RecordState::Queued);
        }
        self.set_state(entity_name, id, EntitySyncState::Pending);
        self.flush_locked(entity_name, id).map(Some)
    }

    /// Pulls the latest server state for a followed entity.
    ///
    /// Still-pending local operations are replayed on top of whatever
    /// the server returns. On transport failure the read degrades to
    /// the cached snapshot rather than failing. Entities must be
    /// followed before they can be pulled.
    pub fn pull(&self, entity_name: &str, id: &str) -> SyncResult<Value> {
        let Some(cached_version) = self.cache.version(entity_name, id) else {
            return Err(not_followed(entity_name, id));
        };
        let request = self.with_session(RequestBody::pull(entity_name, id, Some(cached_version)));

        match self.send_read(&request) {
            Ok(ResponseBody::Pulled(PullOutcome::NotModified)) => {
                self.stats.write().pulls += 1;
                self.cache
                    .get(entity_name, id)
                    .ok_or_else(|| not_followed(entity_name, id))
            }
            Ok(ResponseBody::Pulled(PullOutcome::Entity { entity, version })) => {
                self.stats.write().pulls += 1;
                let pending_ops = self.pending_ops(entity_name, id);
                if !self.oplog.pending_for(entity_name, id).is_empty() {
                    // Any in-flight commit ack is now stale.
                    self.bump_epoch(entity_name, id);
                }
                self.cache
                    .rebase(entity_name, id, entity, version, &pending_ops)?;
                self.cache
                    .get(entity_name, id)
                    .ok_or_else(|| not_followed(entity_name, id))
            }
            Ok(ResponseBody::Error(body)) => Err(SyncError::from_wire(&body, entity_name, id)),
            Ok(other) => Err(unexpected(&other)),
            Err(err) if err.is_retryable() || matches!(err, SyncError::NotConnected) => {
                match self.cache.get(entity_name, id) {
                    Some(snapshot) => {
                        warn!(entity_name, id, error = %err, "pull failed, serving cached snapshot");
                        self.stats.write().reads_degraded += 1;
                        Ok(snapshot)
                    }
                    None => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Deletes an entity on the server and stops following it.
    ///
    /// Unacknowledged operations against the entity are discarded; the
    /// entity no longer exists to apply them to.
    pub fn delete(&self, entity_name: &str, id: &str) -> SyncResult<()> {
        let guard = self.id_guard(entity_name, id);
        let _serialized = guard.lock();

        let request = self.with_session(RequestBody::delete(entity_name, id));
        match self.transport.send(&request)? {
            ResponseBody::Deleted { .. } => {
                for record in self.oplog.pending_for(entity_name, id) {
                    self.oplog.dequeue(record.record_id);
                }
                self.cache.remove(entity_name, id);
                self.states.write().remove(&key(entity_name, id));
                Ok(())
            }
            ResponseBody::Error(body) => Err(SyncError::from_wire(&body, entity_name, id)),
            other => Err(unexpected(&other)),
        }
    }

    /// Pushes every queued record for one entity, oldest first.
    ///
    /// Caller must hold the entity's id guard.
    fn flush_locked(&self, entity_name: &str, id: &str) -> SyncResult<CommitOutcome> {
        let mut last_version = None;
        let mut reconciled = false;

        loop {
            let Some(record) = self
                .oplog
                .pending_for(entity_name, id)
                .into_iter()
                .next()
            else {
                break;
            };

            let base_version = self
                .cache
                .version(entity_name, id)
                .unwrap_or(record.base_version);
            self.oplog.set_base_version(record.record_id, base_version);
            self.oplog.set_state(record.record_id, RecordState::InFlight);
            let epoch = self.epoch(entity_name, id);

            let request = self.with_session(RequestBody::commit(
                entity_name,
                id,
                base_version,
                record.ops.clone(),
            ));
            let response = match self.transport.send(&request) {
                Ok(response) => response,
                Err(err) => {
                    self.oplog.set_state(record.record_id, RecordState::Queued);
                    self.set_error(&err);
                    return Err(err);
                }
            };

            match response {
                ResponseBody::Committed(ack) => {
                    self.oplog.dequeue(record.record_id);
                    if self.epoch(entity_name, id) == epoch {
                        self.cache
                            .acknowledge(entity_name, id, &record.ops, ack.version)?;
                    } else {
                        // A pull rebased past us; the ack is stale.
                        debug!(entity_name, id, "commit ack superseded, refreshing");
                        self.refresh_from_server(entity_name, id)?;
                    }
                    self.stats.write().commits_pushed += 1;
                    last_version = Some(ack.version);
                }
                ResponseBody::Error(body) if body.kind == ErrorKind::Conflict => {
                    self.oplog.set_state(record.record_id, RecordState::Queued);
                    last_version = Some(self.reconcile(entity_name, id)?);
                    reconciled = true;
                    break;
                }
                ResponseBody::Error(body) if body.kind == ErrorKind::Internal => {
                    // Server-side failure; the record may still succeed
                    // later via push_pending.
                    self.oplog.set_state(record.record_id, RecordState::Queued);
                    let err = SyncError::from_wire(&body, entity_name, id);
                    self.set_error(&err);
                    return Err(err);
                }
                ResponseBody::Error(body) => {
                    // Rejected outright; retrying cannot succeed.
                    self.oplog.dequeue(record.record_id);
                    self.rollback_snapshot(entity_name, id)?;
                    let err = SyncError::from_wire(&body, entity_name, id);
                    self.set_error(&err);
                    return Err(err);
                }
                other => {
                    self.oplog.set_state(record.record_id, RecordState::Queued);
                    let err = unexpected(&other);
                    self.set_error(&err);
                    return Err(err);
                }
            }
        }

        if self.oplog.pending_for(entity_name, id).is_empty() {
            self.set_state(entity_name, id, EntitySyncState::Synced);
        }
        self.stats.write().last_error = None;

        let version = last_version
            .ok_or_else(|| SyncError::Protocol("flush completed without a push".into()))?;
        Ok(CommitOutcome {
            version,
            reconciled,
        })
    }

    /// Resolves a rejected commit by re-pulling and replaying.
    ///
    /// Each attempt fetches the server's current state, rebases the
    /// cache with every still-pending operation replayed in FIFO order,
    /// and re-pushes the chain against the fresh version. Exhausting
    /// the attempt budget flags the records conflicted and surfaces the
    /// failure.
    fn reconcile(&self, entity_name: &str, id: &str) -> SyncResult<VersionId> {
        self.set_state(entity_name, id, EntitySyncState::Reconciling);
        self.bump_epoch(entity_name, id);
        let max_attempts = self.config.max_reconcile_attempts;

        for attempt in 1..=max_attempts {
            debug!(entity_name, id, attempt, "reconciling rejected commit");
            let (server_doc, server_version) = self.fetch_latest(entity_name, id)?;

            let pending = self.oplog.pending_for(entity_name, id);
            let all_ops: Vec<PatchOp> =
                pending.iter().flat_map(|r| r.ops.iter().cloned()).collect();
            if let Err(err) =
                self.cache
                    .rebase(entity_name, id, server_doc, server_version, &all_ops)
            {
                // The pending operations no longer apply to what the
                // server has; only manual intervention can resolve this.
                self.flag_conflicted(entity_name, id);
                self.set_error(&err);
                return Err(err);
            }

            let mut version = server_version;
            let mut lost_race = false;
            for record in pending {
                self.oplog.set_base_version(record.record_id, version);
                self.oplog.set_state(record.record_id, RecordState::InFlight);
                let epoch = self.epoch(entity_name, id);
                let request = self.with_session(RequestBody::commit(
                    entity_name,
                    id,
                    version,
                    record.ops.clone(),
                ));
                let response = match self.transport.send(&request) {
                    Ok(response) => response,
                    Err(err) => {
                        self.oplog.set_state(record.record_id, RecordState::Queued);
                        self.set_state(entity_name, id, EntitySyncState::Pending);
                        self.set_error(&err);
                        return Err(err);
                    }
                };
                match response {
                    ResponseBody::Committed(ack) => {
                        self.oplog.dequeue(record.record_id);
                        if self.epoch(entity_name, id) == epoch {
                            self.cache
                                .acknowledge(entity_name, id, &record.ops, ack.version)?;
                            version = ack.version;
                        } else {
                            // A pull rebased past us; the ack is stale.
                            debug!(entity_name, id, "replayed ack superseded, refreshing");
                            self.refresh_from_server(entity_name, id)?;
                            version = self
                                .cache
                                .version(entity_name, id)
                                .unwrap_or(ack.version);
                        }
                        self.stats.write().commits_pushed += 1;
                    }
                    ResponseBody::Error(body) if body.kind == ErrorKind::Conflict => {
                        self.oplog.set_state(record.record_id, RecordState::Queued);
                        lost_race = true;
                        break;
                    }
                    ResponseBody::Error(body) if body.kind == ErrorKind::Internal => {
                        // Server-side failure; the record may still
                        // succeed later via push_pending.
                        self.oplog.set_state(record.record_id, RecordState::Queued);
                        self.set_state(entity_name, id, EntitySyncState::Pending);
                        let err = SyncError::from_wire(&body, entity_name, id);
                        self.set_error(&err);
                        return Err(err);
                    }
                    ResponseBody::Error(body) => {
                        self.oplog.dequeue(record.record_id);
                        self.rollback_snapshot(entity_name, id)?;
                        let err = SyncError::from_wire(&body, entity_name, id);
                        self.set_error(&err);
                        return Err(err);
                    }
                    other => {
                        self.oplog.set_state(record.record_id, RecordState::Queued);
                        let err = unexpected(&other);
                        self.set_error(&err);
                        return Err(err);
                    }
                }
            }

            if !lost_race {
                self.stats.write().conflicts_reconciled += 1;
                self.set_state(entity_name, id, EntitySyncState::Synced);
                return Ok(version);
            }
        }

        warn!(entity_name, id, attempts = max_attempts, "reconciliation exhausted");
        self.flag_conflicted(entity_name, id);
        self.stats.write().reconciliations_exhausted += 1;
        let err = SyncError::ReconcileExhausted {
            entity_name: entity_name.to_string(),
            id: id.to_string(),
            attempts: max_attempts,
        };
        self.set_error(&err);
        Err(err)
    }

    /// Fetches the server's current document and version.
    fn fetch_latest(&self, entity_name: &str, id: &str) -> SyncResult<(Value, VersionId)> {
        let request = self.with_session(RequestBody::pull(entity_name, id, None));
        match self.send_read(&request)? {
            ResponseBody::Pulled(PullOutcome::Entity { entity, version }) => {
                Ok((entity, version))
            }
            ResponseBody::Pulled(PullOutcome::NotModified) => Err(SyncError::Protocol(
                "server reported not-modified for an unconditional pull".into(),
            )),
            ResponseBody::Error(body) => Err(SyncError::from_wire(&body, entity_name, id)),
            other => Err(unexpected(&other)),
        }
    }

    /// Re-pulls and rebases after a stale acknowledgment.
    fn refresh_from_server(&self, entity_name: &str, id: &str) -> SyncResult<()> {
        let (server_doc, server_version) = self.fetch_latest(entity_name, id)?;
        let pending_ops = self.pending_ops(entity_name, id);
        self.cache
            .rebase(entity_name, id, server_doc, server_version, &pending_ops)
    }

    /// Rebuilds the snapshot as acknowledged state plus remaining
    /// pending operations, after a record was dropped.
    fn rollback_snapshot(&self, entity_name: &str, id: &str) -> SyncResult<()> {
        let (acked, version) = self
            .cache
            .acknowledged(entity_name, id)
            .ok_or_else(|| not_followed(entity_name, id))?;
        let pending_ops = self.pending_ops(entity_name, id);
        self.cache
            .rebase(entity_name, id, acked, version, &pending_ops)
    }

    /// Sends an idempotent read, retrying per the retry configuration.
    fn send_read(&self, request: &RequestBody) -> SyncResult<ResponseBody> {
        debug_assert!(request.is_idempotent_read());
        let retry = &self.config.retry;
        let mut last_error = None;

        // The fields are public, so guard against a hand-built zero budget.
        for attempt in 0..retry.max_attempts.max(1) {
            if attempt > 0 {
                std::thread::sleep(retry.delay_for_attempt(attempt));
                self.stats.write().retries += 1;
            }
            match self.transport.send(request) {
                Ok(response) => return Ok(response),
                Err(err) if err.is_retryable() => last_error = Some(err),
                Err(err) => return Err(err),
            }
        }

        Err(last_error.unwrap_or(SyncError::NotConnected))
    }

    fn pending_ops(&self, entity_name: &str, id: &str) -> Vec<PatchOp> {
        self.oplog
            .pending_for(entity_name, id)
            .iter()
            .flat_map(|r| r.ops.iter().cloned())
            .collect()
    }

    fn flag_conflicted(&self, entity_name: &str, id: &str) {
        for record in self.oplog.pending_for(entity_name, id) {
            self.oplog
                .set_state(record.record_id, RecordState::Conflicted);
        }
        self.set_state(entity_name, id, EntitySyncState::Pending);
    }

    fn with_session(&self, request: RequestBody) -> RequestBody {
        match &self.config.session {
            Some(session) => request.with_session(session.clone()),
            None => request,
        }
    }

    fn id_guard(&self, entity_name: &str, id: &str) -> Arc<Mutex<()>> {
        self.inflight
            .lock()
            .entry(key(entity_name, id))
            .or_default()
            .clone()
    }

    fn epoch(&self, entity_name: &str, id: &str) -> u64 {
        self.epochs
            .read()
            .get(&key(entity_name, id))
            .copied()
            .unwrap_or(0)
    }

    fn bump_epoch(&self, entity_name: &str, id: &str) {
        *self.epochs.write().entry(key(entity_name, id)).or_insert(0) += 1;
    }

    fn set_state(&self, entity_name: &str, id: &str, state: EntitySyncState) {
        self.states.write().insert(key(entity_name, id), state);
    }

    fn set_error(&self, err: &SyncError) {
        self.stats.write().last_error = Some(err.to_string());
    }
}

fn key(entity_name: &str, id: &str) -> EntityKey {
    (entity_name.to_string(), id.to_string())
}

fn not_followed(entity_name: &str, id: &str) -> SyncError {
    SyncError::NotFollowed {
        entity_name: entity_name.to_string(),
        id: id.to_string(),
    }
}

fn unexpected(response: &ResponseBody) -> SyncError {
    SyncError::Protocol(format!("unexpected response variant: {response:?}"))
}

/// Extracts the required string `id` from an entity document.
fn document_id(value: &Value) -> SyncResult<&str> {
    value
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| SyncError::Validation("entity must carry a string `id` field".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::transport::MockTransport;
    use entisync_protocol::{apply_all, CommitAck, FindResult, RequestKind};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::mpsc;

    fn controller() -> SyncController<MockTransport> {
        let config = SyncConfig::new("http://127.0.0.1:0").with_retry(RetryConfig::no_retry());
        SyncController::new(config, MockTransport::new())
    }

    fn got(name: &str) -> (ResponseBody, VersionId) {
        let version = VersionId::fresh();
        let response = ResponseBody::Got {
            entity: json!({ "id": "PID-1", "name": name }),
            version,
        };
        (response, version)
    }

    fn committed(version: VersionId) -> ResponseBody {
        ResponseBody::Committed(CommitAck {
            id: "PID-1".into(),
            version,
        })
    }

    fn pulled(name: &str, version: VersionId) -> ResponseBody {
        ResponseBody::Pulled(PullOutcome::Entity {
            entity: json!({ "id": "PID-1", "name": name }),
            version,
        })
    }

    fn rename(to: &str) -> Vec<PatchOp> {
        vec![PatchOp::set("name", json!(to)).unwrap()]
    }

    fn followed(ctl: &SyncController<MockTransport>) {
        let (response, _) = got("a");
        ctl.transport.push_response(response);
        ctl.follow("person", "PID-1").unwrap();
    }

    #[test]
    fn follow_caches_entity() {
        let ctl = controller();
        followed(&ctl);

        assert_eq!(ctl.cache().get("person", "PID-1").unwrap()["name"], json!("a"));
        assert_eq!(ctl.state("person", "PID-1"), Some(EntitySyncState::Synced));
    }

    #[test]
    fn follow_maps_not_found() {
        let ctl = controller();
        ctl.transport
            .push_response(ResponseBody::error(ErrorKind::NotFound, "no such entity"));
        assert!(matches!(
            ctl.follow("person", "PID-1"),
            Err(SyncError::NotFound { .. })
        ));
        assert_eq!(ctl.state("person", "PID-1"), None);
    }

    #[test]
    fn find_and_follow_caches_all_matches() {
        let ctl = controller();
        let v1 = VersionId::fresh();
        let v2 = VersionId::fresh();
        ctl.transport.push_response(ResponseBody::Found(FindResult {
            entities: vec![
                json!({ "id": "PID-1", "name": "a" }),
                json!({ "id": "PID-2", "name": "b" }),
            ],
            versions_by_id: [("PID-1".to_string(), v1), ("PID-2".to_string(), v2)]
                .into_iter()
                .collect(),
        }));

        let entities = ctl.find_and_follow("person", WhereClause::All).unwrap();
        assert_eq!(entities.len(), 2);
        assert_eq!(ctl.cache().version("person", "PID-1"), Some(v1));
        assert_eq!(ctl.cache().version("person", "PID-2"), Some(v2));
    }

    #[test]
    fn commit_and_push_acknowledges() {
        let ctl = controller();
        followed(&ctl);
        let v2 = VersionId::fresh();
        ctl.transport.push_response(committed(v2));

        let outcome = ctl
            .commit_and_push("person", "PID-1", rename("b"))
            .unwrap();
        assert_eq!(outcome.version, v2);
        assert!(!outcome.reconciled);
        assert_eq!(ctl.pending_count(), 0);
        assert_eq!(ctl.state("person", "PID-1"), Some(EntitySyncState::Synced));
        assert_eq!(ctl.cache().version("person", "PID-1"), Some(v2));
        assert_eq!(ctl.cache().get("person", "PID-1").unwrap()["name"], json!("b"));
        assert_eq!(ctl.stats().commits_pushed, 1);
    }

    #[test]
    fn malformed_patch_fails_fast() {
        let ctl = controller();
        followed(&ctl);

        // Push onto a string field cannot apply.
        let ops = vec![PatchOp::push("name", json!("x")).unwrap()];
        assert!(matches!(
            ctl.commit_and_push("person", "PID-1", ops),
            Err(SyncError::Patch(_))
        ));
        assert_eq!(ctl.pending_count(), 0);
        // Only the follow's get went over the wire.
        assert_eq!(ctl.transport.sent_count(), 1);
    }

    #[test]
    fn commit_requires_followed_entity() {
        let ctl = controller();
        assert!(matches!(
            ctl.commit_and_push("person", "PID-1", rename("b")),
            Err(SyncError::NotFollowed { .. })
        ));
    }

    #[test]
    fn transport_failure_keeps_record_and_optimistic_snapshot() {
        let ctl = controller();
        followed(&ctl);
        ctl.transport
            .push_error(SyncError::transport_retryable("connection reset"));

        let result = ctl.commit_and_push("person", "PID-1", rename("b"));
        assert!(matches!(result, Err(SyncError::Transport { .. })));

        // Exactly one commit attempt: writes are never silently retried.
        assert_eq!(ctl.transport.sent_count(), 2);
        assert_eq!(ctl.pending_count(), 1);
        assert_eq!(ctl.oplog.pending()[0].state, RecordState::Queued);
        assert_eq!(ctl.state("person", "PID-1"), Some(EntitySyncState::Pending));
        // The optimistic change stays visible.
        assert_eq!(ctl.cache().get("person", "PID-1").unwrap()["name"], json!("b"));
        assert!(ctl.stats().last_error.is_some());
    }

    #[test]
    fn queued_records_flush_in_fifo_order() {
        let ctl = controller();
        followed(&ctl);

        // First commit fails in transit and stays queued.
        ctl.transport
            .push_error(SyncError::transport_retryable("reset"));
        assert!(ctl.commit_and_push("person", "PID-1", rename("b")).is_err());

        // Second commit pushes the queued record first, then its own.
        let vb = VersionId::fresh();
        let vc = VersionId::fresh();
        ctl.transport.push_response(committed(vb));
        ctl.transport.push_response(committed(vc));
        let outcome = ctl
            .commit_and_push("person", "PID-1", rename("c"))
            .unwrap();

        assert_eq!(outcome.version, vc);
        assert_eq!(ctl.pending_count(), 0);
        assert_eq!(ctl.cache().version("person", "PID-1"), Some(vc));

        let sent = ctl.transport.sent_requests();
        let commits: Vec<&RequestBody> = sent
            .iter()
            .filter(|r| matches!(r.kind, RequestKind::Commit { .. }))
            .collect();
        assert_eq!(commits.len(), 3);
        let RequestKind::Commit { ops, .. } = &commits[1].kind else {
            panic!("expected commit");
        };
        assert_eq!(ops, &rename("b"));
        let RequestKind::Commit { ops, base_version, .. } = &commits[2].kind else {
            panic!("expected commit");
        };
        assert_eq!(ops, &rename("c"));
        assert_eq!(*base_version, vb);
    }

    #[test]
    fn conflict_reconciles_and_replays() {
        let ctl = controller();
        followed(&ctl);

        let server_v2 = VersionId::fresh();
        let acked_v3 = VersionId::fresh();
        // Commit rejected, re-pull returns a renamed entity, replay succeeds.
        ctl.transport
            .push_response(ResponseBody::conflict("stale base version", server_v2));
        ctl.transport.push_response(pulled("z", server_v2));
        ctl.transport.push_response(committed(acked_v3));

        let ops = vec![PatchOp::set("mood", json!("good")).unwrap()];
        let outcome = ctl.commit_and_push("person", "PID-1", ops).unwrap();

        assert!(outcome.reconciled);
        assert_eq!(outcome.version, acked_v3);
        assert_eq!(ctl.pending_count(), 0);
        assert_eq!(ctl.state("person", "PID-1"), Some(EntitySyncState::Synced));
        assert_eq!(ctl.stats().conflicts_reconciled, 1);

        // Local patch replayed on top of the server's rename.
        let snapshot = ctl.cache().get("person", "PID-1").unwrap();
        assert_eq!(snapshot["name"], json!("z"));
        assert_eq!(snapshot["mood"], json!("good"));

        // The replayed commit used the freshly pulled base version.
        let sent = ctl.transport.sent_requests();
        let RequestKind::Commit { base_version, .. } = &sent.last().unwrap().kind else {
            panic!("expected commit");
        };
        assert_eq!(*base_version, server_v2);
    }

    #[test]
    fn reconciliation_exhaustion_flags_records() {
        let config = SyncConfig::new("http://127.0.0.1:0")
            .with_retry(RetryConfig::no_retry())
            .with_max_reconcile_attempts(2);
        let ctl = SyncController::new(config, MockTransport::new());
        followed(&ctl);

        let v2 = VersionId::fresh();
        let v3 = VersionId::fresh();
        ctl.transport
            .push_response(ResponseBody::conflict("stale", v2));
        // Attempt 1: pull then conflict again.
        ctl.transport.push_response(pulled("x", v2));
        ctl.transport
            .push_response(ResponseBody::conflict("stale", v3));
        // Attempt 2: pull then conflict again.
        ctl.transport.push_response(pulled("y", v3));
        ctl.transport
            .push_response(ResponseBody::conflict("stale", VersionId::fresh()));

        let result = ctl.commit_and_push("person", "PID-1", rename("b"));
        assert!(matches!(
            result,
            Err(SyncError::ReconcileExhausted { attempts: 2, .. })
        ));
        assert_eq!(ctl.conflicted_records().len(), 1);
        assert_eq!(ctl.stats().reconciliations_exhausted, 1);
        assert_eq!(ctl.state("person", "PID-1"), Some(EntitySyncState::Pending));

        // Further commits are refused until the conflict is handled.
        assert!(matches!(
            ctl.commit_and_push("person", "PID-1", rename("c")),
            Err(SyncError::Validation(_))
        ));
    }

    #[test]
    fn internal_error_keeps_record_queued() {
        let ctl = controller();
        followed(&ctl);
        ctl.transport
            .push_response(ResponseBody::error(ErrorKind::Internal, "shard offline"));

        let result = ctl.commit_and_push("person", "PID-1", rename("b"));
        assert!(matches!(result, Err(SyncError::Server(_))));

        // The record and the optimistic change both survive.
        assert_eq!(ctl.pending_count(), 1);
        assert_eq!(ctl.oplog.pending()[0].state, RecordState::Queued);
        assert_eq!(ctl.cache().get("person", "PID-1").unwrap()["name"], json!("b"));
        assert_eq!(ctl.state("person", "PID-1"), Some(EntitySyncState::Pending));

        // push_pending drains it once the server recovers.
        let v2 = VersionId::fresh();
        ctl.transport.push_response(committed(v2));
        let outcome = ctl.push_pending("person", "PID-1").unwrap().unwrap();
        assert_eq!(outcome.version, v2);
        assert_eq!(ctl.pending_count(), 0);
    }

    #[test]
    fn internal_error_during_reconcile_keeps_record_queued() {
        let ctl = controller();
        followed(&ctl);

        let v2 = VersionId::fresh();
        ctl.transport
            .push_response(ResponseBody::conflict("stale", v2));
        ctl.transport.push_response(pulled("z", v2));
        ctl.transport
            .push_response(ResponseBody::error(ErrorKind::Internal, "shard offline"));

        let result = ctl.commit_and_push("person", "PID-1", rename("b"));
        assert!(matches!(result, Err(SyncError::Server(_))));
        assert_eq!(ctl.pending_count(), 1);
        assert_eq!(ctl.oplog.pending()[0].state, RecordState::Queued);
        assert_eq!(ctl.state("person", "PID-1"), Some(EntitySyncState::Pending));

        let v3 = VersionId::fresh();
        ctl.transport.push_response(committed(v3));
        let outcome = ctl.push_pending("person", "PID-1").unwrap().unwrap();
        assert_eq!(outcome.version, v3);
        assert_eq!(ctl.pending_count(), 0);
    }

    /// Transport backed by a tiny in-memory server that can pause one
    /// commit between applying it and returning the acknowledgment,
    /// letting a test interleave a pull into that window.
    struct RacingTransport {
        server: Mutex<(Value, VersionId)>,
        applied_tx: Mutex<Option<mpsc::Sender<()>>>,
        release_rx: Mutex<Option<mpsc::Receiver<()>>>,
        gate_commit: u32,
        commits_seen: AtomicU32,
    }

    impl Transport for RacingTransport {
        fn send(&self, request: &RequestBody) -> SyncResult<ResponseBody> {
            match &request.kind {
                RequestKind::Get { .. } => {
                    let server = self.server.lock();
                    Ok(ResponseBody::Got {
                        entity: server.0.clone(),
                        version: server.1,
                    })
                }
                RequestKind::Pull { version, .. } => {
                    let server = self.server.lock();
                    if *version == Some(server.1) {
                        Ok(ResponseBody::Pulled(PullOutcome::NotModified))
                    } else {
                        Ok(ResponseBody::Pulled(PullOutcome::Entity {
                            entity: server.0.clone(),
                            version: server.1,
                        }))
                    }
                }
                RequestKind::Commit {
                    id,
                    base_version,
                    ops,
                } => {
                    let seq = self.commits_seen.fetch_add(1, Ordering::SeqCst) + 1;
                    let ack = {
                        let mut server = self.server.lock();
                        if *base_version != server.1 {
                            return Ok(ResponseBody::conflict("stale base version", server.1));
                        }
                        let mut updated = server.0.clone();
                        apply_all(ops, &mut updated).unwrap();
                        let version = VersionId::fresh();
                        *server = (updated, version);
                        ResponseBody::Committed(CommitAck {
                            id: id.clone(),
                            version,
                        })
                    };
                    if seq == self.gate_commit {
                        if let Some(tx) = self.applied_tx.lock().take() {
                            tx.send(()).unwrap();
                        }
                        if let Some(rx) = self.release_rx.lock().take() {
                            rx.recv().unwrap();
                        }
                    }
                    Ok(ack)
                }
                other => Err(SyncError::Protocol(format!("unexpected request: {other:?}"))),
            }
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn close(&self) {}
    }

    #[test]
    fn pull_during_replayed_commit_supersedes_its_acknowledgment() {
        let (applied_tx, applied_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        // Gate the second commit: the first conflicts, the second is the
        // reconciliation replay.
        let transport = RacingTransport {
            server: Mutex::new((
                json!({ "id": "PID-1", "name": "a", "tags": [] }),
                VersionId::fresh(),
            )),
            applied_tx: Mutex::new(Some(applied_tx)),
            release_rx: Mutex::new(Some(release_rx)),
            gate_commit: 2,
            commits_seen: AtomicU32::new(0),
        };
        let config = SyncConfig::new("http://127.0.0.1:0").with_retry(RetryConfig::no_retry());
        let ctl = Arc::new(SyncController::new(config, transport));
        ctl.follow("person", "PID-1").unwrap();

        // Another writer moves the server on, so the push conflicts and
        // reconciles.
        {
            let mut server = ctl.transport().server.lock();
            server.0["name"] = json!("z");
            server.1 = VersionId::fresh();
        }

        let pusher = Arc::clone(&ctl);
        let handle = std::thread::spawn(move || {
            pusher.commit_and_push(
                "person",
                "PID-1",
                vec![PatchOp::push("tags", json!("x")).unwrap()],
            )
        });

        // The replayed commit has landed server-side but its
        // acknowledgment is still in flight; a pull rebases past it.
        applied_rx.recv().unwrap();
        ctl.pull("person", "PID-1").unwrap();
        release_tx.send(()).unwrap();

        let outcome = handle.join().unwrap().unwrap();
        assert!(outcome.reconciled);

        // The push landed exactly once: the stale acknowledgment was
        // refreshed from the server, not applied on top of the rebase.
        let (acked, acked_version) = ctl.cache().acknowledged("person", "PID-1").unwrap();
        assert_eq!(acked["tags"], json!(["x"]));
        assert_eq!(acked["name"], json!("z"));
        assert_eq!(ctl.cache().get("person", "PID-1").unwrap()["tags"], json!(["x"]));
        assert_eq!(Some(acked_version), ctl.cache().version("person", "PID-1"));
        assert_eq!(ctl.pending_count(), 0);
        assert_eq!(ctl.state("person", "PID-1"), Some(EntitySyncState::Synced));
    }

    #[test]
    fn push_pending_retries_conflicted_records() {
        let ctl = controller();
        followed(&ctl);

        // Leave a record queued via transport failure.
        ctl.transport
            .push_error(SyncError::transport_retryable("reset"));
        assert!(ctl.commit_and_push("person", "PID-1", rename("b")).is_err());

        let v2 = VersionId::fresh();
        ctl.transport.push_response(committed(v2));
        let outcome = ctl.push_pending("person", "PID-1").unwrap().unwrap();
        assert_eq!(outcome.version, v2);
        assert_eq!(ctl.pending_count(), 0);

        // Nothing left to push.
        assert!(ctl.push_pending("person", "PID-1").unwrap().is_none());
    }

    #[test]
    fn pull_not_modified_serves_snapshot() {
        let ctl = controller();
        followed(&ctl);
        ctl.transport
            .push_response(ResponseBody::Pulled(PullOutcome::NotModified));

        let snapshot = ctl.pull("person", "PID-1").unwrap();
        assert_eq!(snapshot["name"], json!("a"));
        assert_eq!(ctl.stats().pulls, 1);

        // The pull carried our cached version.
        let sent = ctl.transport.sent_requests();
        let RequestKind::Pull { version, .. } = &sent.last().unwrap().kind else {
            panic!("expected pull");
        };
        assert!(version.is_some());
    }

    #[test]
    fn pull_rebases_pending_ops_on_server_state() {
        let ctl = controller();
        followed(&ctl);

        // A queued record survives a transport failure...
        ctl.transport
            .push_error(SyncError::transport_retryable("reset"));
        let ops = vec![PatchOp::set("mood", json!("good")).unwrap()];
        assert!(ctl.commit_and_push("person", "PID-1", ops).is_err());

        // ...and a pull replays it on top of fresh server state.
        let v2 = VersionId::fresh();
        ctl.transport.push_response(pulled("z", v2));
        let snapshot = ctl.pull("person", "PID-1").unwrap();
        assert_eq!(snapshot["name"], json!("z"));
        assert_eq!(snapshot["mood"], json!("good"));
        assert_eq!(ctl.cache().version("person", "PID-1"), Some(v2));
        assert_eq!(ctl.pending_count(), 1);
    }

    #[test]
    fn pull_degrades_to_cached_snapshot() {
        let ctl = controller();
        followed(&ctl);
        ctl.transport
            .push_error(SyncError::transport_retryable("network down"));

        let snapshot = ctl.pull("person", "PID-1").unwrap();
        assert_eq!(snapshot["name"], json!("a"));
        assert_eq!(ctl.stats().reads_degraded, 1);
    }

    #[test]
    fn pull_requires_followed_entity() {
        let ctl = controller();
        assert!(matches!(
            ctl.pull("person", "PID-1"),
            Err(SyncError::NotFollowed { .. })
        ));
        // Refused before anything goes over the wire.
        assert_eq!(ctl.transport.sent_count(), 0);
        assert!(ctl.state("person", "PID-1").is_none());
    }

    #[test]
    fn reads_retry_but_writes_do_not() {
        let config = SyncConfig::new("http://127.0.0.1:0")
            .with_retry(RetryConfig::new(3).with_initial_delay(std::time::Duration::ZERO));
        let ctl = SyncController::new(config, MockTransport::new());

        // Two failures, then success: the follow retries through them.
        ctl.transport
            .push_error(SyncError::transport_retryable("reset"));
        ctl.transport
            .push_error(SyncError::transport_retryable("reset"));
        let (response, _) = got("a");
        ctl.transport.push_response(response);
        ctl.follow("person", "PID-1").unwrap();
        assert_eq!(ctl.transport.sent_count(), 3);
        assert_eq!(ctl.stats().retries, 2);

        // A commit sees one attempt only.
        ctl.transport
            .push_error(SyncError::transport_retryable("reset"));
        assert!(ctl.commit_and_push("person", "PID-1", rename("b")).is_err());
        assert_eq!(ctl.transport.sent_count(), 4);
    }

    #[test]
    fn insert_and_follow_caches() {
        let ctl = controller();
        let v1 = VersionId::fresh();
        ctl.transport.push_response(ResponseBody::Inserted {
            entity: json!({ "id": "PID-9", "name": "new" }),
            version: v1,
        });

        let version = ctl
            .insert_and_follow("person", json!({ "id": "PID-9", "name": "new" }))
            .unwrap();
        assert_eq!(version, v1);
        assert_eq!(ctl.state("person", "PID-9"), Some(EntitySyncState::Synced));
    }

    #[test]
    fn insert_requires_string_id() {
        let ctl = controller();
        assert!(matches!(
            ctl.insert_and_follow("person", json!({ "name": "anon" })),
            Err(SyncError::Validation(_))
        ));
        assert_eq!(ctl.transport.sent_count(), 0);
    }

    #[test]
    fn unfollow_refused_with_pending_ops() {
        let ctl = controller();
        followed(&ctl);
        ctl.transport
            .push_error(SyncError::transport_retryable("reset"));
        assert!(ctl.commit_and_push("person", "PID-1", rename("b")).is_err());

        assert!(matches!(
            ctl.unfollow("person", "PID-1"),
            Err(SyncError::Validation(_))
        ));

        // After the record is pushed the entity can be dropped.
        ctl.transport.push_response(committed(VersionId::fresh()));
        ctl.push_pending("person", "PID-1").unwrap();
        ctl.unfollow("person", "PID-1").unwrap();
        assert!(!ctl.cache().contains("person", "PID-1"));
    }

    #[test]
    fn delete_discards_pending_records() {
        let ctl = controller();
        followed(&ctl);
        ctl.transport
            .push_error(SyncError::transport_retryable("reset"));
        assert!(ctl.commit_and_push("person", "PID-1", rename("b")).is_err());

        ctl.transport
            .push_response(ResponseBody::Deleted { id: "PID-1".into() });
        ctl.delete("person", "PID-1").unwrap();
        assert_eq!(ctl.pending_count(), 0);
        assert!(!ctl.cache().contains("person", "PID-1"));
        assert_eq!(ctl.state("person", "PID-1"), None);
    }

    #[test]
    fn rejected_commit_rolls_back_snapshot() {
        let ctl = controller();
        followed(&ctl);
        ctl.transport
            .push_response(ResponseBody::error(ErrorKind::Validation, "rejected"));

        let result = ctl.commit_and_push("person", "PID-1", rename("b"));
        assert!(matches!(result, Err(SyncError::Validation(_))));
        assert_eq!(ctl.pending_count(), 0);
        // The optimistic change was undone.
        assert_eq!(ctl.cache().get("person", "PID-1").unwrap()["name"], json!("a"));
    }
}
