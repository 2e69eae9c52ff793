//! FIFO log of patch operations awaiting server acknowledgment.

use entisync_protocol::{PatchOp, VersionId};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// State of a pending record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    /// Waiting to be pushed.
    Queued,
    /// Currently being pushed or reconciled.
    InFlight,
    /// Reconciliation gave up; retained for manual retry.
    Conflicted,
}

/// One committed-but-unacknowledged batch of patch operations.
#[derive(Debug, Clone)]
pub struct PendingRecord {
    /// Log-local record id, monotonically increasing.
    pub record_id: u64,
    /// Collection the entity belongs to.
    pub entity_name: String,
    /// Entity id.
    pub entity_id: String,
    /// Patch operations, in commit order.
    pub ops: Vec<PatchOp>,
    /// Version the operations were committed against.
    pub base_version: VersionId,
    /// Current state.
    pub state: RecordState,
}

/// FIFO queue of pending patch operations.
///
/// Records enter when a commit is made and leave only on server
/// acknowledgment. A transport failure or exhausted reconciliation
/// leaves the record in the log so nothing is silently dropped.
#[derive(Debug, Default)]
pub struct OperationLog {
    records: Mutex<VecDeque<PendingRecord>>,
    next_record_id: AtomicU64,
}

impl OperationLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a record and returns its id.
    pub fn enqueue(
        &self,
        entity_name: &str,
        entity_id: &str,
        ops: Vec<PatchOp>,
        base_version: VersionId,
    ) -> u64 {
        let record_id = self.next_record_id.fetch_add(1, Ordering::SeqCst);
        let record = PendingRecord {
            record_id,
            entity_name: entity_name.to_string(),
            entity_id: entity_id.to_string(),
            ops,
            base_version,
            state: RecordState::Queued,
        };
        self.records.lock().push_back(record);
        record_id
    }

    /// Removes an acknowledged record.
    pub fn dequeue(&self, record_id: u64) -> Option<PendingRecord> {
        let mut records = self.records.lock();
        let pos = records.iter().position(|r| r.record_id == record_id)?;
        records.remove(pos)
    }

    /// Returns pending records for one entity, oldest first.
    pub fn pending_for(&self, entity_name: &str, entity_id: &str) -> Vec<PendingRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.entity_name == entity_name && r.entity_id == entity_id)
            .cloned()
            .collect()
    }

    /// Returns all pending records, oldest first.
    pub fn pending(&self) -> Vec<PendingRecord> {
        self.records.lock().iter().cloned().collect()
    }

    /// Returns the number of pending records.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Updates a record's state. Returns false if the record is gone.
    pub fn set_state(&self, record_id: u64, state: RecordState) -> bool {
        let mut records = self.records.lock();
        match records.iter_mut().find(|r| r.record_id == record_id) {
            Some(record) => {
                record.state = state;
                true
            }
            None => false,
        }
    }

    /// Rebases a record onto a new base version during reconciliation.
    pub fn set_base_version(&self, record_id: u64, base_version: VersionId) -> bool {
        let mut records = self.records.lock();
        match records.iter_mut().find(|r| r.record_id == record_id) {
            Some(record) => {
                record.base_version = base_version;
                true
            }
            None => false,
        }
    }

    /// Returns conflicted records, oldest first.
    pub fn conflicted(&self) -> Vec<PendingRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.state == RecordState::Conflicted)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn set_op(value: &str) -> Vec<PatchOp> {
        vec![PatchOp::set("name", json!(value)).unwrap()]
    }

    #[test]
    fn enqueue_preserves_fifo_order() {
        let log = OperationLog::new();
        let v = VersionId::fresh();
        let a = log.enqueue("person", "PID-1", set_op("a"), v);
        let b = log.enqueue("person", "PID-1", set_op("b"), v);
        let c = log.enqueue("person", "PID-2", set_op("c"), v);

        let all: Vec<u64> = log.pending().iter().map(|r| r.record_id).collect();
        assert_eq!(all, vec![a, b, c]);

        let for_one: Vec<u64> = log
            .pending_for("person", "PID-1")
            .iter()
            .map(|r| r.record_id)
            .collect();
        assert_eq!(for_one, vec![a, b]);
    }

    #[test]
    fn dequeue_removes_only_the_acked_record() {
        let log = OperationLog::new();
        let v = VersionId::fresh();
        let a = log.enqueue("person", "PID-1", set_op("a"), v);
        let b = log.enqueue("person", "PID-1", set_op("b"), v);

        let removed = log.dequeue(a).unwrap();
        assert_eq!(removed.record_id, a);
        assert_eq!(log.len(), 1);
        assert_eq!(log.pending()[0].record_id, b);
        assert!(log.dequeue(a).is_none());
    }

    #[test]
    fn state_transitions() {
        let log = OperationLog::new();
        let v = VersionId::fresh();
        let id = log.enqueue("person", "PID-1", set_op("a"), v);
        assert_eq!(log.pending()[0].state, RecordState::Queued);

        assert!(log.set_state(id, RecordState::InFlight));
        assert_eq!(log.pending()[0].state, RecordState::InFlight);

        assert!(log.set_state(id, RecordState::Conflicted));
        assert_eq!(log.conflicted().len(), 1);

        assert!(!log.set_state(9999, RecordState::Queued));
    }

    #[test]
    fn rebase_updates_base_version() {
        let log = OperationLog::new();
        let v1 = VersionId::fresh();
        let v2 = VersionId::fresh();
        let id = log.enqueue("person", "PID-1", set_op("a"), v1);

        assert!(log.set_base_version(id, v2));
        assert_eq!(log.pending()[0].base_version, v2);
        assert!(!log.set_base_version(9999, v2));
    }
}
