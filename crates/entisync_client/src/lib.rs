//! # entisync Client
//!
//! Client-side synchronization layer for entisync.
//!
//! This crate provides:
//! - `LocalCache` — an optimistic mirror of followed entities
//! - `OperationLog` — FIFO queue of unacknowledged patch operations
//! - `SyncController` — commit/push/pull coordination with conflict
//!   reconciliation
//! - Transport abstraction with mock and HTTP implementations
//!
//! ## Model
//!
//! A controller owns exactly one cache and one operation log. A commit is
//! applied to the cache immediately (optimistic), enqueued, and pushed to
//! the server; acknowledgments advance the acknowledged snapshot and
//! version. A stale base version triggers reconciliation: re-pull the
//! server state, replay still-pending operations in FIFO order on top,
//! and push again, a bounded number of times.
//!
//! ## Key invariants
//!
//! - The cached version always reflects the last acknowledged state;
//!   optimistic changes live in the snapshot and the operation log only.
//! - Operations against one entity id are pushed in FIFO order, one in
//!   flight at a time; different ids proceed independently.
//! - Commits are never silently retried; idempotent reads are.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cache;
mod config;
mod controller;
mod error;
mod http;
mod oplog;
mod transport;

pub use cache::LocalCache;
pub use config::{RetryConfig, SyncConfig};
pub use controller::{CommitOutcome, EntitySyncState, SyncController, SyncStats};
pub use error::{SyncError, SyncResult};
pub use http::{HttpClient, HttpTransport, PlainHttpClient};
pub use oplog::{OperationLog, PendingRecord, RecordState};
pub use transport::{MockTransport, Transport};
