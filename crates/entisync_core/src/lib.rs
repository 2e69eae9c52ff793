//! # entisync Core
//!
//! Authoritative entity storage for entisync.
//!
//! This crate provides:
//! - `MemoryEntityStore` — keyed, per-entity-versioned storage with
//!   insert/find/get/commit/pull/delete
//! - `StoreConfig` — explicit schema of known entity collections
//! - `TypedCollection` — a typed wrapper over one collection
//!
//! Version identifiers are assigned here and nowhere else: every
//! successful write produces a fresh token, and a `commit` whose base
//! version is stale is rejected without applying anything.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod store;
mod typed;

pub use config::StoreConfig;
pub use error::{CoreError, CoreResult};
pub use store::{Inserted, MemoryEntityStore};
pub use typed::TypedCollection;
