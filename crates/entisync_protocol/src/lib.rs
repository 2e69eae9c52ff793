//! # entisync Protocol
//!
//! Wire-level types shared by entisync clients and servers.
//!
//! This crate provides:
//! - `PatchOp` — declarative patch operations applied to entity documents
//! - `WhereClause` — structural predicates for `find`
//! - `VersionId` — opaque revision tokens
//! - Request/response message bodies and wire error kinds
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod messages;
mod operation;
mod query;
mod version;

pub use error::{ErrorKind, PatchError, PatchResult};
pub use messages::{
    CommitAck, ErrorBody, FindResult, PullOutcome, RequestBody, RequestKind, ResponseBody,
    SessionToken,
};
pub use operation::{apply_all, PatchOp, PatchPath};
pub use query::WhereClause;
pub use version::VersionId;
