//! # entisync Server
//!
//! REST dispatch layer for the entisync entity store.
//!
//! This crate provides:
//! - `RequestHandler` — translates request bodies into store operations
//! - `RestServer` — a tokio HTTP listener hosting the handler
//! - `ServerConfig` — bind address and request limits
//!
//! Store errors are returned in-band as structured error bodies; only
//! malformed HTTP or JSON produces a non-200 status.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod error;
mod handler;
mod http;
mod server;

pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use handler::RequestHandler;
pub use server::RestServer;
