//! Demo entity server.
//!
//! Serves a `person` and a `task` collection over HTTP, seeded with a
//! couple of entities so the demo client has something to edit.

use clap::Parser;
use entisync_core::{MemoryEntityStore, StoreConfig};
use entisync_server::{RestServer, ServerConfig};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Demo entity server for people and tasks.
#[derive(Parser)]
#[command(name = "person-tasks-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    bind: SocketAddr,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let store = Arc::new(MemoryEntityStore::new(
        StoreConfig::new()
            .with_entity("person")
            .with_entity("task")
            .with_entity("person_collection")
            .with_entity("task_collection"),
    ));

    store.insert_multi(
        "person",
        vec![
            json!({ "id": "PID-1", "name": "aoy" }),
            json!({ "id": "PID-2", "name": "ymtt" }),
        ],
    )?;
    store.insert_one(
        "task",
        json!({ "id": "TID-1", "name": "hands-on", "status": "WIP", "assign": [] }),
    )?;
    info!("seeded 2 people and 1 task");

    let server = RestServer::new(ServerConfig::new(cli.bind), store);
    server.serve().await?;
    Ok(())
}
