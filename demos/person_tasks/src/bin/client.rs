//! Demo sync client.
//!
//! Inserts a person collection and a task collection, follows both,
//! pushes a new task onto the task list, and prints the resulting local
//! state.

use clap::Parser;
use entisync_client::{HttpTransport, PlainHttpClient, SyncConfig, SyncController};
use entisync_protocol::PatchOp;
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Demo sync client for the person-tasks server.
#[derive(Parser)]
#[command(name = "person-tasks-client")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Server base URL
    #[arg(short, long, default_value = "http://127.0.0.1:8080")]
    server_url: String,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = SyncConfig::new(cli.server_url.clone());
    let transport = HttpTransport::new(cli.server_url, PlainHttpClient::default());
    let controller = SyncController::new(config, transport);

    let version = controller.insert_and_follow(
        "person_collection",
        json!({
            "id": "person-collection-1",
            "personList": [
                { "id": "PID-1", "name": "a" },
                { "id": "PID-2", "name": "b" },
            ],
        }),
    )?;
    info!(%version, "following person collection");

    let version = controller.insert_and_follow(
        "task_collection",
        json!({
            "id": "task-collection-1",
            "taskList": [
                { "id": "TID-1", "name": "Do hands-on", "status": "TODO" },
            ],
        }),
    )?;
    info!(%version, "following task collection");

    let add_task = PatchOp::push(
        "taskList",
        json!({ "id": "TID-2", "name": "Create store", "status": "WIP" }),
    )?;
    let outcome = controller.commit_and_push("task_collection", "task-collection-1", vec![add_task])?;
    info!(version = %outcome.version, reconciled = outcome.reconciled, "added TID-2");

    println!(
        "{}",
        serde_json::to_string_pretty(&controller.local_state())?
    );
    Ok(())
}
