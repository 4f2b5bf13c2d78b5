// src/main.rs
//! Aviary binary
//!
//! Two entry points share one executable: `aviary worker <spec-json>` runs
//! the worker bootstrap for a single agent, and the bare `aviary` invocation
//! runs a small supervisor demo over the built-in roles. The runtime
//! launches this same binary for every worker it spawns.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tracing::info;

use aviary::ipc::WorkerSpec;
use aviary::observability::{init_tracing, init_worker_tracing};
use aviary::roles::builtin_registry;
use aviary::worker::run_worker;
use aviary::{Runtime, RuntimeConfig, SpawnRequest};

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        Some("worker") => {
            init_worker_tracing()?;
            let raw = match args.next() {
                Some(raw) => raw,
                None => bail!("usage: aviary worker <spec-json>"),
            };
            let spec: WorkerSpec = serde_json::from_str(&raw)
                .map_err(|e| anyhow::anyhow!("invalid worker spec: {e}"))?;
            run_worker(Arc::new(builtin_registry()), spec).await?;
            Ok(())
        }
        Some("demo") | None => {
            init_tracing()?;
            info!("aviary v{}", aviary::VERSION);
            run_demo().await
        }
        Some("version") => {
            println!("aviary {}", aviary::VERSION);
            Ok(())
        }
        Some(other) => bail!("unknown subcommand '{other}' (expected: worker, demo, version)"),
    }
}

/// Spawn a fanout of counters, let them tick, then shut everything down
async fn run_demo() -> Result<()> {
    let config = RuntimeConfig::load()?;
    info!(store = %config.store_root.display(), project = %config.project, "starting demo");

    let runtime = Runtime::new(config, Arc::new(builtin_registry()))?;
    let root = runtime
        .spawn(
            SpawnRequest::new("fanout", "fan out and count")
                .config(serde_json::json!({
                    "fan_out": 2,
                    "child_config": { "limit": 20, "interval_ms": 100 }
                }))
                .session("demo"),
        )
        .await?;
    info!(agent = %root.id, "root agent spawned");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
        _ = tokio::time::sleep(Duration::from_secs(5)) => {}
    }

    for agent in runtime.list_active() {
        info!(agent = %agent.id, status = ?agent.status, iteration = agent.iteration, "active");
    }

    runtime.shutdown().await?;
    info!("demo finished");
    Ok(())
}
