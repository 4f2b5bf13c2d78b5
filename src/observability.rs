// src/observability.rs
//! Tracing initialization
//!
//! Supervisor processes log to stdout; worker processes must log to stderr
//! because their stdout carries the event channel.

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

use crate::error::Result;

static INITIALIZED: OnceCell<()> = OnceCell::new();

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize tracing for a supervisor process
pub fn init_tracing() -> Result<()> {
    INITIALIZED.get_or_init(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter())
            .try_init();
    });
    Ok(())
}

/// Initialize tracing for a worker process (stderr only)
pub fn init_worker_tracing() -> Result<()> {
    INITIALIZED.get_or_init(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter())
            .with_writer(std::io::stderr)
            .try_init();
    });
    Ok(())
}
