// src/config.rs
//! Runtime configuration
//!
//! Layered loading: built-in defaults, then an optional `aviary.toml`, then
//! `AVIARY_*` environment variables.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Configuration for the supervision runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Root directory of the durable entry store
    pub store_root: PathBuf,

    /// Project namespace every agent spawned by this runtime belongs to
    pub project: String,

    /// Program launched for each worker process (defaults to the current
    /// executable, which embeds the worker bootstrap)
    pub worker_program: PathBuf,

    /// Grace period between a STOP command and a forced kill, in milliseconds
    pub stop_grace_ms: u64,

    /// Watchdog cadence in milliseconds; 0 disables the watchdog
    pub watchdog_interval_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            store_root: PathBuf::from("./aviary-data"),
            project: "default".to_string(),
            worker_program: default_worker_program(),
            stop_grace_ms: 5_000,
            watchdog_interval_ms: 1_000,
        }
    }
}

fn default_worker_program() -> PathBuf {
    std::env::current_exe().unwrap_or_else(|_| PathBuf::from("aviary"))
}

impl RuntimeConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        let defaults = Self::default();

        let settings = config::Config::builder()
            .set_default("store_root", defaults.store_root.to_string_lossy().to_string())?
            .set_default("project", defaults.project.clone())?
            .set_default(
                "worker_program",
                defaults.worker_program.to_string_lossy().to_string(),
            )?
            .set_default("stop_grace_ms", defaults.stop_grace_ms)?
            .set_default("watchdog_interval_ms", defaults.watchdog_interval_ms)?
            .add_source(config::File::with_name("aviary").required(false))
            .add_source(config::Environment::with_prefix("AVIARY"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Configuration rooted at an explicit store directory
    pub fn with_root(store_root: impl Into<PathBuf>, project: impl Into<String>) -> Self {
        Self {
            store_root: store_root.into(),
            project: project.into(),
            ..Self::default()
        }
    }
}
