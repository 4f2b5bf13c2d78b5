// src/roles.rs
//! Built-in agent roles
//!
//! Three small roles ship with the worker binary. They are used by the
//! end-to-end tests and double as living documentation of the cooperative
//! run-loop contract: `counter` exercises pause/steer/cancel, `fanout`
//! exercises child spawning, `oneshot` exercises the success and failure
//! exits.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use crate::agent::{AgentCtx, Runnable};
use crate::error::{AviaryError, Result};
use crate::store::EntryType;
use crate::worker::registry::AgentRegistry;

const DEFAULT_TICK_INTERVAL_MS: u64 = 100;
const DEFAULT_METRICS_EVERY: u64 = 5;
const DEFAULT_FAN_OUT: u64 = 2;

/// Ticks an iteration loop until its limit or cancellation, writing
/// periodic METRICS entries. Consumed steers are recorded as CONTEXT.
pub struct Counter {
    limit: u64,
    interval: Duration,
    metrics_every: u64,
}

impl Counter {
    fn from_config(config: &serde_json::Value) -> Self {
        Self {
            limit: config["limit"].as_u64().unwrap_or(u64::MAX),
            interval: Duration::from_millis(
                config["interval_ms"].as_u64().unwrap_or(DEFAULT_TICK_INTERVAL_MS),
            ),
            metrics_every: config["metrics_every"]
                .as_u64()
                .unwrap_or(DEFAULT_METRICS_EVERY)
                .max(1),
        }
    }
}

#[async_trait]
impl Runnable for Counter {
    async fn run(&mut self, ctx: &mut AgentCtx) -> Result<()> {
        let mut count = 0;
        loop {
            ctx.check_pause().await;
            if ctx.is_cancelled() {
                break;
            }

            if let Some(steer) = ctx.consume_steer() {
                info!(agent = %ctx.agent_id(), "steer consumed");
                ctx.memory().write(
                    json!({ "steer": steer.context }),
                    EntryType::Context,
                    vec!["steer".into()],
                )?;
            }

            let iteration = ctx.tick();
            count = iteration;
            if iteration % self.metrics_every == 0 {
                ctx.memory().write(
                    json!({ "count": iteration }),
                    EntryType::Metrics,
                    vec![],
                )?;
            }
            if iteration >= self.limit {
                break;
            }

            let cancelled = ctx.cancelled();
            tokio::select! {
                _ = cancelled.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        ctx.memory().write(
            json!({ "final_count": count }),
            EntryType::Metrics,
            vec!["final".into()],
        )?;
        Ok(())
    }
}

/// Spawns `fan_out` counter children, then idles until stopped
pub struct Fanout {
    fan_out: u64,
    child_config: serde_json::Value,
}

impl Fanout {
    fn from_config(config: &serde_json::Value) -> Self {
        Self {
            fan_out: config["fan_out"].as_u64().unwrap_or(DEFAULT_FAN_OUT),
            child_config: config
                .get("child_config")
                .cloned()
                .unwrap_or_else(|| json!({})),
        }
    }
}

#[async_trait]
impl Runnable for Fanout {
    async fn run(&mut self, ctx: &mut AgentCtx) -> Result<()> {
        for n in 0..self.fan_out {
            let handle = ctx
                .spawn_child(
                    "counter",
                    &format!("count (worker {n})"),
                    self.child_config.clone(),
                )
                .await?;
            info!(agent = %ctx.agent_id(), child = %handle.id, "spawned counter");
        }

        // idle until stopped; children are cascaded down by the runtime
        loop {
            ctx.check_pause().await;
            if ctx.is_cancelled() {
                return Ok(());
            }
            let cancelled = ctx.cancelled();
            tokio::select! {
                _ = cancelled.cancelled() => return Ok(()),
                _ = tokio::time::sleep(Duration::from_millis(DEFAULT_TICK_INTERVAL_MS)) => {}
            }
        }
    }
}

/// Writes one RESULT entry and exits; fails on demand when configured to
pub struct Oneshot {
    fail: bool,
}

#[async_trait]
impl Runnable for Oneshot {
    async fn run(&mut self, ctx: &mut AgentCtx) -> Result<()> {
        if self.fail {
            return Err(AviaryError::AgentFailed("oneshot configured to fail".into()));
        }
        ctx.memory().write(
            json!({ "output": ctx.goal() }),
            EntryType::Result,
            vec![],
        )?;
        Ok(())
    }
}

/// Registry with every built-in role registered
pub fn builtin_registry() -> AgentRegistry {
    let mut registry = AgentRegistry::new();
    registry.register_fn("counter", "counter", vec![], |_, config| {
        Ok(Box::new(Counter::from_config(config)))
    });
    registry.register_fn("fanout", "fanout", vec!["counter".into()], |_, config| {
        Ok(Box::new(Fanout::from_config(config)))
    });
    registry.register_fn("oneshot", "oneshot", vec![], |_, config| {
        Ok(Box::new(Oneshot {
            fail: config["fail"].as_bool().unwrap_or(false),
        }))
    });
    registry
}
