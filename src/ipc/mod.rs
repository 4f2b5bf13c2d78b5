// src/ipc/mod.rs
//! Inter-process command/event protocol
//!
//! The supervisor and each worker communicate over two one-directional
//! channels: commands flow supervisor -> worker on the worker's stdin,
//! events flow worker -> supervisor on its stdout. Frames are single-line
//! JSON (serde-tagged enums), newline-delimited.

use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tracing::warn;

use crate::agent::control::SteerUrgency;
use crate::agent::info::AgentInfo;
use crate::error::Result;
use crate::store::entry::Scope;

/// Supervisor -> worker commands
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    Start,
    Stop,
    Pause,
    Resume,
    Steer {
        context: String,
        urgency: SteerUrgency,
    },
    SpawnResponse {
        correlation_id: String,
        result: std::result::Result<AgentInfo, String>,
    },
}

/// Worker -> supervisor events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    Started {
        info: AgentInfo,
    },
    SpawnRequest {
        correlation_id: String,
        spec: ChildSpec,
    },
    StopRequest {
        agent_id: String,
    },
    Iteration {
        agent_id: String,
        iteration: u64,
    },
    LogEntry {
        agent_id: String,
        level: String,
        message: String,
    },
    Done {
        agent_id: String,
    },
    Failed {
        agent_id: String,
        error: String,
    },
}

/// A worker's request to create a new agent under its own scope. Scope
/// fields left as `None` are inherited from the parent; `Some` overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildSpec {
    pub parent_id: String,
    pub agent_impl: String,
    pub goal: String,
    pub config: serde_json::Value,
    pub session: Option<String>,
    pub sweep: Option<String>,
    pub run: Option<String>,
    pub auto_start: bool,
}

/// Everything a freshly spawned worker process needs to bootstrap itself.
/// Passed as a single JSON argument to `aviary worker`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub agent_id: String,
    pub agent_impl: String,
    pub goal: String,
    pub config: serde_json::Value,
    pub scope: Scope,
    pub parent_id: Option<String>,
    pub store_root: PathBuf,
    pub auto_start: bool,
}

/// Newline-delimited JSON frame writer over any async byte sink
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn send<T: Serialize>(&mut self, frame: &T) -> Result<()> {
        let mut line = serde_json::to_vec(frame)?;
        line.push(b'\n');
        self.inner.write_all(&line).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

/// Newline-delimited JSON frame reader over any async byte source.
/// Unparseable lines are skipped with a warning rather than tearing the
/// channel down.
pub struct FrameReader<R> {
    lines: Lines<BufReader<R>>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            lines: BufReader::new(inner).lines(),
        }
    }

    /// Next frame, or `None` once the channel is closed
    pub async fn next<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        loop {
            match self.lines.next_line().await? {
                None => return Ok(None),
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => match serde_json::from_str(&line) {
                    Ok(frame) => return Ok(Some(frame)),
                    Err(e) => {
                        warn!(error = %e, "skipping malformed frame");
                        continue;
                    }
                },
            }
        }
    }
}
