// src/agent/info.rs
//! Read-only agent projections
//!
//! `AgentInfo` is the per-agent snapshot persisted as `.meta.json` and
//! returned by registry queries. It implements the same observation
//! interface live worker handles implement, so watchdog logic is written
//! once against `AgentView` and works on both.

use serde::{Deserialize, Serialize};

use crate::store::entry::Scope;

/// Lifecycle state of an agent.
///
/// IDLE -> RUNNING <-> PAUSED -> {DONE, FAILED}; terminal states are sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Idle,
    Running,
    Paused,
    Done,
    Failed,
}

impl AgentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentStatus::Done | AgentStatus::Failed)
    }
}

/// Read-only projection of one agent, persisted as `.meta.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: String,
    pub role: String,
    pub status: AgentStatus,
    pub goal: String,
    pub config: serde_json::Value,
    pub parent_id: Option<String>,
    pub children: Vec<String>,
    /// Registry key of the implementation; agents are constructed from this
    /// key at worker start, never passed by reference across processes
    pub agent_impl: String,
    pub iteration: u64,
    pub scope: Scope,
}

/// Observation interface satisfied by both on-disk snapshots and live
/// worker handles
pub trait AgentView {
    fn id(&self) -> &str;
    fn status(&self) -> AgentStatus;
    fn iteration(&self) -> u64;
}

impl AgentView for AgentInfo {
    fn id(&self) -> &str {
        &self.id
    }

    fn status(&self) -> AgentStatus {
        self.status
    }

    fn iteration(&self) -> u64 {
        self.iteration
    }
}
