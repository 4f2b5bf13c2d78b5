// src/agent/mod.rs
//! The agent contract
//!
//! An agent is one unit of autonomous work: a `Runnable` run loop driven by
//! a dedicated worker process, observing pause/cancel/steer through the
//! `AgentCtx` handed to it. Agent code touches the store only through the
//! bound `MemoryView` and creates children only through the supervisor seam
//! (`Spawner`), never directly.

pub mod control;
pub mod info;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::agent::control::{ControlState, Steer};
use crate::agent::info::{AgentInfo, AgentStatus};
use crate::error::{AviaryError, Result};
use crate::ipc::{ChildSpec, Event};
use crate::memory::MemoryView;
use crate::store::{FileStore, Scope};
use crate::worker::registry::AgentRegistry;

/// A user-supplied agent run loop.
///
/// Implementations must be cooperative: call `ctx.check_pause()` between
/// units of work and exit promptly once `ctx.is_cancelled()` turns true.
/// Role metadata lives on the implementation's `AgentFactory`.
#[async_trait]
pub trait Runnable: Send {
    async fn run(&mut self, ctx: &mut AgentCtx) -> Result<()>;
}

/// Scope field overrides for a child spawn; `None` inherits from the parent
#[derive(Debug, Clone, Default)]
pub struct ScopeOverrides {
    pub session: Option<String>,
    pub sweep: Option<String>,
    pub run: Option<String>,
}

/// The seam through which an agent asks its owning supervisor to create or
/// stop agents. Workers go through a cross-process proxy; tests may supply
/// an in-process implementation.
#[async_trait]
pub trait Spawner: Send + Sync {
    async fn spawn_child(&self, spec: ChildSpec) -> Result<AgentInfo>;
    async fn request_stop(&self, agent_id: &str) -> Result<()>;
}

/// Everything an agent's run loop may touch
pub struct AgentCtx {
    info: Arc<Mutex<AgentInfo>>,
    control: Arc<ControlState>,
    memory: MemoryView,
    spawner: Arc<dyn Spawner>,
    registry: Arc<AgentRegistry>,
    allowed_child_roles: Vec<String>,
    events: mpsc::Sender<Event>,
    store: Arc<FileStore>,
}

impl AgentCtx {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        info: Arc<Mutex<AgentInfo>>,
        control: Arc<ControlState>,
        memory: MemoryView,
        spawner: Arc<dyn Spawner>,
        registry: Arc<AgentRegistry>,
        allowed_child_roles: Vec<String>,
        events: mpsc::Sender<Event>,
        store: Arc<FileStore>,
    ) -> Self {
        Self {
            info,
            control,
            memory,
            spawner,
            registry,
            allowed_child_roles,
            events,
            store,
        }
    }

    pub fn agent_id(&self) -> String {
        self.info.lock().id.clone()
    }

    pub fn goal(&self) -> String {
        self.info.lock().goal.clone()
    }

    pub fn config(&self) -> serde_json::Value {
        self.info.lock().config.clone()
    }

    pub fn scope(&self) -> Scope {
        self.info.lock().scope.clone()
    }

    /// The bound memory view; the only path from agent code to the store
    pub fn memory(&self) -> &MemoryView {
        &self.memory
    }

    /// Cooperative suspension point; see `ControlState::check_pause`
    pub async fn check_pause(&self) {
        self.control.check_pause().await;
    }

    /// Atomically read and clear the pending PRIORITY steer, if any
    pub fn consume_steer(&self) -> Option<Steer> {
        self.control.consume_steer()
    }

    pub fn is_cancelled(&self) -> bool {
        self.control.is_cancelled()
    }

    /// Cancellation token for use in select loops
    pub fn cancelled(&self) -> CancellationToken {
        self.control.cancellation_token()
    }

    /// Advance the iteration counter and report it to the supervisor.
    /// Returns the new counter value.
    pub fn tick(&self) -> u64 {
        let (agent_id, iteration) = {
            let mut info = self.info.lock();
            info.iteration += 1;
            (info.id.clone(), info.iteration)
        };
        let _ = self.events.try_send(Event::Iteration {
            agent_id,
            iteration,
        });
        iteration
    }

    /// Spawn a child agent inheriting this agent's scope
    pub async fn spawn_child(
        &mut self,
        agent_impl: &str,
        goal: &str,
        config: serde_json::Value,
    ) -> Result<ChildHandle> {
        self.spawn_child_scoped(agent_impl, goal, config, ScopeOverrides::default())
            .await
    }

    /// Spawn a child agent with explicit scope overrides. Rejected before
    /// the request leaves this process when the implementation's role is not
    /// in this agent's allowed child roles.
    pub async fn spawn_child_scoped(
        &mut self,
        agent_impl: &str,
        goal: &str,
        config: serde_json::Value,
        overrides: ScopeOverrides,
    ) -> Result<ChildHandle> {
        let factory = self.registry.resolve(agent_impl)?;
        let role = factory.role().to_string();
        if !self.allowed_child_roles.iter().any(|r| r == &role) {
            return Err(AviaryError::RoleNotAllowed {
                parent_role: self.info.lock().role.clone(),
                role,
            });
        }

        let spec = ChildSpec {
            parent_id: self.agent_id(),
            agent_impl: agent_impl.to_string(),
            goal: goal.to_string(),
            config,
            session: overrides.session,
            sweep: overrides.sweep,
            run: overrides.run,
            auto_start: true,
        };

        let child = self.spawner.spawn_child(spec).await?;
        debug!(child = %child.id, "child spawned");

        let snapshot = {
            let mut info = self.info.lock();
            info.children.push(child.id.clone());
            info.clone()
        };
        self.store.write_meta(&snapshot)?;

        Ok(ChildHandle {
            id: child.id,
            project: snapshot.scope.project,
            store: Arc::clone(&self.store),
            spawner: Arc::clone(&self.spawner),
        })
    }
}

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Caller-side reference to a spawned child. Observes the child through its
/// on-disk snapshot, so it works across process boundaries without IPC.
pub struct ChildHandle {
    pub id: String,
    project: String,
    store: Arc<FileStore>,
    spawner: Arc<dyn Spawner>,
}

impl std::fmt::Debug for ChildHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildHandle")
            .field("id", &self.id)
            .field("project", &self.project)
            .finish_non_exhaustive()
    }
}

impl ChildHandle {
    /// Current status from the child's on-disk snapshot
    pub fn status(&self) -> Result<AgentStatus> {
        self.store
            .read_agent_info(&self.project, &self.id)?
            .map(|info| info.status)
            .ok_or_else(|| AviaryError::AgentNotFound(self.id.clone()))
    }

    /// Wait until the child reaches a terminal state, polling its snapshot
    pub async fn wait(&self, timeout: Duration) -> Result<AgentInfo> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(info) = self.store.read_agent_info(&self.project, &self.id)? {
                if info.status.is_terminal() {
                    return Ok(info);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(AviaryError::WaitTimeout(self.id.clone()));
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    /// Ask the supervisor to stop the child (cascades to its descendants)
    pub async fn cancel(&self) -> Result<()> {
        self.spawner.request_stop(&self.id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    struct RecordingSpawner {
        store: Arc<FileStore>,
    }

    #[async_trait]
    impl Spawner for RecordingSpawner {
        async fn spawn_child(&self, spec: ChildSpec) -> Result<AgentInfo> {
            let scope = Scope {
                project: "proj".into(),
                session: spec.session,
                sweep: spec.sweep,
                run: spec.run,
                role: "counter".into(),
            };
            let info = AgentInfo {
                id: "counter-00000001".into(),
                role: "counter".into(),
                status: AgentStatus::Running,
                goal: spec.goal,
                config: spec.config,
                parent_id: Some(spec.parent_id),
                children: vec![],
                agent_impl: spec.agent_impl,
                iteration: 0,
                scope,
            };
            self.store.write_meta(&info)?;
            Ok(info)
        }

        async fn request_stop(&self, agent_id: &str) -> Result<()> {
            let mut info = self
                .store
                .read_agent_info("proj", agent_id)?
                .ok_or_else(|| AviaryError::AgentNotFound(agent_id.to_string()))?;
            info.status = AgentStatus::Done;
            self.store.write_meta(&info)
        }
    }

    struct Noop;

    #[async_trait]
    impl Runnable for Noop {
        async fn run(&mut self, _ctx: &mut AgentCtx) -> Result<()> {
            Ok(())
        }
    }

    fn test_ctx(
        store: Arc<FileStore>,
        allowed: Vec<String>,
    ) -> (AgentCtx, mpsc::Receiver<Event>) {
        let scope = Scope::project("proj", "orchestrator");
        let info = AgentInfo {
            id: "orchestrator-0000abcd".into(),
            role: "orchestrator".into(),
            status: AgentStatus::Running,
            goal: "coordinate".into(),
            config: json!({}),
            parent_id: None,
            children: vec![],
            agent_impl: "fanout".into(),
            iteration: 0,
            scope: scope.clone(),
        };

        let mut registry = AgentRegistry::new();
        registry.register_fn("counter", "counter", vec![], |_, _| Ok(Box::new(Noop)));

        let (events_tx, events_rx) = mpsc::channel(16);
        let memory = MemoryView::new(Arc::clone(&store), info.id.clone(), scope);
        let spawner = Arc::new(RecordingSpawner {
            store: Arc::clone(&store),
        });

        let ctx = AgentCtx::new(
            Arc::new(Mutex::new(info)),
            Arc::new(ControlState::new()),
            memory,
            spawner,
            Arc::new(registry),
            allowed,
            events_tx,
            store,
        );
        (ctx, events_rx)
    }

    #[tokio::test]
    async fn test_spawn_child_disallowed_role() {
        let dir = tempdir().unwrap();
        let store = Arc::new(FileStore::new(dir.path()).unwrap());
        let (mut ctx, _rx) = test_ctx(store, vec![]);

        let err = ctx
            .spawn_child("counter", "count", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, AviaryError::RoleNotAllowed { .. }));
    }

    #[tokio::test]
    async fn test_spawn_child_records_edge_and_waits() {
        let dir = tempdir().unwrap();
        let store = Arc::new(FileStore::new(dir.path()).unwrap());
        let (mut ctx, _rx) = test_ctx(Arc::clone(&store), vec!["counter".into()]);

        let handle = ctx.spawn_child("counter", "count", json!({})).await.unwrap();
        assert_eq!(handle.status().unwrap(), AgentStatus::Running);

        // parent meta now lists the child
        let parent = store
            .read_agent_info("proj", "orchestrator-0000abcd")
            .unwrap()
            .unwrap();
        assert_eq!(parent.children, vec![handle.id.clone()]);

        handle.cancel().await.unwrap();
        let info = handle.wait(Duration::from_secs(2)).await.unwrap();
        assert_eq!(info.status, AgentStatus::Done);
    }

    #[tokio::test]
    async fn test_tick_emits_iteration_events() {
        let dir = tempdir().unwrap();
        let store = Arc::new(FileStore::new(dir.path()).unwrap());
        let (ctx, mut rx) = test_ctx(store, vec![]);

        assert_eq!(ctx.tick(), 1);
        assert_eq!(ctx.tick(), 2);

        match rx.recv().await.unwrap() {
            Event::Iteration { iteration, .. } => assert_eq!(iteration, 1),
            other => panic!("unexpected event: {other:?}"),
        }
        match rx.recv().await.unwrap() {
            Event::Iteration { iteration, .. } => assert_eq!(iteration, 2),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_impl_rejected_before_spawner() {
        let dir = tempdir().unwrap();
        let store = Arc::new(FileStore::new(dir.path()).unwrap());
        let (mut ctx, _rx) = test_ctx(store, vec!["counter".into()]);

        let err = ctx.spawn_child("ghost", "g", json!({})).await.unwrap_err();
        assert!(matches!(err, AviaryError::UnknownImpl(_)));
    }
}
