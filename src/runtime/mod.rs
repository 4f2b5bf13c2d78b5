// src/runtime/mod.rs
//! The supervision runtime
//!
//! `Runtime` owns worker processes: it spawns one OS process per agent,
//! cascades stop/pause/resume down the parent-child tree, forwards PRIORITY
//! steers and turns CRITICAL steers into forced restarts, and runs a
//! watchdog that reconciles the in-memory view against the on-disk
//! snapshots. The in-memory `WorkerHandle` table is a cache; disk remains
//! the cross-process source of truth.

pub mod handle;

pub use handle::WorkerHandle;

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::json;
use tokio::io::AsyncRead;
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::control::SteerUrgency;
use crate::agent::info::{AgentInfo, AgentStatus};
use crate::config::RuntimeConfig;
use crate::error::{AviaryError, Result};
use crate::ipc::{ChildSpec, Command, Event, FrameReader, FrameWriter, WorkerSpec};
use crate::store::{Entry, EntryType, FileStore, Scope};
use crate::worker::registry::AgentRegistry;

/// Callback invoked by the watchdog for every RUNNING agent
pub type MonitorFn = Arc<dyn Fn(&AgentInfo) -> Result<()> + Send + Sync>;

const CMD_CHANNEL_CAPACITY: usize = 64;
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const KILL_WAIT: Duration = Duration::from_secs(2);

/// A request to create one new agent
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub agent_impl: String,
    pub goal: String,
    pub config: serde_json::Value,
    pub session: Option<String>,
    pub sweep: Option<String>,
    pub run: Option<String>,
    pub parent_id: Option<String>,
    pub auto_start: bool,
}

impl SpawnRequest {
    pub fn new(agent_impl: impl Into<String>, goal: impl Into<String>) -> Self {
        Self {
            agent_impl: agent_impl.into(),
            goal: goal.into(),
            config: json!({}),
            session: None,
            sweep: None,
            run: None,
            parent_id: None,
            auto_start: true,
        }
    }

    pub fn config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    pub fn session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    pub fn sweep(mut self, sweep: impl Into<String>) -> Self {
        self.sweep = Some(sweep.into());
        self
    }

    pub fn run(mut self, run: impl Into<String>) -> Self {
        self.run = Some(run.into());
        self
    }

    pub fn parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }
}

/// Supervisor for a tree of agent worker processes
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    config: RuntimeConfig,
    store: Arc<FileStore>,
    registry: Arc<AgentRegistry>,
    workers: DashMap<String, Arc<WorkerHandle>>,
    monitors: RwLock<Vec<MonitorFn>>,
    shutdown: CancellationToken,
}

impl Runtime {
    pub fn new(config: RuntimeConfig, registry: Arc<AgentRegistry>) -> Result<Self> {
        let store = Arc::new(FileStore::new(&config.store_root)?);
        let inner = Arc::new(RuntimeInner {
            config,
            store,
            registry,
            workers: DashMap::new(),
            monitors: RwLock::new(Vec::new()),
            shutdown: CancellationToken::new(),
        });

        if inner.config.watchdog_interval_ms > 0 {
            tokio::spawn(Arc::clone(&inner).watchdog_loop());
        }

        Ok(Self { inner })
    }

    /// The runtime's store, shared with every worker through the filesystem
    pub fn store(&self) -> Arc<FileStore> {
        Arc::clone(&self.inner.store)
    }

    /// Register a watchdog callback, invoked once per RUNNING agent per
    /// cycle; idle, paused and terminal agents are skipped
    pub fn add_monitor(&self, monitor: MonitorFn) {
        self.inner.monitors.write().push(monitor);
    }

    /// Spawn a new agent in its own worker process and return its initial
    /// snapshot
    pub async fn spawn(&self, request: SpawnRequest) -> Result<AgentInfo> {
        self.inner.spawn(request).await
    }

    /// Cascading stop: descendants first, then the agent itself. Sends STOP,
    /// waits out the grace period, SIGKILLs as a backstop.
    pub async fn stop(&self, agent_id: &str) -> Result<()> {
        self.inner.stop_cascade(agent_id).await
    }

    /// Cascading pause (agent plus all descendants)
    pub async fn pause(&self, agent_id: &str) -> Result<()> {
        self.inner
            .cascade_command(agent_id, Command::Pause, AgentStatus::Paused)
            .await
    }

    /// Cascading resume
    pub async fn resume(&self, agent_id: &str) -> Result<()> {
        self.inner
            .cascade_command(agent_id, Command::Resume, AgentStatus::Running)
            .await
    }

    /// Steer a running agent. Returns `false` when the agent is not alive.
    ///
    /// PRIORITY forwards the steer for cooperative consumption. CRITICAL
    /// stops the agent tree and respawns the same implementation in the same
    /// scope with the steer context appended to the goal; a checkpoint-free
    /// restart.
    pub async fn steer(
        &self,
        agent_id: &str,
        context: &str,
        urgency: SteerUrgency,
    ) -> Result<bool> {
        self.inner.steer(agent_id, context, urgency).await
    }

    /// Stop every tracked agent and clear the table. Store contents are
    /// left untouched.
    pub async fn shutdown(&self) -> Result<()> {
        info!("runtime shutting down");
        self.inner.shutdown.cancel();

        for root in self.inner.root_ids() {
            self.inner.stop_cascade(&root).await?;
        }

        // orphans whose parents were already gone
        let stragglers: Vec<String> = self
            .inner
            .workers
            .iter()
            .filter(|w| w.is_alive())
            .map(|w| w.key().clone())
            .collect();
        for id in stragglers {
            self.inner.stop_cascade(&id).await?;
        }

        self.inner.workers.clear();
        Ok(())
    }

    /// Cached snapshot for one agent. Only ids currently registered with
    /// this runtime resolve; agents removed from the table (replaced or
    /// shut down) are gone, even though their entries and `.meta.json`
    /// remain readable through the store.
    pub fn get_agent(&self, agent_id: &str) -> Option<AgentInfo> {
        self.inner.workers.get(agent_id).map(|w| w.info())
    }

    /// All non-terminal agents tracked by this runtime
    pub fn list_active(&self) -> Vec<AgentInfo> {
        let mut active: Vec<AgentInfo> = self
            .inner
            .workers
            .iter()
            .map(|w| w.info())
            .filter(|info| !info.status.is_terminal())
            .collect();
        active.sort_by(|a, b| a.id.cmp(&b.id));
        active
    }

    /// Root agents of the supervision tree; descend via `children` ids
    pub fn agent_tree(&self) -> Vec<AgentInfo> {
        let mut roots: Vec<AgentInfo> = self
            .inner
            .root_ids()
            .iter()
            .filter_map(|id| self.inner.workers.get(id).map(|w| w.info()))
            .collect();
        roots.sort_by(|a, b| a.id.cmp(&b.id));
        roots
    }
}

impl RuntimeInner {
    async fn spawn(self: &Arc<Self>, request: SpawnRequest) -> Result<AgentInfo> {
        let factory = self.registry.resolve(&request.agent_impl)?;
        let role = factory.role().to_string();

        let scope = match &request.parent_id {
            Some(parent_id) => {
                let parent_scope = self.scope_of(parent_id)?;
                Scope::child_of(
                    &parent_scope,
                    role.clone(),
                    request.session.clone(),
                    request.sweep.clone(),
                    request.run.clone(),
                )
            }
            None => Scope {
                project: self.config.project.clone(),
                session: request.session.clone(),
                sweep: request.sweep.clone(),
                run: request.run.clone(),
                role: role.clone(),
            },
        };

        let agent_id = format!("{}-{:08x}", role, rand::random::<u32>());
        let info = AgentInfo {
            id: agent_id.clone(),
            role,
            status: AgentStatus::Idle,
            goal: request.goal.clone(),
            config: request.config.clone(),
            parent_id: request.parent_id.clone(),
            children: Vec::new(),
            agent_impl: request.agent_impl.clone(),
            iteration: 0,
            scope: scope.clone(),
        };

        let worker_spec = WorkerSpec {
            agent_id: agent_id.clone(),
            agent_impl: request.agent_impl.clone(),
            goal: request.goal.clone(),
            config: request.config.clone(),
            scope: scope.clone(),
            parent_id: request.parent_id.clone(),
            store_root: self.config.store_root.clone(),
            // the runtime drives the start transition explicitly
            auto_start: false,
        };
        let spec_json = serde_json::to_string(&worker_spec)?;

        let mut child = tokio::process::Command::new(&self.config.worker_program)
            .arg("worker")
            .arg(&spec_json)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AviaryError::SpawnFailed(format!("worker launch failed: {e}")))?;

        let pid = child
            .id()
            .ok_or_else(|| AviaryError::SpawnFailed("worker exited before startup".into()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AviaryError::SpawnFailed("worker stdin not piped".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AviaryError::SpawnFailed("worker stdout not piped".into()))?;

        info!(agent = %agent_id, pid, agent_impl = %request.agent_impl, "worker spawned");

        let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(CMD_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let mut writer = FrameWriter::new(stdin);
            while let Some(cmd) = cmd_rx.recv().await {
                if writer.send(&cmd).await.is_err() {
                    break;
                }
            }
        });

        let handle = Arc::new(WorkerHandle::new(info.clone(), cmd_tx, pid));
        self.workers.insert(agent_id.clone(), Arc::clone(&handle));

        // record the parent -> child edge in the cached tree
        if let Some(parent_id) = &request.parent_id {
            if let Some(parent) = self.workers.get(parent_id) {
                parent.update_info(|i| i.children.push(agent_id.clone()));
            }
        }

        let spawn_record = Entry::new(
            &agent_id,
            &scope,
            EntryType::Context,
            json!({
                "message": "spawn requested",
                "agent_impl": request.agent_impl,
                "parent": request.parent_id,
            }),
            vec!["spawn".into()],
        );
        self.store.write(spawn_record, false)?;

        tokio::spawn(
            Arc::clone(self).event_pump(agent_id.clone(), FrameReader::new(stdout), child),
        );

        if request.auto_start {
            handle.send(Command::Start).await?;
        }

        Ok(info)
    }

    /// Ids whose parent is unknown to this runtime; snapshots the table
    /// first, DashMap does not allow reentrant access during iteration
    fn root_ids(&self) -> Vec<String> {
        let infos: Vec<AgentInfo> = self.workers.iter().map(|w| w.info()).collect();
        let ids: HashSet<&str> = infos.iter().map(|i| i.id.as_str()).collect();
        infos
            .iter()
            .filter(|info| {
                info.parent_id
                    .as_deref()
                    .map_or(true, |p| !ids.contains(p))
            })
            .map(|info| info.id.clone())
            .collect()
    }

    fn scope_of(&self, agent_id: &str) -> Result<Scope> {
        if let Some(handle) = self.workers.get(agent_id) {
            return Ok(handle.info().scope);
        }
        self.store
            .read_agent_info(&self.config.project, agent_id)?
            .map(|info| info.scope)
            .ok_or_else(|| AviaryError::AgentNotFound(agent_id.to_string()))
    }

    /// Drains one worker's event stream, then reconciles its exit
    async fn event_pump<R: AsyncRead + Unpin>(
        self: Arc<Self>,
        agent_id: String,
        mut events: FrameReader<R>,
        mut child: Child,
    ) {
        loop {
            match events.next::<Event>().await {
                Ok(Some(event)) => self.handle_event(&agent_id, event).await,
                Ok(None) => break,
                Err(e) => {
                    warn!(agent = %agent_id, error = %e, "event channel error");
                    break;
                }
            }
        }

        match child.wait().await {
            Ok(status) => debug!(agent = %agent_id, %status, "worker exited"),
            Err(e) => warn!(agent = %agent_id, error = %e, "worker wait failed"),
        }
        self.on_worker_exit(&agent_id);
    }

    async fn handle_event(self: &Arc<Self>, agent_id: &str, event: Event) {
        match event {
            Event::Started { info } => {
                debug!(agent = %agent_id, "worker started");
                if let Some(handle) = self.workers.get(agent_id) {
                    handle.update_info(|cached| {
                        cached.status = info.status;
                        cached.iteration = info.iteration;
                    });
                }
            }
            Event::Iteration { iteration, .. } => {
                if let Some(handle) = self.workers.get(agent_id) {
                    handle.update_info(|cached| cached.iteration = iteration);
                }
            }
            Event::Done { .. } => {
                if let Some(handle) = self.workers.get(agent_id) {
                    handle.update_info(|cached| cached.status = AgentStatus::Done);
                }
            }
            Event::Failed { error, .. } => {
                warn!(agent = %agent_id, %error, "agent failed");
                if let Some(handle) = self.workers.get(agent_id) {
                    handle.update_info(|cached| cached.status = AgentStatus::Failed);
                }
            }
            Event::LogEntry { level, message, .. } => match level.as_str() {
                "error" => error!(agent = %agent_id, "{message}"),
                "warn" => warn!(agent = %agent_id, "{message}"),
                _ => info!(agent = %agent_id, "{message}"),
            },
            Event::SpawnRequest {
                correlation_id,
                spec,
            } => {
                let result = self
                    .spawn_for_child(spec)
                    .await
                    .map_err(|e| e.to_string());
                if let Some(handle) = self.workers.get(agent_id) {
                    let _ = handle
                        .send(Command::SpawnResponse {
                            correlation_id,
                            result,
                        })
                        .await;
                }
            }
            Event::StopRequest { agent_id: target } => {
                // detach so a slow stop never stalls this worker's event pump
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = inner.stop_cascade(&target).await {
                        warn!(agent = %target, error = %e, "requested stop failed");
                    }
                });
            }
        }
    }

    /// Boxed to break the `spawn` -> `event_pump` -> `handle_event` ->
    /// `spawn` async cycle; without the type erasure the pump future has no
    /// finite type
    fn spawn_for_child(
        self: &Arc<Self>,
        spec: ChildSpec,
    ) -> Pin<Box<dyn Future<Output = Result<AgentInfo>> + Send>> {
        let this = Arc::clone(self);
        Box::pin(async move {
            this.spawn(SpawnRequest {
                agent_impl: spec.agent_impl,
                goal: spec.goal,
                config: spec.config,
                session: spec.session,
                sweep: spec.sweep,
                run: spec.run,
                parent_id: Some(spec.parent_id),
                auto_start: spec.auto_start,
            })
            .await
        })
    }

    /// Children strictly before parents: reversed pre-order of the cached
    /// tree rooted at `agent_id`
    fn stop_order(&self, agent_id: &str) -> Vec<String> {
        let mut order = Vec::new();
        let mut stack = vec![agent_id.to_string()];
        let mut seen = HashSet::new();
        while let Some(id) = stack.pop() {
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(handle) = self.workers.get(&id) {
                stack.extend(handle.info().children);
            }
            order.push(id);
        }
        order.reverse();
        order
    }

    async fn stop_cascade(&self, agent_id: &str) -> Result<()> {
        for id in self.stop_order(agent_id) {
            self.stop_one(&id).await;
        }
        Ok(())
    }

    /// Stop one worker: STOP, grace period, SIGKILL backstop. A missing or
    /// already-dead worker is a no-op.
    async fn stop_one(&self, agent_id: &str) {
        let handle = match self.workers.get(agent_id) {
            Some(h) => Arc::clone(&h),
            None => return,
        };
        if !handle.is_alive() {
            return;
        }

        info!(agent = %agent_id, "stopping");
        handle.mark_stopping();
        let _ = handle.send(Command::Stop).await;

        let grace = Duration::from_millis(self.config.stop_grace_ms);
        if !wait_for_death(&handle, grace).await {
            warn!(agent = %agent_id, "grace period expired, killing worker");
            handle.kill();
            wait_for_death(&handle, KILL_WAIT).await;
        }
    }

    async fn cascade_command(
        &self,
        agent_id: &str,
        cmd: Command,
        cached_status: AgentStatus,
    ) -> Result<()> {
        if !self.workers.contains_key(agent_id) {
            return Err(AviaryError::AgentNotFound(agent_id.to_string()));
        }
        let mut order = self.stop_order(agent_id);
        order.reverse(); // parent first for pause/resume
        for id in order {
            if let Some(handle) = self.workers.get(&id) {
                if !handle.is_alive() {
                    continue;
                }
                if handle.send(cmd.clone()).await.is_ok() {
                    // mirror the worker's state machine: PAUSED only from
                    // RUNNING and back, never from IDLE or a terminal state
                    handle.update_info(|info| {
                        let applies = match cached_status {
                            AgentStatus::Paused => info.status == AgentStatus::Running,
                            AgentStatus::Running => info.status == AgentStatus::Paused,
                            _ => false,
                        };
                        if applies {
                            info.status = cached_status;
                        }
                    });
                }
            }
        }
        Ok(())
    }

    async fn steer(
        self: &Arc<Self>,
        agent_id: &str,
        context: &str,
        urgency: SteerUrgency,
    ) -> Result<bool> {
        let handle = match self.workers.get(agent_id) {
            Some(h) => Arc::clone(&h),
            // unknown and removed ids read the same as dead ones
            None => return Ok(false),
        };
        if !handle.is_alive() || handle.info().status.is_terminal() {
            return Ok(false);
        }

        match urgency {
            SteerUrgency::Priority => {
                handle
                    .send(Command::Steer {
                        context: context.to_string(),
                        urgency,
                    })
                    .await?;
                Ok(true)
            }
            SteerUrgency::Critical => {
                let old = handle.info();
                info!(agent = %agent_id, "critical steer: replacing agent");

                self.stop_cascade(agent_id).await?;
                self.workers.remove(agent_id);
                if let Some(parent_id) = &old.parent_id {
                    if let Some(parent) = self.workers.get(parent_id) {
                        parent.update_info(|i| i.children.retain(|c| c != agent_id));
                    }
                }

                let replacement = self
                    .spawn(SpawnRequest {
                        agent_impl: old.agent_impl,
                        goal: format!("{}\n\n{}", old.goal, context),
                        config: old.config,
                        session: old.scope.session,
                        sweep: old.scope.sweep,
                        run: old.scope.run,
                        parent_id: old.parent_id,
                        auto_start: true,
                    })
                    .await?;
                info!(old = %agent_id, new = %replacement.id, "agent replaced");
                Ok(true)
            }
        }
    }

    /// Reconcile a worker exit against its on-disk snapshot. A dead process
    /// with a non-terminal snapshot is recorded as FAILED (or DONE when the
    /// runtime asked it to stop).
    fn on_worker_exit(&self, agent_id: &str) {
        let handle = match self.workers.get(agent_id) {
            Some(h) => Arc::clone(&h),
            None => return,
        };
        handle.mark_dead();

        let disk = self
            .store
            .read_agent_info(&self.config.project, agent_id)
            .unwrap_or_default();
        match disk {
            Some(info) if info.status.is_terminal() => {
                handle.update_info(|cached| {
                    cached.status = info.status;
                    cached.iteration = info.iteration;
                });
            }
            disk => {
                let terminal = if handle.is_stopping() {
                    AgentStatus::Done
                } else {
                    warn!(agent = %agent_id, "worker died without a terminal snapshot");
                    AgentStatus::Failed
                };
                handle.update_info(|cached| cached.status = terminal);
                let mut info = disk.unwrap_or_else(|| handle.info());
                info.status = terminal;
                if let Err(e) = self.store.write_meta(&info) {
                    error!(agent = %agent_id, error = %e, "failed to reconcile snapshot");
                }
            }
        }
    }

    async fn watchdog_loop(self: Arc<Self>) {
        let period = Duration::from_millis(self.config.watchdog_interval_ms);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }
            self.watchdog_cycle();
        }
    }

    fn watchdog_cycle(&self) {
        let monitors = self.monitors.read().clone();
        let live: Vec<Arc<WorkerHandle>> = self
            .workers
            .iter()
            .filter(|w| w.is_alive())
            .map(|w| Arc::clone(&w))
            .collect();

        for handle in &live {
            let info = handle.info();
            if !handle.process_running() {
                warn!(agent = %info.id, "watchdog: worker process is gone");
                self.on_worker_exit(&info.id);
                continue;
            }
            // disk may be ahead of the event stream
            if let Ok(Some(disk)) = self.store.read_agent_info(&self.config.project, &info.id) {
                if disk.status.is_terminal() && !info.status.is_terminal() {
                    handle.update_info(|cached| {
                        cached.status = disk.status;
                        cached.iteration = disk.iteration;
                    });
                }
            }

            let snapshot = handle.info();
            if snapshot.status != AgentStatus::Running {
                continue;
            }
            for monitor in &monitors {
                if let Err(e) = monitor(&snapshot) {
                    warn!(agent = %snapshot.id, error = %e, "monitor callback failed");
                }
            }
        }
    }
}

async fn wait_for_death(handle: &WorkerHandle, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if !handle.is_alive() {
            return true;
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }
    !handle.is_alive()
}
