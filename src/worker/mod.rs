// src/worker/mod.rs
//! Worker process bootstrap
//!
//! Each worker process hosts exactly one agent. The bootstrap resolves the
//! implementation from the string-keyed registry, wires up store + memory
//! view + supervisor proxy, runs the agent to completion and writes a final
//! `.meta.json` snapshot unconditionally (even after an unhandled panic),
//! so on-disk state is never stale relative to the true terminal state.

pub mod registry;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};
use ulid::Ulid;

use crate::agent::control::{ControlState, Steer, SteerUrgency};
use crate::agent::info::{AgentInfo, AgentStatus};
use crate::agent::{AgentCtx, Spawner};
use crate::error::{AviaryError, Result};
use crate::ipc::{ChildSpec, Command, Event, FrameReader, FrameWriter, WorkerSpec};
use crate::memory::MemoryView;
use crate::store::{EntryType, FileStore};
use crate::worker::registry::AgentRegistry;

/// How long a spawn request may stay unanswered before failing loudly
const SPAWN_TIMEOUT: Duration = Duration::from_secs(30);

const EVENT_CHANNEL_CAPACITY: usize = 256;

type SpawnReply = std::result::Result<AgentInfo, String>;
type PendingSpawns = Arc<DashMap<String, oneshot::Sender<SpawnReply>>>;

/// Cross-process supervisor proxy handed to the agent.
///
/// A worker cannot create a sibling process directly: spawns are emitted as
/// correlated SPAWN_REQUEST events and resolved by the command listener on
/// the matching SPAWN_RESPONSE.
pub struct WorkerProxy {
    events: mpsc::Sender<Event>,
    pending: PendingSpawns,
}

#[async_trait]
impl Spawner for WorkerProxy {
    async fn spawn_child(&self, spec: ChildSpec) -> Result<AgentInfo> {
        let correlation_id = Ulid::new().to_string();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.insert(correlation_id.clone(), reply_tx);

        self.events
            .send(Event::SpawnRequest {
                correlation_id: correlation_id.clone(),
                spec,
            })
            .await
            .map_err(|_| AviaryError::ChannelClosed)?;

        match tokio::time::timeout(SPAWN_TIMEOUT, reply_rx).await {
            Err(_) => {
                // An unanswered request is a detectable bug, not a silent
                // deadlock.
                self.pending.remove(&correlation_id);
                Err(AviaryError::SpawnTimeout(SPAWN_TIMEOUT))
            }
            Ok(Err(_)) => Err(AviaryError::ChannelClosed),
            Ok(Ok(Ok(info))) => Ok(info),
            Ok(Ok(Err(message))) => Err(AviaryError::SpawnFailed(message)),
        }
    }

    async fn request_stop(&self, agent_id: &str) -> Result<()> {
        self.events
            .send(Event::StopRequest {
                agent_id: agent_id.to_string(),
            })
            .await
            .map_err(|_| AviaryError::ChannelClosed)
    }
}

/// Run the worker bootstrap over the process's stdio channels
pub async fn run_worker(registry: Arc<AgentRegistry>, spec: WorkerSpec) -> Result<()> {
    run_worker_io(registry, spec, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Worker bootstrap over arbitrary command/event channels
pub async fn run_worker_io<R, W>(
    registry: Arc<AgentRegistry>,
    spec: WorkerSpec,
    cmd_in: R,
    event_out: W,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let store = Arc::new(FileStore::new(&spec.store_root)?);
    let factory = registry.resolve(&spec.agent_impl)?;
    let mut runnable = factory.build(&spec.goal, &spec.config)?;

    let control = Arc::new(ControlState::new());
    let info = Arc::new(Mutex::new(AgentInfo {
        id: spec.agent_id.clone(),
        role: factory.role().to_string(),
        status: AgentStatus::Idle,
        goal: spec.goal.clone(),
        config: spec.config.clone(),
        parent_id: spec.parent_id.clone(),
        children: Vec::new(),
        agent_impl: spec.agent_impl.clone(),
        iteration: 0,
        scope: spec.scope.clone(),
    }));

    persist_snapshot(&store, &info, &control);

    let memory = MemoryView::new(Arc::clone(&store), spec.agent_id.clone(), spec.scope.clone());
    memory.write(
        json!({ "message": "spawned", "goal": spec.goal }),
        EntryType::Context,
        vec!["spawned".into()],
    )?;

    // Event channel: a single writer task owns the outbound byte stream.
    let (event_tx, mut event_rx) = mpsc::channel::<Event>(EVENT_CHANNEL_CAPACITY);
    let writer_task = tokio::spawn(async move {
        let mut writer = FrameWriter::new(event_out);
        while let Some(event) = event_rx.recv().await {
            if writer.send(&event).await.is_err() {
                break;
            }
        }
    });

    let pending: PendingSpawns = Arc::new(DashMap::new());
    let listener_task = tokio::spawn(command_listener(
        FrameReader::new(cmd_in),
        Arc::clone(&control),
        Arc::clone(&info),
        Arc::clone(&store),
        Arc::clone(&pending),
    ));

    let started_info = info.lock().clone();
    event_tx
        .send(Event::Started { info: started_info })
        .await
        .map_err(|_| AviaryError::ChannelClosed)?;

    if spec.auto_start {
        control.mark_started();
    }
    control.wait_started().await;

    let outcome = if control.is_cancelled() {
        // stopped before it ever ran
        Ok(Ok(()))
    } else {
        control.set_status(AgentStatus::Running);
        persist_snapshot(&store, &info, &control);
        info!(agent = %spec.agent_id, "agent running");

        // Report the IDLE -> RUNNING transition so the supervisor's cache
        // tracks it without waiting on a disk read.
        let running_info = info.lock().clone();
        event_tx
            .send(Event::Started { info: running_info })
            .await
            .map_err(|_| AviaryError::ChannelClosed)?;

        let proxy: Arc<dyn Spawner> = Arc::new(WorkerProxy {
            events: event_tx.clone(),
            pending: Arc::clone(&pending),
        });
        let mut ctx = AgentCtx::new(
            Arc::clone(&info),
            Arc::clone(&control),
            memory,
            proxy,
            registry,
            factory.allowed_child_roles(),
            event_tx.clone(),
            Arc::clone(&store),
        );

        // Run inside a task so a panicking run loop is caught exactly once
        // here instead of tearing the bootstrap down.
        tokio::spawn(async move { runnable.run(&mut ctx).await }).await
    };

    let failure = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(join_err) => Some(match join_err.try_into_panic() {
            Ok(payload) => panic_message(payload),
            Err(e) => format!("run task aborted: {e}"),
        }),
    };

    let terminal = match &failure {
        Some(message) => {
            record_failure(&store, &spec, message.clone());
            AgentStatus::Failed
        }
        None => AgentStatus::Done,
    };
    control.set_status(terminal);

    // Final snapshot, written unconditionally: the store must reflect the
    // true terminal state even with no live listener.
    persist_snapshot(&store, &info, &control);

    let event = match failure {
        Some(error) => Event::Failed {
            agent_id: spec.agent_id.clone(),
            error,
        },
        None => Event::Done {
            agent_id: spec.agent_id.clone(),
        },
    };
    let _ = event_tx.send(event).await;

    drop(event_tx);
    let _ = writer_task.await;
    listener_task.abort();

    info!(agent = %spec.agent_id, status = ?terminal, "worker exiting");
    Ok(())
}

/// Background command listener: applies lifecycle commands to the local
/// control state and resolves pending spawn correlations. STEER writes
/// straight into the in-memory steer buffer; the store is bypassed on the
/// hot interrupt path.
async fn command_listener<R: AsyncRead + Unpin>(
    mut reader: FrameReader<R>,
    control: Arc<ControlState>,
    info: Arc<Mutex<AgentInfo>>,
    store: Arc<FileStore>,
    pending: PendingSpawns,
) {
    loop {
        let cmd = match reader.next::<Command>().await {
            Ok(Some(cmd)) => cmd,
            Ok(None) => {
                // Supervisor went away; there is nothing left to run for.
                warn!("command channel closed, cancelling agent");
                control.mark_started();
                control.cancel();
                return;
            }
            Err(e) => {
                warn!(error = %e, "command channel error, cancelling agent");
                control.mark_started();
                control.cancel();
                return;
            }
        };

        match cmd {
            Command::Start => control.mark_started(),
            Command::Stop => {
                control.mark_started();
                control.cancel();
            }
            Command::Pause => {
                // PAUSED is only reachable from RUNNING; a pause before the
                // run loop starts (or after it ends) is dropped.
                if control.status() == AgentStatus::Running {
                    control.pause();
                    control.set_status(AgentStatus::Paused);
                    persist_snapshot(&store, &info, &control);
                }
            }
            Command::Resume => {
                control.resume();
                if control.status() == AgentStatus::Paused {
                    control.set_status(AgentStatus::Running);
                    persist_snapshot(&store, &info, &control);
                }
            }
            Command::Steer { context, urgency } => match urgency {
                SteerUrgency::Priority => {
                    control.put_steer(Steer::new(context, SteerUrgency::Priority));
                }
                SteerUrgency::Critical => {
                    // CRITICAL steers are intercepted by the runtime and must
                    // never reach a worker.
                    warn!("ignoring CRITICAL steer delivered to worker");
                }
            },
            Command::SpawnResponse {
                correlation_id,
                result,
            } => {
                if let Some((_, reply_tx)) = pending.remove(&correlation_id) {
                    let _ = reply_tx.send(result);
                } else {
                    warn!(correlation_id = %correlation_id, "spawn response without pending request");
                }
            }
        }
    }
}

/// Copy the control status into the shared snapshot and rewrite
/// `.meta.json`. Persistence failures are logged, never fatal.
fn persist_snapshot(store: &FileStore, info: &Mutex<AgentInfo>, control: &ControlState) {
    let snapshot = {
        let mut info = info.lock();
        info.status = control.status();
        info.clone()
    };
    if let Err(e) = store.write_meta(&snapshot) {
        error!(agent = %snapshot.id, error = %e, "failed to write agent snapshot");
    }
}

fn record_failure(store: &Arc<FileStore>, spec: &WorkerSpec, message: String) {
    error!(agent = %spec.agent_id, error = %message, "agent run failed");
    let memory = MemoryView::new(
        Arc::clone(store),
        spec.agent_id.clone(),
        spec.scope.clone(),
    );
    if let Err(e) = memory.write(
        json!({ "error": message }),
        EntryType::Alert,
        vec!["error".into()],
    ) {
        error!(agent = %spec.agent_id, error = %e, "failed to record failure entry");
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("run loop panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("run loop panicked: {s}")
    } else {
        "run loop panicked".to_string()
    }
}
