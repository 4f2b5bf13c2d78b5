// src/runtime/handle.rs
//! Supervisor-side handle to one live worker process

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::agent::info::{AgentInfo, AgentStatus, AgentView};
use crate::error::{AviaryError, Result};
use crate::ipc::Command;

/// One spawned worker as the runtime sees it: a cached `AgentInfo` snapshot
/// refreshed from IPC events, the command channel into the process, and the
/// liveness flags the stop path and watchdog coordinate through.
pub struct WorkerHandle {
    id: String,
    info: RwLock<AgentInfo>,
    cmd_tx: mpsc::Sender<Command>,
    pid: u32,
    alive: AtomicBool,
    /// Set before STOP is sent so exit reconciliation records DONE rather
    /// than FAILED for a worker we asked to die
    stopping: AtomicBool,
}

impl WorkerHandle {
    pub(crate) fn new(info: AgentInfo, cmd_tx: mpsc::Sender<Command>, pid: u32) -> Self {
        Self {
            id: info.id.clone(),
            info: RwLock::new(info),
            cmd_tx,
            pid,
            alive: AtomicBool::new(true),
            stopping: AtomicBool::new(false),
        }
    }

    /// Current cached snapshot
    pub fn info(&self) -> AgentInfo {
        self.info.read().clone()
    }

    pub(crate) fn update_info(&self, f: impl FnOnce(&mut AgentInfo)) {
        f(&mut self.info.write());
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub(crate) fn mark_dead(&self) {
        self.alive.store(false, Ordering::Release);
    }

    pub(crate) fn mark_stopping(&self) {
        self.stopping.store(true, Ordering::Release);
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Send a command down the worker's stdin channel
    pub(crate) async fn send(&self, cmd: Command) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| AviaryError::ChannelClosed)
    }

    /// True while the worker process exists, checked with a null signal
    pub(crate) fn process_running(&self) -> bool {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        kill(Pid::from_raw(self.pid as i32), None).is_ok()
    }

    /// SIGKILL backstop for workers that ignore STOP past the grace period
    pub(crate) fn kill(&self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        debug!(agent = %self.id, pid = self.pid, "sending SIGKILL");
        if let Err(e) = kill(Pid::from_raw(self.pid as i32), Signal::SIGKILL) {
            // ESRCH just means it already exited
            if e != nix::errno::Errno::ESRCH {
                warn!(agent = %self.id, pid = self.pid, error = %e, "SIGKILL failed");
            }
        }
    }
}

impl AgentView for WorkerHandle {
    fn id(&self) -> &str {
        &self.id
    }

    fn status(&self) -> AgentStatus {
        self.info.read().status
    }

    fn iteration(&self) -> u64 {
        self.info.read().iteration
    }
}
