// src/agent/control.rs
//! In-memory control state shared between an agent's run loop and the
//! worker's command listener
//!
//! Holds the pause flag, the cancellation token and the single-slot steer
//! buffer. The steer slot is last-write-wins: a new steer silently
//! supersedes an unconsumed one.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::agent::info::AgentStatus;

/// Steering urgency. PRIORITY steers are consumed cooperatively by the
/// agent; CRITICAL steers never reach the agent and are intercepted by the
/// runtime, which restarts the agent with an amended goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SteerUrgency {
    Priority,
    Critical,
}

/// A pending redirection message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Steer {
    pub context: String,
    pub urgency: SteerUrgency,
    pub timestamp: DateTime<Utc>,
}

impl Steer {
    pub fn new(context: impl Into<String>, urgency: SteerUrgency) -> Self {
        Self {
            context: context.into(),
            urgency,
            timestamp: Utc::now(),
        }
    }
}

/// Shared control state for one agent
pub struct ControlState {
    status: RwLock<AgentStatus>,
    paused_tx: watch::Sender<bool>,
    paused_rx: watch::Receiver<bool>,
    started_tx: watch::Sender<bool>,
    started_rx: watch::Receiver<bool>,
    cancel: CancellationToken,
    steer: Mutex<Option<Steer>>,
}

impl ControlState {
    pub fn new() -> Self {
        let (paused_tx, paused_rx) = watch::channel(false);
        let (started_tx, started_rx) = watch::channel(false);
        Self {
            status: RwLock::new(AgentStatus::Idle),
            paused_tx,
            paused_rx,
            started_tx,
            started_rx,
            cancel: CancellationToken::new(),
            steer: Mutex::new(None),
        }
    }

    pub fn status(&self) -> AgentStatus {
        *self.status.read()
    }

    /// Set the status; terminal states are sticky and never overwritten
    pub fn set_status(&self, status: AgentStatus) {
        let mut current = self.status.write();
        if !current.is_terminal() {
            *current = status;
        }
    }

    pub fn mark_started(&self) {
        let _ = self.started_tx.send(true);
    }

    /// Wait until the start command arrives or the agent is cancelled
    pub async fn wait_started(&self) {
        let mut rx = self.started_rx.clone();
        loop {
            if *rx.borrow() || self.cancel.is_cancelled() {
                return;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }

    pub fn pause(&self) {
        let _ = self.paused_tx.send(true);
    }

    pub fn resume(&self) {
        let _ = self.paused_tx.send(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused_rx.borrow()
    }

    /// Cooperative suspension point: waits while paused, waking on resume or
    /// cancellation. Run loops must call this between units of work.
    pub async fn check_pause(&self) {
        let mut rx = self.paused_rx.clone();
        loop {
            if !*rx.borrow() || self.cancel.is_cancelled() {
                return;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// Replace any pending steer (last-write-wins, by design)
    pub fn put_steer(&self, steer: Steer) {
        *self.steer.lock() = Some(steer);
    }

    /// Atomically read and clear the pending steer
    pub fn consume_steer(&self) -> Option<Steer> {
        self.steer.lock().take()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token observed by every suspension point; cloned into select loops
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Default for ControlState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_steer_slot_last_write_wins() {
        let control = ControlState::new();
        control.put_steer(Steer::new("first", SteerUrgency::Priority));
        control.put_steer(Steer::new("second", SteerUrgency::Priority));

        let steer = control.consume_steer().unwrap();
        assert_eq!(steer.context, "second");
        assert!(control.consume_steer().is_none());
    }

    #[test]
    fn test_terminal_status_sticky() {
        let control = ControlState::new();
        control.set_status(AgentStatus::Running);
        control.set_status(AgentStatus::Done);
        control.set_status(AgentStatus::Running);
        assert_eq!(control.status(), AgentStatus::Done);
    }

    #[tokio::test]
    async fn test_check_pause_returns_when_not_paused() {
        let control = ControlState::new();
        tokio::time::timeout(Duration::from_millis(50), control.check_pause())
            .await
            .expect("check_pause must return immediately when not paused");
    }

    #[tokio::test]
    async fn test_check_pause_blocks_until_resume() {
        let control = Arc::new(ControlState::new());
        control.pause();

        let waiter = Arc::clone(&control);
        let task = tokio::spawn(async move { waiter.check_pause().await });

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!task.is_finished());

        control.resume();
        tokio::time::timeout(Duration::from_millis(100), task)
            .await
            .expect("resume must wake the waiter")
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancel_wakes_paused_waiter() {
        let control = Arc::new(ControlState::new());
        control.pause();

        let waiter = Arc::clone(&control);
        let task = tokio::spawn(async move { waiter.check_pause().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        control.cancel();
        tokio::time::timeout(Duration::from_millis(100), task)
            .await
            .expect("cancel must wake the waiter")
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_started() {
        let control = Arc::new(ControlState::new());
        let waiter = Arc::clone(&control);
        let task = tokio::spawn(async move { waiter.wait_started().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!task.is_finished());

        control.mark_started();
        tokio::time::timeout(Duration::from_millis(100), task)
            .await
            .expect("start must wake the waiter")
            .unwrap();
    }
}
