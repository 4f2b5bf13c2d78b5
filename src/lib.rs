// src/lib.rs
//! Aviary: process-isolated agent supervision runtime
//!
//! Every agent runs in its own worker process and is supervised over a
//! newline-delimited JSON command/event channel. Agents persist everything
//! through a durable, queryable file store scoped by
//! project/session/sweep/run, and are steered through a bounded in-memory
//! channel: PRIORITY steers are consumed cooperatively, CRITICAL steers
//! force a restart with an amended goal.
//!
//! The crate is structured into:
//!
//! - **store**: durable Entry store (`FileStore`) and query filters
//! - **memory**: per-agent scoped facade over the store (`MemoryView`)
//! - **agent**: the `Runnable` contract, control state, and `AgentCtx`
//! - **ipc**: the command/event wire protocol and frame codecs
//! - **worker**: worker-process bootstrap and the agent registry
//! - **runtime**: the supervisor (`Runtime`) with cascading control and a
//!   watchdog
//! - **roles**: built-in example roles registered in the shipped binary

pub mod agent;
pub mod config;
pub mod error;
pub mod ipc;
pub mod memory;
pub mod observability;
pub mod roles;
pub mod runtime;
pub mod store;
pub mod worker;

// Re-export commonly used types
pub use agent::control::{ControlState, Steer, SteerUrgency};
pub use agent::info::{AgentInfo, AgentStatus, AgentView};
pub use agent::{AgentCtx, ChildHandle, Runnable, ScopeOverrides, Spawner};
pub use config::RuntimeConfig;
pub use error::{AviaryError, Result};
pub use memory::MemoryView;
pub use runtime::{Runtime, SpawnRequest, WorkerHandle};
pub use store::{Entry, EntryFilter, EntryType, FileStore, Order, Scope};
pub use worker::registry::{AgentFactory, AgentRegistry};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
