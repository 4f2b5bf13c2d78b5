// src/store/mod.rs
//! Durable entry store
//!
//! One JSON file per entry under `{root}/{project}/{agent_id}/`, plus one
//! `.meta.json` snapshot per agent. Writes are temp-file-then-atomic-rename,
//! so the tree is safe under concurrent multi-process access without locks.

pub mod entry;
pub mod file_store;

pub use entry::{Entry, EntryFilter, EntryType, Order, Scope};
pub use file_store::FileStore;
