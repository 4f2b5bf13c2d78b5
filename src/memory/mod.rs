// src/memory/mod.rs
//! Scoped memory facade
//!
//! `MemoryView` is the only interface ordinary agent code uses to touch the
//! store. It binds one fixed agent identity and scope, auto-filling both on
//! every write, and assembles prompt-ready context blocks from the agent's
//! own entries, its inbox and entries written under ancestor scopes.

use std::sync::Arc;

use crate::error::Result;
use crate::store::entry::{Entry, EntryFilter, EntryType, Scope};
use crate::store::FileStore;

/// Rough token estimate used by `assemble_context` (~4 chars per token)
fn estimate_tokens(text: &str) -> usize {
    text.len() / 4
}

const TRUNCATION_MARKER: &str = "[... context truncated: token budget reached]";

/// Read/write facade bound to one agent identity and scope
pub struct MemoryView {
    store: Arc<FileStore>,
    agent_id: String,
    scope: Scope,
}

impl MemoryView {
    pub fn new(store: Arc<FileStore>, agent_id: String, scope: Scope) -> Self {
        Self {
            store,
            agent_id,
            scope,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Write an entry under this agent's identity and scope
    pub fn write(
        &self,
        data: serde_json::Value,
        entry_type: EntryType,
        tags: Vec<String>,
    ) -> Result<Entry> {
        let entry = Entry::new(&self.agent_id, &self.scope, entry_type, data, tags);
        self.store.write(entry, false)
    }

    /// Send a message to another agent. MESSAGE is the only entry type where
    /// a target id is meaningful.
    pub fn msg(
        &self,
        target_id: &str,
        data: serde_json::Value,
        tags: Vec<String>,
    ) -> Result<Entry> {
        let mut entry = Entry::new(&self.agent_id, &self.scope, EntryType::Message, data, tags);
        entry.target_id = Some(target_id.to_string());
        self.store.write(entry, false)
    }

    /// Entries written by this agent, oldest first
    pub fn read_self(&self, limit: Option<usize>) -> Result<Vec<Entry>> {
        let mut filter = EntryFilter::new()
            .project(&self.scope.project)
            .agent_id(&self.agent_id);
        filter.limit = limit;
        self.store.query(&filter)
    }

    /// Messages addressed to this agent. Unacknowledged messages remain
    /// visible on every call (at-least-once, consumer-deletes semantics).
    pub fn read_inbox(&self) -> Result<Vec<Entry>> {
        self.store.query(
            &EntryFilter::new()
                .project(&self.scope.project)
                .entry_type(EntryType::Message)
                .target_id(&self.agent_id),
        )
    }

    /// Acknowledge (delete) a message by key; the only acknowledgment
    /// mechanism there is
    pub fn ack(&self, key: &str) -> Result<bool> {
        self.store.delete(key)
    }

    /// Scoped query passthrough; pins the project to this view's scope
    /// unless the filter sets one explicitly
    pub fn query(&self, mut filter: EntryFilter) -> Result<Vec<Entry>> {
        if filter.project.is_none() {
            filter.project = Some(self.scope.project.clone());
        }
        self.store.query(&filter)
    }

    /// Build a prompt-ready text block from this agent's own entries, its
    /// inbox and entries visible from ancestor scopes, excluding RAW_FILE.
    /// Content is appended until the estimated token count would exceed
    /// `token_budget`; truncation is marked explicitly, never silent.
    pub fn assemble_context(&self, token_budget: usize) -> Result<String> {
        let own = self.read_self(None)?;
        let inbox = self.read_inbox()?;

        let shared: Vec<Entry> = self
            .store
            .query(
                &EntryFilter::new()
                    .project(&self.scope.project)
                    .exclude_type(EntryType::RawFile),
            )?
            .into_iter()
            .filter(|e| e.agent_id != self.agent_id && self.scope.sees(&e.scope()))
            .collect();

        let mut out = String::new();
        let mut used = 0usize;
        let mut truncated = false;

        let sections: [(&str, &[Entry]); 3] = [
            ("## Own entries", &own),
            ("## Inbox", &inbox),
            ("## Shared context", &shared),
        ];

        'outer: for (header, entries) in sections {
            if entries.is_empty() {
                continue;
            }
            let header_line = format!("{header}\n");
            let header_cost = estimate_tokens(&header_line);
            if used + header_cost > token_budget {
                truncated = true;
                break;
            }
            out.push_str(&header_line);
            used += header_cost;

            for entry in entries {
                if entry.entry_type == EntryType::RawFile {
                    continue;
                }
                let line = format!(
                    "[{}] {}: {}\n",
                    entry.entry_type.as_str(),
                    entry.agent_id,
                    entry.data
                );
                let cost = estimate_tokens(&line);
                if used + cost > token_budget {
                    truncated = true;
                    break 'outer;
                }
                out.push_str(&line);
                used += cost;
            }
        }

        if truncated {
            out.push_str(TRUNCATION_MARKER);
            out.push('\n');
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn run_scope(run: &str) -> Scope {
        Scope {
            project: "proj".into(),
            session: Some("s1".into()),
            sweep: Some("w1".into()),
            run: Some(run.into()),
            role: "executor".into(),
        }
    }

    fn view(store: &Arc<FileStore>, agent_id: &str, scope: Scope) -> MemoryView {
        MemoryView::new(Arc::clone(store), agent_id.into(), scope)
    }

    #[test]
    fn test_write_autofills_identity_and_scope() {
        let dir = tempdir().unwrap();
        let store = Arc::new(FileStore::new(dir.path()).unwrap());
        let memory = view(&store, "executor-1", run_scope("r1"));

        let entry = memory
            .write(json!({"loss": 0.3}), EntryType::Metrics, vec![])
            .unwrap();
        assert_eq!(entry.agent_id, "executor-1");
        assert_eq!(entry.run.as_deref(), Some("r1"));
        assert_eq!(entry.role, "executor");
    }

    #[test]
    fn test_inbox_ack_cycle() {
        let dir = tempdir().unwrap();
        let store = Arc::new(FileStore::new(dir.path()).unwrap());
        let sender = view(&store, "orchestrator-1", run_scope("r1"));
        let receiver = view(&store, "executor-1", run_scope("r1"));

        sender
            .msg("executor-1", json!({"note": "hurry up"}), vec![])
            .unwrap();

        // unacked messages stay visible on every read
        let first = receiver.read_inbox().unwrap();
        assert_eq!(first.len(), 1);
        let second = receiver.read_inbox().unwrap();
        assert_eq!(second.len(), 1);

        assert!(receiver.ack(&first[0].key).unwrap());
        assert!(receiver.read_inbox().unwrap().is_empty());
        assert!(!receiver.ack(&first[0].key).unwrap());
    }

    #[test]
    fn test_read_self_only_own_entries() {
        let dir = tempdir().unwrap();
        let store = Arc::new(FileStore::new(dir.path()).unwrap());
        let mine = view(&store, "a", run_scope("r1"));
        let theirs = view(&store, "b", run_scope("r1"));

        mine.write(json!({}), EntryType::Plan, vec![]).unwrap();
        theirs.write(json!({}), EntryType::Plan, vec![]).unwrap();

        let own = mine.read_self(None).unwrap();
        assert_eq!(own.len(), 1);
        assert_eq!(own[0].agent_id, "a");
    }

    #[test]
    fn test_context_sees_ancestors_not_sibling_runs() {
        let dir = tempdir().unwrap();
        let store = Arc::new(FileStore::new(dir.path()).unwrap());

        let mut session_scope = run_scope("r1");
        session_scope.sweep = None;
        session_scope.run = None;
        session_scope.role = "orchestrator".into();

        let session_agent = view(&store, "orchestrator-1", session_scope);
        let sibling = view(&store, "executor-2", run_scope("r2"));
        let me = view(&store, "executor-1", run_scope("r1"));

        session_agent
            .write(json!({"shared": "session plan"}), EntryType::Plan, vec![])
            .unwrap();
        sibling
            .write(json!({"private": "sibling run"}), EntryType::Metrics, vec![])
            .unwrap();

        let context = me.assemble_context(10_000).unwrap();
        assert!(context.contains("session plan"));
        assert!(!context.contains("sibling run"));
    }

    #[test]
    fn test_context_excludes_raw_files() {
        let dir = tempdir().unwrap();
        let store = Arc::new(FileStore::new(dir.path()).unwrap());
        let me = view(&store, "executor-1", run_scope("r1"));

        me.write(json!({"blob": "giant raw dump"}), EntryType::RawFile, vec![])
            .unwrap();
        me.write(json!({"plan": "visible"}), EntryType::Plan, vec![])
            .unwrap();

        let context = me.assemble_context(10_000).unwrap();
        assert!(context.contains("visible"));
        assert!(!context.contains("giant raw dump"));
    }

    #[test]
    fn test_context_truncation_is_visible() {
        let dir = tempdir().unwrap();
        let store = Arc::new(FileStore::new(dir.path()).unwrap());
        let me = view(&store, "executor-1", run_scope("r1"));

        for i in 0..50 {
            me.write(
                json!({"step": i, "padding": "x".repeat(200)}),
                EntryType::Reflection,
                vec![],
            )
            .unwrap();
        }

        let context = me.assemble_context(100).unwrap();
        assert!(context.contains(TRUNCATION_MARKER));
        assert!(estimate_tokens(&context) < 200);

        // a generous budget fits everything, no marker
        let full = me.assemble_context(1_000_000).unwrap();
        assert!(!full.contains(TRUNCATION_MARKER));
    }
}
