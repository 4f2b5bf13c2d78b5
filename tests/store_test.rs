// tests/store_test.rs
//! Store-level behavior across process-like boundaries: independent
//! `FileStore` handles over one shared tree, plus property tests for the
//! query filter semantics.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use serde_json::json;
use tempfile::tempdir;
use ulid::Ulid;

use aviary::{Entry, EntryFilter, EntryType, FileStore, MemoryView, Scope};

fn run_scope(session: &str, sweep: Option<&str>, run: Option<&str>, role: &str) -> Scope {
    Scope {
        project: "proj".into(),
        session: Some(session.into()),
        sweep: sweep.map(String::from),
        run: run.map(String::from),
        role: role.into(),
    }
}

/// Write an entry with an explicit timestamp, as the update path does
fn write_at(store: &FileStore, agent: &str, ts_ms: i64) -> Entry {
    let mut entry = Entry::new(
        agent,
        &run_scope("s1", None, None, "executor"),
        EntryType::Metrics,
        json!({ "ts": ts_ms }),
        vec![],
    );
    entry.key = Ulid::new().to_string();
    entry.created_at = Utc.timestamp_millis_opt(ts_ms).unwrap();
    store.write(entry, true).unwrap()
}

#[test]
fn test_two_stores_share_one_tree() {
    let dir = tempdir().unwrap();
    let writer = FileStore::new(dir.path()).unwrap();
    let reader = FileStore::new(dir.path()).unwrap();

    let written = writer
        .write(
            Entry::new(
                "executor-1",
                &run_scope("s1", Some("w1"), Some("r1"), "executor"),
                EntryType::Result,
                json!({ "answer": 42 }),
                vec!["final".into()],
            ),
            false,
        )
        .unwrap();

    let seen = reader
        .query(&EntryFilter::new().project("proj").run("r1"))
        .unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].key, written.key);

    // delete through the non-writing handle, observe through the writer
    assert!(reader.delete(&written.key).unwrap());
    assert!(writer.query(&EntryFilter::new()).unwrap().is_empty());
}

#[test]
fn test_messages_cross_store_handles() {
    let dir = tempdir().unwrap();
    let store_a = Arc::new(FileStore::new(dir.path()).unwrap());
    let store_b = Arc::new(FileStore::new(dir.path()).unwrap());

    let sender = MemoryView::new(
        store_a,
        "orchestrator-1".into(),
        run_scope("s1", None, None, "orchestrator"),
    );
    let receiver = MemoryView::new(
        store_b,
        "executor-1".into(),
        run_scope("s1", Some("w1"), Some("r1"), "executor"),
    );

    sender
        .msg("executor-1", json!({ "instruction": "begin" }), vec![])
        .unwrap();

    let inbox = receiver.read_inbox().unwrap();
    assert_eq!(inbox.len(), 1);
    assert!(receiver.ack(&inbox[0].key).unwrap());
    assert!(receiver.read_inbox().unwrap().is_empty());
}

#[test]
fn test_sweep_scope_visible_to_runs_not_siblings() {
    let dir = tempdir().unwrap();
    let store = Arc::new(FileStore::new(dir.path()).unwrap());

    let sweep_agent = MemoryView::new(
        Arc::clone(&store),
        "sweeper-1".into(),
        run_scope("s1", Some("w1"), None, "sweeper"),
    );
    let run_one = MemoryView::new(
        Arc::clone(&store),
        "executor-1".into(),
        run_scope("s1", Some("w1"), Some("r1"), "executor"),
    );
    let run_two = MemoryView::new(
        Arc::clone(&store),
        "executor-2".into(),
        run_scope("s1", Some("w1"), Some("r2"), "executor"),
    );

    sweep_agent
        .write(json!({ "plan": "grid search" }), EntryType::Plan, vec![])
        .unwrap();
    run_two
        .write(json!({ "loss": 0.1 }), EntryType::Metrics, vec![])
        .unwrap();

    let context = run_one.assemble_context(50_000).unwrap();
    assert!(context.contains("grid search"));
    assert!(!context.contains("0.1"));

    // the sweep-level agent does not see run-private entries either
    let sweep_context = sweep_agent.assemble_context(50_000).unwrap();
    assert!(!sweep_context.contains("0.1"));
}

proptest! {
    /// `since` (inclusive) and `before` (exclusive) partition the entries at
    /// any pivot: every entry lands in exactly one half.
    #[test]
    fn prop_since_before_partition(
        offsets in prop::collection::hash_set(0i64..10_000, 1..25),
        pivot in 0i64..10_000,
    ) {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        let base = 1_700_000_000_000i64;

        for offset in &offsets {
            write_at(&store, "agent-1", base + offset);
        }

        let pivot_ts = Utc.timestamp_millis_opt(base + pivot).unwrap();
        let all = store.query(&EntryFilter::new().agent_id("agent-1")).unwrap();
        let after = store
            .query(&EntryFilter::new().agent_id("agent-1").since(pivot_ts))
            .unwrap();
        let strictly_before = store
            .query(&EntryFilter::new().agent_id("agent-1").before(pivot_ts))
            .unwrap();

        prop_assert_eq!(all.len(), offsets.len());
        prop_assert_eq!(after.len() + strictly_before.len(), all.len());
        for entry in &after {
            prop_assert!(entry.created_at >= pivot_ts);
            prop_assert!(!strictly_before.iter().any(|e| e.key == entry.key));
        }
        for entry in &strictly_before {
            prop_assert!(entry.created_at < pivot_ts);
        }
    }

    /// Any filtered query returns a subset of the unfiltered scan, and every
    /// returned entry satisfies the filter.
    #[test]
    fn prop_filter_returns_matching_subset(
        type_idx in 0usize..4,
        count in 1usize..12,
    ) {
        let types = [
            EntryType::Metrics,
            EntryType::Plan,
            EntryType::Alert,
            EntryType::Reflection,
        ];
        let wanted = types[type_idx];

        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        for i in 0..count {
            let entry = Entry::new(
                "agent-1",
                &run_scope("s1", None, None, "executor"),
                types[i % types.len()],
                json!({ "i": i }),
                vec![],
            );
            store.write(entry, false).unwrap();
        }

        let all = store.query(&EntryFilter::new().agent_id("agent-1")).unwrap();
        let filtered = store
            .query(&EntryFilter::new().agent_id("agent-1").entry_type(wanted))
            .unwrap();

        prop_assert_eq!(all.len(), count);
        for entry in &filtered {
            prop_assert_eq!(entry.entry_type, wanted);
            prop_assert!(all.iter().any(|e| e.key == entry.key));
        }
        let expected = all.iter().filter(|e| e.entry_type == wanted).count();
        prop_assert_eq!(filtered.len(), expected);
    }

    /// Keys stay unique across writes
    #[test]
    fn prop_keys_unique(count in 2usize..20) {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        let mut keys = std::collections::HashSet::new();
        for _ in 0..count {
            let entry = store
                .write(
                    Entry::new(
                        "agent-1",
                        &run_scope("s1", None, None, "executor"),
                        EntryType::Context,
                        json!({}),
                        vec![],
                    ),
                    false,
                )
                .unwrap();
            prop_assert!(keys.insert(entry.key));
        }
    }
}
