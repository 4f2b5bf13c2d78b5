// src/store/entry.rs
//! Entry and scope data model
//!
//! An `Entry` is one immutable, typed, scoped record in the store. A `Scope`
//! is the project/session/sweep/run namespace an agent writes under; children
//! inherit it down the spawn tree unless a spawn call overrides a field.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Namespace an agent's entries are written under. Immutable once assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    pub project: String,
    pub session: Option<String>,
    pub sweep: Option<String>,
    pub run: Option<String>,
    pub role: String,
}

impl Scope {
    /// Top-level scope for a project
    pub fn project(project: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            session: None,
            sweep: None,
            run: None,
            role: role.into(),
        }
    }

    /// Scope for a child agent: every field inherited from the parent unless
    /// explicitly overridden. An explicit override always wins.
    pub fn child_of(
        parent: &Scope,
        role: impl Into<String>,
        session: Option<String>,
        sweep: Option<String>,
        run: Option<String>,
    ) -> Self {
        Self {
            project: parent.project.clone(),
            session: session.or_else(|| parent.session.clone()),
            sweep: sweep.or_else(|| parent.sweep.clone()),
            run: run.or_else(|| parent.run.clone()),
            role: role.into(),
        }
    }

    /// Whether an entry written under `other` is visible from this scope.
    ///
    /// Ancestor scopes are visible (a run-scoped agent sees sweep-, session-
    /// and project-scoped entries); sibling scopes are not (a different run
    /// under the same sweep stays invisible).
    pub fn sees(&self, other: &Scope) -> bool {
        fn level_ok(mine: &Option<String>, theirs: &Option<String>) -> bool {
            theirs.is_none() || theirs == mine
        }

        self.project == other.project
            && level_ok(&self.session, &other.session)
            && level_ok(&self.sweep, &other.sweep)
            && level_ok(&self.run, &other.run)
    }
}

/// The closed set of entry types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryType {
    RawFile,
    Metrics,
    Alert,
    Result,
    Context,
    Reflection,
    Plan,
    Message,
}

impl EntryType {
    /// Lowercase token used in entry filenames
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::RawFile => "raw_file",
            EntryType::Metrics => "metrics",
            EntryType::Alert => "alert",
            EntryType::Result => "result",
            EntryType::Context => "context",
            EntryType::Reflection => "reflection",
            EntryType::Plan => "plan",
            EntryType::Message => "message",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "raw_file" => Some(EntryType::RawFile),
            "metrics" => Some(EntryType::Metrics),
            "alert" => Some(EntryType::Alert),
            "result" => Some(EntryType::Result),
            "context" => Some(EntryType::Context),
            "reflection" => Some(EntryType::Reflection),
            "plan" => Some(EntryType::Plan),
            "message" => Some(EntryType::Message),
            _ => None,
        }
    }
}

/// One immutable record in the store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    /// Globally unique key (ULID), assigned by the store on write
    pub key: String,

    /// Agent that produced this entry
    pub agent_id: String,

    /// Addressee; set only for MESSAGE entries
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,

    #[serde(rename = "type")]
    pub entry_type: EntryType,

    pub project: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sweep: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<String>,
    pub role: String,

    pub tags: Vec<String>,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Entry {
    /// Build an entry under the given scope; key and timestamp are assigned
    /// by the store on write.
    pub fn new(
        agent_id: impl Into<String>,
        scope: &Scope,
        entry_type: EntryType,
        data: serde_json::Value,
        tags: Vec<String>,
    ) -> Self {
        Self {
            key: String::new(),
            agent_id: agent_id.into(),
            target_id: None,
            entry_type,
            project: scope.project.clone(),
            session: scope.session.clone(),
            sweep: scope.sweep.clone(),
            run: scope.run.clone(),
            role: scope.role.clone(),
            tags,
            data,
            created_at: Utc::now(),
        }
    }

    /// Reconstruct the scope this entry was written under
    pub fn scope(&self) -> Scope {
        Scope {
            project: self.project.clone(),
            session: self.session.clone(),
            sweep: self.sweep.clone(),
            run: self.run.clone(),
            role: self.role.clone(),
        }
    }

    /// Filename this entry is stored under: `{timestamp_ms}_{type}_{key}.json`
    pub fn file_name(&self) -> String {
        format!(
            "{}_{}_{}.json",
            self.created_at.timestamp_millis(),
            self.entry_type.as_str(),
            self.key
        )
    }
}

/// Fields recoverable from an entry filename without parsing JSON
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNameFields {
    pub timestamp_ms: i64,
    pub entry_type: EntryType,
    pub key: String,
}

/// Parse `{timestamp_ms}_{type}_{key}.json`. The type token may itself
/// contain an underscore (`raw_file`), so the key is taken from the end.
pub fn parse_file_name(name: &str) -> Option<FileNameFields> {
    let stem = name.strip_suffix(".json")?;
    let (ts, rest) = stem.split_once('_')?;
    let (type_str, key) = rest.rsplit_once('_')?;
    Some(FileNameFields {
        timestamp_ms: ts.parse().ok()?,
        entry_type: EntryType::parse(type_str)?,
        key: key.to_string(),
    })
}

/// Sort order for query results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    #[default]
    Asc,
    Desc,
}

/// Multi-field filter for store queries.
///
/// All set fields must match; `tags` matches when the entry's tag set
/// intersects the filter set (OR-membership, not AND). `since` is inclusive
/// and `before` exclusive, so the two partition a scope's entries at any
/// boundary timestamp.
#[derive(Debug, Clone, Default)]
pub struct EntryFilter {
    pub project: Option<String>,
    pub session: Option<String>,
    pub sweep: Option<String>,
    pub run: Option<String>,
    pub agent_id: Option<String>,
    pub target_id: Option<String>,
    pub role: Option<String>,
    pub entry_type: Option<EntryType>,
    pub type_exclude: Vec<EntryType>,
    pub tags: Vec<String>,
    pub since: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub order: Order,
}

impl EntryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
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

    pub fn agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn target_id(mut self, target_id: impl Into<String>) -> Self {
        self.target_id = Some(target_id.into());
        self
    }

    pub fn role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn entry_type(mut self, entry_type: EntryType) -> Self {
        self.entry_type = Some(entry_type);
        self
    }

    pub fn exclude_type(mut self, entry_type: EntryType) -> Self {
        self.type_exclude.push(entry_type);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn before(mut self, before: DateTime<Utc>) -> Self {
        self.before = Some(before);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn order(mut self, order: Order) -> Self {
        self.order = order;
        self
    }

    /// JSON-level match; filename-level fields (timestamp, type) are assumed
    /// to have been prefiltered but are re-checked exactly here.
    pub fn matches(&self, entry: &Entry) -> bool {
        if let Some(ref p) = self.project {
            if &entry.project != p {
                return false;
            }
        }
        if let Some(ref s) = self.session {
            if entry.session.as_deref() != Some(s.as_str()) {
                return false;
            }
        }
        if let Some(ref s) = self.sweep {
            if entry.sweep.as_deref() != Some(s.as_str()) {
                return false;
            }
        }
        if let Some(ref r) = self.run {
            if entry.run.as_deref() != Some(r.as_str()) {
                return false;
            }
        }
        if let Some(ref a) = self.agent_id {
            if &entry.agent_id != a {
                return false;
            }
        }
        if let Some(ref t) = self.target_id {
            if entry.target_id.as_deref() != Some(t.as_str()) {
                return false;
            }
        }
        if let Some(ref r) = self.role {
            if &entry.role != r {
                return false;
            }
        }
        if let Some(t) = self.entry_type {
            if entry.entry_type != t {
                return false;
            }
        }
        if self.type_exclude.contains(&entry.entry_type) {
            return false;
        }
        if !self.tags.is_empty() && !entry.tags.iter().any(|t| self.tags.contains(t)) {
            return false;
        }
        if let Some(since) = self.since {
            if entry.created_at < since {
                return false;
            }
        }
        if let Some(before) = self.before {
            if entry.created_at >= before {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> Scope {
        Scope {
            project: "proj".into(),
            session: Some("s1".into()),
            sweep: Some("w1".into()),
            run: Some("r1".into()),
            role: "executor".into(),
        }
    }

    #[test]
    fn test_child_scope_inherits() {
        let parent = scope();
        let child = Scope::child_of(&parent, "sidecar", None, None, None);
        assert_eq!(child.session.as_deref(), Some("s1"));
        assert_eq!(child.sweep.as_deref(), Some("w1"));
        assert_eq!(child.run.as_deref(), Some("r1"));
        assert_eq!(child.role, "sidecar");
    }

    #[test]
    fn test_child_scope_override_wins() {
        let parent = scope();
        let child = Scope::child_of(&parent, "executor", None, None, Some("r2".into()));
        assert_eq!(child.run.as_deref(), Some("r2"));
        assert_eq!(child.sweep.as_deref(), Some("w1"));
    }

    #[test]
    fn test_scope_sees_ancestors_not_siblings() {
        let mine = scope();

        let mut session_level = scope();
        session_level.sweep = None;
        session_level.run = None;
        assert!(mine.sees(&session_level));

        let mut sibling_run = scope();
        sibling_run.run = Some("r2".into());
        assert!(!mine.sees(&sibling_run));

        assert!(mine.sees(&mine.clone()));
    }

    #[test]
    fn test_file_name_round_trip() {
        let mut entry = Entry::new("agent-1", &scope(), EntryType::RawFile, json!({}), vec![]);
        entry.key = "01HQZX5J8KT3V9WY2M4N6P7R8S".into();
        let fields = parse_file_name(&entry.file_name()).unwrap();
        assert_eq!(fields.entry_type, EntryType::RawFile);
        assert_eq!(fields.key, entry.key);
        assert_eq!(fields.timestamp_ms, entry.created_at.timestamp_millis());
    }

    #[test]
    fn test_parse_file_name_rejects_garbage() {
        assert!(parse_file_name("not-an-entry").is_none());
        assert!(parse_file_name(".meta.json").is_none());
        assert!(parse_file_name("123_unknown_abc.json").is_none());
    }

    #[test]
    fn test_filter_tags_are_or_membership() {
        let mut entry = Entry::new(
            "a",
            &scope(),
            EntryType::Metrics,
            json!({}),
            vec!["alpha".into()],
        );
        entry.key = "k".into();

        let filter = EntryFilter::new().tag("alpha").tag("beta");
        assert!(filter.matches(&entry));

        let filter = EntryFilter::new().tag("beta").tag("gamma");
        assert!(!filter.matches(&entry));
    }

    #[test]
    fn test_filter_since_inclusive_before_exclusive() {
        let entry = Entry::new("a", &scope(), EntryType::Metrics, json!({}), vec![]);
        let at = entry.created_at;

        assert!(EntryFilter::new().since(at).matches(&entry));
        assert!(!EntryFilter::new().before(at).matches(&entry));
    }
}
