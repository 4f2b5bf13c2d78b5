// src/store/file_store.rs
//! Durable, crash-tolerant entry store
//!
//! One file per entry, directory per agent:
//! `{root}/{project}/{agent_id}/{timestamp_ms}_{type}_{key}.json`, plus one
//! `.meta.json` snapshot per agent. Every write goes through a temp file and
//! an atomic rename, so no reader ever observes a partial file. Entry writes
//! never conflict (unique filenames) and readers never block writers; no
//! locks are taken on the tree.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::agent::info::AgentInfo;
use crate::error::Result;
use crate::store::entry::{parse_file_name, Entry, EntryFilter, Order};

/// Callback invoked synchronously after every successful local write
pub type WriteListener = Box<dyn Fn(&Entry) + Send + Sync>;

const META_FILE: &str = ".meta.json";

/// The durable entry store
pub struct FileStore {
    root: PathBuf,
    /// key -> path cache for entries written by this process
    index: DashMap<String, PathBuf>,
    listeners: RwLock<Vec<WriteListener>>,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            index: DashMap::new(),
            listeners: RwLock::new(Vec::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Register a listener invoked synchronously on every local write
    pub fn add_listener(&self, listener: impl Fn(&Entry) + Send + Sync + 'static) {
        self.listeners.write().push(Box::new(listener));
    }

    /// Write an entry durably. Assigns a fresh key and timestamp unless
    /// `preserve_key` is set and a key is already present (the
    /// delete-then-rewrite update path, which keeps the original
    /// `created_at`). Once this returns, the entry is visible to any
    /// subsequent query, including from other processes.
    pub fn write(&self, mut entry: Entry, preserve_key: bool) -> Result<Entry> {
        if !(preserve_key && !entry.key.is_empty()) {
            entry.key = Ulid::new().to_string();
            entry.created_at = Utc::now();
        }

        let dir = self.agent_dir(&entry.project, &entry.agent_id);
        fs::create_dir_all(&dir)?;

        let path = dir.join(entry.file_name());
        let tmp = dir.join(format!(".tmp-{}", entry.key));
        fs::write(&tmp, serde_json::to_vec_pretty(&entry)?)?;
        fs::rename(&tmp, &path)?;

        self.index.insert(entry.key.clone(), path);
        debug!(key = %entry.key, agent = %entry.agent_id, "entry written");

        for listener in self.listeners.read().iter() {
            listener(&entry);
        }

        Ok(entry)
    }

    /// Query entries matching a multi-field filter.
    ///
    /// Filename-derived fields (timestamp, type) are filtered before any
    /// JSON is parsed. Corrupt or partially written files are skipped with a
    /// warning and never abort the scan. Results are sorted by `created_at`
    /// and truncated to `limit`.
    pub fn query(&self, filter: &EntryFilter) -> Result<Vec<Entry>> {
        let mut out = Vec::new();

        for agent_dir in self.scan_dirs(filter)? {
            let read_dir = match fs::read_dir(&agent_dir) {
                Ok(rd) => rd,
                Err(_) => continue,
            };

            for dirent in read_dir.flatten() {
                let name = dirent.file_name();
                let name = name.to_string_lossy();
                if name.starts_with('.') {
                    continue;
                }
                let Some(fields) = parse_file_name(&name) else {
                    continue;
                };

                // Cheap filters before touching file contents. Boundary
                // timestamps stay in: exact checks re-run on the parsed
                // entry, which carries sub-millisecond precision.
                if let Some(since) = filter.since {
                    if fields.timestamp_ms < since.timestamp_millis() {
                        continue;
                    }
                }
                if let Some(before) = filter.before {
                    if fields.timestamp_ms > before.timestamp_millis() {
                        continue;
                    }
                }
                if let Some(t) = filter.entry_type {
                    if fields.entry_type != t {
                        continue;
                    }
                }
                if filter.type_exclude.contains(&fields.entry_type) {
                    continue;
                }

                let entry = match read_entry(&dirent.path()) {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!(path = %dirent.path().display(), error = %e, "skipping unreadable entry file");
                        continue;
                    }
                };

                if filter.matches(&entry) {
                    out.push(entry);
                }
            }
        }

        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.key.cmp(&b.key)));
        if filter.order == Order::Desc {
            out.reverse();
        }
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }

        Ok(out)
    }

    /// Most recent entry matching the filter
    pub fn latest(&self, filter: EntryFilter) -> Result<Option<Entry>> {
        let filter = filter.limit(1).order(Order::Desc);
        Ok(self.query(&filter)?.into_iter().next())
    }

    /// Delete an entry by key. Returns false for an unknown key.
    pub fn delete(&self, key: &str) -> Result<bool> {
        if let Some((_, path)) = self.index.remove(key) {
            return match fs::remove_file(&path) {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e.into()),
            };
        }

        // Not locally indexed; the entry may have been written by another
        // process sharing the tree.
        let suffix = format!("_{key}.json");
        for agent_dir in self.scan_dirs(&EntryFilter::new())? {
            let read_dir = match fs::read_dir(&agent_dir) {
                Ok(rd) => rd,
                Err(_) => continue,
            };
            for dirent in read_dir.flatten() {
                if dirent.file_name().to_string_lossy().ends_with(&suffix) {
                    fs::remove_file(dirent.path())?;
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Atomically rewrite an agent's `.meta.json` snapshot
    pub fn write_meta(&self, info: &AgentInfo) -> Result<()> {
        let dir = self.agent_dir(&info.scope.project, &info.id);
        fs::create_dir_all(&dir)?;

        let tmp = dir.join(format!(".tmp-meta-{}", Ulid::new()));
        fs::write(&tmp, serde_json::to_vec_pretty(info)?)?;
        fs::rename(&tmp, dir.join(META_FILE))?;
        Ok(())
    }

    /// Raw `.meta.json` contents, if present
    pub fn read_meta(&self, project: &str, agent_id: &str) -> Result<Option<serde_json::Value>> {
        self.read_meta_as(project, agent_id)
    }

    /// Typed `.meta.json` snapshot, letting a supervisor or sibling process
    /// reconstruct AgentInfo without an IPC round trip
    pub fn read_agent_info(&self, project: &str, agent_id: &str) -> Result<Option<AgentInfo>> {
        self.read_meta_as(project, agent_id)
    }

    fn read_meta_as<T: serde::de::DeserializeOwned>(
        &self,
        project: &str,
        agent_id: &str,
    ) -> Result<Option<T>> {
        let path = self.agent_dir(project, agent_id).join(META_FILE);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping corrupt meta file");
                Ok(None)
            }
        }
    }

    fn agent_dir(&self, project: &str, agent_id: &str) -> PathBuf {
        self.root.join(project).join(agent_id)
    }

    /// Agent directories to scan for the given filter: one when the agent id
    /// is pinned, otherwise every agent directory of the matching project(s)
    fn scan_dirs(&self, filter: &EntryFilter) -> Result<Vec<PathBuf>> {
        let project_dirs: Vec<PathBuf> = match &filter.project {
            Some(project) => {
                let dir = self.root.join(project);
                if dir.is_dir() {
                    vec![dir]
                } else {
                    Vec::new()
                }
            }
            None => subdirs(&self.root),
        };

        let mut out = Vec::new();
        for project_dir in project_dirs {
            match &filter.agent_id {
                Some(agent_id) => {
                    let dir = project_dir.join(agent_id);
                    if dir.is_dir() {
                        out.push(dir);
                    }
                }
                None => out.extend(subdirs(&project_dir)),
            }
        }
        Ok(out)
    }
}

fn read_entry(path: &Path) -> Result<Entry> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn subdirs(dir: &Path) -> Vec<PathBuf> {
    match fs::read_dir(dir) {
        Ok(rd) => rd
            .flatten()
            .map(|d| d.path())
            .filter(|p| p.is_dir())
            .collect(),
        Err(_) => Vec::new(),
    }
}
