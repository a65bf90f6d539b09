//! # Version Store
//!
//! Append-only lineage of descriptor versions per `agent_id`. Nothing is
//! ever edited or deleted; a version is only superseded by a later one.
//!
//! Appends are serialized per `agent_id` (lineage order matters) while
//! distinct agents append concurrently. A lineage never moves backwards:
//! an entry must carry a version at least as new as the last one, and
//! re-appending the same version (e.g. a re-evaluation) must carry the
//! identical descriptor.

use crate::error::{self, Result};
use crate::harness::ScoreRecord;
use crate::mutation::Mutation;
use evoforge_graph::AgentDescriptor;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// One lineage record: a descriptor, how it came to be, and optionally a score
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionEntry {
    pub descriptor: AgentDescriptor,
    pub mutation: Mutation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<ScoreRecord>,
    /// Seconds since the Unix epoch
    pub recorded_at: u64,
}

impl VersionEntry {
    pub fn new(descriptor: AgentDescriptor, mutation: Mutation) -> Self {
        Self {
            descriptor,
            mutation,
            score: None,
            recorded_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        }
    }

    pub fn with_score(mut self, record: ScoreRecord) -> Self {
        self.score = Some(record);
        self
    }

    pub fn agent_id(&self) -> &str {
        &self.descriptor.agent_id
    }

    pub fn version(&self) -> u64 {
        self.descriptor.version
    }
}

/// Persistence collaborator for descriptor lineages
pub trait VersionStore: Send + Sync {
    /// Append an entry to its agent's lineage
    fn append(&self, entry: VersionEntry) -> Result<()>;

    /// Most recently appended entry
    fn latest(&self, agent_id: &str) -> Result<Option<VersionEntry>>;

    /// Every entry in append order
    fn history(&self, agent_id: &str) -> Result<Vec<VersionEntry>>;

    /// Score records in append order
    fn trajectory(&self, agent_id: &str) -> Result<Vec<ScoreRecord>> {
        Ok(self
            .history(agent_id)?
            .into_iter()
            .filter_map(|e| e.score)
            .collect())
    }
}

/// Reject entries that would move a lineage backwards or rewrite a version
fn check_supersedes(last: Option<&VersionEntry>, entry: &VersionEntry) -> Result<()> {
    let Some(last) = last else {
        return Ok(());
    };
    if entry.version() < last.version()
        || (entry.version() == last.version() && entry.descriptor != last.descriptor)
    {
        return Err(error::version_conflict(entry.agent_id(), last.version(), entry.version())
            .with_operation("VersionStore::append"));
    }
    Ok(())
}

type Lineage<T> = Arc<Mutex<T>>;

/// Per-agent lock table
#[derive(Default)]
struct Locks<T> {
    table: Mutex<HashMap<String, Lineage<T>>>,
}

impl<T: Default> Locks<T> {
    fn get(&self, agent_id: &str) -> Result<Lineage<T>> {
        let mut table = self
            .table
            .lock()
            .map_err(|_| error::storage_error("lock table poisoned"))?;
        Ok(table.entry(agent_id.to_string()).or_default().clone())
    }
}

// ============================================================================
// In-memory store
// ============================================================================

/// Volatile store, useful for tests and single-process runs
#[derive(Default)]
pub struct MemoryVersionStore {
    lineages: Locks<Vec<VersionEntry>>,
}

impl MemoryVersionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VersionStore for MemoryVersionStore {
    fn append(&self, entry: VersionEntry) -> Result<()> {
        let lineage = self.lineages.get(entry.agent_id())?;
        let mut entries = lineage
            .lock()
            .map_err(|_| error::storage_error("lineage lock poisoned"))?;
        check_supersedes(entries.last(), &entry)?;
        entries.push(entry);
        Ok(())
    }

    fn latest(&self, agent_id: &str) -> Result<Option<VersionEntry>> {
        let lineage = self.lineages.get(agent_id)?;
        let entries = lineage
            .lock()
            .map_err(|_| error::storage_error("lineage lock poisoned"))?;
        Ok(entries.last().cloned())
    }

    fn history(&self, agent_id: &str) -> Result<Vec<VersionEntry>> {
        let lineage = self.lineages.get(agent_id)?;
        let entries = lineage
            .lock()
            .map_err(|_| error::storage_error("lineage lock poisoned"))?;
        Ok(entries.clone())
    }
}

// ============================================================================
// File store
// ============================================================================

/// One JSON-lines file per agent under a base directory
pub struct FileVersionStore {
    base_path: PathBuf,
    locks: Locks<()>,
}

impl FileVersionStore {
    pub fn new(base_path: impl AsRef<Path>) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_path)
            .map_err(|e| error::io_error(format!("Failed to create store dir: {}", e)))?;
        Ok(Self {
            base_path,
            locks: Locks::default(),
        })
    }

    /// Plain ids map to `{id}.jsonl`; any other id is hex-encoded behind a `~`
    /// so that distinct ids never share a file.
    fn lineage_path(&self, agent_id: &str) -> PathBuf {
        let plain = !agent_id.is_empty()
            && !agent_id.starts_with('.')
            && agent_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        let file = if plain {
            format!("{}.jsonl", agent_id)
        } else {
            format!("~{}.jsonl", hex::encode(agent_id))
        };
        self.base_path.join(file)
    }

    fn read(&self, agent_id: &str) -> Result<Vec<VersionEntry>> {
        let path = self.lineage_path(agent_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&path)
            .map_err(|e| error::io_error(format!("Failed to read {}: {}", path.display(), e)))?;

        content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(n, line)| {
                serde_json::from_str(line).map_err(|e| {
                    error::serialization_error(format!("{}:{}: {}", path.display(), n + 1, e))
                })
            })
            .collect()
    }
}

impl VersionStore for FileVersionStore {
    fn append(&self, entry: VersionEntry) -> Result<()> {
        let lock = self.locks.get(entry.agent_id())?;
        let _guard = lock
            .lock()
            .map_err(|_| error::storage_error("lineage lock poisoned"))?;

        let existing = self.read(entry.agent_id())?;
        check_supersedes(existing.last(), &entry)?;

        let line = serde_json::to_string(&entry)
            .map_err(|e| error::serialization_error(e.to_string()))?;
        let path = self.lineage_path(entry.agent_id());
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| error::io_error(format!("Failed to open {}: {}", path.display(), e)))?;
        writeln!(file, "{}", line)
            .and_then(|_| file.flush())
            .map_err(|e| error::io_error(format!("Failed to write {}: {}", path.display(), e)))?;

        debug!(agent_id = entry.agent_id(), version = entry.version(), "lineage entry appended");
        Ok(())
    }

    fn latest(&self, agent_id: &str) -> Result<Option<VersionEntry>> {
        Ok(self.history(agent_id)?.pop())
    }

    fn history(&self, agent_id: &str) -> Result<Vec<VersionEntry>> {
        let lock = self.locks.get(agent_id)?;
        let _guard = lock
            .lock()
            .map_err(|_| error::storage_error("lineage lock poisoned"))?;
        self.read(agent_id)
    }
}
