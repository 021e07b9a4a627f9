//! Persistence for job- and entity-scoped records.
//!
//! Every record is JSON. Stores do no locking beyond what keeps a single call
//! consistent; read-modify-write cycles are serialized by
//! [`crate::orchestrator`].

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::core::entity_memory::EntityMemory;
use crate::core::queue::HandoffQueue;
use crate::core::scratchpad::Scratchpad;
use crate::error::OrchestratorError;
use crate::io::event_log::{self, JobEventRecord};

/// Key/value plus append-log capability the orchestrator persists through.
pub trait Store: Send + Sync {
    fn read_scratchpad(&self, job_id: &str) -> Result<Option<Scratchpad>>;
    fn write_scratchpad(&self, job_id: &str, pad: &Scratchpad) -> Result<()>;
    fn read_queue(&self, job_id: &str) -> Result<Option<HandoffQueue>>;
    fn write_queue(&self, job_id: &str, queue: &HandoffQueue) -> Result<()>;
    fn read_entity_memory(&self, entity_key: &str) -> Result<Option<EntityMemory>>;
    fn write_entity_memory(&self, entity_key: &str, memory: &EntityMemory) -> Result<()>;
    fn append_event(&self, record: &JobEventRecord) -> Result<()>;
    fn read_events(&self, job_id: &str) -> Result<Vec<JobEventRecord>>;
}

/// Reject keys that could escape the store root or collide after
/// normalization.
pub fn validate_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && key != "."
        && key != ".."
        && key
            .chars()
            .all(|c| c.is_alphanumeric() || c == '.' || c == '_' || c == '-');
    if !valid {
        return Err(OrchestratorError::InvalidKey {
            key: key.to_string(),
        }
        .into());
    }
    Ok(())
}

/// In-memory store holding records as serialized JSON.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, String>>,
    events: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records
            .get(key)
            .map(|json| serde_json::from_str(json).with_context(|| format!("parse record {key}")))
            .transpose()
    }

    fn put<T: Serialize>(&self, key: String, value: &T) -> Result<()> {
        let json = serde_json::to_string(value).with_context(|| format!("serialize record {key}"))?;
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, json);
        Ok(())
    }
}

impl Store for MemoryStore {
    fn read_scratchpad(&self, job_id: &str) -> Result<Option<Scratchpad>> {
        self.get(&format!("scratchpad/{job_id}"))
    }

    fn write_scratchpad(&self, job_id: &str, pad: &Scratchpad) -> Result<()> {
        self.put(format!("scratchpad/{job_id}"), pad)
    }

    fn read_queue(&self, job_id: &str) -> Result<Option<HandoffQueue>> {
        self.get(&format!("queue/{job_id}"))
    }

    fn write_queue(&self, job_id: &str, queue: &HandoffQueue) -> Result<()> {
        self.put(format!("queue/{job_id}"), queue)
    }

    fn read_entity_memory(&self, entity_key: &str) -> Result<Option<EntityMemory>> {
        self.get(&format!("entity/{entity_key}"))
    }

    fn write_entity_memory(&self, entity_key: &str, memory: &EntityMemory) -> Result<()> {
        self.put(format!("entity/{entity_key}"), memory)
    }

    fn append_event(&self, record: &JobEventRecord) -> Result<()> {
        let line = event_log::to_line(record)?;
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(record.job_id.clone())
            .or_default()
            .push_str(&line);
        Ok(())
    }

    fn read_events(&self, job_id: &str) -> Result<Vec<JobEventRecord>> {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        match events.get(job_id) {
            Some(doc) => event_log::parse_lines(doc),
            None => Ok(Vec::new()),
        }
    }
}

/// File-backed store rooted at the state directory.
///
/// Layout:
/// - `jobs/<job_id>/scratchpad.json`
/// - `jobs/<job_id>/queue.json`
/// - `jobs/<job_id>/events.jsonl`
/// - `entities/<entity_key>.json`
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn job_dir(&self, job_id: &str) -> Result<PathBuf> {
        validate_key(job_id)?;
        Ok(self.root.join("jobs").join(job_id))
    }

    fn entity_path(&self, entity_key: &str) -> Result<PathBuf> {
        validate_key(entity_key)?;
        Ok(self.root.join("entities").join(format!("{entity_key}.json")))
    }
}

impl Store for FileStore {
    fn read_scratchpad(&self, job_id: &str) -> Result<Option<Scratchpad>> {
        read_json(&self.job_dir(job_id)?.join("scratchpad.json"))
    }

    fn write_scratchpad(&self, job_id: &str, pad: &Scratchpad) -> Result<()> {
        write_json(&self.job_dir(job_id)?.join("scratchpad.json"), pad)
    }

    fn read_queue(&self, job_id: &str) -> Result<Option<HandoffQueue>> {
        read_json(&self.job_dir(job_id)?.join("queue.json"))
    }

    fn write_queue(&self, job_id: &str, queue: &HandoffQueue) -> Result<()> {
        write_json(&self.job_dir(job_id)?.join("queue.json"), queue)
    }

    fn read_entity_memory(&self, entity_key: &str) -> Result<Option<EntityMemory>> {
        read_json(&self.entity_path(entity_key)?)
    }

    fn write_entity_memory(&self, entity_key: &str, memory: &EntityMemory) -> Result<()> {
        write_json(&self.entity_path(entity_key)?, memory)
    }

    fn append_event(&self, record: &JobEventRecord) -> Result<()> {
        let dir = self.job_dir(&record.job_id)?;
        fs::create_dir_all(&dir).with_context(|| format!("create directory {}", dir.display()))?;
        let path = dir.join("events.jsonl");
        let line = event_log::to_line(record)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open event log {}", path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append event log {}", path.display()))?;
        Ok(())
    }

    fn read_events(&self, job_id: &str) -> Result<Vec<JobEventRecord>> {
        let path = self.job_dir(job_id)?.join("events.jsonl");
        if !path.exists() {
            return Ok(Vec::new());
        }
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        event_log::parse_lines(&contents).with_context(|| format!("parse {}", path.display()))
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    debug!(path = %path.display(), "reading record");
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let value =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(value))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    debug!(path = %path.display(), "writing record");
    let mut buf = serde_json::to_string_pretty(value).context("serialize json")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Write via a sibling temp file and rename so readers never see a torn file.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
