//! Persistent job registry.
//!
//! Layout under the project root:
//!
//! ```text
//! statepoints.json                 index {id: statepoint}, derived
//! workspace/<id>/statepoint.json   immutable
//! workspace/<id>/document.json     mutable annotations
//! ```
//!
//! The workspace directories are the source of truth; the index is rebuilt
//! from them and only exists so the sweep can be inspected without this tool.

use crate::error::JobError;
use crate::expand::StatePoint;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use sweep_core::{atomic_write_bytes, atomic_write_json_pretty, ensure_dir, write_new};
use tracing::{debug, warn};

pub const WORKSPACE_DIR: &str = "workspace";
pub const INDEX_FILE: &str = "statepoints.json";
pub const STATEPOINT_FILE: &str = "statepoint.json";
pub const DOCUMENT_FILE: &str = "document.json";

/// Timing and outcome of the latest run of one operation on one job.
/// `attempts` is informational; eligibility never looks at it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub mode: String,
    pub started_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wall_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub attempts: u32,
}

/// Mutable per-job annotations: a few well-known keys plus free-form extras.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobDocument {
    /// Target step count. Written once at initialization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<u64>,
    /// Set when a sampling run finished at or past the target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done: Option<bool>,
    /// Physical-unit annotations, e.g. `T_SI`, `real_timestep`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub units: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub runs: BTreeMap<String, RunStats>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl JobDocument {
    /// Looks up a key as it appears in the serialized document.
    pub fn get(&self, key: &str) -> Option<Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map.get(key).cloned(),
            _ => None,
        }
    }

    /// Sets a top-level key, routing well-known keys through their typed
    /// fields. A value that does not fit the typed field is rejected.
    pub fn set(&mut self, key: &str, value: Value) -> Result<()> {
        let mut map = match serde_json::to_value(&*self)? {
            Value::Object(map) => map,
            _ => return Err(anyhow!("document did not serialize to an object")),
        };
        map.insert(key.to_string(), value);
        *self = serde_json::from_value(Value::Object(map))
            .map_err(|e| anyhow!("invalid value for document key '{}': {}", key, e))?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub id: String,
    pub statepoint: StatePoint,
    pub workspace: PathBuf,
}

impl JobRecord {
    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(8)]
    }

    /// Path of a file inside the job workspace.
    pub fn path(&self, name: &str) -> PathBuf {
        self.workspace.join(name)
    }

    pub fn has_file(&self, name: &str) -> bool {
        self.path(name).is_file()
    }

    pub fn statepoint_path(&self) -> PathBuf {
        self.path(STATEPOINT_FILE)
    }

    pub fn document_path(&self) -> PathBuf {
        self.path(DOCUMENT_FILE)
    }

    /// Reads the document; a missing file reads as empty.
    pub fn document(&self) -> Result<JobDocument> {
        let path = self.document_path();
        match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                JobError::CorruptDocument {
                    path: path.clone(),
                    reason: e.to_string(),
                }
                .into()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(JobDocument::default()),
            Err(source) => Err(JobError::Io { path, source }.into()),
        }
    }

    /// Read-modify-write of the document with atomic replace.
    pub fn update_document<F>(&self, f: F) -> Result<JobDocument>
    where
        F: FnOnce(&mut JobDocument),
    {
        let mut doc = self.document()?;
        f(&mut doc);
        atomic_write_json_pretty(&self.document_path(), &serde_json::to_value(&doc)?)?;
        Ok(doc)
    }
}

#[derive(Debug, Clone)]
pub struct Registry {
    root: PathBuf,
}

impl Registry {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn workspace_dir(&self) -> PathBuf {
        self.root.join(WORKSPACE_DIR)
    }

    pub fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    fn record_for(&self, id: &str, statepoint: StatePoint) -> JobRecord {
        JobRecord {
            id: id.to_string(),
            statepoint,
            workspace: self.workspace_dir().join(id),
        }
    }

    /// Returns the job for `statepoint`, creating it if absent. Safe to call
    /// concurrently for the same state point: every file is published whole
    /// and only if absent.
    pub fn ensure(&self, statepoint: &StatePoint) -> Result<JobRecord> {
        self.ensure_tracked(statepoint).map(|(job, _)| job)
    }

    /// Like `ensure`, also reporting whether this call created the job.
    pub fn ensure_tracked(&self, statepoint: &StatePoint) -> Result<(JobRecord, bool)> {
        let id = statepoint.id();
        let job = self.record_for(&id, statepoint.clone());
        ensure_dir(&job.workspace)?;

        let sp_bytes = serde_json::to_vec_pretty(statepoint)?;
        let created = write_new(&job.statepoint_path(), &sp_bytes)?;
        if !created {
            let existing = read_statepoint(&job.statepoint_path())?;
            if existing.canonical() != statepoint.canonical() {
                return Err(JobError::IdentityCollision {
                    id,
                    path: job.statepoint_path(),
                }
                .into());
            }
        }
        write_new(&job.document_path(), b"{}\n")?;
        debug!(job = %job.id, created, "ensured job");
        Ok((job, created))
    }

    /// Every job ever created under this root, sorted by id. Entries whose
    /// state point cannot be read are skipped with a warning.
    pub fn all(&self) -> Result<Vec<JobRecord>> {
        let dir = self.workspace_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut jobs = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().to_string();
            let sp_path = entry.path().join(STATEPOINT_FILE);
            if !sp_path.is_file() {
                continue;
            }
            match read_statepoint(&sp_path) {
                Ok(sp) if sp.id() == id => jobs.push(self.record_for(&id, sp)),
                Ok(_) => warn!(job = %id, "state point does not hash to its directory name; skipping"),
                Err(e) => warn!(job = %id, error = %e, "unreadable state point; skipping"),
            }
        }
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(jobs)
    }

    /// Opens a job by full id or unique id prefix.
    pub fn open(&self, id_or_prefix: &str) -> Result<JobRecord> {
        let mut matches: Vec<JobRecord> = self
            .all()?
            .into_iter()
            .filter(|j| j.id.starts_with(id_or_prefix))
            .collect();
        match matches.len() {
            0 => Err(anyhow!("no job matches '{}'", id_or_prefix)),
            1 => Ok(matches.remove(0)),
            n => Err(anyhow!("'{}' is ambiguous ({} jobs match)", id_or_prefix, n)),
        }
    }

    /// Records the target step count once. A later call with a different
    /// value keeps the stored one. Returns the effective target.
    pub fn set_target(&self, job: &JobRecord, steps: u64) -> Result<u64> {
        let doc = job.update_document(|doc| match doc.steps {
            None => doc.steps = Some(steps),
            Some(existing) if existing != steps => {
                warn!(
                    job = %job.id,
                    existing,
                    requested = steps,
                    "target step already recorded; keeping existing value"
                );
            }
            Some(_) => {}
        })?;
        Ok(doc.steps.unwrap_or(steps))
    }

    /// Merges every job into the on-disk index. Returns the number of entries.
    pub fn write_index(&self) -> Result<usize> {
        let mut index = self.read_index().unwrap_or_default();
        for job in self.all()? {
            index.insert(job.id, job.statepoint);
        }
        let bytes = serde_json::to_vec_pretty(&index)?;
        atomic_write_bytes(&self.index_path(), &bytes)?;
        Ok(index.len())
    }

    pub fn read_index(&self) -> Result<BTreeMap<String, StatePoint>> {
        let path = self.index_path();
        match fs::read(&path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }
}

fn read_statepoint(path: &Path) -> Result<StatePoint> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}
