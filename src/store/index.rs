//! Project-level files that live beside the workspace: the state point
//! index and the cached per-pair status snapshot.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Job, StatePoint, atomic_write};
use crate::error::{FlowError, Result};
use crate::flow::PairState;

/// Every known state point keyed by job id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatePointIndex(BTreeMap<String, StatePoint>);

impl StatePointIndex {
    pub fn from_jobs<'a>(jobs: impl IntoIterator<Item = &'a Job>) -> Self {
        Self(
            jobs.into_iter()
                .map(|j| (j.id().to_string(), j.statepoint().clone()))
                .collect(),
        )
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[allow(dead_code)]
    pub fn get(&self, id: &str) -> Option<&StatePoint> {
        self.0.get(id)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| FlowError::fs(parent, e))?;
        }
        atomic_write(path, serde_json::to_string_pretty(self)?.as_bytes())
    }

    #[allow(dead_code)]
    pub fn read(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| FlowError::fs(path, e))?;
        serde_json::from_str(&contents)
            .map_err(|e| FlowError::Integrity(format!("corrupted index {}: {e}", path.display())))
    }
}

/// Last evaluated state of every (job, operation) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusCache {
    pub updated_at: DateTime<Utc>,
    pub jobs: BTreeMap<String, BTreeMap<String, PairState>>,
}

impl StatusCache {
    pub fn new() -> Self {
        Self {
            updated_at: Utc::now(),
            jobs: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, job_id: &str, operation: &str, state: PairState) {
        self.jobs
            .entry(job_id.to_string())
            .or_default()
            .insert(operation.to_string(), state);
    }

    pub fn path_in(project_dir: &Path) -> PathBuf {
        project_dir.join(".morphflow").join("status.json")
    }

    /// Merges into whatever is on disk so runs over a job subset keep the other entries.
    pub fn merge_into(&self, path: &Path) -> Result<()> {
        let mut merged = Self::load(path)?.unwrap_or_else(Self::new);
        for (job, ops) in &self.jobs {
            merged.jobs.entry(job.clone()).or_default().extend(ops.clone());
        }
        merged.updated_at = Utc::now();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| FlowError::fs(parent, e))?;
        }
        atomic_write(path, serde_json::to_string_pretty(&merged)?.as_bytes())
    }

    /// Returns `None` when no snapshot has been written yet.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(FlowError::fs(path, e)),
        }
    }
}

impl Default for StatusCache {
    fn default() -> Self {
        Self::new()
    }
}
