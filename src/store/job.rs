use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, info, warn};

use super::statepoint::FINGERPRINT_LEN;
use super::{Document, StatePoint, atomic_write};
use crate::error::{FlowError, Result};

pub const STATEPOINT_FILE: &str = "statepoint.json";
pub const DOCUMENT_FILE: &str = "document.json";
pub const OUTPUT_DIR: &str = "output";

/// Workspace plus persisted state bound to one state point.
#[derive(Debug, Clone)]
pub struct Job {
    id: String,
    statepoint: StatePoint,
    workspace: PathBuf,
    doc: Document,
}

impl Job {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn statepoint(&self) -> &StatePoint {
        &self.statepoint
    }

    #[allow(dead_code)]
    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn output_dir(&self) -> PathBuf {
        self.workspace.join(OUTPUT_DIR)
    }

    /// Resolves a path relative to the workspace root.
    pub fn path(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.workspace.join(rel)
    }

    pub fn doc(&self) -> &Document {
        &self.doc
    }

    pub fn doc_mut(&mut self) -> &mut Document {
        &mut self.doc
    }

    /// Re-reads the document from disk, picking up writes made by other processes.
    pub fn reload(&mut self) -> Result<()> {
        self.doc = Document::load(self.workspace.join(DOCUMENT_FILE))?;
        Ok(())
    }
}

/// Conjunction of `key = value` equalities over state point fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobFilter {
    terms: Vec<(String, Value)>,
}

impl JobFilter {
    pub fn all() -> Self {
        Self::default()
    }

    #[allow(dead_code)]
    pub fn eq(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.terms.push((key.into(), value.into()));
        self
    }

    /// Parses `key=value`. The value is read as JSON when possible, else as a plain string.
    pub fn parse_term(term: &str) -> Result<(String, Value)> {
        let (key, raw) = term.split_once('=').ok_or_else(|| {
            FlowError::Configuration(format!("filter '{term}' is not of the form key=value"))
        })?;
        let key = key.trim();
        if key.is_empty() {
            return Err(FlowError::Configuration(format!("filter '{term}' has an empty key")));
        }
        let raw = raw.trim();
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        Ok((key.to_string(), value))
    }

    pub fn parse(terms: &[String]) -> Result<Self> {
        let terms = terms
            .iter()
            .map(|t| Self::parse_term(t))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { terms })
    }

    pub fn matches(&self, sp: &StatePoint) -> bool {
        self.terms
            .iter()
            .all(|(key, want)| sp.get(key).is_some_and(|have| values_equal(have, want)))
    }
}

// Numbers compare by value so `300` matches a stored `300.0`.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Content-addressed store of job workspaces under a single root directory.
#[derive(Debug, Clone)]
pub struct JobStore {
    root: PathBuf,
}

impl JobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Attaches to the workspace for `sp`, creating it on first use.
    ///
    /// Safe to call any number of times: an existing document or output
    /// tree is never reset. A workspace whose recorded state point differs
    /// from `sp` is a fingerprint collision and fails with an integrity error.
    pub fn open_or_create(&self, sp: &StatePoint) -> Result<Job> {
        let id = sp.fingerprint();
        let workspace = self.root.join(&id);
        let sp_path = workspace.join(STATEPOINT_FILE);

        match read_statepoint(&sp_path)? {
            Some(existing) if existing != *sp => {
                return Err(FlowError::Integrity(format!(
                    "fingerprint collision in {}: {} vs {}",
                    workspace.display(),
                    existing.canonical_json(),
                    sp.canonical_json()
                )));
            }
            Some(_) => debug!("attached to existing job {id}"),
            None => {
                if workspace.exists() {
                    warn!("job {id} has no state point file, repairing");
                } else {
                    info!("creating job {id}");
                }
                std::fs::create_dir_all(workspace.join(OUTPUT_DIR))
                    .map_err(|e| FlowError::fs(&workspace, e))?;
                atomic_write(&sp_path, serde_json::to_string_pretty(sp)?.as_bytes())?;
            }
        }

        let output = workspace.join(OUTPUT_DIR);
        if !output.exists() {
            std::fs::create_dir_all(&output).map_err(|e| FlowError::fs(&output, e))?;
        }

        let doc = Document::load(workspace.join(DOCUMENT_FILE))?;
        if !doc.path().exists() {
            doc.save()?;
        }

        Ok(Job {
            id,
            statepoint: sp.clone(),
            workspace,
            doc,
        })
    }

    /// Opens an existing job by id, verifying that its state point still hashes to it.
    pub fn open(&self, id: &str) -> Result<Job> {
        let workspace = self.root.join(id);
        let sp_path = workspace.join(STATEPOINT_FILE);
        let statepoint = read_statepoint(&sp_path)?.ok_or_else(|| {
            FlowError::Integrity(format!("job {id} has no readable state point"))
        })?;
        if statepoint.fingerprint() != id {
            return Err(FlowError::Integrity(format!(
                "job directory {id} holds a state point hashing to {}",
                statepoint.fingerprint()
            )));
        }
        let doc = Document::load(workspace.join(DOCUMENT_FILE))?;
        Ok(Job {
            id: id.to_string(),
            statepoint,
            workspace,
            doc,
        })
    }

    /// All jobs whose state point matches `filter`, ordered by id.
    pub fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(FlowError::fs(&self.root, e)),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| FlowError::fs(&self.root, e))?;
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            let name = entry.file_name().to_string_lossy().into_owned();
            if !is_dir || name.starts_with('.') {
                continue;
            }
            if !is_fingerprint(&name) {
                warn!("ignoring {}: not a job directory", entry.path().display());
                continue;
            }
            if !entry.path().join(STATEPOINT_FILE).exists() {
                warn!("ignoring job {name}: no state point file");
                continue;
            }
            ids.push(name);
        }
        ids.sort();

        let mut jobs = Vec::new();
        for id in ids {
            let job = self.open(&id)?;
            if filter.matches(job.statepoint()) {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }
}

fn is_fingerprint(name: &str) -> bool {
    name.len() == FINGERPRINT_LEN && name.bytes().all(|b| b.is_ascii_hexdigit())
}

fn read_statepoint(path: &Path) -> Result<Option<StatePoint>> {
    match std::fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents).map(Some).map_err(|e| {
            FlowError::Integrity(format!("corrupted state point {}: {e}", path.display()))
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(FlowError::fs(path, e)),
    }
}
