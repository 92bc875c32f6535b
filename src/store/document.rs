use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::Value;

use super::atomic_write;
use crate::error::{FlowError, Result};

/// Small persisted key/value record scoped to one job.
///
/// Mutations are buffered in memory; [`Document::save`] replaces the file
/// atomically, so a reader never observes a half-written record.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    path: PathBuf,
    fields: BTreeMap<String, Value>,
}

impl Document {
    /// Loads the document at `path`, or starts an empty one if the file does not exist.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let fields = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).map_err(|e| {
                FlowError::Integrity(format!("corrupted document {}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(FlowError::fs(&path, e)),
        };
        Ok(Self { path, fields })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[allow(dead_code)]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// True only when `key` holds the JSON boolean `true`.
    pub fn flag(&self, key: &str) -> bool {
        matches!(self.fields.get(key), Some(Value::Bool(true)))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn save(&self) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&self.fields)?;
        atomic_write(&self.path, &bytes)
    }
}
