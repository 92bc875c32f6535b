mod document;
mod index;
mod job;
mod statepoint;

pub use document::Document;
pub use index::{StatePointIndex, StatusCache};
pub use job::{DOCUMENT_FILE, Job, JobFilter, JobStore, OUTPUT_DIR, STATEPOINT_FILE};
pub use statepoint::StatePoint;

use std::path::Path;

use crate::error::{FlowError, Result};

/// Writes `bytes` to a sibling temp file and renames it over `path`.
pub(crate) fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{name}.{}.tmp", std::process::id()));
    std::fs::write(&tmp, bytes).map_err(|e| FlowError::fs(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| FlowError::fs(path, e))
}
