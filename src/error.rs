use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FlowError>;

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Missing input: {0}")]
    MissingInput(String),

    #[error("Invalid input in '{}': {message}", .path.display())]
    InvalidInput { path: PathBuf, message: String },

    #[error("Filesystem error at '{}': {source}", .path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("Operation '{operation}' finished but its postconditions are still false")]
    Incomplete { operation: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FlowError {
    /// Wraps an I/O failure together with the path it happened on.
    pub fn fs(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        FlowError::Filesystem {
            path: path.into(),
            source,
        }
    }

    /// Fatal errors abort the whole invocation instead of a single (job, operation) pair.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FlowError::Configuration(_) | FlowError::Integrity(_))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            FlowError::Configuration(_) => ErrorKind::Configuration,
            FlowError::MissingInput(_) => ErrorKind::MissingInput,
            FlowError::InvalidInput { .. } => ErrorKind::InvalidInput,
            FlowError::Filesystem { .. } | FlowError::Json(_) => ErrorKind::Filesystem,
            FlowError::Engine(_) => ErrorKind::Engine,
            FlowError::Integrity(_) => ErrorKind::Integrity,
            FlowError::Incomplete { .. } => ErrorKind::Incomplete,
        }
    }
}

/// Coarse classification used in run summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    Configuration,
    MissingInput,
    InvalidInput,
    Filesystem,
    Engine,
    Integrity,
    Incomplete,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::MissingInput => "missing input",
            ErrorKind::InvalidInput => "invalid input",
            ErrorKind::Filesystem => "filesystem",
            ErrorKind::Engine => "engine",
            ErrorKind::Integrity => "integrity",
            ErrorKind::Incomplete => "incomplete",
        };
        write!(f, "{name}")
    }
}
