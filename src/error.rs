//! Error types for the retrieval core.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("store operation '{operation}' failed: {cause}")]
    Store {
        operation: String,
        #[source]
        cause: rusqlite::Error,
    },

    #[error("io error on {path}: {cause}")]
    Io {
        path: PathBuf,
        #[source]
        cause: std::io::Error,
    },

    #[error("invalid config field '{field}': {cause}")]
    Config { field: String, cause: String },

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    EmbeddingDimensionMismatch { expected: u16, actual: usize },

    #[error("path not allowed: {0}")]
    PathNotAllowed(PathBuf),

    #[error("file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("json parse error: {cause}")]
    Json {
        #[source]
        cause: serde_json::Error,
    },

    #[error("yaml parse error: {cause}")]
    Yaml {
        #[source]
        cause: serde_yaml::Error,
    },
}

impl From<rusqlite::Error> for MemoryError {
    fn from(cause: rusqlite::Error) -> Self {
        MemoryError::Store {
            operation: "query".to_string(),
            cause,
        }
    }
}

pub type Result<T> = std::result::Result<T, MemoryError>;
