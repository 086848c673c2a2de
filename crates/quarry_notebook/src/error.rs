//! Notebook error types.

use std::path::PathBuf;

/// Notebook result type
pub type NotebookResult<T> = Result<T, NotebookError>;

/// Notebook errors
#[derive(Debug, thiserror::Error)]
pub enum NotebookError {
    /// The leading metadata cell is missing or unparsable
    #[error("Malformed notebook metadata in {}: {reason}", path.display())]
    MalformedMetadata {
        /// Offending document
        path: PathBuf,
        /// What was wrong
        reason: String,
    },

    /// Index sentinels are missing a partner, duplicated, or out of order
    #[error("Malformed index {}: {reason}", path.display())]
    MalformedIndex {
        /// Offending index file
        path: PathBuf,
        /// What was wrong
        reason: String,
    },

    /// The document is not valid notebook JSON
    #[error("Cannot parse {}: {source}", path.display())]
    Parse {
        /// Offending document
        path: PathBuf,
        /// Underlying error
        #[source]
        source: serde_json::Error,
    },

    /// Filesystem failure
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        /// Path being read or written
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
}

impl NotebookError {
    /// Wrap an I/O error with the path involved
    pub fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> NotebookError {
        let path = path.into();
        move |source| NotebookError::Io { path, source }
    }
}
