//! QUARRY Notebook
//!
//! Durable, self-describing research documents. Each session writes one
//! Jupyter (nbformat 4) notebook whose leading raw cell carries YAML
//! frontmatter; every execution appends a code cell, and the latest
//! quality-gate result is cached in notebook metadata. Workspace indexes
//! are regenerated inside sentinel-delimited regions of a Markdown file.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod document;
pub mod error;
pub mod index;
pub mod sync;

pub use config::SyncConfig;
pub use document::{DocumentStatus, Frontmatter, NotebookDocument, RunRecord};
pub use error::{NotebookError, NotebookResult};
pub use index::{IndexEntry, WorkspaceIndex};
pub use sync::{NotebookSynchronizer, SyncOutcome};
