//! Synchronizer configuration.

use quarry_evidence::GateConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default number of run records kept in frontmatter
pub const DEFAULT_MAX_RUNS: usize = 10;

/// Synchronizer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Markdown file whose sentinel region lists the workspace notebooks
    pub index_path: Option<PathBuf>,
    /// Workspace directory scanned for the index; defaults to the
    /// notebook's directory
    #[serde(default)]
    pub workspace_dir: Option<PathBuf>,
    /// Workspace name written into new documents; defaults to the
    /// workspace directory's name
    pub workspace_name: Option<String>,
    /// Tags written into new documents
    pub tags: Vec<String>,
    /// Run records kept in frontmatter, oldest evicted first
    pub max_runs: usize,
    /// Quality gate thresholds
    pub gate: GateConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            index_path: None,
            workspace_dir: None,
            workspace_name: None,
            tags: Vec::new(),
            max_runs: DEFAULT_MAX_RUNS,
            gate: GateConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Regenerate this index file after every write
    #[must_use]
    pub fn with_index(mut self, index_path: impl Into<PathBuf>) -> Self {
        self.index_path = Some(index_path.into());
        self
    }

    /// Set the workspace directory
    #[must_use]
    pub fn with_workspace_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workspace_dir = Some(dir.into());
        self
    }

    /// Set the workspace name for new documents
    #[must_use]
    pub fn with_workspace_name(mut self, name: impl Into<String>) -> Self {
        self.workspace_name = Some(name.into());
        self
    }

    /// Set tags for new documents
    #[must_use]
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Set run record retention
    #[must_use]
    pub fn with_max_runs(mut self, max_runs: usize) -> Self {
        self.max_runs = max_runs;
        self
    }

    /// Set gate thresholds
    #[must_use]
    pub fn with_gate(mut self, gate: GateConfig) -> Self {
        self.gate = gate;
        self
    }
}
