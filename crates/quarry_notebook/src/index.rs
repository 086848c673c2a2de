//! Workspace indexes.
//!
//! The index is a Markdown file that may hold arbitrary user prose. The
//! generated table lives between [`BEGIN`] and [`END`]; only the bytes
//! strictly between the two sentinels are ever rewritten.

use crate::document::{DocumentStatus, EXTENSION, NotebookDocument};
use crate::error::{NotebookError, NotebookResult};
use quarry_core::Timestamp;
use quarry_core::fs::write_atomic;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Opening sentinel
pub const BEGIN: &str = "<!-- quarry:index:begin -->";

/// Closing sentinel
pub const END: &str = "<!-- quarry:index:end -->";

/// Default index file name inside a workspace
pub const INDEX_FILE: &str = "INDEX.md";

/// One notebook in the index
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexEntry {
    /// Document slug
    pub slug: String,
    /// Path relative to the workspace
    pub path: PathBuf,
    /// Lifecycle state
    pub status: DocumentStatus,
    /// Last write
    pub updated: Timestamp,
    /// Cached quality score
    pub score: Option<u32>,
    /// Number of executions recorded
    pub executions: usize,
}

impl IndexEntry {
    fn from_document(workspace: &Path, doc: &NotebookDocument) -> Self {
        let path = doc
            .path()
            .strip_prefix(workspace)
            .unwrap_or(doc.path())
            .to_path_buf();
        Self {
            slug: doc.frontmatter.slug.clone(),
            path,
            status: doc.frontmatter.status,
            updated: doc.frontmatter.updated,
            score: doc.cached_quality().map(|q| q.score),
            executions: doc.execution_count(),
        }
    }
}

/// Index of every notebook in a workspace directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkspaceIndex {
    /// Workspace directory
    pub workspace_path: PathBuf,
    /// Entries sorted by slug
    pub entries: Vec<IndexEntry>,
}

impl WorkspaceIndex {
    /// Build from the notebooks directly inside `workspace`
    ///
    /// Documents that fail to load are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be read
    pub fn scan(workspace: &Path) -> NotebookResult<Self> {
        let mut entries = Vec::new();
        let dir = std::fs::read_dir(workspace).map_err(NotebookError::io(workspace))?;
        for entry in dir {
            let path = entry.map_err(NotebookError::io(workspace))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) || !path.is_file() {
                continue;
            }
            match NotebookDocument::load(&path) {
                Ok(doc) => entries.push(IndexEntry::from_document(workspace, &doc)),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping notebook in index"),
            }
        }
        entries.sort_by(|a, b| a.slug.cmp(&b.slug).then_with(|| a.path.cmp(&b.path)));
        Ok(Self {
            workspace_path: workspace.to_path_buf(),
            entries,
        })
    }

    /// Markdown table for the sentinel region, newline-delimited on both ends
    #[must_use]
    pub fn render_table(&self) -> String {
        let mut out = String::from("\n| Notebook | Status | Updated | Score | Executions |\n");
        out.push_str("|---|---|---|---|---|\n");
        for entry in &self.entries {
            let score = entry
                .score
                .map_or_else(|| "-".to_string(), |s| s.to_string());
            out.push_str(&format!(
                "| [{}]({}) | {} | {} | {} | {} |\n",
                entry.slug,
                entry.path.display(),
                entry.status.as_str(),
                entry.updated,
                score,
                entry.executions
            ));
        }
        out
    }
}

/// Replace the bytes strictly between the sentinels of `existing`
///
/// Text without any sentinel gets a fresh block appended.
///
/// # Errors
///
/// Returns a description of the problem when a sentinel is missing its
/// partner, appears twice, or the end precedes the begin
pub fn splice_region(existing: &str, generated: &str) -> Result<String, String> {
    let begins: Vec<usize> = existing.match_indices(BEGIN).map(|(i, _)| i).collect();
    let ends: Vec<usize> = existing.match_indices(END).map(|(i, _)| i).collect();

    match (begins.as_slice(), ends.as_slice()) {
        ([], []) => {
            let mut out = existing.to_string();
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(BEGIN);
            out.push_str(generated);
            out.push_str(END);
            out.push('\n');
            Ok(out)
        }
        ([begin], [end]) => {
            let start = begin + BEGIN.len();
            if *end < start {
                return Err("end sentinel precedes begin sentinel".to_string());
            }
            let mut out = String::with_capacity(existing.len() + generated.len());
            out.push_str(&existing[..start]);
            out.push_str(generated);
            out.push_str(&existing[*end..]);
            Ok(out)
        }
        ([_], []) => Err("begin sentinel has no matching end sentinel".to_string()),
        ([], [_]) => Err("end sentinel has no matching begin sentinel".to_string()),
        _ => Err(format!(
            "expected one sentinel pair, found {} begin and {} end",
            begins.len(),
            ends.len()
        )),
    }
}

/// Regenerate the index region of `index_path`
///
/// A missing file is created. The file is left untouched when its
/// sentinels are malformed.
///
/// # Errors
///
/// Returns [`NotebookError::MalformedIndex`] for bad sentinels, or an I/O
/// error
pub fn write_index(index_path: &Path, index: &WorkspaceIndex) -> NotebookResult<()> {
    let existing = match std::fs::read_to_string(index_path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(NotebookError::io(index_path)(e)),
    };
    let updated = splice_region(&existing, &index.render_table()).map_err(|reason| {
        NotebookError::MalformedIndex {
            path: index_path.to_path_buf(),
            reason,
        }
    })?;
    if updated == existing {
        return Ok(());
    }
    write_atomic(index_path, updated.as_bytes()).map_err(NotebookError::io(index_path))?;
    debug!(path = %index_path.display(), entries = index.entries.len(), "Wrote workspace index");
    Ok(())
}

/// Scan `workspace` and regenerate `index_path`
///
/// # Errors
///
/// Same as [`WorkspaceIndex::scan`] and [`write_index`]
pub fn regenerate(workspace: &Path, index_path: &Path) -> NotebookResult<WorkspaceIndex> {
    let index = WorkspaceIndex::scan(workspace)?;
    write_index(index_path, &index)?;
    Ok(index)
}
