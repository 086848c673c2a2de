//! Execution recording.

use crate::config::SyncConfig;
use crate::document::{NotebookDocument, RunRecord};
use crate::error::NotebookResult;
use crate::index::{self, WorkspaceIndex};
use quarry_core::{ExecutionResult, ExecutionStatus, SequenceId, SessionId, Timestamp};
use quarry_evidence::{Marker, MarkerHistory, QualityGate, QualityGateResult};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// What one [`NotebookSynchronizer::record`] call wrote
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    /// Sequence id of the recorded execution
    pub sequence_id: SequenceId,
    /// Index of the appended cell in the notebook (cell 0 is frontmatter)
    pub cell_index: usize,
    /// Markers found in this execution's stdout
    pub markers: Vec<Marker>,
    /// Gate result over the whole session history
    pub quality: QualityGateResult,
    /// Whether the workspace index was regenerated
    pub index_updated: bool,
}

/// Writes execution results into one session's notebook
#[derive(Debug, Clone)]
pub struct NotebookSynchronizer {
    path: PathBuf,
    session_id: SessionId,
    config: SyncConfig,
    gate: QualityGate,
}

impl NotebookSynchronizer {
    /// Create a synchronizer for the document at `path`
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, session_id: SessionId, config: SyncConfig) -> Self {
        let gate = QualityGate::with_config(config.gate.clone());
        Self {
            path: path.into(),
            session_id,
            config,
            gate,
        }
    }

    /// Document path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Configuration
    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Load the document, or build a fresh one in memory if none exists
    ///
    /// # Errors
    ///
    /// Returns error if an existing document cannot be read or parsed
    pub fn open_or_create(&self) -> NotebookResult<NotebookDocument> {
        if self.path.exists() {
            return NotebookDocument::load(&self.path);
        }
        let slug = self
            .path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("notebook")
            .to_string();
        let workspace = self.config.workspace_name.clone().unwrap_or_else(|| {
            self.workspace_dir()
                .file_name()
                .and_then(|s| s.to_str())
                .unwrap_or("default")
                .to_string()
        });
        let mut doc = NotebookDocument::create(&self.path, workspace, slug);
        doc.frontmatter.tags = self.config.tags.clone();
        Ok(doc)
    }

    /// Append one execution and rewrite the document
    ///
    /// Timeouts are not recorded; the late result is recorded when it is
    /// collected. Returns `None` for them.
    ///
    /// # Errors
    ///
    /// Returns error if the existing document is malformed or the write
    /// fails; a malformed document is never overwritten
    pub fn record(&self, code: &str, result: &ExecutionResult) -> NotebookResult<Option<SyncOutcome>> {
        if result.status == ExecutionStatus::Timeout {
            debug!(session = %self.session_id, seq = %result.sequence_id, "Not recording timeout");
            return Ok(None);
        }

        let mut doc = self.open_or_create()?;
        let chunks = doc.stdout_chunks();
        let mut history = MarkerHistory::from_chunks(chunks.iter().map(String::as_str));
        let markers = history.push_chunk(&result.stdout);
        let quality = self.gate.evaluate(history.markers());

        let now = Timestamp::now();
        let cell_index = doc.append_execution(code, result, markers.clone(), now);
        doc.frontmatter.touch(now);
        doc.frontmatter.push_run(
            RunRecord {
                sequence_id: result.sequence_id,
                status: result.status,
                duration_ms: result.duration_ms,
                score: quality.score,
                recorded_at: now,
            },
            self.config.max_runs,
        );
        doc.set_quality(&self.session_id, quality.clone());
        doc.save()?;

        info!(
            session = %self.session_id,
            seq = %result.sequence_id,
            status = %result.status,
            markers = markers.len(),
            score = quality.score,
            "Recorded execution"
        );

        let index_updated = match self.regenerate_index() {
            Ok(updated) => updated.is_some(),
            Err(e) => {
                warn!(session = %self.session_id, error = %e, "Workspace index not updated");
                false
            }
        };

        Ok(Some(SyncOutcome {
            sequence_id: result.sequence_id,
            cell_index,
            markers,
            quality,
            index_updated,
        }))
    }

    /// Gate result over the document's full history
    ///
    /// A document that does not exist yet scores as an empty history.
    ///
    /// # Errors
    ///
    /// Returns error if an existing document cannot be read or parsed
    pub fn quality_report(&self) -> NotebookResult<QualityGateResult> {
        if !self.path.exists() {
            return Ok(self.gate.evaluate(&[]));
        }
        let doc = NotebookDocument::load(&self.path)?;
        let chunks = doc.stdout_chunks();
        let history = MarkerHistory::from_chunks(chunks.iter().map(String::as_str));
        Ok(self.gate.evaluate(history.markers()))
    }

    /// Regenerate the configured workspace index; `None` when unconfigured
    ///
    /// # Errors
    ///
    /// Returns error if the workspace cannot be scanned or the index has
    /// malformed sentinels
    pub fn regenerate_index(&self) -> NotebookResult<Option<WorkspaceIndex>> {
        match &self.config.index_path {
            Some(index_path) => index::regenerate(self.workspace_dir(), index_path).map(Some),
            None => Ok(None),
        }
    }

    /// Directory scanned for the index and named in new documents
    #[must_use]
    pub fn workspace_dir(&self) -> &Path {
        if let Some(dir) = &self.config.workspace_dir {
            return dir;
        }
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Cell;
    use crate::error::NotebookError;
    use crate::index::{BEGIN, INDEX_FILE};
    use quarry_evidence::MarkerType;

    fn ok(seq: u64, stdout: &str) -> ExecutionResult {
        ExecutionResult::completed(SequenceId::from_raw(seq), stdout.to_string(), String::new(), None, 3)
    }

    fn sync_in(dir: &Path, config: SyncConfig) -> NotebookSynchronizer {
        NotebookSynchronizer::new(
            dir.join("churn.ipynb"),
            SessionId::parse("churn").unwrap(),
            config,
        )
    }

    #[test]
    fn test_record_creates_document() {
        let dir = tempfile::tempdir().unwrap();
        let sync = sync_in(dir.path(), SyncConfig::default().with_tags(vec!["ml".into()]));

        let outcome = sync.record("print('hi')", &ok(1, "hi\n")).unwrap().unwrap();
        assert_eq!(outcome.cell_index, 1);
        assert!(outcome.quality.passed);
        assert!(!outcome.index_updated);

        let doc = NotebookDocument::load(sync.path()).unwrap();
        assert_eq!(doc.frontmatter.slug, "churn");
        assert_eq!(doc.frontmatter.tags, vec!["ml".to_string()]);
        assert_eq!(doc.frontmatter.runs.len(), 1);
        assert!(doc.frontmatter.updated >= doc.frontmatter.created);
        assert_eq!(doc.cached_quality().unwrap().score, 100);
    }

    #[test]
    fn test_marker_lines_monotonic_across_cells() {
        let dir = tempfile::tempdir().unwrap();
        let sync = sync_in(dir.path(), SyncConfig::default());

        sync.record("a", &ok(1, "[OBJECTIVE] churn\nnoise\n")).unwrap();
        let second = sync
            .record("b", &ok(2, "[DATA] 10k rows\n[FINDING] x\n"))
            .unwrap()
            .unwrap();

        let lines: Vec<usize> = second.markers.iter().map(|m| m.line_number).collect();
        assert_eq!(lines, vec![3, 4]);
        assert_eq!(second.cell_index, 2);

        let doc = NotebookDocument::load(sync.path()).unwrap();
        let recorded = doc.cells[1].record().unwrap();
        assert_eq!(recorded.markers[1].marker_type, MarkerType::Finding);
        assert_eq!(recorded.markers[1].line_number, 4);
    }

    #[test]
    fn test_quality_recomputed_over_full_history() {
        let dir = tempfile::tempdir().unwrap();
        let sync = sync_in(dir.path(), SyncConfig::default());

        let first = sync.record("a", &ok(1, "[FINDING] churn rises\n")).unwrap().unwrap();
        assert!(!first.quality.passed);
        assert_eq!(first.quality.score, 40);

        sync.record("b", &ok(2, "[STAT:ci] 95% CI [0.1, 0.3]\n[STAT:effect_size] d=0.4\n"))
            .unwrap();
        let report = sync.quality_report().unwrap();
        assert_eq!(report.score, 40);

        sync.record(
            "c",
            &ok(3, "[STAT:ci] 95% CI [0.1, 0.3]\n[STAT:effect_size] d=0.4\n[FINDING] churn rises\n"),
        )
        .unwrap();
        let report = sync.quality_report().unwrap();
        assert_eq!(report.findings_validation.total, 2);
        assert_eq!(report.findings_validation.verified, 1);
    }

    #[test]
    fn test_timeout_not_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let sync = sync_in(dir.path(), SyncConfig::default());
        let outcome = sync
            .record("sleep", &ExecutionResult::timed_out(SequenceId::FIRST, 100))
            .unwrap();
        assert!(outcome.is_none());
        assert!(!sync.path().exists());
    }

    #[test]
    fn test_error_and_death_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let sync = sync_in(dir.path(), SyncConfig::default());
        let err = ExecutionResult::completed(
            SequenceId::FIRST,
            String::new(),
            String::new(),
            Some("NameError: name 'x' is not defined".into()),
            1,
        );
        sync.record("x", &err).unwrap();
        sync.record("crash", &ExecutionResult::worker_died(SequenceId::from_raw(2), 4, "exit status: 1"))
            .unwrap();

        let doc = NotebookDocument::load(sync.path()).unwrap();
        let statuses: Vec<ExecutionStatus> = doc.frontmatter.runs.iter().map(|r| r.status).collect();
        assert_eq!(statuses, vec![ExecutionStatus::Error, ExecutionStatus::WorkerDied]);
        assert!(matches!(&doc.cells[0], Cell::Code { outputs, .. } if !outputs.is_empty()));
    }

    #[test]
    fn test_run_retention() {
        let dir = tempfile::tempdir().unwrap();
        let sync = sync_in(dir.path(), SyncConfig::default());
        for seq in 1..=12 {
            sync.record("pass", &ok(seq, "")).unwrap();
        }
        let doc = NotebookDocument::load(sync.path()).unwrap();
        assert_eq!(doc.frontmatter.runs.len(), 10);
        assert_eq!(doc.frontmatter.runs[0].sequence_id, SequenceId::from_raw(3));
        assert_eq!(doc.execution_count(), 12);
    }

    #[test]
    fn test_malformed_document_is_never_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let sync = sync_in(dir.path(), SyncConfig::default());
        let broken = r#"{"cells": [], "metadata": {}, "nbformat": 4, "nbformat_minor": 5}"#;
        std::fs::write(sync.path(), broken).unwrap();

        let err = sync.record("a", &ok(1, "x\n")).unwrap_err();
        assert!(matches!(err, NotebookError::MalformedMetadata { .. }));
        assert_eq!(std::fs::read_to_string(sync.path()).unwrap(), broken);
        assert!(sync.quality_report().is_err());
    }

    #[test]
    fn test_record_regenerates_index() {
        let dir = tempfile::tempdir().unwrap();
        let index_path = dir.path().join(INDEX_FILE);
        let sync = sync_in(dir.path(), SyncConfig::default().with_index(&index_path));

        let outcome = sync.record("a", &ok(1, "[FINDING] x\n")).unwrap().unwrap();
        assert!(outcome.index_updated);
        let text = std::fs::read_to_string(&index_path).unwrap();
        assert!(text.starts_with(BEGIN));
        assert!(text.contains("| [churn](churn.ipynb) | active |"));
        assert!(text.contains("| 40 | 1 |"));
    }

    #[test]
    fn test_malformed_index_does_not_fail_record() {
        let dir = tempfile::tempdir().unwrap();
        let index_path = dir.path().join(INDEX_FILE);
        std::fs::write(&index_path, BEGIN).unwrap();
        let sync = sync_in(dir.path(), SyncConfig::default().with_index(&index_path));

        let outcome = sync.record("a", &ok(1, "")).unwrap().unwrap();
        assert!(!outcome.index_updated);
        assert_eq!(std::fs::read_to_string(&index_path).unwrap(), BEGIN);
        assert!(matches!(
            sync.regenerate_index(),
            Err(NotebookError::MalformedIndex { .. })
        ));
    }

    #[test]
    fn test_configured_workspace_dir_names_and_indexes() {
        let dir = tempfile::tempdir().unwrap();
        let lab = dir.path().join("lab");
        std::fs::create_dir(&lab).unwrap();
        NotebookDocument::create(lab.join("prior.ipynb"), "lab", "prior")
            .save()
            .unwrap();
        let index_path = lab.join(INDEX_FILE);
        let config = SyncConfig::default()
            .with_workspace_dir(&lab)
            .with_index(&index_path);
        let sync = sync_in(dir.path(), config);
        assert_eq!(sync.workspace_dir(), lab.as_path());

        sync.record("a", &ok(1, "x\n")).unwrap().unwrap();
        let doc = NotebookDocument::load(sync.path()).unwrap();
        assert_eq!(doc.frontmatter.workspace, "lab");
        let text = std::fs::read_to_string(&index_path).unwrap();
        assert!(text.contains("[prior](prior.ipynb)"));
    }

    #[test]
    fn test_quality_report_without_document() {
        let dir = tempfile::tempdir().unwrap();
        let sync = sync_in(dir.path(), SyncConfig::default());
        let report = sync.quality_report().unwrap();
        assert!(report.passed);
        assert_eq!(report.score, 100);
    }
}
