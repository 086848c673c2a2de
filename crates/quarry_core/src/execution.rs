//! Execution request and result records.
//!
//! These travel from the supervisor to the notebook layer, so they live in
//! the core crate and carry no transport details.

use crate::id::SequenceId;
use serde::{Deserialize, Serialize};

/// A single execution request, immutable once sent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Sequence id assigned by the supervisor
    pub sequence_id: SequenceId,
    /// Source code to run
    pub code: String,
    /// How long the caller is willing to block
    pub timeout_ms: u64,
}

impl ExecutionRequest {
    /// Create a new request
    #[must_use]
    pub fn new(sequence_id: SequenceId, code: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            sequence_id,
            code: code.into(),
            timeout_ms,
        }
    }
}

/// Outcome class of an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Code ran to completion
    Ok,
    /// Code raised an exception inside the interpreter
    Error,
    /// The caller stopped waiting; the worker may still be computing
    Timeout,
    /// The worker process exited before responding
    WorkerDied,
}

impl ExecutionStatus {
    /// Whether the worker produced a response for this execution
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Ok | Self::Error)
    }

    /// Stable lowercase name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Timeout => "timeout",
            Self::WorkerDied => "worker_died",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Captured result of one execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Sequence id of the request this answers
    pub sequence_id: SequenceId,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
    /// Formatted exception trace, if the code raised
    pub exception_trace: Option<String>,
    /// Wall time spent, as measured by the worker when it answered
    pub duration_ms: u64,
    /// Outcome class
    pub status: ExecutionStatus,
}

impl ExecutionResult {
    /// Build a result from a worker response
    ///
    /// The status is `Error` whenever an exception trace is present.
    #[must_use]
    pub fn completed(
        sequence_id: SequenceId,
        stdout: String,
        stderr: String,
        exception_trace: Option<String>,
        duration_ms: u64,
    ) -> Self {
        let status = if exception_trace.is_some() {
            ExecutionStatus::Error
        } else {
            ExecutionStatus::Ok
        };
        Self {
            sequence_id,
            stdout,
            stderr,
            exception_trace,
            duration_ms,
            status,
        }
    }

    /// Result for a request the caller stopped waiting on
    #[must_use]
    pub fn timed_out(sequence_id: SequenceId, waited_ms: u64) -> Self {
        Self {
            sequence_id,
            stdout: String::new(),
            stderr: String::new(),
            exception_trace: None,
            duration_ms: waited_ms,
            status: ExecutionStatus::Timeout,
        }
    }

    /// Result for a request whose worker exited before answering
    #[must_use]
    pub fn worker_died(sequence_id: SequenceId, elapsed_ms: u64, reason: impl Into<String>) -> Self {
        Self {
            sequence_id,
            stdout: String::new(),
            stderr: reason.into(),
            exception_trace: None,
            duration_ms: elapsed_ms,
            status: ExecutionStatus::WorkerDied,
        }
    }

    /// Whether the code ran without raising
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == ExecutionStatus::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completed_status_follows_exception() {
        let ok = ExecutionResult::completed(SequenceId::FIRST, "hi\n".into(), String::new(), None, 3);
        assert_eq!(ok.status, ExecutionStatus::Ok);
        assert!(ok.is_ok());

        let err = ExecutionResult::completed(
            SequenceId::FIRST,
            String::new(),
            String::new(),
            Some("ZeroDivisionError: division by zero".into()),
            1,
        );
        assert_eq!(err.status, ExecutionStatus::Error);
        assert!(!err.is_ok());
    }

    #[test]
    fn test_status_completed() {
        assert!(ExecutionStatus::Ok.is_completed());
        assert!(ExecutionStatus::Error.is_completed());
        assert!(!ExecutionStatus::Timeout.is_completed());
        assert!(!ExecutionStatus::WorkerDied.is_completed());
    }

    #[test]
    fn test_status_serde_names() {
        let json = serde_json::to_string(&ExecutionStatus::WorkerDied).unwrap();
        assert_eq!(json, "\"worker_died\"");
        assert_eq!(ExecutionStatus::Timeout.to_string(), "timeout");
    }

    #[test]
    fn test_timed_out_and_worker_died() {
        let t = ExecutionResult::timed_out(SequenceId::from_raw(4), 250);
        assert_eq!(t.status, ExecutionStatus::Timeout);
        assert_eq!(t.duration_ms, 250);

        let d = ExecutionResult::worker_died(SequenceId::from_raw(5), 10, "exit status 137");
        assert_eq!(d.status, ExecutionStatus::WorkerDied);
        assert!(d.stderr.contains("137"));
    }
}
