//! Bridge error taxonomy.

use quarry_core::{CoreError, ExecutionResult, ExecutionStatus, OwnerId, SequenceId, SessionId};

/// Bridge result type
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Bridge errors
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Another live owner holds the session lock
    #[error("Session {session_id} is locked by {}", owner_label(.owner, .pid))]
    SessionLocked {
        /// Locked session
        session_id: SessionId,
        /// Current owner, if the lock record was readable
        owner: Option<OwnerId>,
        /// Process id recorded by the owner (informational only)
        pid: Option<u32>,
        /// Milliseconds since the owner's last heartbeat
        heartbeat_age_ms: Option<u64>,
    },

    /// The worker could not be started
    #[error("Worker spawn failed: {reason}")]
    WorkerSpawnFailed {
        /// Why the spawn failed
        reason: String,
    },

    /// A request is already outstanding on the session
    #[error("Request already in flight on session {session_id}")]
    RequestInFlight {
        /// Busy session
        session_id: SessionId,
    },

    /// The caller stopped waiting; the worker may still be computing
    #[error("Execution {sequence_id} timed out after {waited_ms}ms")]
    ExecutionTimeout {
        /// Outstanding request
        sequence_id: SequenceId,
        /// How long the caller waited
        waited_ms: u64,
    },

    /// The worker exited before answering
    #[error("Worker died during execution {sequence_id}: {reason}")]
    WorkerDied {
        /// Request that was lost
        sequence_id: SequenceId,
        /// Exit description
        reason: String,
    },

    /// `wait` was called with nothing outstanding
    #[error("No request in flight on session {session_id}")]
    NothingInFlight {
        /// Idle session
        session_id: SessionId,
    },

    /// The session has never been started
    #[error("Session {session_id} has no running worker")]
    NotStarted {
        /// Session without a worker
        session_id: SessionId,
    },

    /// The lock file no longer belongs to this owner
    #[error("Lock for session {session_id} is no longer held by this owner")]
    LockLost {
        /// Session whose lock was lost
        session_id: SessionId,
    },

    /// Invalid session input
    #[error("Invalid session: {0}")]
    InvalidSession(#[from] CoreError),

    /// An outgoing frame exceeds the frame limit; nothing was sent
    #[error("Frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge {
        /// Encoded length
        len: usize,
        /// Limit
        max: usize,
    },

    /// Wire protocol violation
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Filesystem or socket failure
    #[error("I/O error during {context}: {source}")]
    Io {
        /// What was being attempted
        context: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
}

fn owner_label(owner: &Option<OwnerId>, pid: &Option<u32>) -> String {
    match (owner, pid) {
        (Some(owner), Some(pid)) => format!("{} (pid {})", owner, pid),
        (Some(owner), None) => owner.to_string(),
        _ => "an unknown owner".to_string(),
    }
}

impl BridgeError {
    /// Wrap an I/O error with context
    pub fn io(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> BridgeError {
        let context = context.into();
        move |source| BridgeError::Io { context, source }
    }
}

/// Converts non-completed execution results into errors
pub trait CheckExecution: Sized {
    /// `Timeout` becomes [`BridgeError::ExecutionTimeout`], `WorkerDied`
    /// becomes [`BridgeError::WorkerDied`]; `Ok` and `Error` pass through.
    ///
    /// # Errors
    ///
    /// Returns error if the execution did not complete
    fn check(self) -> BridgeResult<Self>;
}

impl CheckExecution for ExecutionResult {
    fn check(self) -> BridgeResult<Self> {
        match self.status {
            ExecutionStatus::Ok | ExecutionStatus::Error => Ok(self),
            ExecutionStatus::Timeout => Err(BridgeError::ExecutionTimeout {
                sequence_id: self.sequence_id,
                waited_ms: self.duration_ms,
            }),
            ExecutionStatus::WorkerDied => Err(BridgeError::WorkerDied {
                sequence_id: self.sequence_id,
                reason: self.stderr,
            }),
        }
    }
}
