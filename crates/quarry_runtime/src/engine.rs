//! Research engine.

use quarry_bridge::{Bridge, BridgeError, Session, SessionSpec, WorkerSnapshot};
use quarry_core::{ExecutionResult, ExecutionStatus, SessionId};
use quarry_evidence::QualityGateResult;
use quarry_notebook::{NotebookError, NotebookSynchronizer, SyncConfig, SyncOutcome};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// Engine result type
pub type EngineResult<T> = Result<T, EngineError>;

/// Engine errors
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Session or worker failure
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    /// Document failure
    #[error(transparent)]
    Notebook(#[from] NotebookError),
}

/// An open session and the notebook it writes
#[derive(Debug)]
pub struct ResearchSession {
    session: Session,
    notebook: NotebookSynchronizer,
    pending: Option<String>,
    last_sync: Option<SyncOutcome>,
}

impl ResearchSession {
    /// Session identifier
    #[must_use]
    pub fn id(&self) -> &SessionId {
        self.session.id()
    }

    /// Notebook the session records into
    #[must_use]
    pub fn notebook(&self) -> &NotebookSynchronizer {
        &self.notebook
    }

    /// Worker state
    #[must_use]
    pub fn snapshot(&self) -> Option<WorkerSnapshot> {
        self.session.snapshot()
    }

    /// Code of a timed-out request still awaiting its result
    #[must_use]
    pub fn pending_code(&self) -> Option<&str> {
        self.pending.as_deref()
    }

    /// What the most recent notebook write produced
    #[must_use]
    pub fn last_sync(&self) -> Option<&SyncOutcome> {
        self.last_sync.as_ref()
    }
}

/// Controller facade over the bridge and the notebook synchronizer
#[derive(Debug, Clone)]
pub struct ResearchEngine {
    bridge: Bridge,
    sync: SyncConfig,
}

impl ResearchEngine {
    /// Create an engine
    #[must_use]
    pub fn new(bridge: Bridge, sync: SyncConfig) -> Self {
        Self { bridge, sync }
    }

    /// Underlying bridge
    #[must_use]
    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    /// Acquire the session lock and start its worker
    ///
    /// The spec's workspace, if set and not already configured, is the
    /// directory the notebook index covers. The lock is released again if
    /// the worker cannot be started.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::SessionLocked`] while another owner is live,
    /// or the spawn failure
    pub async fn open(&self, spec: SessionSpec, notebook: impl Into<PathBuf>) -> EngineResult<ResearchSession> {
        let mut sync = self.sync.clone();
        if sync.workspace_dir.is_none()
            && let Some(workspace) = &spec.workspace
        {
            sync = sync.with_workspace_dir(workspace);
        }
        let notebook = NotebookSynchronizer::new(notebook, spec.id.clone(), sync);
        let session = self.bridge.acquire(spec).await?;
        if let Err(e) = self.bridge.start(&session).await {
            warn!(session = %session.id(), error = %e, "Worker failed to start, releasing lock");
            if let Err(release) = self.bridge.release(session).await {
                warn!(error = %release, "Release after failed start also failed");
            }
            return Err(e.into());
        }
        info!(session = %session.id(), notebook = %notebook.path().display(), "Opened research session");
        Ok(ResearchSession {
            session,
            notebook,
            pending: None,
            last_sync: None,
        })
    }

    /// Execute `code` and record the result in the notebook
    ///
    /// Exceptions and worker deaths are results, not errors. A timed-out
    /// execution is not recorded until [`ResearchEngine::wait`] collects it.
    ///
    /// # Errors
    ///
    /// Returns bridge errors such as [`BridgeError::RequestInFlight`],
    /// [`BridgeError::LockLost`] without touching the notebook if another
    /// owner took the session, or a notebook error if the result could not
    /// be recorded
    pub async fn execute_code(
        &self,
        session: &mut ResearchSession,
        code: &str,
        timeout: Option<Duration>,
    ) -> EngineResult<ExecutionResult> {
        let result = self.bridge.execute(&session.session, code, timeout).await?;
        if result.status == ExecutionStatus::Timeout {
            session.pending = Some(code.to_string());
        } else {
            Self::record(session, code, &result)?;
        }
        Ok(result)
    }

    /// Wait again for a timed-out execution and record it once it lands
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::NothingInFlight`] if nothing is outstanding,
    /// or [`BridgeError::LockLost`] as for [`ResearchEngine::execute_code`]
    pub async fn wait(&self, session: &mut ResearchSession, timeout: Option<Duration>) -> EngineResult<ExecutionResult> {
        let result = self.bridge.wait(&session.session, timeout).await?;
        if result.status != ExecutionStatus::Timeout {
            let code = session.pending.take().unwrap_or_default();
            Self::record(session, &code, &result)?;
        }
        Ok(result)
    }

    /// Write a result to the notebook, but only while the lock is ours
    fn record(session: &mut ResearchSession, code: &str, result: &ExecutionResult) -> EngineResult<()> {
        if let Err(e) = session.session.ensure_lock_held() {
            warn!(session = %session.id(), seq = %result.sequence_id, "Lock lost, result not recorded");
            return Err(e.into());
        }
        session.last_sync = session.notebook.record(code, result)?;
        Ok(())
    }

    /// Kill the worker, abandoning any outstanding execution, and start a
    /// clean one
    ///
    /// # Errors
    ///
    /// Returns the spawn failure for the replacement worker
    pub async fn cancel(&self, session: &mut ResearchSession) -> EngineResult<()> {
        if let Some(code) = session.pending.take() {
            info!(session = %session.id(), code_len = code.len(), "Abandoning pending execution");
        }
        self.bridge.cancel(&session.session).await?;
        Ok(())
    }

    /// Quality gate over everything recorded so far
    ///
    /// # Errors
    ///
    /// Returns error if the notebook exists but cannot be read
    pub fn quality_report(&self, session: &ResearchSession) -> EngineResult<QualityGateResult> {
        Ok(session.notebook.quality_report()?)
    }

    /// Stop the worker and release the session lock
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::LockLost`] if the lock was taken over
    pub async fn close(&self, session: ResearchSession) -> EngineResult<()> {
        if session.pending.is_some() {
            warn!(session = %session.id(), "Closing with an execution still pending");
        }
        self.bridge.release(session.session).await?;
        Ok(())
    }
}
