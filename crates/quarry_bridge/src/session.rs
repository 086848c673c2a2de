//! Session state.
//!
//! A [`Session`] is created by [`crate::Bridge::acquire`] and passed back
//! into every bridge call. It owns the lock, the lock heartbeat task, the
//! socket endpoint and the current worker generation.

use crate::error::{BridgeError, BridgeResult};
use crate::lock::{LockRecord, SessionLock};
use crate::transport::{Channel, Endpoint};
use crate::worker::WorkerProcess;
use quarry_core::{ExecutionRequest, SequenceId, SessionId, Timestamp};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

/// What the caller wants a session to be
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSpec {
    /// Session identifier
    pub id: SessionId,
    /// Directory holding the session's notebooks; `None` uses the
    /// notebook's own directory
    pub workspace: Option<PathBuf>,
    /// Working directory for user code
    pub project_root: PathBuf,
    /// Interpreter binary the worker runs under
    pub interpreter_path: PathBuf,
}

impl SessionSpec {
    /// Spec rooted at the current directory
    #[must_use]
    pub fn new(id: SessionId, interpreter_path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            workspace: None,
            project_root: PathBuf::from("."),
            interpreter_path: interpreter_path.into(),
        }
    }

    /// Set the workspace directory
    #[must_use]
    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = Some(workspace.into());
        self
    }

    /// Set the project root
    #[must_use]
    pub fn with_project_root(mut self, project_root: impl Into<PathBuf>) -> Self {
        self.project_root = project_root.into();
        self
    }
}

/// Request sent to the worker and not yet answered
#[derive(Debug)]
pub(crate) struct Outstanding {
    pub(crate) request: ExecutionRequest,
    pub(crate) sent_at: Instant,
}

/// One worker generation
#[derive(Debug)]
pub(crate) struct LiveWorker {
    pub(crate) process: Box<dyn WorkerProcess>,
    pub(crate) channel: Channel,
    pub(crate) pid: Option<u32>,
    pub(crate) runtime: String,
    pub(crate) next_seq: SequenceId,
    pub(crate) outstanding: Option<Outstanding>,
    pub(crate) last_beat: Instant,
}

/// Mutable worker state, guarded by the session's async mutex
#[derive(Debug, Default)]
pub(crate) struct WorkerSlot {
    pub(crate) endpoint: Option<Endpoint>,
    pub(crate) worker: Option<LiveWorker>,
    pub(crate) generation: u64,
}

/// Point-in-time view of a session's worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerSnapshot {
    /// Number of workers started so far
    pub generation: u64,
    /// Whether a worker is currently attached
    pub running: bool,
    /// Worker process id, when the worker is a process
    pub pid: Option<u32>,
    /// Interpreter announced by the worker
    pub runtime: Option<String>,
    /// Sequence id the next request will use
    pub next_sequence: SequenceId,
    /// Request awaiting a response
    pub outstanding: Option<SequenceId>,
    /// Milliseconds since the worker last showed signs of life
    pub since_heartbeat_ms: Option<u64>,
}

/// A locked research session
#[derive(Debug)]
pub struct Session {
    spec: SessionSpec,
    created_at: Timestamp,
    lock: Arc<Mutex<Option<SessionLock>>>,
    lock_lost: Arc<AtomicBool>,
    heartbeat: Option<JoinHandle<()>>,
    pub(crate) slot: tokio::sync::Mutex<WorkerSlot>,
}

impl Session {
    /// Wrap an acquired lock and start refreshing it every `interval`
    pub(crate) fn new(spec: SessionSpec, lock: SessionLock, interval: Duration) -> Self {
        let lock = Arc::new(Mutex::new(Some(lock)));
        let lock_lost = Arc::new(AtomicBool::new(false));
        let heartbeat = tokio::spawn(refresh_loop(
            spec.id.clone(),
            Arc::clone(&lock),
            Arc::clone(&lock_lost),
            interval,
        ));
        Self {
            spec,
            created_at: Timestamp::now(),
            lock,
            lock_lost,
            heartbeat: Some(heartbeat),
            slot: tokio::sync::Mutex::new(WorkerSlot::default()),
        }
    }

    /// Session identifier
    #[must_use]
    pub fn id(&self) -> &SessionId {
        &self.spec.id
    }

    /// Spec the session was acquired with
    #[must_use]
    pub fn spec(&self) -> &SessionSpec {
        &self.spec
    }

    /// When the session was acquired
    #[must_use]
    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    /// Current lock record, `None` once released
    #[must_use]
    pub fn lock_record(&self) -> Option<LockRecord> {
        self.lock
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().map(|l| l.record().clone()))
    }

    /// Whether a refresh found the lock taken over or removed
    #[must_use]
    pub fn is_lock_lost(&self) -> bool {
        self.lock_lost.load(Ordering::SeqCst)
    }

    /// Worker state, or `None` while a call holds the session
    #[must_use]
    pub fn snapshot(&self) -> Option<WorkerSnapshot> {
        let slot = self.slot.try_lock().ok()?;
        let worker = slot.worker.as_ref();
        Some(WorkerSnapshot {
            generation: slot.generation,
            running: worker.is_some(),
            pid: worker.and_then(|w| w.pid),
            runtime: worker.map(|w| w.runtime.clone()),
            next_sequence: worker.map_or(SequenceId::FIRST, |w| w.next_seq),
            outstanding: worker
                .and_then(|w| w.outstanding.as_ref())
                .map(|o| o.request.sequence_id),
            since_heartbeat_ms: worker.map(|w| w.last_beat.elapsed().as_millis() as u64),
        })
    }

    /// Fail unless the lock file on disk still names this owner
    ///
    /// Checked against the file rather than the last refresh, so a
    /// takeover between heartbeats is seen. A failed check marks the lock
    /// lost for good.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::LockLost`] once the lock was taken over,
    /// removed or released
    pub fn ensure_lock_held(&self) -> BridgeResult<()> {
        let lost = || BridgeError::LockLost {
            session_id: self.spec.id.clone(),
        };
        if self.is_lock_lost() {
            return Err(lost());
        }
        let guard = self.lock.lock().map_err(|_| lost())?;
        let held = guard.as_ref().ok_or_else(lost)?;
        if let Err(e) = held.verify_owned() {
            self.lock_lost.store(true, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    /// Record the socket endpoint in the lock file
    pub(crate) fn record_socket(&self, socket: Option<PathBuf>) -> BridgeResult<()> {
        let mut guard = self.lock.lock().map_err(|_| BridgeError::LockLost {
            session_id: self.spec.id.clone(),
        })?;
        match guard.as_mut() {
            Some(lock) => lock.set_socket_path(socket),
            None => Err(BridgeError::LockLost {
                session_id: self.spec.id.clone(),
            }),
        }
    }

    /// Stop refreshing and hand back the lock
    pub(crate) async fn stop_heartbeat(&mut self) -> Option<SessionLock> {
        if let Some(handle) = self.heartbeat.take() {
            handle.abort();
            let _ = handle.await;
        }
        self.lock.lock().ok().and_then(|mut guard| guard.take())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(handle) = self.heartbeat.take() {
            handle.abort();
        }
    }
}

async fn refresh_loop(
    session_id: SessionId,
    lock: Arc<Mutex<Option<SessionLock>>>,
    lost: Arc<AtomicBool>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let outcome = match lock.lock() {
            Ok(mut guard) => match guard.as_mut() {
                Some(held) => held.refresh(),
                None => return,
            },
            Err(_) => return,
        };
        match outcome {
            Ok(()) => debug!(session = %session_id, "Refreshed session lock"),
            Err(BridgeError::LockLost { .. }) => {
                error!(session = %session_id, "Session lock lost");
                lost.store(true, Ordering::SeqCst);
                return;
            }
            Err(e) => warn!(session = %session_id, error = %e, "Lock refresh failed"),
        }
    }
}
