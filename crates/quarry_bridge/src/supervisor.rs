//! Bridge supervisor.
//!
//! [`Bridge`] is stateless apart from configuration and a launcher; all
//! per-session state lives in the [`Session`] passed to each call. One
//! call at a time may hold a session: a second concurrent call fails with
//! [`BridgeError::RequestInFlight`] without touching the worker.

use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::lock::{self, SessionInfo, SessionLock};
use crate::protocol::{Disposition, Frame, Payload, classify};
use crate::session::{LiveWorker, Outstanding, Session, SessionSpec, WorkerSlot};
use crate::transport::{Channel, Endpoint};
use crate::worker::{InterpreterLauncher, LaunchSpec, Launcher, WorkerProcess};
use quarry_core::{ExecutionRequest, ExecutionResult, SequenceId, SessionId};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::MutexGuard;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How often the handshake checks whether the worker already exited
const HANDSHAKE_POLL: Duration = Duration::from_millis(25);

/// Grace period for collecting an exit status after the channel closes
const EXIT_GRACE: Duration = Duration::from_millis(500);

/// Session supervisor
#[derive(Debug, Clone)]
pub struct Bridge {
    config: BridgeConfig,
    launcher: Arc<dyn Launcher>,
}

/// How an await on the outstanding request ended
enum Wait {
    Answered(ExecutionResult),
    TimedOut(ExecutionResult),
    Died { sequence_id: SequenceId, elapsed_ms: u64, reason: String },
}

impl Bridge {
    /// Create a bridge launching Python workers
    #[must_use]
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            launcher: Arc::new(InterpreterLauncher::python()),
        }
    }

    /// Replace the worker launcher
    #[must_use]
    pub fn with_launcher(mut self, launcher: impl Launcher + 'static) -> Self {
        self.launcher = Arc::new(launcher);
        self
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Take the session lock and start refreshing it
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::SessionLocked`] while another owner is live
    pub async fn acquire(&self, spec: SessionSpec) -> BridgeResult<Session> {
        let lock = SessionLock::acquire(
            &self.config.runtime_dir,
            &spec.id,
            self.config.lock_stale_after(),
        )?;
        Ok(Session::new(spec, lock, self.config.heartbeat_interval()))
    }

    /// Start the session's worker; a no-op if one is already running
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::WorkerSpawnFailed`] if the interpreter is
    /// invalid, cannot be spawned, exits early, or misses the handshake
    pub async fn start(&self, session: &Session) -> BridgeResult<()> {
        let mut slot = claim(session)?;
        session.ensure_lock_held()?;
        if slot.worker.is_some() {
            return Ok(());
        }
        self.spawn_worker(session, &mut slot).await
    }

    /// Run `code` and wait up to `timeout` for its result
    ///
    /// A timeout does not stop the worker: the result has status
    /// `timeout`, the request stays outstanding, and [`Bridge::wait`] can
    /// collect it. If the worker dies the result has status `worker_died`
    /// and the next call starts a fresh worker.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::RequestInFlight`] if a request is already
    /// outstanding or another call holds the session,
    /// [`BridgeError::NotStarted`] before [`Bridge::start`], or
    /// [`BridgeError::FrameTooLarge`] if `code` does not fit in one frame;
    /// the worker and its sequence are untouched in that case
    pub async fn execute(
        &self,
        session: &Session,
        code: &str,
        timeout: Option<Duration>,
    ) -> BridgeResult<ExecutionResult> {
        let mut slot = claim(session)?;
        session.ensure_lock_held()?;
        if slot.worker.is_none() {
            if slot.generation == 0 {
                return Err(BridgeError::NotStarted {
                    session_id: session.id().clone(),
                });
            }
            info!(session = %session.id(), "Respawning worker");
            self.spawn_worker(session, &mut slot).await?;
        }

        let timeout = timeout.unwrap_or(Duration::from_millis(self.config.execute_timeout_ms));
        let Some(worker) = slot.worker.as_mut() else {
            return Err(BridgeError::NotStarted {
                session_id: session.id().clone(),
            });
        };
        if worker.outstanding.is_some() {
            return Err(BridgeError::RequestInFlight {
                session_id: session.id().clone(),
            });
        }

        let sequence_id = worker.next_seq;
        let request = ExecutionRequest::new(sequence_id, code, timeout.as_millis() as u64);
        debug!(session = %session.id(), seq = %sequence_id, "Sending execute request");

        match worker.channel.send(Frame::execute(&request)).await {
            Ok(()) => {}
            Err(e @ BridgeError::FrameTooLarge { .. }) => {
                warn!(session = %session.id(), seq = %sequence_id, error = %e, "Request not sent");
                return Err(e);
            }
            Err(e) => {
                let reason = match worker.process.wait_exit(EXIT_GRACE).await {
                    Some(exit) => exit,
                    None => e.to_string(),
                };
                self.bury(&mut slot).await;
                warn!(session = %session.id(), seq = %sequence_id, %reason, "Worker gone before request");
                return Ok(ExecutionResult::worker_died(sequence_id, 0, reason));
            }
        }
        worker.next_seq = sequence_id.next();
        worker.outstanding = Some(Outstanding {
            request,
            sent_at: Instant::now(),
        });

        self.settle(session, &mut slot, timeout).await
    }

    /// Wait again for the outstanding request
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::NothingInFlight`] if no request is outstanding
    pub async fn wait(
        &self,
        session: &Session,
        timeout: Option<Duration>,
    ) -> BridgeResult<ExecutionResult> {
        let mut slot = claim(session)?;
        session.ensure_lock_held()?;
        let pending = slot
            .worker
            .as_ref()
            .is_some_and(|w| w.outstanding.is_some());
        if !pending {
            return Err(if slot.generation == 0 {
                BridgeError::NotStarted {
                    session_id: session.id().clone(),
                }
            } else {
                BridgeError::NothingInFlight {
                    session_id: session.id().clone(),
                }
            });
        }
        let timeout = timeout.unwrap_or(Duration::from_millis(self.config.execute_timeout_ms));
        self.settle(session, &mut slot, timeout).await
    }

    /// Kill the worker and start a clean one
    ///
    /// Any outstanding request is abandoned and interpreter state is lost.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::NotStarted`] before [`Bridge::start`], or a
    /// spawn failure for the replacement worker
    pub async fn cancel(&self, session: &Session) -> BridgeResult<()> {
        let mut slot = claim(session)?;
        session.ensure_lock_held()?;
        if slot.generation == 0 {
            return Err(BridgeError::NotStarted {
                session_id: session.id().clone(),
            });
        }
        if let Some(worker) = slot.worker.as_ref() {
            let abandoned = worker.outstanding.as_ref().map(|o| o.request.sequence_id);
            warn!(session = %session.id(), abandoned = ?abandoned, "Cancelling worker");
        }
        self.bury(&mut slot).await;
        self.spawn_worker(session, &mut slot).await
    }

    /// Shut the worker down gracefully and start a fresh one
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::NotStarted`] before [`Bridge::start`], or a
    /// spawn failure for the replacement worker
    pub async fn restart(&self, session: &Session) -> BridgeResult<()> {
        let mut slot = claim(session)?;
        session.ensure_lock_held()?;
        if slot.generation == 0 {
            return Err(BridgeError::NotStarted {
                session_id: session.id().clone(),
            });
        }
        if let Some(worker) = slot.worker.take() {
            self.shutdown_worker(session.id(), worker).await;
        }
        info!(session = %session.id(), "Restarting worker");
        self.spawn_worker(session, &mut slot).await
    }

    /// Heartbeat round trip to an idle worker
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::RequestInFlight`] while a request is
    /// outstanding, [`BridgeError::WorkerDied`] if the worker is gone
    pub async fn ping(&self, session: &Session) -> BridgeResult<Duration> {
        let mut slot = claim(session)?;
        session.ensure_lock_held()?;
        let Some(worker) = slot.worker.as_mut() else {
            return Err(BridgeError::NotStarted {
                session_id: session.id().clone(),
            });
        };
        if worker.outstanding.is_some() {
            return Err(BridgeError::RequestInFlight {
                session_id: session.id().clone(),
            });
        }

        let started = Instant::now();
        let last = SequenceId::from_raw(worker.next_seq.as_u64().saturating_sub(1));
        let reply = tokio::time::timeout(
            Duration::from_millis(self.config.handshake_timeout_ms),
            echo(&mut worker.channel),
        )
        .await;

        match reply {
            Ok(Ok(true)) => {
                worker.last_beat = Instant::now();
                Ok(started.elapsed())
            }
            Ok(Ok(false)) | Ok(Err(_)) => {
                let reason = worker
                    .process
                    .wait_exit(EXIT_GRACE)
                    .await
                    .unwrap_or_else(|| "connection closed".to_string());
                self.bury(&mut slot).await;
                Err(BridgeError::WorkerDied {
                    sequence_id: last,
                    reason,
                })
            }
            Err(_) => Err(BridgeError::Protocol(format!(
                "no heartbeat reply within {}ms",
                self.config.handshake_timeout_ms
            ))),
        }
    }

    /// Stop the worker, remove the socket endpoint, and release the lock
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::LockLost`] if the lock file belongs to
    /// someone else by now; local cleanup still happens
    pub async fn release(&self, mut session: Session) -> BridgeResult<()> {
        let held = session.stop_heartbeat().await;
        {
            let mut slot = session.slot.lock().await;
            if let Some(worker) = slot.worker.take() {
                self.shutdown_worker(session.id(), worker).await;
            }
            slot.endpoint = None;
        }
        let result = match held {
            Some(lock) => lock.release(),
            None => Ok(()),
        };
        info!(session = %session.id(), "Released session");
        result
    }

    /// All sessions with a lock file in the runtime directory
    ///
    /// # Errors
    ///
    /// Returns error if the runtime directory cannot be read
    pub fn list_sessions(&self) -> BridgeResult<Vec<SessionInfo>> {
        lock::list(&self.config.runtime_dir, self.config.lock_stale_after())
    }

    /// Remove a session's lock and socket
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::SessionLocked`] for a live lock unless `force`
    pub fn unlock(&self, session_id: &SessionId, force: bool) -> BridgeResult<bool> {
        lock::unlock(
            &self.config.runtime_dir,
            session_id,
            self.config.lock_stale_after(),
            force,
        )
    }

    async fn spawn_worker(&self, session: &Session, slot: &mut WorkerSlot) -> BridgeResult<()> {
        if slot.endpoint.is_none() {
            let socket = self.config.socket_path(session.id());
            slot.endpoint = Some(Endpoint::bind(&socket)?.with_max_frame_len(self.config.max_frame_bytes));
            session.record_socket(Some(socket))?;
        }
        let Some(endpoint) = slot.endpoint.as_ref() else {
            return Err(BridgeError::Protocol("socket endpoint missing".to_string()));
        };

        let spec = session.spec();
        let launch = LaunchSpec {
            session_id: spec.id.clone(),
            interpreter_path: spec.interpreter_path.clone(),
            socket_path: endpoint.path().to_path_buf(),
            working_dir: spec.project_root.clone(),
            runtime_dir: self.config.runtime_dir.clone(),
            max_frame_len: self.config.max_frame_bytes,
            token: Uuid::new_v4().simple().to_string(),
        };
        let mut process = self.launcher.launch(&launch)?;

        let handshake = handshake(
            endpoint,
            process.as_mut(),
            &launch.token,
            Duration::from_millis(self.config.handshake_timeout_ms),
        )
        .await;
        let (channel, pid, runtime) = match handshake {
            Ok(ready) => ready,
            Err(e) => {
                process.kill().await;
                warn!(session = %session.id(), error = %e, "Worker failed to start");
                return Err(e);
            }
        };

        slot.generation += 1;
        info!(
            session = %session.id(),
            generation = slot.generation,
            pid = ?pid,
            %runtime,
            "Worker ready"
        );
        slot.worker = Some(LiveWorker {
            process,
            channel,
            pid,
            runtime,
            next_seq: SequenceId::FIRST,
            outstanding: None,
            last_beat: Instant::now(),
        });
        Ok(())
    }

    /// Wait for the outstanding request to be answered
    async fn settle(
        &self,
        session: &Session,
        slot: &mut WorkerSlot,
        timeout: Duration,
    ) -> BridgeResult<ExecutionResult> {
        let Some(worker) = slot.worker.as_mut() else {
            return Err(BridgeError::NothingInFlight {
                session_id: session.id().clone(),
            });
        };
        let outcome = await_response(worker, timeout, self.config.heartbeat_interval()).await?;

        match outcome {
            Wait::Answered(result) => {
                debug!(session = %session.id(), seq = %result.sequence_id, status = %result.status, "Execution finished");
                Ok(result)
            }
            Wait::TimedOut(result) => {
                warn!(
                    session = %session.id(),
                    seq = %result.sequence_id,
                    waited_ms = result.duration_ms,
                    "Execution still running after timeout"
                );
                Ok(result)
            }
            Wait::Died {
                sequence_id,
                elapsed_ms,
                reason,
            } => {
                warn!(session = %session.id(), seq = %sequence_id, %reason, "Worker died during execution");
                self.bury(slot).await;
                Ok(ExecutionResult::worker_died(sequence_id, elapsed_ms, reason))
            }
        }
    }

    /// Kill and forget the current worker; the endpoint stays bound
    async fn bury(&self, slot: &mut WorkerSlot) {
        if let Some(mut worker) = slot.worker.take() {
            worker.process.kill().await;
        }
    }

    async fn shutdown_worker(&self, session_id: &SessionId, mut worker: LiveWorker) {
        let grace = Duration::from_millis(self.config.shutdown_grace_ms);
        if worker.channel.send(Frame::shutdown(0)).await.is_ok()
            && let Some(exit) = worker.process.wait_exit(grace).await
        {
            debug!(session = %session_id, %exit, "Worker exited after shutdown");
            return;
        }
        warn!(session = %session_id, "Worker ignored shutdown, killing");
        worker.process.kill().await;
    }
}

/// Claim exclusive use of a session for one call
fn claim(session: &Session) -> BridgeResult<MutexGuard<'_, WorkerSlot>> {
    session
        .slot
        .try_lock()
        .map_err(|_| BridgeError::RequestInFlight {
            session_id: session.id().clone(),
        })
}

/// Accept the worker's connection and read its ready frame
///
/// The worker is identified by the launch token it echoes. Its announced
/// pid may differ from the spawned process when a wrapper forks the
/// interpreter.
async fn handshake(
    endpoint: &Endpoint,
    process: &mut dyn WorkerProcess,
    token: &str,
    timeout: Duration,
) -> BridgeResult<(Channel, Option<u32>, String)> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut poll = tokio::time::interval(HANDSHAKE_POLL);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let accepted = tokio::select! {
            accepted = endpoint.accept() => Some(accepted?),
            _ = poll.tick() => None,
            _ = tokio::time::sleep_until(deadline) => {
                return Err(BridgeError::WorkerSpawnFailed {
                    reason: format!("no handshake within {}ms", timeout.as_millis()),
                });
            }
        };

        let Some(mut channel) = accepted else {
            if let Some(exit) = process.try_exit() {
                return Err(BridgeError::WorkerSpawnFailed {
                    reason: format!("worker exited before handshake ({})", exit),
                });
            }
            continue;
        };

        let first = match tokio::time::timeout_at(deadline, channel.recv()).await {
            Ok(first) => first?,
            Err(_) => {
                return Err(BridgeError::WorkerSpawnFailed {
                    reason: format!("no ready frame within {}ms", timeout.as_millis()),
                });
            }
        };
        match first {
            Some(Frame {
                payload:
                    Payload::Ready {
                        pid,
                        runtime,
                        token: announced,
                    },
                ..
            }) => {
                if announced != token {
                    warn!(announced_pid = pid, "Ignoring connection with a foreign launch token");
                    continue;
                }
                if let Some(spawned) = process.pid()
                    && spawned != pid
                {
                    info!(spawned, announced = pid, "Worker runs under a wrapper process");
                }
                return Ok((channel, process.pid(), runtime));
            }
            other => {
                warn!(frame = ?other, "Expected ready frame");
                continue;
            }
        }
    }
}

/// Send one heartbeat and wait for its echo; `false` if the channel closed
async fn echo(channel: &mut Channel) -> BridgeResult<bool> {
    let counter = channel.heartbeat().await?;
    loop {
        match channel.recv().await? {
            None => return Ok(false),
            Some(frame) if frame.payload == Payload::Beat && frame.seq == counter => return Ok(true),
            Some(frame) => debug!(seq = frame.seq, "Discarding frame while pinging"),
        }
    }
}

async fn await_response(
    worker: &mut LiveWorker,
    timeout: Duration,
    liveness_interval: Duration,
) -> BridgeResult<Wait> {
    let Some(outstanding) = worker.outstanding.as_ref() else {
        return Err(BridgeError::Protocol("no outstanding request".to_string()));
    };
    let sequence_id = outstanding.request.sequence_id;
    let sent_at = outstanding.sent_at;
    let started = Instant::now();

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let mut liveness = tokio::time::interval(liveness_interval);
    liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);
    liveness.tick().await;

    loop {
        tokio::select! {
            frame = worker.channel.recv() => match frame {
                Ok(Some(frame)) => match classify(&frame, Some(sequence_id)) {
                    Disposition::Accept => {
                        worker.outstanding = None;
                        worker.last_beat = Instant::now();
                        if let Some(result) = frame.into_result() {
                            return Ok(Wait::Answered(result));
                        }
                    }
                    Disposition::Oversized => {
                        let max = worker.channel.max_frame_len();
                        warn!(seq = %sequence_id, max, "Response exceeded the frame limit");
                        worker.outstanding = None;
                        worker.last_beat = Instant::now();
                        return Ok(Wait::Answered(ExecutionResult::completed(
                            sequence_id,
                            String::new(),
                            String::new(),
                            Some(format!(
                                "FrameTooLarge: the result exceeded the {} byte frame limit and was discarded",
                                max
                            )),
                            sent_at.elapsed().as_millis() as u64,
                        )));
                    }
                    Disposition::Heartbeat => worker.last_beat = Instant::now(),
                    Disposition::Stale => {
                        warn!(seq = frame.seq, outstanding = %sequence_id, "Discarding stale response");
                    }
                    Disposition::Ack | Disposition::Unexpected => {
                        warn!(seq = frame.seq, kind = ?frame.kind, "Discarding unexpected frame");
                    }
                },
                Ok(None) | Err(_) => {
                    let reason = worker
                        .process
                        .wait_exit(EXIT_GRACE)
                        .await
                        .unwrap_or_else(|| "connection closed".to_string());
                    return Ok(Wait::Died {
                        sequence_id,
                        elapsed_ms: sent_at.elapsed().as_millis() as u64,
                        reason,
                    });
                }
            },
            _ = liveness.tick() => {
                if let Some(reason) = worker.process.try_exit() {
                    return Ok(Wait::Died {
                        sequence_id,
                        elapsed_ms: sent_at.elapsed().as_millis() as u64,
                        reason,
                    });
                }
            }
            _ = &mut deadline => {
                return Ok(Wait::TimedOut(ExecutionResult::timed_out(
                    sequence_id,
                    started.elapsed().as_millis() as u64,
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::{WorkerExit, serve};
    use crate::protocol::MAX_FRAME_LEN;
    use crate::testing::{InProcessLauncher, ScriptInterpreter, TaskWorker};
    use quarry_core::ExecutionStatus;
    use std::path::Path;

    fn config(dir: &Path) -> BridgeConfig {
        BridgeConfig::new(dir.join("run"))
            .with_handshake_timeout(2_000)
            .with_execute_timeout(5_000)
            .with_heartbeat_interval(20)
            .with_shutdown_grace(500)
    }

    fn bridge(dir: &Path) -> Bridge {
        Bridge::new(config(dir)).with_launcher(InProcessLauncher::new(ScriptInterpreter::new))
    }

    fn spec(dir: &Path, id: &str) -> SessionSpec {
        SessionSpec::new(SessionId::parse(id).unwrap(), "/unused")
            .with_workspace(dir)
            .with_project_root(dir)
    }

    async fn started(bridge: &Bridge, dir: &Path, id: &str) -> Session {
        let session = bridge.acquire(spec(dir, id)).await.unwrap();
        bridge.start(&session).await.unwrap();
        session
    }

    #[tokio::test]
    async fn test_bindings_persist_across_executions() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = bridge(dir.path());
        let session = started(&bridge, dir.path(), "persist").await;

        let first = bridge.execute(&session, "let x = 5", None).await.unwrap();
        assert_eq!(first.sequence_id, SequenceId::FIRST);
        assert_eq!(first.status, ExecutionStatus::Ok);

        let second = bridge.execute(&session, "show x", None).await.unwrap();
        assert_eq!(second.sequence_id, SequenceId::from_raw(2));
        assert_eq!(second.stdout, "5\n");
    }

    #[tokio::test]
    async fn test_exception_is_reported_not_raised() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = bridge(dir.path());
        let session = started(&bridge, dir.path(), "raise").await;

        let result = bridge.execute(&session, "echo a\nfail boom", None).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Error);
        assert_eq!(result.stdout, "a\n");
        assert!(result.exception_trace.unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn test_execute_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = bridge(dir.path());
        let session = bridge.acquire(spec(dir.path(), "cold")).await.unwrap();

        assert!(matches!(
            bridge.execute(&session, "echo x", None).await,
            Err(BridgeError::NotStarted { .. })
        ));
        assert!(matches!(
            bridge.wait(&session, None).await,
            Err(BridgeError::NotStarted { .. })
        ));
    }

    #[tokio::test]
    async fn test_timeout_keeps_request_outstanding() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = bridge(dir.path());
        let session = started(&bridge, dir.path(), "slow").await;

        let result = bridge
            .execute(&session, "sleep 300\necho done", Some(Duration::from_millis(30)))
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Timeout);
        assert_eq!(result.sequence_id, SequenceId::FIRST);

        assert!(matches!(
            bridge.execute(&session, "echo again", None).await,
            Err(BridgeError::RequestInFlight { .. })
        ));
        assert_eq!(
            session.snapshot().unwrap().outstanding,
            Some(SequenceId::FIRST)
        );

        let late = bridge.wait(&session, Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(late.status, ExecutionStatus::Ok);
        assert_eq!(late.stdout, "done\n");
        assert_eq!(late.sequence_id, SequenceId::FIRST);

        let next = bridge.execute(&session, "echo again", None).await.unwrap();
        assert_eq!(next.sequence_id, SequenceId::from_raw(2));
        assert!(matches!(
            bridge.wait(&session, None).await,
            Err(BridgeError::NothingInFlight { .. })
        ));
    }

    #[tokio::test]
    async fn test_concurrent_execute_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = bridge(dir.path());
        let session = started(&bridge, dir.path(), "busy").await;

        let (first, second) = tokio::join!(
            bridge.execute(&session, "sleep 100\necho one", None),
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                bridge.execute(&session, "echo two", None).await
            }
        );
        assert_eq!(first.unwrap().stdout, "one\n");
        assert!(matches!(second, Err(BridgeError::RequestInFlight { .. })));
        assert_eq!(
            session.snapshot().unwrap().next_sequence,
            SequenceId::from_raw(2)
        );
    }

    #[tokio::test]
    async fn test_worker_death_then_respawn() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = bridge(dir.path());
        let session = started(&bridge, dir.path(), "mortal").await;

        bridge.execute(&session, "let x = 1", None).await.unwrap();
        let died = bridge.execute(&session, "exit", None).await.unwrap();
        assert_eq!(died.status, ExecutionStatus::WorkerDied);
        assert_eq!(died.sequence_id, SequenceId::from_raw(2));
        assert!(!session.snapshot().unwrap().running);

        let revived = bridge.execute(&session, "show x\necho hi", None).await.unwrap();
        assert_eq!(revived.sequence_id, SequenceId::FIRST);
        assert_eq!(revived.status, ExecutionStatus::Error);
        assert_eq!(session.snapshot().unwrap().generation, 2);
    }

    #[tokio::test]
    async fn test_restart_clears_bindings() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = bridge(dir.path());
        let session = started(&bridge, dir.path(), "fresh").await;

        bridge.execute(&session, "let x = 1", None).await.unwrap();
        bridge.restart(&session).await.unwrap();

        let result = bridge.execute(&session, "show x", None).await.unwrap();
        assert!(result.exception_trace.unwrap().contains("NameError"));
        assert_eq!(result.sequence_id, SequenceId::FIRST);
    }

    #[tokio::test]
    async fn test_cancel_abandons_outstanding() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = bridge(dir.path());
        let session = started(&bridge, dir.path(), "cancel").await;

        let result = bridge
            .execute(&session, "sleep 300", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Timeout);

        bridge.cancel(&session).await.unwrap();
        assert!(matches!(
            bridge.wait(&session, None).await,
            Err(BridgeError::NothingInFlight { .. })
        ));
        let after = bridge.execute(&session, "echo ok", None).await.unwrap();
        assert_eq!(after.stdout, "ok\n");
        assert_eq!(session.snapshot().unwrap().generation, 2);
    }

    #[tokio::test]
    async fn test_ping_idle_worker() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = bridge(dir.path());
        let session = started(&bridge, dir.path(), "ping").await;

        assert!(bridge.ping(&session).await.is_ok());
        // Heartbeats do not consume execution sequence numbers
        let result = bridge.execute(&session, "echo x", None).await.unwrap();
        assert_eq!(result.sequence_id, SequenceId::FIRST);
    }

    #[tokio::test]
    async fn test_second_owner_is_locked_out() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = bridge(dir.path());
        let _session = bridge.acquire(spec(dir.path(), "owned")).await.unwrap();

        let other = Bridge::new(config(dir.path()));
        assert!(matches!(
            other.acquire(spec(dir.path(), "owned")).await,
            Err(BridgeError::SessionLocked { .. })
        ));
    }

    #[tokio::test]
    async fn test_concurrent_acquire_single_winner() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = bridge(dir.path());

        let attempts = (0..8).map(|_| bridge.acquire(spec(dir.path(), "race")));
        let results = futures::future::join_all(attempts).await;
        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);
        assert!(results.iter().all(|r| matches!(
            r,
            Ok(_) | Err(BridgeError::SessionLocked { .. })
        )));
    }

    #[tokio::test]
    async fn test_release_removes_socket_and_lock() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = bridge(dir.path());
        let session = started(&bridge, dir.path(), "done").await;
        let id = session.id().clone();
        let socket = bridge.config().socket_path(&id);
        let lock_file = bridge.config().lock_path(&id);
        assert!(socket.exists());
        assert_eq!(
            session.lock_record().unwrap().socket_path,
            Some(socket.clone())
        );

        bridge.release(session).await.unwrap();
        assert!(!socket.exists());
        assert!(!lock_file.exists());

        // The session can be taken again immediately
        let again = bridge.acquire(spec(dir.path(), "done")).await.unwrap();
        bridge.release(again).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_and_unlock() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = bridge(dir.path());
        let session = bridge.acquire(spec(dir.path(), "listed")).await.unwrap();

        let sessions = bridge.list_sessions().unwrap();
        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].live);
        assert_eq!(&sessions[0].session_id, session.id());

        assert!(matches!(
            bridge.unlock(session.id(), false),
            Err(BridgeError::SessionLocked { .. })
        ));
        assert!(bridge.unlock(session.id(), true).unwrap());
        assert!(bridge.list_sessions().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_interpreter_fails_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = Bridge::new(config(dir.path()));
        let session = bridge
            .acquire(
                SessionSpec::new(SessionId::parse("nopy").unwrap(), dir.path().join("python-missing"))
                    .with_project_root(dir.path()),
            )
            .await
            .unwrap();

        assert!(matches!(
            bridge.start(&session).await,
            Err(BridgeError::WorkerSpawnFailed { .. })
        ));
        assert!(!session.snapshot().unwrap().running);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_worker_exiting_before_handshake_fails_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = Bridge::new(config(dir.path()))
            .with_launcher(InterpreterLauncher::with_harness("exit 7\n", "sh"));
        let session = bridge
            .acquire(
                SessionSpec::new(SessionId::parse("shell").unwrap(), "/bin/sh")
                    .with_project_root(dir.path()),
            )
            .await
            .unwrap();

        match bridge.start(&session).await {
            Err(BridgeError::WorkerSpawnFailed { reason }) => {
                assert!(reason.contains("before handshake"), "{}", reason);
            }
            other => panic!("expected WorkerSpawnFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_oversized_request_keeps_worker() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = Bridge::new(config(dir.path()).with_max_frame_bytes(2_048))
            .with_launcher(InProcessLauncher::new(ScriptInterpreter::new));
        let session = started(&bridge, dir.path(), "wide").await;

        bridge.execute(&session, "let x = 1", None).await.unwrap();
        let huge = format!("echo {}", "y".repeat(5_000));
        assert!(matches!(
            bridge.execute(&session, &huge, None).await,
            Err(BridgeError::FrameTooLarge { max: 2_048, .. })
        ));

        let snapshot = session.snapshot().unwrap();
        assert!(snapshot.running);
        assert_eq!(snapshot.generation, 1);
        assert_eq!(snapshot.outstanding, None);
        let shown = bridge.execute(&session, "show x", None).await.unwrap();
        assert_eq!(shown.stdout, "1\n");
        assert_eq!(shown.sequence_id, SequenceId::from_raw(2));
    }

    #[tokio::test]
    async fn test_large_output_is_truncated_by_worker() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = Bridge::new(config(dir.path()).with_max_frame_bytes(2_048))
            .with_launcher(InProcessLauncher::new(ScriptInterpreter::new));
        let session = started(&bridge, dir.path(), "loud").await;

        let result = bridge.execute(&session, "fill 100000", None).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Ok);
        assert!(result.stdout.ends_with(crate::protocol::TRUNCATION_NOTE));
        assert!(result.stdout.len() < 2_048);

        let next = bridge.execute(&session, "echo after", None).await.unwrap();
        assert_eq!(next.stdout, "after\n");
    }

    /// Worker that ignores the frame limit on its first answer
    #[derive(Debug)]
    struct UnboundedLauncher;

    impl Launcher for UnboundedLauncher {
        fn launch(&self, spec: &LaunchSpec) -> BridgeResult<Box<dyn WorkerProcess>> {
            let socket = spec.socket_path.clone();
            let token = spec.token.clone();
            Ok(Box::new(TaskWorker::spawn(async move {
                let mut channel = Channel::connect(&socket, MAX_FRAME_LEN).await?;
                channel.send(Frame::ready(std::process::id(), "unbounded 1", token)).await?;
                let mut answered = 0;
                while let Some(frame) = channel.recv().await? {
                    match frame.payload {
                        Payload::Execute { code, .. } => {
                            let stdout = if answered == 0 { "z".repeat(20_000) } else { code };
                            answered += 1;
                            channel
                                .send(Frame::outcome(frame.seq, stdout, String::new(), None, 1))
                                .await?;
                        }
                        Payload::Beat => channel.send(Frame::beat(frame.seq)).await?,
                        _ => break,
                    }
                }
                Ok::<_, BridgeError>(WorkerExit {
                    reason: "closed".to_string(),
                })
            })))
        }
    }

    #[tokio::test]
    async fn test_discarded_response_fails_only_its_request() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = Bridge::new(config(dir.path()).with_max_frame_bytes(2_048)).with_launcher(UnboundedLauncher);
        let session = started(&bridge, dir.path(), "unbounded").await;

        let lost = bridge
            .execute(&session, "anything", Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(lost.status, ExecutionStatus::Error);
        assert_eq!(lost.sequence_id, SequenceId::FIRST);
        assert!(lost.exception_trace.unwrap().contains("2048 byte frame limit"));
        assert_eq!(session.snapshot().unwrap().outstanding, None);

        let next = bridge.execute(&session, "second", None).await.unwrap();
        assert_eq!(next.status, ExecutionStatus::Ok);
        assert_eq!(next.stdout, "second");
        assert_eq!(next.sequence_id, SequenceId::from_raw(2));
        assert_eq!(session.snapshot().unwrap().generation, 1);
    }

    /// Starts the interpreter the way a forking wrapper would: under a
    /// different pid, after a stray connection has already reached the
    /// socket
    #[derive(Debug)]
    struct WrapperLauncher;

    impl Launcher for WrapperLauncher {
        fn launch(&self, spec: &LaunchSpec) -> BridgeResult<Box<dyn WorkerProcess>> {
            let spec = spec.clone();
            let worker = TaskWorker::spawn(async move {
                let mut stray = Channel::connect(&spec.socket_path, MAX_FRAME_LEN).await?;
                stray
                    .send(Frame::ready(std::process::id(), "stray 0", "stale-token"))
                    .await?;
                let exit = serve(&spec, ScriptInterpreter::new()).await;
                drop(stray);
                exit
            });
            Ok(Box::new(worker.with_pid(std::process::id().wrapping_add(1))))
        }
    }

    #[tokio::test]
    async fn test_handshake_matches_token_not_pid() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = Bridge::new(config(dir.path())).with_launcher(WrapperLauncher);
        let session = started(&bridge, dir.path(), "wrapped").await;

        let snapshot = session.snapshot().unwrap();
        assert_eq!(snapshot.runtime.as_deref(), Some("script 1"));
        assert_eq!(snapshot.pid, Some(std::process::id().wrapping_add(1)));

        let result = bridge.execute(&session, "echo through", None).await.unwrap();
        assert_eq!(result.stdout, "through\n");
        bridge.release(session).await.unwrap();
    }

    fn find_python() -> Option<std::path::PathBuf> {
        ["/usr/bin/python3", "/usr/local/bin/python3", "/opt/homebrew/bin/python3"]
            .iter()
            .map(std::path::PathBuf::from)
            .find(|p| p.is_file())
    }

    #[tokio::test]
    async fn test_python_worker_end_to_end() {
        let Some(python) = find_python() else {
            return;
        };
        let dir = tempfile::tempdir().unwrap();
        let bridge = Bridge::new(config(dir.path()).with_handshake_timeout(10_000));
        let session = bridge
            .acquire(
                SessionSpec::new(SessionId::parse("py").unwrap(), python)
                    .with_project_root(dir.path()),
            )
            .await
            .unwrap();
        bridge.start(&session).await.unwrap();
        assert!(session.snapshot().unwrap().pid.is_some());

        bridge.execute(&session, "x = 21", None).await.unwrap();
        let doubled = bridge.execute(&session, "print(x * 2)", None).await.unwrap();
        assert_eq!(doubled.stdout, "42\n");

        let raised = bridge.execute(&session, "1 / 0", None).await.unwrap();
        assert_eq!(raised.status, ExecutionStatus::Error);
        assert!(raised.exception_trace.unwrap().contains("ZeroDivisionError"));

        let died = bridge.execute(&session, "import os; os._exit(3)", None).await.unwrap();
        assert_eq!(died.status, ExecutionStatus::WorkerDied);

        bridge.release(session).await.unwrap();
    }

    #[tokio::test]
    async fn test_python_worker_truncates_output() {
        let Some(python) = find_python() else {
            return;
        };
        let dir = tempfile::tempdir().unwrap();
        let bridge = Bridge::new(
            config(dir.path())
                .with_handshake_timeout(10_000)
                .with_max_frame_bytes(4_096),
        );
        let session = bridge
            .acquire(
                SessionSpec::new(SessionId::parse("py-loud").unwrap(), python)
                    .with_project_root(dir.path()),
            )
            .await
            .unwrap();
        bridge.start(&session).await.unwrap();

        let loud = bridge
            .execute(&session, "x = 7\nprint('q' * 100000)", None)
            .await
            .unwrap();
        assert_eq!(loud.status, ExecutionStatus::Ok);
        assert!(loud.stdout.ends_with(crate::protocol::TRUNCATION_NOTE));
        let after = bridge.execute(&session, "print(x)", None).await.unwrap();
        assert_eq!(after.stdout, "7\n");

        bridge.release(session).await.unwrap();
    }
}
