//! Worker side of the protocol, in Rust.
//!
//! [`serve`] speaks the same frames as `assets/harness.py` on behalf of
//! any [`Interpreter`], so a worker can be embedded without an external
//! interpreter.

use crate::error::{BridgeError, BridgeResult};
use crate::protocol::{Frame, Payload};
use crate::transport::Channel;
use crate::worker::LaunchSpec;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Output captured from one execution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captured {
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
    /// Formatted exception trace, if the code raised
    pub exception: Option<String>,
}

/// The executed code terminated the worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    /// Exit description
    pub reason: String,
}

/// A stateful code interpreter
///
/// State set by one `execute` call must be visible to the next.
pub trait Interpreter: Send + 'static {
    /// Interpreter description announced in the ready frame
    fn runtime(&self) -> String;

    /// Execute code, capturing its output
    ///
    /// # Errors
    ///
    /// Returns [`WorkerExit`] if the code ends the worker; no response is
    /// sent for that request
    fn execute(&mut self, code: &str) -> Result<Captured, WorkerExit>;
}

type Running = (u64, JoinHandle<Result<(Captured, u64), WorkerExit>>);

enum Event {
    Finished(Result<Result<(Captured, u64), WorkerExit>, tokio::task::JoinError>),
    Frame(BridgeResult<Option<Frame>>),
}

async fn join_running(running: &mut Option<Running>) -> Result<Result<(Captured, u64), WorkerExit>, tokio::task::JoinError> {
    match running.as_mut() {
        Some((_, handle)) => handle.await,
        None => std::future::pending().await,
    }
}

/// Connect to the socket named in `spec` and serve requests until shutdown
///
/// Heartbeats are answered while code runs. Execute requests that arrive
/// while busy are queued in order. Output too large for one frame is
/// truncated with [`crate::protocol::TRUNCATION_NOTE`].
///
/// # Errors
///
/// Returns error if the socket fails or the interpreter panics
pub async fn serve<I: Interpreter>(spec: &LaunchSpec, interpreter: I) -> BridgeResult<WorkerExit> {
    let mut channel = Channel::connect(&spec.socket_path, spec.max_frame_len).await?;
    let runtime = interpreter.runtime();
    let interpreter = Arc::new(Mutex::new(interpreter));
    channel
        .send(Frame::ready(std::process::id(), runtime, spec.token.clone()))
        .await?;

    let mut running: Option<Running> = None;
    let mut queued: VecDeque<(u64, String)> = VecDeque::new();

    loop {
        let event = tokio::select! {
            joined = join_running(&mut running) => Event::Finished(joined),
            frame = channel.recv() => Event::Frame(frame),
        };

        match event {
            Event::Finished(joined) => {
                let seq = running.take().map(|(seq, _)| seq).unwrap_or_default();
                match joined {
                    Ok(Ok((captured, duration_ms))) => {
                        let max = channel.max_frame_len();
                        let frame = Frame::outcome(
                            seq,
                            captured.stdout,
                            captured.stderr,
                            captured.exception,
                            duration_ms,
                        );
                        let len = frame.encoded_len();
                        if len > max {
                            debug!(seq, len, max, "Truncating output to the frame limit");
                        }
                        channel.send(frame.fit_within(max)).await?;
                    }
                    Ok(Err(exit)) => {
                        debug!(seq, reason = %exit.reason, "Code ended the worker");
                        return Ok(exit);
                    }
                    Err(e) => return Err(BridgeError::Protocol(format!("interpreter panicked: {}", e))),
                }
            }
            Event::Frame(frame) => match frame? {
                None => {
                    return Ok(WorkerExit {
                        reason: "supervisor closed the connection".to_string(),
                    });
                }
                Some(frame) => match frame.payload {
                    Payload::Beat => channel.send(Frame::beat(frame.seq)).await?,
                    Payload::Execute { code, .. } => queued.push_back((frame.seq, code)),
                    Payload::Shutdown => {
                        channel.send(Frame::ack(frame.seq)).await?;
                        return Ok(WorkerExit {
                            reason: "shutdown requested".to_string(),
                        });
                    }
                    other => warn!(seq = frame.seq, payload = ?other, "Worker ignoring frame"),
                },
            },
        }

        if running.is_none() {
            if let Some((seq, code)) = queued.pop_front() {
                running = Some((seq, start_execution(Arc::clone(&interpreter), code)));
            }
        }
    }
}

fn start_execution<I: Interpreter>(
    interpreter: Arc<Mutex<I>>,
    code: String,
) -> JoinHandle<Result<(Captured, u64), WorkerExit>> {
    tokio::task::spawn_blocking(move || {
        let started = Instant::now();
        let mut guard = interpreter.lock().map_err(|_| WorkerExit {
            reason: "interpreter state poisoned".to_string(),
        })?;
        let captured = guard.execute(&code)?;
        Ok((captured, started.elapsed().as_millis() as u64))
    })
}
