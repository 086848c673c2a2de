//! In-process workers for tests.
//!
//! [`InProcessLauncher`] runs [`serve`] as a task in the supervisor's own
//! runtime and [`ScriptInterpreter`] gives it a tiny stateful language, so
//! the bridge can be driven end to end without an external interpreter.
//!
//! Built for this crate's tests and behind the `test-utils` feature.

use crate::error::BridgeResult;
use crate::harness::{Captured, Interpreter, WorkerExit, serve};
use crate::worker::{LaunchSpec, Launcher, WorkerProcess};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Runs [`serve`] as a task in the current runtime
pub struct InProcessLauncher<F> {
    factory: F,
}

impl<F> std::fmt::Debug for InProcessLauncher<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessLauncher").finish_non_exhaustive()
    }
}

impl<F, I> InProcessLauncher<F>
where
    F: Fn() -> I + Send + Sync + 'static,
    I: Interpreter,
{
    /// Create a launcher producing a fresh interpreter per worker
    #[must_use]
    pub fn new(factory: F) -> Self {
        Self { factory }
    }
}

impl<F, I> Launcher for InProcessLauncher<F>
where
    F: Fn() -> I + Send + Sync + 'static,
    I: Interpreter,
{
    fn launch(&self, spec: &LaunchSpec) -> BridgeResult<Box<dyn WorkerProcess>> {
        let interpreter = (self.factory)();
        let spec = spec.clone();
        Ok(Box::new(TaskWorker::spawn(async move {
            serve(&spec, interpreter).await
        })))
    }
}

/// Worker running as a task
#[derive(Debug)]
pub struct TaskWorker {
    handle: JoinHandle<BridgeResult<WorkerExit>>,
    pid: Option<u32>,
    exit: Option<String>,
}

impl TaskWorker {
    /// Spawn `worker` on the current runtime
    pub fn spawn<W>(worker: W) -> Self
    where
        W: Future<Output = BridgeResult<WorkerExit>> + Send + 'static,
    {
        Self {
            handle: tokio::spawn(worker),
            pid: None,
            exit: None,
        }
    }

    /// Report `pid` as the worker's process id
    #[must_use]
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }
}

fn describe(joined: Result<BridgeResult<WorkerExit>, tokio::task::JoinError>) -> String {
    match joined {
        Ok(Ok(exit)) => exit.reason,
        Ok(Err(e)) => e.to_string(),
        Err(e) if e.is_cancelled() => "killed".to_string(),
        Err(e) => e.to_string(),
    }
}

#[async_trait]
impl WorkerProcess for TaskWorker {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn try_exit(&mut self) -> Option<String> {
        if self.exit.is_none() && self.handle.is_finished() {
            self.exit = Some("worker task finished".to_string());
        }
        self.exit.clone()
    }

    async fn wait_exit(&mut self, timeout: Duration) -> Option<String> {
        if self.exit.is_some() {
            return self.exit.clone();
        }
        match tokio::time::timeout(timeout, &mut self.handle).await {
            Ok(joined) => {
                self.exit = Some(describe(joined));
                self.exit.clone()
            }
            Err(_) => None,
        }
    }

    async fn kill(&mut self) {
        if self.exit.is_some() {
            return;
        }
        self.handle.abort();
        self.exit = Some(describe((&mut self.handle).await));
    }
}

/// Line-oriented command interpreter with persistent bindings
///
/// One command per line:
/// `let NAME = VALUE`, `show NAME`, `echo TEXT`, `warn TEXT`,
/// `fill COUNT`, `fail MESSAGE`, `sleep MILLIS`, `exit`. Execution stops
/// at the first failing line.
#[derive(Debug, Default, Clone)]
pub struct ScriptInterpreter {
    bindings: HashMap<String, String>,
}

impl ScriptInterpreter {
    /// Create an interpreter with no bindings
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Interpreter for ScriptInterpreter {
    fn runtime(&self) -> String {
        "script 1".to_string()
    }

    fn execute(&mut self, code: &str) -> Result<Captured, WorkerExit> {
        let mut out = Captured::default();
        for (index, line) in code.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
            let failure = match command {
                "echo" => {
                    out.stdout.push_str(rest);
                    out.stdout.push('\n');
                    None
                }
                "warn" => {
                    out.stderr.push_str(rest);
                    out.stderr.push('\n');
                    None
                }
                "fill" => match rest.trim().parse::<usize>() {
                    Ok(count) => {
                        out.stdout.push_str(&".".repeat(count));
                        out.stdout.push('\n');
                        None
                    }
                    Err(_) => Some(format!("ValueError: bad count {:?}", rest)),
                },
                "let" => match rest.split_once('=') {
                    Some((name, value)) => {
                        self.bindings
                            .insert(name.trim().to_string(), value.trim().to_string());
                        None
                    }
                    None => Some("SyntaxError: expected `let NAME = VALUE`".to_string()),
                },
                "show" => match self.bindings.get(rest.trim()) {
                    Some(value) => {
                        out.stdout.push_str(value);
                        out.stdout.push('\n');
                        None
                    }
                    None => Some(format!("NameError: name '{}' is not defined", rest.trim())),
                },
                "sleep" => match rest.trim().parse::<u64>() {
                    Ok(ms) => {
                        std::thread::sleep(Duration::from_millis(ms));
                        None
                    }
                    Err(_) => Some(format!("ValueError: bad duration {:?}", rest)),
                },
                "fail" => Some(format!("Error: {}", rest)),
                "exit" => {
                    return Err(WorkerExit {
                        reason: "exit called".to_string(),
                    });
                }
                other => Some(format!("SyntaxError: unknown command {:?}", other)),
            };
            if let Some(message) = failure {
                out.exception = Some(format!("line {}\n{}", index + 1, message));
                break;
            }
        }
        Ok(out)
    }
}
