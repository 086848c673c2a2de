//! Worker processes.
//!
//! A [`Launcher`] turns a [`LaunchSpec`] into a running worker that will
//! connect back to the session socket. The default launcher runs the
//! embedded Python harness under the session's configured interpreter.

use crate::error::{BridgeError, BridgeResult};
use async_trait::async_trait;
use quarry_core::SessionId;
use quarry_core::fs::write_atomic_with_mode;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info};

/// Python harness executed by [`InterpreterLauncher::python`]
pub const PYTHON_HARNESS: &str = include_str!("../assets/harness.py");

/// Environment variable carrying the launch token to a worker process
pub const ENV_LAUNCH_TOKEN: &str = "QUARRY_LAUNCH_TOKEN";

/// Everything a launcher needs to start one worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Session the worker serves
    pub session_id: SessionId,
    /// Interpreter binary
    pub interpreter_path: PathBuf,
    /// Socket the worker must connect to
    pub socket_path: PathBuf,
    /// Working directory for user code
    pub working_dir: PathBuf,
    /// Runtime directory for launcher scratch files
    pub runtime_dir: PathBuf,
    /// Frame limit the worker must respect
    pub max_frame_len: usize,
    /// Nonce the worker echoes in its ready frame
    pub token: String,
}

/// Handle to a running worker
#[async_trait]
pub trait WorkerProcess: Send + Sync + std::fmt::Debug {
    /// OS process id, if the worker is a separate process
    fn pid(&self) -> Option<u32>;

    /// Exit description if the worker has already exited
    fn try_exit(&mut self) -> Option<String>;

    /// Wait up to `timeout` for the worker to exit on its own
    async fn wait_exit(&mut self, timeout: Duration) -> Option<String>;

    /// Force the worker down and reap it
    async fn kill(&mut self);
}

/// Starts workers
pub trait Launcher: Send + Sync + std::fmt::Debug {
    /// Start a worker for `spec`
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::WorkerSpawnFailed`] if the worker cannot start
    fn launch(&self, spec: &LaunchSpec) -> BridgeResult<Box<dyn WorkerProcess>>;
}

/// Launches a harness script under an external interpreter
#[derive(Debug, Clone)]
pub struct InterpreterLauncher {
    harness: &'static str,
    extension: &'static str,
    interpreter_args: Vec<String>,
}

impl Default for InterpreterLauncher {
    fn default() -> Self {
        Self::python()
    }
}

impl InterpreterLauncher {
    /// Python launcher (`<interpreter> -u harness.py --socket <path> --max-frame <bytes>`)
    #[must_use]
    pub fn python() -> Self {
        Self {
            harness: PYTHON_HARNESS,
            extension: "py",
            interpreter_args: vec!["-u".to_string()],
        }
    }

    /// Launcher for a custom harness script
    #[must_use]
    pub fn with_harness(harness: &'static str, extension: &'static str) -> Self {
        Self {
            harness,
            extension,
            interpreter_args: Vec::new(),
        }
    }

    /// Add interpreter arguments placed before the harness path
    #[must_use]
    pub fn with_interpreter_args(mut self, args: Vec<String>) -> Self {
        self.interpreter_args = args;
        self
    }

    /// Write the harness into the runtime directory, named by content hash
    fn install_harness(&self, runtime_dir: &Path) -> BridgeResult<PathBuf> {
        let hash = blake3::hash(self.harness.as_bytes()).to_hex();
        let path = runtime_dir.join(format!(
            "quarry_harness_{}.{}",
            &hash.as_str()[..8],
            self.extension
        ));
        if !path.is_file() {
            write_atomic_with_mode(&path, self.harness.as_bytes(), Some(0o600))
                .map_err(BridgeError::io("install worker harness"))?;
        }
        Ok(path)
    }
}

impl Launcher for InterpreterLauncher {
    fn launch(&self, spec: &LaunchSpec) -> BridgeResult<Box<dyn WorkerProcess>> {
        validate_interpreter(&spec.interpreter_path)?;
        let harness = self.install_harness(&spec.runtime_dir)?;

        let mut child = Command::new(&spec.interpreter_path)
            .args(&self.interpreter_args)
            .arg(&harness)
            .arg("--socket")
            .arg(&spec.socket_path)
            .arg("--max-frame")
            .arg(spec.max_frame_len.to_string())
            .current_dir(&spec.working_dir)
            .env("QUARRY_SESSION_ID", spec.session_id.as_str())
            .env(ENV_LAUNCH_TOKEN, &spec.token)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BridgeError::WorkerSpawnFailed {
                reason: format!("{}: {}", spec.interpreter_path.display(), e),
            })?;

        let pid = child.id();
        if let Some(stderr) = child.stderr.take() {
            let session = spec.session_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(session = %session, "worker: {}", line);
                }
            });
        }
        info!(session = %spec.session_id, pid = ?pid, "Spawned worker process");
        Ok(Box::new(ChildWorker { child, pid }))
    }
}

/// Reject interpreter paths that cannot possibly be executed
///
/// # Errors
///
/// Returns [`BridgeError::WorkerSpawnFailed`] for a missing path, a
/// directory, or a file without an execute bit
pub fn validate_interpreter(path: &Path) -> BridgeResult<()> {
    let meta = std::fs::metadata(path).map_err(|e| BridgeError::WorkerSpawnFailed {
        reason: format!("interpreter {}: {}", path.display(), e),
    })?;
    if !meta.is_file() {
        return Err(BridgeError::WorkerSpawnFailed {
            reason: format!("interpreter {} is not a file", path.display()),
        });
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if meta.permissions().mode() & 0o111 == 0 {
            return Err(BridgeError::WorkerSpawnFailed {
                reason: format!("interpreter {} is not executable", path.display()),
            });
        }
    }
    Ok(())
}

/// Worker running as a child process
#[derive(Debug)]
struct ChildWorker {
    child: Child,
    pid: Option<u32>,
}

#[async_trait]
impl WorkerProcess for ChildWorker {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn try_exit(&mut self) -> Option<String> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            Ok(None) => None,
            Err(e) => Some(format!("unknown exit ({})", e)),
        }
    }

    async fn wait_exit(&mut self, timeout: Duration) -> Option<String> {
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => Some(status.to_string()),
            Ok(Err(e)) => Some(format!("unknown exit ({})", e)),
            Err(_) => None,
        }
    }

    async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            debug!(pid = ?self.pid, error = %e, "Kill on an already reaped worker");
        }
    }
}
