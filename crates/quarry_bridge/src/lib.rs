//! QUARRY Bridge
//!
//! Keeps one persistent interpreter worker alive per research session.
//! The bridge owns the session lock, the worker process, and the framed
//! socket channel between them, and exposes execute/wait/cancel/restart/
//! release over an explicit [`Session`] value.
//!
//! Unix only: the channel is a Unix domain socket.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod harness;
pub mod lock;
pub mod protocol;
pub mod session;
pub mod supervisor;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
pub mod transport;
pub mod worker;

pub use config::BridgeConfig;
pub use error::{BridgeError, BridgeResult, CheckExecution};
pub use harness::{Captured, Interpreter, WorkerExit, serve};
pub use lock::{LockRecord, SessionInfo, SessionLock};
pub use protocol::{Frame, FrameCodec, FrameKind, Payload};
pub use session::{Session, SessionSpec, WorkerSnapshot};
pub use supervisor::Bridge;
#[cfg(any(test, feature = "test-utils"))]
pub use testing::{InProcessLauncher, ScriptInterpreter, TaskWorker};
pub use transport::{Channel, Endpoint};
pub use worker::{InterpreterLauncher, LaunchSpec, Launcher, WorkerProcess};
