//! QUARRY Core Types
//!
//! Session identity, sequence numbers, timestamps, and execution records
//! shared by the bridge, the evidence engine, and the notebook layer.
//! The only I/O here is [`fs::write_atomic`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod execution;
pub mod fs;
pub mod id;
pub mod time;

// Re-exports
pub use error::{CoreError, CoreResult};
pub use execution::{ExecutionRequest, ExecutionResult, ExecutionStatus};
pub use id::{OwnerId, SequenceId, SessionId};
pub use time::Timestamp;
