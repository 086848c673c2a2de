//! QUARRY Runtime
//!
//! Controller-facing facade. A [`ResearchEngine`] opens a locked session
//! with a running worker, executes code through the bridge, records every
//! completed result into the session notebook, and reports the quality
//! gate over the session's full output history.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod engine;

pub use engine::{EngineError, EngineResult, ResearchEngine, ResearchSession};
