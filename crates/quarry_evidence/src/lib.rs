//! QUARRY Evidence
//!
//! Extracts typed evidence markers from plain-text execution output and
//! scores the accumulated marker history against quality gates.
//! Everything here is pure: identical text always yields identical markers
//! and identical gate results, so a whole session can be replayed.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod gate;
pub mod history;
pub mod marker;

pub use gate::{
    FindingsValidation, GateConfig, MlValidation, QualityGate, QualityGateResult, Violation,
    ViolationKind,
};
pub use history::MarkerHistory;
pub use marker::{Marker, MarkerType, parse, parse_with_offset};
