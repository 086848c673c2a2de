//! Marker grammar and parser.
//!
//! A marker is a line that starts with `[TYPE]` or `[TYPE:subtype]`
//! followed by free-form content:
//!
//! ```text
//! [STAT:ci] 95% CI [0.12, 0.31]
//! [FINDING] churn drops after onboarding email
//! ```
//!
//! TYPE is matched case-insensitively against [`MarkerType`]; the subtype is
//! kept verbatim. Lines that do not match are ignored, so parsing never fails.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static MARKER_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[([A-Za-z][A-Za-z_]*)(?::([^\]]+))?\](.*)$").expect("marker regex is valid")
});

/// Known marker types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarkerType {
    /// Research objective
    Objective,
    /// Hypothesis under test
    Hypothesis,
    /// Experiment description
    Experiment,
    /// Raw observation
    Observation,
    /// Analysis step
    Analysis,
    /// Detected pattern
    Pattern,
    /// Correlation between variables
    Correlation,
    /// Anomaly or outlier
    Anomaly,
    /// Dataset description
    Data,
    /// Dataset shape
    Shape,
    /// Model or pipeline metric
    Metric,
    /// Statistical evidence (confidence intervals, effect sizes, p-values)
    Stat,
    /// Claimed finding
    Finding,
    /// Conclusion
    Conclusion,
    /// Known limitation
    Limitation,
    /// Planned follow-up
    NextStep,
    /// Decision taken
    Decision,
    /// Insight
    Insight,
    /// Progress checkpoint
    Checkpoint,
    /// Informational message
    Info,
    /// Warning
    Warning,
    /// Error report
    Error,
    /// Debug output
    Debug,
}

impl MarkerType {
    /// All known marker types
    pub const ALL: [MarkerType; 23] = [
        Self::Objective,
        Self::Hypothesis,
        Self::Experiment,
        Self::Observation,
        Self::Analysis,
        Self::Pattern,
        Self::Correlation,
        Self::Anomaly,
        Self::Data,
        Self::Shape,
        Self::Metric,
        Self::Stat,
        Self::Finding,
        Self::Conclusion,
        Self::Limitation,
        Self::NextStep,
        Self::Decision,
        Self::Insight,
        Self::Checkpoint,
        Self::Info,
        Self::Warning,
        Self::Error,
        Self::Debug,
    ];

    /// Canonical upper-case tag
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Objective => "OBJECTIVE",
            Self::Hypothesis => "HYPOTHESIS",
            Self::Experiment => "EXPERIMENT",
            Self::Observation => "OBSERVATION",
            Self::Analysis => "ANALYSIS",
            Self::Pattern => "PATTERN",
            Self::Correlation => "CORRELATION",
            Self::Anomaly => "ANOMALY",
            Self::Data => "DATA",
            Self::Shape => "SHAPE",
            Self::Metric => "METRIC",
            Self::Stat => "STAT",
            Self::Finding => "FINDING",
            Self::Conclusion => "CONCLUSION",
            Self::Limitation => "LIMITATION",
            Self::NextStep => "NEXT_STEP",
            Self::Decision => "DECISION",
            Self::Insight => "INSIGHT",
            Self::Checkpoint => "CHECKPOINT",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Debug => "DEBUG",
        }
    }

    /// Look up a tag, ignoring case
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        let upper = tag.to_ascii_uppercase();
        Self::ALL.iter().copied().find(|t| t.tag() == upper)
    }
}

impl std::fmt::Display for MarkerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// A typed evidence record extracted from one output line
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Marker {
    /// Marker type
    #[serde(rename = "type")]
    pub marker_type: MarkerType,
    /// Optional subtype, verbatim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    /// 1-based line number in the parsed stream
    pub line_number: usize,
    /// Content after the bracket, trimmed
    pub content: String,
    /// The full original line
    pub raw_line: String,
}

impl Marker {
    /// Whether this marker has the given type and exact subtype
    #[must_use]
    pub fn is(&self, marker_type: MarkerType, subtype: &str) -> bool {
        self.marker_type == marker_type && self.subtype.as_deref() == Some(subtype)
    }

    /// Subtype or empty string
    #[must_use]
    pub fn subtype_str(&self) -> &str {
        self.subtype.as_deref().unwrap_or("")
    }
}

/// Parse a single line
///
/// Returns `None` if the line is not a marker.
#[must_use]
pub fn parse_line(line: &str, line_number: usize) -> Option<Marker> {
    let caps = MARKER_LINE.captures(line)?;
    let marker_type = MarkerType::from_tag(caps.get(1)?.as_str())?;
    let subtype = caps.get(2).map(|m| m.as_str().to_string());
    let content = caps.get(3).map_or("", |m| m.as_str()).trim().to_string();

    Some(Marker {
        marker_type,
        subtype,
        line_number,
        content,
        raw_line: line.to_string(),
    })
}

/// Parse all markers in `text`, numbering lines from 1
#[must_use]
pub fn parse(text: &str) -> Vec<Marker> {
    parse_with_offset(text, 0)
}

/// Parse all markers in `text`, numbering lines from `offset + 1`
///
/// Used to number a chunk of output by its position in a larger stream.
#[must_use]
pub fn parse_with_offset(text: &str, offset: usize) -> Vec<Marker> {
    text.lines()
        .enumerate()
        .filter_map(|(idx, line)| parse_line(line, offset + idx + 1))
        .collect()
}
