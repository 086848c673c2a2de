//! Notebook documents.
//!
//! On disk a document is nbformat 4 JSON:
//!
//! - cell 0 is a `raw` cell holding `---\n<yaml frontmatter>---\n`
//! - every execution appends one `code` cell with stream outputs, an
//!   `error` output when the code raised, and `metadata.quarry` recording
//!   the sequence id, status, duration, and that cell's markers
//! - `metadata.quarry` at notebook level caches the latest quality gate
//!   result and the owning session id
//!
//! Cells are append-only apart from cell 0, which is rewritten wholesale.

use crate::error::{NotebookError, NotebookResult};
use quarry_core::fs::write_atomic;
use quarry_core::{ExecutionResult, ExecutionStatus, SequenceId, SessionId, Timestamp};
use quarry_evidence::{Marker, QualityGateResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

/// Frontmatter schema written by this version
pub const SCHEMA_VERSION: u32 = 1;

/// nbformat major version
pub const NBFORMAT: u32 = 4;

/// nbformat minor version (cell ids are required from 4.5)
pub const NBFORMAT_MINOR: u32 = 5;

/// Notebook file extension
pub const EXTENSION: &str = "ipynb";

/// Text stored as one string or as a list of lines
///
/// Serialized as a list of lines with line endings kept, the way notebook
/// tools write it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultilineText(pub String);

impl MultilineText {
    /// Get as string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MultilineText {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl Serialize for MultilineText {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let lines: Vec<&str> = self.0.split_inclusive('\n').collect();
        lines.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for MultilineText {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            One(String),
            Many(Vec<String>),
        }
        Ok(match Repr::deserialize(deserializer)? {
            Repr::One(text) => Self(text),
            Repr::Many(lines) => Self(lines.concat()),
        })
    }
}

/// Lifecycle state of a document
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    /// Receiving executions
    #[default]
    Active,
    /// Research finished
    Completed,
    /// Kept for reference only
    Archived,
}

impl DocumentStatus {
    /// Lowercase name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Archived => "archived",
        }
    }
}

/// Summary of one recorded execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Execution sequence id within its worker generation
    pub sequence_id: SequenceId,
    /// Outcome class
    pub status: ExecutionStatus,
    /// Execution time
    pub duration_ms: u64,
    /// Quality score after this execution
    pub score: u32,
    /// When the run was written
    pub recorded_at: Timestamp,
}

/// YAML frontmatter of a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frontmatter {
    /// Frontmatter schema version
    pub schema_version: u32,
    /// Workspace the document belongs to
    pub workspace: String,
    /// Document slug, unique within the workspace
    pub slug: String,
    /// Lifecycle state
    #[serde(default)]
    pub status: DocumentStatus,
    /// Creation time
    pub created: Timestamp,
    /// Last write; never earlier than `created`
    pub updated: Timestamp,
    /// Free-form tags
    #[serde(default)]
    pub tags: Vec<String>,
    /// Most recent runs, oldest first
    #[serde(default)]
    pub runs: Vec<RunRecord>,
}

impl Frontmatter {
    /// Fresh frontmatter created at `now`
    #[must_use]
    pub fn new(workspace: impl Into<String>, slug: impl Into<String>, now: Timestamp) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            workspace: workspace.into(),
            slug: slug.into(),
            status: DocumentStatus::Active,
            created: now,
            updated: now,
            tags: Vec::new(),
            runs: Vec::new(),
        }
    }

    /// Render as a `---` delimited YAML block
    ///
    /// # Errors
    ///
    /// Returns error if YAML serialization fails
    pub fn render(&self) -> Result<String, serde_yaml::Error> {
        let yaml = serde_yaml::to_string(self)?;
        Ok(format!("---\n{}---\n", yaml))
    }

    /// Parse a `---` delimited YAML block
    ///
    /// # Errors
    ///
    /// Returns a description of the problem if the block is missing its
    /// delimiters, is not valid YAML, or uses a newer schema
    pub fn parse(source: &str) -> Result<Self, String> {
        let body = source
            .strip_prefix("---\n")
            .or_else(|| source.strip_prefix("---\r\n"))
            .ok_or_else(|| "frontmatter must start with '---'".to_string())?;
        let end = if body.starts_with("---") {
            0
        } else {
            body.find("\n---")
                .map(|i| i + 1)
                .ok_or_else(|| "frontmatter is not closed by '---'".to_string())?
        };
        let frontmatter: Self =
            serde_yaml::from_str(&body[..end]).map_err(|e| format!("invalid frontmatter: {}", e))?;
        if frontmatter.schema_version > SCHEMA_VERSION {
            return Err(format!(
                "unsupported schema version {}",
                frontmatter.schema_version
            ));
        }
        Ok(frontmatter)
    }

    /// Move `updated` to `now`, never below `created`
    pub fn touch(&mut self, now: Timestamp) {
        self.updated = now.max(self.created);
    }

    /// Append a run record, evicting the oldest beyond `max_runs`
    pub fn push_run(&mut self, run: RunRecord, max_runs: usize) {
        self.runs.push(run);
        if self.runs.len() > max_runs {
            let excess = self.runs.len() - max_runs;
            self.runs.drain(..excess);
        }
    }
}

/// Per-cell record written by the synchronizer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellRecord {
    /// Execution sequence id
    pub sequence_id: SequenceId,
    /// Outcome class
    pub status: ExecutionStatus,
    /// Execution time
    pub duration_ms: u64,
    /// Markers found in this cell's stdout, numbered over the session stream
    #[serde(default)]
    pub markers: Vec<Marker>,
    /// When the cell was written
    pub recorded_at: Timestamp,
}

/// Code cell metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodeCellMetadata {
    /// Record for cells written by the synchronizer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quarry: Option<CellRecord>,
    /// Metadata from other tools, preserved as-is
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Cell output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "output_type", rename_all = "snake_case")]
pub enum Output {
    /// Captured stream text
    Stream {
        /// `stdout` or `stderr`
        name: String,
        /// Stream contents
        text: MultilineText,
    },
    /// Raised exception
    Error {
        /// Exception name
        ename: String,
        /// Exception value
        evalue: String,
        /// Trace lines
        traceback: Vec<String>,
    },
    /// Rich result written by other tools
    ExecuteResult {
        /// Execution counter
        #[serde(default)]
        execution_count: Option<u64>,
        /// MIME bundle
        #[serde(default)]
        data: Map<String, Value>,
        /// Output metadata
        #[serde(default)]
        metadata: Map<String, Value>,
    },
    /// Display output written by other tools
    DisplayData {
        /// MIME bundle
        #[serde(default)]
        data: Map<String, Value>,
        /// Output metadata
        #[serde(default)]
        metadata: Map<String, Value>,
    },
}

impl Output {
    fn stream(name: &str, text: &str) -> Self {
        Self::Stream {
            name: name.to_string(),
            text: MultilineText(text.to_string()),
        }
    }

    fn error(trace: &str) -> Self {
        let last = trace
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or_default()
            .trim();
        let (ename, evalue) = match last.split_once(':') {
            Some((name, value)) if !name.is_empty() && !name.contains(char::is_whitespace) => {
                (name.to_string(), value.trim().to_string())
            }
            _ => ("Error".to_string(), last.to_string()),
        };
        Self::Error {
            ename,
            evalue,
            traceback: trace.lines().map(str::to_string).collect(),
        }
    }
}

/// Notebook cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cell_type", rename_all = "lowercase")]
pub enum Cell {
    /// Unrendered text; cell 0 holds the frontmatter
    Raw {
        /// Cell id
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        /// Cell metadata
        #[serde(default)]
        metadata: Map<String, Value>,
        /// Cell text
        source: MultilineText,
    },
    /// Markdown prose
    Markdown {
        /// Cell id
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        /// Cell metadata
        #[serde(default)]
        metadata: Map<String, Value>,
        /// Cell text
        source: MultilineText,
    },
    /// Executed code and its outputs
    Code {
        /// Cell id
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        /// Cell metadata
        #[serde(default)]
        metadata: CodeCellMetadata,
        /// Source code
        source: MultilineText,
        /// Execution counter
        #[serde(default)]
        execution_count: Option<u64>,
        /// Outputs
        #[serde(default)]
        outputs: Vec<Output>,
    },
}

impl Cell {
    /// Concatenated stdout of a code cell; empty for other cells
    #[must_use]
    pub fn stdout(&self) -> String {
        match self {
            Cell::Code { outputs, .. } => outputs
                .iter()
                .filter_map(|o| match o {
                    Output::Stream { name, text } if name == "stdout" => Some(text.as_str()),
                    _ => None,
                })
                .collect(),
            _ => String::new(),
        }
    }

    /// Synchronizer record of a code cell
    #[must_use]
    pub fn record(&self) -> Option<&CellRecord> {
        match self {
            Cell::Code { metadata, .. } => metadata.quarry.as_ref(),
            _ => None,
        }
    }
}

/// Session-level metadata cached in the notebook
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuarryMetadata {
    /// Session that last wrote the document
    #[serde(default)]
    pub session_id: Option<SessionId>,
    /// Quality gate result after the last write
    #[serde(default)]
    pub quality: Option<QualityGateResult>,
}

/// Notebook-level metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotebookMetadata {
    /// QUARRY cache
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quarry: Option<QuarryMetadata>,
    /// Metadata from other tools, preserved as-is
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct NotebookFile {
    cells: Vec<Cell>,
    #[serde(default)]
    metadata: NotebookMetadata,
    nbformat: u32,
    nbformat_minor: u32,
}

/// A research notebook bound to a path
#[derive(Debug, Clone, PartialEq)]
pub struct NotebookDocument {
    path: PathBuf,
    frontmatter_id: Option<String>,
    /// Parsed frontmatter
    pub frontmatter: Frontmatter,
    /// Cells after the frontmatter cell
    pub cells: Vec<Cell>,
    /// Notebook-level metadata
    pub metadata: NotebookMetadata,
}

impl NotebookDocument {
    /// New, empty document; nothing is written until [`Self::save`]
    #[must_use]
    pub fn create(path: impl Into<PathBuf>, workspace: impl Into<String>, slug: impl Into<String>) -> Self {
        let mut extra = Map::new();
        extra.insert(
            "kernelspec".to_string(),
            serde_json::json!({"name": "python3", "display_name": "Python 3", "language": "python"}),
        );
        extra.insert("language_info".to_string(), serde_json::json!({"name": "python"}));
        Self {
            path: path.into(),
            frontmatter_id: Some(new_cell_id()),
            frontmatter: Frontmatter::new(workspace, slug, Timestamp::now()),
            cells: Vec::new(),
            metadata: NotebookMetadata {
                quarry: None,
                extra,
            },
        }
    }

    /// Read a document from disk
    ///
    /// # Errors
    ///
    /// Returns [`NotebookError::Parse`] for invalid JSON and
    /// [`NotebookError::MalformedMetadata`] if cell 0 is not valid
    /// frontmatter
    pub fn load(path: &Path) -> NotebookResult<Self> {
        let text = std::fs::read_to_string(path).map_err(NotebookError::io(path))?;
        Self::parse(path, &text)
    }

    /// Parse document text that was read from `path`
    ///
    /// # Errors
    ///
    /// Same as [`Self::load`]
    pub fn parse(path: &Path, text: &str) -> NotebookResult<Self> {
        let file: NotebookFile = serde_json::from_str(text).map_err(|source| NotebookError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        let malformed = |reason: String| NotebookError::MalformedMetadata {
            path: path.to_path_buf(),
            reason,
        };

        let mut cells = file.cells.into_iter();
        let (frontmatter_id, source) = match cells.next() {
            Some(Cell::Raw { id, source, .. }) => (id, source),
            Some(_) => return Err(malformed("first cell is not a raw frontmatter cell".to_string())),
            None => return Err(malformed("document has no cells".to_string())),
        };
        let frontmatter = Frontmatter::parse(source.as_str()).map_err(malformed)?;

        Ok(Self {
            path: path.to_path_buf(),
            frontmatter_id,
            frontmatter,
            cells: cells.collect(),
            metadata: file.metadata,
        })
    }

    /// Path the document is bound to
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serialize to notebook JSON
    ///
    /// # Errors
    ///
    /// Returns error if the frontmatter cannot be rendered
    pub fn to_json(&self) -> NotebookResult<String> {
        let rendered = self.frontmatter.render().map_err(|e| NotebookError::MalformedMetadata {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        let mut raw_metadata = Map::new();
        raw_metadata.insert("raw_mimetype".to_string(), Value::from("text/x-yaml"));

        let mut cells = Vec::with_capacity(self.cells.len() + 1);
        cells.push(Cell::Raw {
            id: self.frontmatter_id.clone(),
            metadata: raw_metadata,
            source: MultilineText(rendered),
        });
        cells.extend(self.cells.iter().cloned());

        let file = NotebookFile {
            cells,
            metadata: self.metadata.clone(),
            nbformat: NBFORMAT,
            nbformat_minor: NBFORMAT_MINOR,
        };
        let mut json = serde_json::to_string_pretty(&file).map_err(|source| NotebookError::Parse {
            path: self.path.clone(),
            source,
        })?;
        json.push('\n');
        Ok(json)
    }

    /// Write the whole document atomically
    ///
    /// # Errors
    ///
    /// Returns error if serialization or the write fails
    pub fn save(&self) -> NotebookResult<()> {
        let json = self.to_json()?;
        write_atomic(&self.path, json.as_bytes()).map_err(NotebookError::io(&self.path))
    }

    /// Stdout of every code cell in order
    #[must_use]
    pub fn stdout_chunks(&self) -> Vec<String> {
        self.cells
            .iter()
            .filter(|c| matches!(c, Cell::Code { .. }))
            .map(Cell::stdout)
            .collect()
    }

    /// Number of code cells
    #[must_use]
    pub fn execution_count(&self) -> usize {
        self.cells
            .iter()
            .filter(|c| matches!(c, Cell::Code { .. }))
            .count()
    }

    /// Append a code cell for one execution; returns its notebook cell index
    pub fn append_execution(
        &mut self,
        code: &str,
        result: &ExecutionResult,
        markers: Vec<Marker>,
        recorded_at: Timestamp,
    ) -> usize {
        let mut outputs = Vec::new();
        if !result.stdout.is_empty() {
            outputs.push(Output::stream("stdout", &result.stdout));
        }
        if !result.stderr.is_empty() {
            outputs.push(Output::stream("stderr", &result.stderr));
        }
        if let Some(trace) = &result.exception_trace {
            outputs.push(Output::error(trace));
        } else if result.status == ExecutionStatus::WorkerDied {
            outputs.push(Output::Error {
                ename: "WorkerDied".to_string(),
                evalue: result.stderr.trim().to_string(),
                traceback: Vec::new(),
            });
        }

        self.cells.push(Cell::Code {
            id: Some(new_cell_id()),
            metadata: CodeCellMetadata {
                quarry: Some(CellRecord {
                    sequence_id: result.sequence_id,
                    status: result.status,
                    duration_ms: result.duration_ms,
                    markers,
                    recorded_at,
                }),
                extra: Map::new(),
            },
            source: MultilineText(code.to_string()),
            execution_count: Some(result.sequence_id.as_u64()),
            outputs,
        });
        self.cells.len()
    }

    /// Cache the latest gate result and session id
    pub fn set_quality(&mut self, session_id: &SessionId, quality: QualityGateResult) {
        self.metadata.quarry = Some(QuarryMetadata {
            session_id: Some(session_id.clone()),
            quality: Some(quality),
        });
    }

    /// Cached gate result, if any
    #[must_use]
    pub fn cached_quality(&self) -> Option<&QualityGateResult> {
        self.metadata.quarry.as_ref().and_then(|q| q.quality.as_ref())
    }
}

fn new_cell_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..12].to_string()
}
