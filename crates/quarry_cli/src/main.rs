//! QUARRY CLI
//!
//! Operator tooling for research sessions: inspect and clear session
//! locks, run code files through a session, and rebuild quality reports
//! and workspace indexes from notebooks on disk.

#![warn(missing_docs)]
#![warn(clippy::all)]

use clap::{Parser, Subcommand};
use color_eyre::Result;
use color_eyre::eyre::eyre;
use quarry_bridge::{Bridge, BridgeConfig, SessionSpec};
use quarry_core::{ExecutionResult, ExecutionStatus, SessionId};
use quarry_evidence::{MarkerHistory, QualityGate, QualityGateResult};
use quarry_notebook::index::{self, INDEX_FILE};
use quarry_notebook::{NotebookDocument, SyncConfig};
use quarry_runtime::ResearchEngine;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "quarry_bridge=info,quarry_notebook=info,quarry_runtime=info,quarry=info";

#[derive(Parser)]
#[command(name = "quarry")]
#[command(about = "QUARRY - evidence-gated research sessions over persistent interpreters", long_about = None)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List session locks and their liveness
    Sessions {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove a session's lock and socket
    Unlock {
        /// Session id
        id: String,
        /// Remove even if the owner looks live
        #[arg(long)]
        force: bool,
    },
    /// Execute code files in a session and record them in its notebook
    Run {
        /// Session id
        #[arg(short, long)]
        session: String,
        /// Interpreter binary
        #[arg(short, long, default_value = "/usr/bin/python3")]
        interpreter: PathBuf,
        /// Notebook to record into
        #[arg(short, long)]
        notebook: PathBuf,
        /// Workspace directory; its index is regenerated after each write
        #[arg(short, long)]
        workspace: Option<PathBuf>,
        /// Per-file execution timeout
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Code files, executed in order
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Recompute the quality gate from a notebook
    Report {
        /// Notebook to read
        #[arg(short, long)]
        notebook: PathBuf,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Regenerate a workspace index
    Index {
        /// Workspace directory
        #[arg(short, long)]
        workspace: PathBuf,
        /// Index file; defaults to INDEX.md inside the workspace
        #[arg(long)]
        index: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::Sessions { json } => sessions(json),
        Commands::Unlock { id, force } => unlock(&id, force),
        Commands::Run {
            session,
            interpreter,
            notebook,
            workspace,
            timeout_ms,
            files,
        } => run(&session, interpreter, notebook, workspace, timeout_ms, &files).await,
        Commands::Report { notebook, json } => report(&notebook, json),
        Commands::Index { workspace, index } => {
            let index_path = index.unwrap_or_else(|| workspace.join(INDEX_FILE));
            let built = index::regenerate(&workspace, &index_path)?;
            println!(
                "Indexed {} notebook(s) into {}",
                built.entries.len(),
                index_path.display()
            );
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn bridge() -> Result<Bridge> {
    Ok(Bridge::new(BridgeConfig::from_env()?))
}

fn sessions(json: bool) -> Result<()> {
    let sessions = bridge()?.list_sessions()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
        return Ok(());
    }
    if sessions.is_empty() {
        println!("No sessions");
        return Ok(());
    }
    for info in sessions {
        let state = if info.live { "live" } else { "stale" };
        match info.record {
            Some(record) => println!(
                "{}  {}  owner {}  pid {}  heartbeat {}ms ago",
                info.session_id,
                state,
                record.owner,
                record.pid,
                record.heartbeat_age().as_millis()
            ),
            None => println!("{}  {}  (unreadable lock)", info.session_id, state),
        }
    }
    Ok(())
}

fn unlock(id: &str, force: bool) -> Result<()> {
    let session_id = SessionId::parse(id)?;
    if bridge()?.unlock(&session_id, force)? {
        println!("Unlocked {}", session_id);
    } else {
        println!("{} was not locked", session_id);
    }
    Ok(())
}

async fn run(
    session: &str,
    interpreter: PathBuf,
    notebook: PathBuf,
    workspace: Option<PathBuf>,
    timeout_ms: Option<u64>,
    files: &[PathBuf],
) -> Result<()> {
    let session_id = SessionId::parse(session)?;
    let workspace_dir = workspace.clone().unwrap_or_else(|| {
        notebook
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
    });

    let mut sync = SyncConfig::default();
    if let Some(dir) = &workspace {
        sync = sync.with_index(dir.join(INDEX_FILE));
    }
    let engine = ResearchEngine::new(bridge()?, sync);
    let spec = SessionSpec::new(session_id, interpreter).with_workspace(&workspace_dir);
    let mut research = engine.open(spec, &notebook).await?;

    let timeout = timeout_ms.map(Duration::from_millis);
    tracing::debug!(session = %research.id(), files = files.len(), "Running files");
    let mut outcome: Result<()> = Ok(());
    for file in files {
        let code = match std::fs::read_to_string(file) {
            Ok(code) => code,
            Err(e) => {
                outcome = Err(eyre!("reading {}: {}", file.display(), e));
                break;
            }
        };
        println!("==> {}", file.display());
        let result = match engine.execute_code(&mut research, &code, timeout).await {
            Ok(result) => result,
            Err(e) => {
                outcome = Err(e.into());
                break;
            }
        };
        print_result(&result);
        if result.status == ExecutionStatus::Timeout {
            eprintln!("Timed out; cancelling the worker and stopping");
            if let Err(e) = engine.cancel(&mut research).await {
                outcome = Err(e.into());
            }
            break;
        }
    }

    if outcome.is_ok() {
        match engine.quality_report(&research) {
            Ok(quality) => print_quality(&quality),
            Err(e) => outcome = Err(e.into()),
        }
    }
    engine.close(research).await?;
    outcome
}

fn report(notebook: &Path, json: bool) -> Result<()> {
    let doc = NotebookDocument::load(notebook)?;
    let chunks = doc.stdout_chunks();
    let history = MarkerHistory::from_chunks(chunks.iter().map(String::as_str));
    let quality = QualityGate::new().evaluate(history.markers());
    if json {
        println!("{}", serde_json::to_string_pretty(&quality)?);
    } else {
        println!(
            "{} ({}, {} execution(s))",
            doc.frontmatter.slug,
            doc.frontmatter.status.as_str(),
            doc.execution_count()
        );
        print_quality(&quality);
    }
    Ok(())
}

fn print_result(result: &ExecutionResult) {
    print!("{}", result.stdout);
    if !result.stderr.is_empty() {
        eprint!("{}", result.stderr);
    }
    if let Some(trace) = &result.exception_trace {
        eprintln!("{}", trace.trim_end());
    }
    println!(
        "[{} {} in {}ms]",
        result.sequence_id, result.status, result.duration_ms
    );
}

fn print_quality(quality: &QualityGateResult) {
    let verdict = if quality.passed { "PASSED" } else { "FAILED" };
    println!("Quality gate {}: score {}/100", verdict, quality.score);
    for violation in &quality.violations {
        println!(
            "  - {} (line {}, -{}): {}",
            violation.kind.code(),
            violation.line_number,
            violation.penalty,
            violation.message
        );
    }
}
