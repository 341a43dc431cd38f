//! `chronos`: run a code-generation CLI autonomously until the task is done.
//!
//! Sessions live in `.chronos/` under the working directory and survive
//! crashes, quota waits and restarts.

use std::future::Future;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use chronos::commands::{self, RunRequest, TaskSource};
use chronos::engine::{RunOutcome, StopReason};
use chronos::error::SessionError;
use chronos::{exit_codes, logging};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "chronos",
    version,
    about = "Autonomous, rate-limited, resumable runner for code-generation CLIs"
)]
struct Cli {
    /// Log progress to stderr (`RUST_LOG` takes precedence).
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct DirArg {
    /// Working directory of the session.
    #[arg(short, long, default_value = ".")]
    dir: PathBuf,
}

#[derive(Subcommand)]
enum Command {
    /// Start a new session and drive it until it completes or stops.
    Run {
        /// Task prompt.
        #[arg(required_unless_present_any = ["file", "sequence"])]
        prompt: Option<String>,
        /// Read the task prompt from a file.
        #[arg(short, long, conflicts_with_all = ["prompt", "sequence"])]
        file: Option<PathBuf>,
        /// Run a TOML sequence of prompts (`[[prompts]] name/prompt`).
        #[arg(short, long, conflicts_with = "prompt")]
        sequence: Option<PathBuf>,
        #[command(flatten)]
        dir: DirArg,
        /// Approve the tool's permission prompts automatically.
        #[arg(long)]
        yolo: bool,
        /// Discard any existing session first, even an active one.
        #[arg(long)]
        force: bool,
    },
    /// Continue the session from its last recorded cursor.
    Resume {
        #[command(flatten)]
        dir: DirArg,
    },
    /// Show the session without modifying it.
    Status {
        #[command(flatten)]
        dir: DirArg,
        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },
    /// Delete the session.
    Clear {
        #[command(flatten)]
        dir: DirArg,
    },
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("chronos: {err:#}");
            exit_code_for(&err)
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Run {
            prompt,
            file,
            sequence,
            dir,
            yolo,
            force,
        } => {
            let source = task_source(prompt, file, sequence)?;
            let request = RunRequest {
                dir: dir.dir,
                source,
                yolo,
                force,
            };
            let outcome = with_runtime(|cancel| commands::run(request, cancel))?;
            Ok(report(&outcome))
        }
        Command::Resume { dir } => {
            let outcome = with_runtime(|cancel| async move { commands::resume(&dir.dir, cancel).await })?;
            Ok(report(&outcome))
        }
        Command::Status { dir, json } => {
            let status = commands::status(&dir.dir)?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&status).context("serialize status")?
                );
            } else {
                print!("{}", status.render());
            }
            Ok(exit_codes::OK)
        }
        Command::Clear { dir } => {
            if commands::clear(&dir.dir)? {
                println!("session cleared");
            } else {
                println!("no session to clear");
            }
            Ok(exit_codes::OK)
        }
    }
}

fn task_source(
    prompt: Option<String>,
    file: Option<PathBuf>,
    sequence: Option<PathBuf>,
) -> Result<TaskSource> {
    match (prompt, file, sequence) {
        (Some(prompt), None, None) => Ok(TaskSource::Prompt(prompt)),
        (None, Some(file), None) => Ok(TaskSource::File(file)),
        (None, None, Some(sequence)) => Ok(TaskSource::Sequence(sequence)),
        _ => bail!("give exactly one of PROMPT, --file or --sequence"),
    }
}

/// Run `f` on a multi-threaded runtime with a token cancelled by SIGINT/SIGTERM.
fn with_runtime<F, Fut>(f: F) -> Result<RunOutcome>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<RunOutcome>>,
{
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("start tokio runtime")?;
    runtime.block_on(async {
        let cancel = CancellationToken::new();
        let watcher = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            warn!("interrupt received, stopping");
            watcher.cancel();
        });
        f(cancel).await
    })
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(term), Ok(int)) => (term, int),
        (Err(err), _) | (_, Err(err)) => {
            warn!(err = %err, "failed to register signal handlers");
            return std::future::pending().await;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(err = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

/// Print how the run ended and pick the exit code.
fn report(outcome: &RunOutcome) -> i32 {
    let session = &outcome.session;
    match &outcome.reason {
        StopReason::Completed => {
            eprintln!(
                "chronos: session {} completed after {} turn(s)",
                session.session_id, session.turn_count
            );
            exit_codes::OK
        }
        StopReason::Failed { detail } => {
            eprintln!("chronos: session {} failed: {detail}", session.session_id);
            eprintln!("chronos: fix the cause, then `chronos resume` to retry from the last cursor");
            exit_codes::FAILED
        }
        StopReason::Aborted => {
            eprintln!(
                "chronos: session {} aborted at turn {}; `chronos resume` continues it",
                session.session_id, session.turn_count
            );
            exit_codes::ABORTED
        }
        StopReason::PermissionRequired { prompt } => {
            eprintln!("chronos: the tool asked for permission: {prompt}");
            eprintln!("chronos: rerun with --yolo to approve automatically, or `chronos resume` after handling it");
            exit_codes::PERMISSION_REQUIRED
        }
        StopReason::TurnLimit => {
            eprintln!(
                "chronos: turn limit reached after {} turn(s) this run; `chronos resume` continues",
                outcome.turns_run
            );
            exit_codes::TURN_LIMIT
        }
    }
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<SessionError>() {
        Some(SessionError::AlreadyActive { .. } | SessionError::RunLockHeld { .. }) => {
            exit_codes::ALREADY_ACTIVE
        }
        Some(SessionError::NotFound { .. }) => exit_codes::NOT_FOUND,
        Some(SessionError::StoreCorrupted { .. }) => exit_codes::STORE_CORRUPTED,
        Some(SessionError::SessionMismatch { .. }) | None => exit_codes::INVALID,
    }
}
