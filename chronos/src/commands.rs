//! Orchestration behind the `chronos` subcommands.
//!
//! Each command resolves the working directory, loads `.chronos/config.toml`
//! and wires the store, limiter, invoker and transcript into an [`Engine`].

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::core::session::Session;
use crate::core::types::SessionStatus;
use crate::engine::{Engine, EngineSettings, RunOutcome};
use crate::io::config::{ChronosConfig, load_config};
use crate::io::invoker::ToolInvoker;
use crate::io::paths::resolve_working_directory;
use crate::io::sequence::load_sequence;
use crate::io::session_store::{NewSession, SessionStore};
use crate::io::transcript::{ConsoleTranscript, JsonlTranscript, NullTranscript, TranscriptSink};
use crate::limiter::RateLimiter;

/// Where the task for a new session comes from.
#[derive(Debug, Clone)]
pub enum TaskSource {
    Prompt(String),
    File(PathBuf),
    Sequence(PathBuf),
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub dir: PathBuf,
    pub source: TaskSource,
    pub yolo: bool,
    /// Clear an existing session first, even an active one.
    pub force: bool,
}

/// Create a session for `request` and drive it.
pub async fn run(request: RunRequest, cancel: CancellationToken) -> Result<RunOutcome> {
    let dir = resolve_working_directory(&request.dir)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = SessionStore::new(&dir, clock.clone());
    let config = load_config(&store.paths().config_path)?;
    let new_session = new_session(request.source, request.yolo)?;

    if request.force && store.clear()? {
        info!("existing session cleared (--force)");
    }
    let session = store.create(new_session)?;
    info!(session_id = %session.session_id, dir = %dir.display(), "session started");

    let transcript = open_transcript(&store, &session, false, clock.as_ref());
    let limiter = Arc::new(RateLimiter::new(config.limiter.limiter_config(), clock.clone()));
    let engine = build_engine(store, transcript, limiter, &config, clock, cancel)?;
    engine.drive(&session.session_id).await
}

/// Continue the session in `dir` from its persisted cursor.
///
/// See [`Engine::resume`] for how each stored status is handled.
pub async fn resume(dir: &Path, cancel: CancellationToken) -> Result<RunOutcome> {
    let dir = resolve_working_directory(dir)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = SessionStore::new(&dir, clock.clone());
    let config = load_config(&store.paths().config_path)?;

    let session = store.load()?;
    info!(session_id = %session.session_id, status = %session.status, "resuming session");
    let transcript = open_transcript(&store, &session, true, clock.as_ref());
    let limiter = Arc::new(RateLimiter::new(config.limiter.limiter_config(), clock.clone()));
    let engine = build_engine(store, transcript, limiter, &config, clock, cancel)?;
    engine.resume(&session.session_id).await
}

/// Read-only view of the session in a working directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub session_id: String,
    pub status: SessionStatus,
    pub working_directory: PathBuf,
    pub turn_count: u64,
    pub current_step: String,
    pub steps_completed: usize,
    pub steps_total: usize,
    pub cursor: Option<String>,
    pub yolo_mode: bool,
    pub quota_available_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub last_summary: Option<String>,
    pub last_error: Option<String>,
}

impl StatusReport {
    pub fn from_session(session: &Session) -> Self {
        Self {
            session_id: session.session_id.clone(),
            status: session.status,
            working_directory: session.working_directory.clone(),
            turn_count: session.turn_count,
            current_step: session
                .current_step()
                .map(|step| step.name.clone())
                .unwrap_or_default(),
            steps_completed: session.steps_completed(),
            steps_total: session.steps.len(),
            cursor: session.cursor.clone(),
            yolo_mode: session.yolo_mode,
            quota_available_at: session.quota_available_at,
            created_at: session.created_at,
            last_updated: session.last_updated,
            last_summary: session.last_summary.clone(),
            last_error: session.last_error.clone(),
        }
    }

    /// Human-readable multi-line report.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "session:      {}", self.session_id);
        let _ = writeln!(out, "status:       {}", self.status);
        let _ = writeln!(out, "directory:    {}", self.working_directory.display());
        let _ = writeln!(out, "turns:        {}", self.turn_count);
        let _ = writeln!(
            out,
            "steps:        {}/{} (current: {})",
            self.steps_completed, self.steps_total, self.current_step
        );
        let _ = writeln!(out, "cursor:       {}", self.cursor.as_deref().unwrap_or("-"));
        let _ = writeln!(out, "yolo:         {}", self.yolo_mode);
        if let Some(at) = self.quota_available_at {
            let _ = writeln!(out, "quota at:     {}", at.to_rfc3339());
        }
        let _ = writeln!(out, "last updated: {}", self.last_updated.to_rfc3339());
        if let Some(error) = &self.last_error {
            let _ = writeln!(out, "last error:   {error}");
        }
        out
    }
}

/// Report the session without modifying anything.
pub fn status(dir: &Path) -> Result<StatusReport> {
    let dir = resolve_working_directory(dir)?;
    let store = SessionStore::new(&dir, Arc::new(SystemClock));
    let session = store.load()?;
    Ok(StatusReport::from_session(&session))
}

/// Remove the session. Returns whether one existed.
pub fn clear(dir: &Path) -> Result<bool> {
    let dir = resolve_working_directory(dir)?;
    SessionStore::new(&dir, Arc::new(SystemClock)).clear()
}

fn new_session(source: TaskSource, yolo_mode: bool) -> Result<NewSession> {
    let request = match source {
        TaskSource::Prompt(prompt) => NewSession::single(non_empty(prompt)?, yolo_mode),
        TaskSource::File(path) => {
            let prompt = fs::read_to_string(&path)
                .with_context(|| format!("read prompt file {}", path.display()))?;
            NewSession::single(
                non_empty(prompt).with_context(|| format!("prompt file {}", path.display()))?,
                yolo_mode,
            )
        }
        TaskSource::Sequence(path) => {
            let steps = load_sequence(&path)?;
            let names: Vec<&str> = steps.iter().map(|s| s.name.as_str()).collect();
            NewSession {
                prompt: format!("sequence {}: {}", path.display(), names.join(", ")),
                steps,
                yolo_mode,
            }
        }
    };
    Ok(request)
}

fn non_empty(prompt: String) -> Result<String> {
    let trimmed = prompt.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("prompt must not be empty"));
    }
    Ok(trimmed.to_string())
}

/// Transcript for `session`: file-backed when possible, echoed to the console.
fn open_transcript(
    store: &SessionStore,
    session: &Session,
    reconcile: bool,
    clock: &dyn Clock,
) -> Arc<dyn TranscriptSink> {
    let path = store.paths().transcript_path(&session.session_id);
    let file: Arc<dyn TranscriptSink> = match JsonlTranscript::open(&path) {
        Ok(sink) => {
            if reconcile {
                match sink.reconcile(session, clock.wall_now()) {
                    Ok(Some((from, to))) => {
                        info!(from, to, "transcript reconciled with session store");
                    }
                    Ok(None) => {}
                    Err(err) => warn!(err = %format!("{err:#}"), "transcript reconcile failed"),
                }
            }
            Arc::new(sink)
        }
        Err(err) => {
            warn!(err = %format!("{err:#}"), "transcript unavailable, continuing without it");
            Arc::new(NullTranscript)
        }
    };
    Arc::new(ConsoleTranscript::new(file))
}

fn build_engine(
    store: SessionStore,
    transcript: Arc<dyn TranscriptSink>,
    limiter: Arc<RateLimiter>,
    config: &ChronosConfig,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
) -> Result<Engine<ToolInvoker>> {
    let invoker = ToolInvoker::new(config.tool.clone(), transcript.clone(), clock.clone())?;
    Ok(Engine::new(
        store,
        invoker,
        limiter,
        clock,
        transcript,
        EngineSettings::from_config(config),
        cancel,
    ))
}
