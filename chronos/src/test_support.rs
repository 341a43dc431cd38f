//! Deterministic doubles for tests: virtual clock, scripted turns and an
//! in-memory transcript.

use std::collections::VecDeque;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, TimeDelta, Utc};
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, SleepFuture};
use crate::core::session::{MAIN_STEP, PromptStep, SESSION_VERSION, Session};
use crate::core::types::{SessionStatus, TurnOutcome, TurnOutput};
use crate::io::invoker::TurnInvoker;
use crate::io::session_store::SessionStore;
use crate::io::transcript::{TranscriptRecord, TranscriptSink};

/// Virtual clock. `sleep` returns immediately after advancing time by the
/// requested duration and recording it.
#[derive(Debug)]
pub struct ManualClock {
    start: Instant,
    wall_start: DateTime<Utc>,
    state: Mutex<ManualState>,
}

#[derive(Debug, Default)]
struct ManualState {
    elapsed: Duration,
    sleeps: Vec<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            wall_start: Utc::now(),
            state: Mutex::new(ManualState::default()),
        }
    }

    /// Move time forward without recording a sleep.
    pub fn advance(&self, by: Duration) {
        self.lock().elapsed += by;
    }

    /// Every duration passed to `sleep`, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.lock().sleeps.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.start + self.lock().elapsed
    }

    fn wall_now(&self) -> DateTime<Utc> {
        let elapsed = TimeDelta::from_std(self.lock().elapsed).unwrap_or_default();
        self.wall_start + elapsed
    }

    fn sleep(&self, duration: Duration) -> SleepFuture<'_> {
        {
            let mut state = self.lock();
            state.elapsed += duration;
            state.sleeps.push(duration);
        }
        Box::pin(tokio::task::yield_now())
    }
}

/// Invoker that replays a fixed list of outcomes and records what it saw.
#[derive(Debug, Default)]
pub struct ScriptedInvoker {
    outcomes: Mutex<VecDeque<TurnOutcome>>,
    calls: Mutex<Vec<Session>>,
    cancel_on_call: AtomicUsize,
}

impl ScriptedInvoker {
    pub fn new(outcomes: impl IntoIterator<Item = TurnOutcome>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Cancel the run's token during the `call`-th turn (1-based), the way a
    /// Ctrl-C arriving mid-turn would.
    pub fn cancel_on_call(self, call: usize) -> Self {
        self.cancel_on_call.store(call, Ordering::SeqCst);
        self
    }

    /// Snapshot of the session passed to each turn.
    pub fn calls(&self) -> Vec<Session> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn remaining(&self) -> usize {
        self.outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn next(&self, session: &Session, cancel: &CancellationToken) -> TurnOutcome {
        let call = {
            let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
            calls.push(session.clone());
            calls.len()
        };
        if call == self.cancel_on_call.load(Ordering::SeqCst) {
            cancel.cancel();
            return TurnOutcome::Crashed("turn cancelled".to_string());
        }
        self.outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| TurnOutcome::Crashed("script exhausted".to_string()))
    }
}

impl TurnInvoker for ScriptedInvoker {
    fn run_turn(
        &self,
        session: &Session,
        cancel: &CancellationToken,
    ) -> impl Future<Output = TurnOutcome> + Send {
        let outcome = self.next(session, cancel);
        std::future::ready(outcome)
    }
}

/// Transcript kept in memory; `failing()` rejects every append.
#[derive(Debug, Default)]
pub struct MemoryTranscript {
    records: Mutex<Vec<TranscriptRecord>>,
    fail: bool,
}

impl MemoryTranscript {
    pub fn failing() -> Self {
        Self {
            records: Mutex::default(),
            fail: true,
        }
    }

    pub fn records(&self) -> Vec<TranscriptRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl TranscriptSink for MemoryTranscript {
    fn append(&self, record: &TranscriptRecord) -> Result<()> {
        if self.fail {
            return Err(anyhow!("transcript unavailable"));
        }
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }
}

/// Scratch working directory, removed on drop.
pub struct TestWorkspace {
    _temp: tempfile::TempDir,
    dir: PathBuf,
}

impl TestWorkspace {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create temp dir")?;
        // Sessions are keyed by the canonical path.
        let dir = temp.path().canonicalize().context("canonicalize temp dir")?;
        Ok(Self { _temp: temp, dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn store(&self, clock: Arc<dyn Clock>) -> SessionStore {
        SessionStore::new(&self.dir, clock)
    }
}

/// A fresh single-step session rooted at `dir`.
pub fn session_fixture(dir: &Path) -> Session {
    let now = Utc::now();
    Session {
        version: SESSION_VERSION,
        session_id: "session-fixture".to_string(),
        prompt: "implement the parser".to_string(),
        working_directory: dir.to_path_buf(),
        yolo_mode: false,
        steps: vec![PromptStep {
            name: MAIN_STEP.to_string(),
            prompt: "implement the parser".to_string(),
        }],
        step_index: 0,
        cursor: None,
        turn_count: 0,
        status: SessionStatus::Active,
        quota_available_at: None,
        last_summary: None,
        last_error: None,
        created_at: now,
        last_updated: now,
    }
}

/// Successful turn output.
pub fn success(task_complete: bool, cursor: Option<&str>) -> TurnOutcome {
    TurnOutcome::Success(TurnOutput {
        text: "worked on it".to_string(),
        task_complete,
        cursor: cursor.map(str::to_string),
    })
}

pub fn crashed(detail: &str) -> TurnOutcome {
    TurnOutcome::Crashed(detail.to_string())
}
