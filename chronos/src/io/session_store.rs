//! Durable session storage (`.chronos/session.json`).
//!
//! Every mutation runs under the exclusive session lock and replaces the file
//! as a whole (temp file, fsync, rename), so a reader only ever observes a
//! complete, previously committed record.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use jsonschema::validator_for;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::core::session::{MAIN_STEP, PromptStep, SESSION_VERSION, Session, validate_session};
use crate::core::types::{SessionStatus, TranscriptRole};
use crate::error::SessionError;
use crate::io::atomic::write_atomic;
use crate::io::lock::FileLock;
use crate::io::paths::ChronosPaths;
use crate::io::transcript::{TURN_RECORDED, TranscriptRecord, TranscriptSink, append_best_effort};

const SESSION_SCHEMA: &str = include_str!("../../schemas/session.schema.json");

static SESSION_SCHEMA_VALUE: LazyLock<Value> = LazyLock::new(|| {
    serde_json::from_str(SESSION_SCHEMA).expect("embedded session schema is valid json")
});

/// Summaries stored in the session are bounded to this many bytes (tail).
const SUMMARY_LIMIT_BYTES: usize = 2_000;

/// What a new session should run.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub prompt: String,
    /// Empty for a single-prompt task.
    pub steps: Vec<PromptStep>,
    pub yolo_mode: bool,
}

impl NewSession {
    pub fn single(prompt: impl Into<String>, yolo_mode: bool) -> Self {
        Self {
            prompt: prompt.into(),
            steps: Vec::new(),
            yolo_mode,
        }
    }
}

/// Result of a successful turn to be committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnRecord {
    /// Marker reported by the tool; `turn-<n>` is used when absent.
    pub cursor: Option<String>,
    pub summary: String,
    /// The tool reported the current step done.
    pub step_completed: bool,
}

/// Guard proving this process drives the session in a working directory.
#[derive(Debug)]
pub struct RunLock {
    _lock: FileLock,
}

pub struct SessionStore {
    paths: ChronosPaths,
    clock: Arc<dyn Clock>,
}

impl SessionStore {
    pub fn new(working_directory: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            paths: ChronosPaths::new(working_directory),
            clock,
        }
    }

    pub fn paths(&self) -> &ChronosPaths {
        &self.paths
    }

    /// Create a session, archiving a terminal predecessor.
    ///
    /// Fails with [`SessionError::AlreadyActive`] if an active or waiting
    /// session exists for this working directory.
    #[instrument(skip_all, fields(dir = %self.paths.working_directory.display()))]
    pub fn create(&self, request: NewSession) -> Result<Session> {
        let _lock = self.mutation_lock()?;

        let existing = self.read()?;
        if let Some(existing) = &existing
            && !existing.status.is_terminal()
        {
            return Err(SessionError::AlreadyActive {
                session_id: existing.session_id.clone(),
                status: existing.status,
                working_directory: self.paths.working_directory.clone(),
            }
            .into());
        }

        let steps = if request.steps.is_empty() {
            vec![PromptStep {
                name: MAIN_STEP.to_string(),
                prompt: request.prompt.clone(),
            }]
        } else {
            request.steps
        };
        if steps.iter().any(|step| step.prompt.trim().is_empty()) {
            return Err(anyhow!("prompt must not be empty"));
        }
        if let Some(existing) = &existing {
            self.archive(existing)?;
        }

        let now = self.clock.wall_now();
        let session = Session {
            version: SESSION_VERSION,
            session_id: uuid::Uuid::new_v4().to_string(),
            prompt: request.prompt,
            working_directory: self.paths.working_directory.clone(),
            yolo_mode: request.yolo_mode,
            steps,
            step_index: 0,
            cursor: None,
            turn_count: 0,
            status: SessionStatus::Active,
            quota_available_at: None,
            last_summary: None,
            last_error: None,
            created_at: now,
            last_updated: now,
        };
        self.write(&session)?;
        info!(session_id = %session.session_id, steps = session.steps.len(), "session created");
        Ok(session)
    }

    /// Load the committed session. Never mutates.
    pub fn load(&self) -> Result<Session> {
        self.read()?.ok_or_else(|| {
            SessionError::NotFound {
                working_directory: self.paths.working_directory.clone(),
            }
            .into()
        })
    }

    /// Commit a successful turn: `turn_count` and `cursor` move together in
    /// one atomic write, then the transcript is told (best effort).
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub fn record_turn(
        &self,
        session_id: &str,
        record: &TurnRecord,
        transcript: &dyn TranscriptSink,
    ) -> Result<Session> {
        let session = self.mutate(session_id, |session| {
            session.turn_count += 1;
            let cursor = record
                .cursor
                .clone()
                .unwrap_or_else(|| format!("turn-{}", session.turn_count));
            if record.step_completed && !session.is_last_step() {
                session.step_index += 1;
                session.cursor = None;
                session.status = SessionStatus::Active;
            } else {
                session.cursor = Some(cursor);
                session.status = if record.step_completed {
                    SessionStatus::Completed
                } else {
                    SessionStatus::Active
                };
            }
            session.quota_available_at = None;
            session.last_summary = Some(tail(&record.summary, SUMMARY_LIMIT_BYTES).to_string());
            session.last_error = None;
        })?;
        debug!(turn = session.turn_count, cursor = ?session.cursor, status = %session.status, "turn recorded");

        append_best_effort(
            transcript,
            &TranscriptRecord::new(
                &session.session_id,
                session.turn_count,
                TranscriptRole::System,
                format!("{TURN_RECORDED} {}", tail(&record.summary, 200)),
                session.last_updated,
            ),
        );
        Ok(session)
    }

    /// Idempotent status update. `quota_available_at` is kept only while
    /// waiting for quota.
    pub fn set_status(
        &self,
        session_id: &str,
        status: SessionStatus,
        quota_available_at: Option<DateTime<Utc>>,
    ) -> Result<Session> {
        let quota_available_at = quota_available_at.filter(|_| status == SessionStatus::WaitingForQuota);
        let current = self.load()?;
        check_identity(&current, session_id)?;
        if current.status == status && current.quota_available_at == quota_available_at {
            return Ok(current);
        }
        let session = self.mutate(session_id, |session| {
            session.status = status;
            session.quota_available_at = quota_available_at;
        })?;
        info!(session_id, status = %status, "session status updated");
        Ok(session)
    }

    /// Record a diagnostic without touching progress.
    pub fn record_error(&self, session_id: &str, detail: &str) -> Result<Session> {
        self.mutate(session_id, |session| {
            session.last_error = Some(tail(detail, SUMMARY_LIMIT_BYTES).to_string());
        })
    }

    /// Mark the session failed with its diagnostic in one write.
    pub fn fail(&self, session_id: &str, detail: &str) -> Result<Session> {
        let session = self.mutate(session_id, |session| {
            session.status = SessionStatus::Failed;
            session.quota_available_at = None;
            session.last_error = Some(tail(detail, SUMMARY_LIMIT_BYTES).to_string());
        })?;
        warn!(session_id, detail, "session failed");
        Ok(session)
    }

    /// Delete the session. Missing sessions are not an error.
    ///
    /// Refuses while another process holds the run lock.
    #[instrument(skip_all, fields(dir = %self.paths.working_directory.display()))]
    pub fn clear(&self) -> Result<bool> {
        let _run = self.acquire_run_lock()?;
        let _lock = self.mutation_lock()?;
        match fs::remove_file(&self.paths.session_path) {
            Ok(()) => {
                info!("session cleared");
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err)
                .with_context(|| format!("remove {}", self.paths.session_path.display())),
        }
    }

    /// Take the per-directory run lock for the lifetime of a drive.
    pub fn acquire_run_lock(&self) -> Result<RunLock> {
        match FileLock::try_acquire(&self.paths.run_lock_path)? {
            Some(lock) => Ok(RunLock { _lock: lock }),
            None => Err(SessionError::RunLockHeld {
                working_directory: self.paths.working_directory.clone(),
            }
            .into()),
        }
    }

    fn mutation_lock(&self) -> Result<FileLock> {
        FileLock::acquire(&self.paths.session_lock_path)
    }

    fn mutate<F: FnOnce(&mut Session)>(&self, session_id: &str, apply: F) -> Result<Session> {
        let _lock = self.mutation_lock()?;
        let mut session = self.load()?;
        check_identity(&session, session_id)?;
        apply(&mut session);
        // Wall clocks can step backwards; keep the record self-consistent.
        session.last_updated = self.clock.wall_now().max(session.last_updated);
        self.write(&session)?;
        Ok(session)
    }

    fn read(&self) -> Result<Option<Session>> {
        let path = &self.paths.session_path;
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
        };
        let session = parse_session(path, &contents)?;
        if session.working_directory != self.paths.working_directory {
            return Err(corrupted(
                path,
                format!(
                    "record belongs to {}",
                    session.working_directory.display()
                ),
            ));
        }
        Ok(Some(session))
    }

    fn write(&self, session: &Session) -> Result<()> {
        let mut buf = serde_json::to_string_pretty(session).context("serialize session")?;
        buf.push('\n');
        write_atomic(&self.paths.session_path, &buf, "session")
    }

    fn archive(&self, session: &Session) -> Result<()> {
        let target = self.paths.archive_path(&session.session_id);
        fs::create_dir_all(&self.paths.archive_dir)
            .with_context(|| format!("create {}", self.paths.archive_dir.display()))?;
        fs::rename(&self.paths.session_path, &target)
            .with_context(|| format!("archive session to {}", target.display()))?;
        info!(session_id = %session.session_id, status = %session.status, "previous session archived");
        Ok(())
    }
}

fn check_identity(session: &Session, session_id: &str) -> Result<()> {
    if session.session_id != session_id {
        return Err(SessionError::SessionMismatch {
            expected: session_id.to_string(),
            found: session.session_id.clone(),
        }
        .into());
    }
    Ok(())
}

/// Structural validation: JSON, schema, then semantic invariants.
fn parse_session(path: &Path, contents: &str) -> Result<Session> {
    let value: Value = serde_json::from_str(contents)
        .map_err(|err| corrupted(path, format!("invalid json: {err}")))?;
    let validator = validator_for(&SESSION_SCHEMA_VALUE)
        .map_err(|err| anyhow!("invalid embedded session schema: {err}"))?;
    let messages: Vec<String> = validator.iter_errors(&value).map(|e| e.to_string()).collect();
    if !messages.is_empty() {
        return Err(corrupted(path, messages.join("; ")));
    }
    let session: Session = serde_json::from_value(value)
        .map_err(|err| corrupted(path, format!("deserialize: {err}")))?;
    let errors = validate_session(&session);
    if !errors.is_empty() {
        return Err(corrupted(path, errors.join("; ")));
    }
    Ok(session)
}

fn corrupted(path: &Path, reason: String) -> anyhow::Error {
    SessionError::StoreCorrupted {
        path: path.to_path_buf(),
        reason,
    }
    .into()
}

/// Last `limit` bytes of `text`, on a char boundary.
fn tail(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut start = text.len() - limit;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ManualClock, MemoryTranscript};

    fn store(dir: &Path) -> SessionStore {
        SessionStore::new(dir.canonicalize().expect("canonicalize"), Arc::new(ManualClock::new()))
    }

    fn turn(cursor: Option<&str>, step_completed: bool) -> TurnRecord {
        TurnRecord {
            cursor: cursor.map(str::to_string),
            summary: "did some work".to_string(),
            step_completed,
        }
    }

    #[test]
    fn create_then_load() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let created = store.create(NewSession::single("build it", true)).expect("create");

        let loaded = store.load().expect("load");
        assert_eq!(loaded, created);
        assert_eq!(loaded.status, SessionStatus::Active);
        assert_eq!(loaded.steps.len(), 1);
        assert_eq!(loaded.steps[0].name, MAIN_STEP);
        assert!(loaded.yolo_mode);
    }

    #[test]
    fn second_create_is_rejected_while_active() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        store.create(NewSession::single("one", false)).expect("create");

        let err = store.create(NewSession::single("two", false)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SessionError>(),
            Some(SessionError::AlreadyActive { .. })
        ));
    }

    #[test]
    fn create_over_terminal_session_archives_it() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let first = store.create(NewSession::single("one", false)).expect("create");
        store.fail(&first.session_id, "boom").expect("fail");

        let second = store.create(NewSession::single("two", false)).expect("create");
        assert_ne!(second.session_id, first.session_id);
        assert!(store.paths().archive_path(&first.session_id).is_file());
    }

    #[test]
    fn rejected_create_leaves_terminal_session_in_place() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let first = store.create(NewSession::single("one", false)).expect("create");
        store.fail(&first.session_id, "boom").expect("fail");

        let request = NewSession {
            prompt: "two".to_string(),
            steps: vec![PromptStep {
                name: "blank".to_string(),
                prompt: "   ".to_string(),
            }],
            yolo_mode: false,
        };
        assert!(store.create(request).is_err());
        assert!(!store.paths().archive_path(&first.session_id).exists());
        let kept = store.load().expect("load");
        assert_eq!(kept.session_id, first.session_id);
        assert_eq!(kept.status, SessionStatus::Failed);
    }

    #[test]
    fn load_missing_is_not_found() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = store(temp.path()).load().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SessionError>(),
            Some(SessionError::NotFound { .. })
        ));
    }

    #[test]
    fn record_turn_advances_count_and_cursor_together() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let transcript = MemoryTranscript::default();
        let session = store.create(NewSession::single("go", false)).expect("create");

        let after = store
            .record_turn(&session.session_id, &turn(Some("abc"), false), &transcript)
            .expect("record");
        assert_eq!(after.turn_count, 1);
        assert_eq!(after.cursor.as_deref(), Some("abc"));

        let after = store
            .record_turn(&session.session_id, &turn(None, false), &transcript)
            .expect("record");
        assert_eq!(after.turn_count, 2);
        assert_eq!(after.cursor.as_deref(), Some("turn-2"));
        assert_eq!(store.load().expect("load"), after);

        let recorded = transcript.records();
        assert_eq!(recorded.len(), 2);
        assert!(recorded[1].content.starts_with(TURN_RECORDED));
    }

    #[test]
    fn completing_final_step_completes_session() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let session = store.create(NewSession::single("go", false)).expect("create");
        let done = store
            .record_turn(&session.session_id, &turn(None, true), &MemoryTranscript::default())
            .expect("record");
        assert_eq!(done.status, SessionStatus::Completed);
        assert_eq!(done.cursor.as_deref(), Some("turn-1"));
    }

    #[test]
    fn completing_middle_step_moves_to_next_step() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let steps = vec![
            PromptStep {
                name: "plan".to_string(),
                prompt: "plan it".to_string(),
            },
            PromptStep {
                name: "build".to_string(),
                prompt: "build it".to_string(),
            },
        ];
        let session = store
            .create(NewSession {
                prompt: "plan then build".to_string(),
                steps,
                yolo_mode: true,
            })
            .expect("create");
        let next = store
            .record_turn(&session.session_id, &turn(Some("x"), true), &MemoryTranscript::default())
            .expect("record");
        assert_eq!(next.step_index, 1);
        assert_eq!(next.cursor, None);
        assert_eq!(next.status, SessionStatus::Active);
    }

    #[test]
    fn transcript_failure_does_not_block_progress() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let session = store.create(NewSession::single("go", false)).expect("create");
        let transcript = MemoryTranscript::failing();
        let after = store
            .record_turn(&session.session_id, &turn(None, false), &transcript)
            .expect("record");
        assert_eq!(store.load().expect("load").turn_count, after.turn_count);
    }

    #[test]
    fn set_status_is_idempotent_and_scopes_quota_time() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let session = store.create(NewSession::single("go", false)).expect("create");
        let at = Utc::now();

        let waiting = store
            .set_status(&session.session_id, SessionStatus::WaitingForQuota, Some(at))
            .expect("set");
        assert_eq!(waiting.quota_available_at, Some(at));
        let again = store
            .set_status(&session.session_id, SessionStatus::WaitingForQuota, Some(at))
            .expect("set");
        assert_eq!(again, waiting);

        let active = store
            .set_status(&session.session_id, SessionStatus::Active, Some(at))
            .expect("set");
        assert_eq!(active.quota_available_at, None);
    }

    #[test]
    fn mutations_check_session_identity() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        store.create(NewSession::single("go", false)).expect("create");
        let err = store
            .set_status("someone-else", SessionStatus::Aborted, None)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SessionError>(),
            Some(SessionError::SessionMismatch { .. })
        ));
    }

    #[test]
    fn clear_is_idempotent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        store.create(NewSession::single("go", false)).expect("create");
        assert!(store.clear().expect("clear"));
        assert!(!store.clear().expect("clear again"));
        assert!(store.load().is_err());
    }

    #[test]
    fn clear_refuses_while_run_lock_is_held() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        store.create(NewSession::single("go", false)).expect("create");
        let _run = store.acquire_run_lock().expect("run lock");
        let err = store.clear().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SessionError>(),
            Some(SessionError::RunLockHeld { .. })
        ));
    }

    #[test]
    fn garbage_on_disk_is_store_corrupted() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        fs::create_dir_all(&store.paths().chronos_dir).expect("mkdir");
        fs::write(&store.paths().session_path, "{\"session_id\": 3").expect("write");
        let err = store.load().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SessionError>(),
            Some(SessionError::StoreCorrupted { .. })
        ));
    }

    #[test]
    fn schema_and_invariant_violations_are_store_corrupted() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        store.create(NewSession::single("go", false)).expect("create");
        let raw = fs::read_to_string(&store.paths().session_path).expect("read");

        let mut value: Value = serde_json::from_str(&raw).expect("json");
        value["status"] = Value::String("running".to_string());
        fs::write(&store.paths().session_path, value.to_string()).expect("write");
        let err = store.load().unwrap_err();
        assert!(format!("{err}").contains("corrupted"));

        let mut value: Value = serde_json::from_str(&raw).expect("json");
        value["step_index"] = Value::from(7);
        fs::write(&store.paths().session_path, value.to_string()).expect("write");
        let err = store.load().unwrap_err();
        assert!(format!("{err}").contains("step_index 7"));
    }

    #[test]
    fn leftover_temp_file_does_not_affect_load() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let session = store.create(NewSession::single("go", false)).expect("create");
        fs::write(store.paths().session_path.with_extension("json.tmp"), "{\"torn\":")
            .expect("write torn temp");
        assert_eq!(store.load().expect("load"), session);
    }

    #[test]
    fn tail_respects_char_boundaries() {
        assert_eq!(tail("hello", 10), "hello");
        assert_eq!(tail("hello", 3), "llo");
        assert_eq!(tail("ééé", 3), "é");
    }
}
