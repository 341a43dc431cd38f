//! Append-only transcript of every turn (`.chronos/transcripts/<id>.jsonl`).
//!
//! The transcript is advisory. Append failures are logged and never retried,
//! and the session store stays authoritative when the two disagree.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::session::Session;
use crate::core::types::TranscriptRole;

/// Content prefix of the record written after a turn is durably stored.
pub const TURN_RECORDED: &str = "turn recorded:";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptRecord {
    pub session_id: String,
    pub turn: u64,
    pub role: TranscriptRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl TranscriptRecord {
    pub fn new(
        session_id: &str,
        turn: u64,
        role: TranscriptRole,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            turn,
            role,
            content: content.into(),
            timestamp,
        }
    }
}

pub trait TranscriptSink: Send + Sync {
    fn append(&self, record: &TranscriptRecord) -> Result<()>;
}

/// Append, logging instead of failing.
pub fn append_best_effort(sink: &dyn TranscriptSink, record: &TranscriptRecord) {
    if let Err(err) = sink.append(record) {
        warn!(
            session_id = %record.session_id,
            turn = record.turn,
            err = %format!("{err:#}"),
            "transcript append failed"
        );
    }
}

/// JSON Lines file sink.
#[derive(Debug)]
pub struct JsonlTranscript {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlTranscript {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create transcript dir {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open transcript {}", path.display()))?;
        terminate_torn_line(&mut file)
            .with_context(|| format!("repair transcript {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    /// Compare the transcript with the durable session after a restart.
    ///
    /// Returns the range of turns the store recorded but the transcript never
    /// saw (a crash between the two writes), after noting the gap in the
    /// transcript itself.
    pub fn reconcile(&self, session: &Session, now: DateTime<Utc>) -> Result<Option<(u64, u64)>> {
        let last = self.last_recorded_turn()?;
        if last >= session.turn_count {
            return Ok(None);
        }
        let gap = (last + 1, session.turn_count);
        warn!(
            session_id = %session.session_id,
            from = gap.0,
            to = gap.1,
            "transcript is behind the session store"
        );
        self.append(&TranscriptRecord::new(
            &session.session_id,
            session.turn_count,
            TranscriptRole::System,
            format!(
                "transcript missing turns {}..={}; session store is authoritative",
                gap.0, gap.1
            ),
            now,
        ))?;
        Ok(Some(gap))
    }

    fn last_recorded_turn(&self) -> Result<u64> {
        let file = File::open(&self.path)
            .with_context(|| format!("read transcript {}", self.path.display()))?;
        let mut last = 0;
        for line in BufReader::new(file).lines() {
            let line = line.with_context(|| format!("read transcript {}", self.path.display()))?;
            let Ok(record) = serde_json::from_str::<TranscriptRecord>(&line) else {
                debug!(path = %self.path.display(), "skipping unparsable transcript line");
                continue;
            };
            if record.role == TranscriptRole::System && record.content.starts_with(TURN_RECORDED) {
                last = last.max(record.turn);
            }
        }
        Ok(last)
    }
}

impl TranscriptSink for JsonlTranscript {
    fn append(&self, record: &TranscriptRecord) -> Result<()> {
        let mut line = serde_json::to_string(record).context("serialize transcript record")?;
        line.push('\n');
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.write_all(line.as_bytes())
            .with_context(|| format!("append transcript {}", self.path.display()))?;
        file.flush()
            .with_context(|| format!("flush transcript {}", self.path.display()))
    }
}

/// A crash mid-append can leave a final line without its newline; start the
/// next record on a fresh line.
fn terminate_torn_line(file: &mut File) -> std::io::Result<()> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(());
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    if last[0] != b'\n' {
        file.write_all(b"\n")?;
    }
    Ok(())
}

/// Sink that drops every record, used when the transcript file cannot be opened.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTranscript;

impl TranscriptSink for NullTranscript {
    fn append(&self, _record: &TranscriptRecord) -> Result<()> {
        Ok(())
    }
}

/// Sink that echoes tool output to stdout before forwarding.
pub struct ConsoleTranscript {
    inner: Arc<dyn TranscriptSink>,
}

impl ConsoleTranscript {
    pub fn new(inner: Arc<dyn TranscriptSink>) -> Self {
        Self { inner }
    }
}

impl TranscriptSink for ConsoleTranscript {
    fn append(&self, record: &TranscriptRecord) -> Result<()> {
        match record.role {
            TranscriptRole::Output => println!("{}", record.content),
            TranscriptRole::Permission | TranscriptRole::Error => {
                eprintln!("[{}] {}", role_label(record.role), record.content);
            }
            TranscriptRole::Prompt | TranscriptRole::System => {}
        }
        self.inner.append(record)
    }
}

fn role_label(role: TranscriptRole) -> &'static str {
    match role {
        TranscriptRole::Prompt => "prompt",
        TranscriptRole::Output => "output",
        TranscriptRole::Permission => "permission",
        TranscriptRole::Error => "error",
        TranscriptRole::System => "system",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::session_fixture;

    fn record(turn: u64, role: TranscriptRole, content: &str) -> TranscriptRecord {
        TranscriptRecord::new("s-1", turn, role, content, Utc::now())
    }

    #[test]
    fn appends_one_json_line_per_record() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("transcripts/s-1.jsonl");
        let sink = JsonlTranscript::open(&path).expect("open");

        sink.append(&record(1, TranscriptRole::Prompt, "do it")).expect("append");
        sink.append(&record(1, TranscriptRole::Output, "done")).expect("append");

        let contents = fs::read_to_string(&path).expect("read");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: TranscriptRecord = serde_json::from_str(lines[1]).expect("parse");
        assert_eq!(parsed.role, TranscriptRole::Output);
        assert_eq!(parsed.content, "done");
    }

    #[test]
    fn reopening_after_torn_write_starts_a_fresh_line() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("s-1.jsonl");
        fs::write(&path, "{\"session_id\":\"s-1\",\"tu").expect("write torn");

        let sink = JsonlTranscript::open(&path).expect("open");
        sink.append(&record(1, TranscriptRole::System, "resumed")).expect("append");

        let contents = fs::read_to_string(&path).expect("read");
        let last = contents.lines().last().expect("line");
        assert!(serde_json::from_str::<TranscriptRecord>(last).is_ok());
    }

    #[test]
    fn reconcile_notes_turns_missing_from_transcript() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("s-1.jsonl");
        let sink = JsonlTranscript::open(&path).expect("open");
        sink.append(&record(1, TranscriptRole::System, "turn recorded: first"))
            .expect("append");

        let mut session = session_fixture(temp.path());
        session.session_id = "s-1".to_string();
        session.turn_count = 2;
        session.cursor = Some("turn-2".to_string());

        let gap = sink.reconcile(&session, Utc::now()).expect("reconcile");
        assert_eq!(gap, Some((2, 2)));
        let contents = fs::read_to_string(&path).expect("read");
        assert!(contents.contains("session store is authoritative"));

        session.turn_count = 1;
        assert_eq!(sink.reconcile(&session, Utc::now()).expect("reconcile"), None);
    }
}
