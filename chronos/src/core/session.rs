//! The durable session record and its semantic invariants.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::types::SessionStatus;

/// On-disk format version of [`Session`].
pub const SESSION_VERSION: u32 = 1;

/// Name of the single step of a one-prompt session.
pub const MAIN_STEP: &str = "main";

/// One prompt of a sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptStep {
    pub name: String,
    pub prompt: String,
}

/// Persisted progress of one task in one working directory
/// (`.chronos/session.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub version: u32,
    pub session_id: String,
    /// Original task description. Immutable.
    pub prompt: String,
    /// Immutable.
    pub working_directory: PathBuf,
    /// Fixed at creation.
    pub yolo_mode: bool,
    pub steps: Vec<PromptStep>,
    pub step_index: usize,
    /// Opaque resume marker, advanced only by successful turns.
    pub cursor: Option<String>,
    pub turn_count: u64,
    pub status: SessionStatus,
    /// Server-suggested end of a quota wait, kept while `waiting_for_quota`.
    pub quota_available_at: Option<DateTime<Utc>>,
    pub last_summary: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl Session {
    pub fn current_step(&self) -> Option<&PromptStep> {
        self.steps.get(self.step_index)
    }

    pub fn is_last_step(&self) -> bool {
        self.step_index + 1 >= self.steps.len()
    }

    /// Number of steps already completed.
    pub fn steps_completed(&self) -> usize {
        if self.status == SessionStatus::Completed {
            self.steps.len()
        } else {
            self.step_index
        }
    }
}

/// Check invariants that JSON Schema cannot express.
pub fn validate_session(session: &Session) -> Vec<String> {
    let mut errors = Vec::new();

    if session.version != SESSION_VERSION {
        errors.push(format!(
            "unsupported version {} (expected {SESSION_VERSION})",
            session.version
        ));
    }
    if session.session_id.trim().is_empty() {
        errors.push("session_id must not be empty".to_string());
    }
    if session.steps.is_empty() {
        errors.push("steps must not be empty".to_string());
    }
    if !session.steps.is_empty() && session.step_index >= session.steps.len() {
        errors.push(format!(
            "step_index {} out of range for {} steps",
            session.step_index,
            session.steps.len()
        ));
    }
    if session.quota_available_at.is_some() && session.status != SessionStatus::WaitingForQuota {
        errors.push(format!(
            "quota_available_at set while status is {}",
            session.status
        ));
    }
    if session.turn_count == 0 && session.cursor.is_some() {
        errors.push("cursor set before any turn was recorded".to_string());
    }
    if session.last_updated < session.created_at {
        errors.push("last_updated precedes created_at".to_string());
    }
    if !session.working_directory.is_absolute() {
        errors.push(format!(
            "working_directory {} is not absolute",
            session.working_directory.display()
        ));
    }

    errors
}
