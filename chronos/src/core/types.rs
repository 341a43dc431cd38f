//! Shared deterministic types for the continuation engine.
//!
//! These types define stable contracts between the limiter, the session store,
//! the process invoker and the engine. They carry no I/O.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    WaitingForQuota,
    Completed,
    Failed,
    Aborted,
}

impl SessionStatus {
    /// Terminal sessions no longer hold the per-directory active slot.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::WaitingForQuota => "waiting_for_quota",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of a turn that ran to a clean exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutput {
    /// Captured output (bounded tail).
    pub text: String,
    /// The tool printed the completion marker.
    pub task_complete: bool,
    /// Resume marker reported by the tool, if any.
    pub cursor: Option<String>,
}

/// Structured result of one bounded interaction with the wrapped tool.
///
/// The tool's ad hoc output grammar is mapped onto this type at the invoker
/// boundary; the engine never inspects raw output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Success(TurnOutput),
    PermissionRequested(String),
    /// Quota rejection with an optional server-suggested retry delay.
    RateLimited(Option<Duration>),
    Crashed(String),
}

impl TurnOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::PermissionRequested(_) => "permission_requested",
            Self::RateLimited(_) => "rate_limited",
            Self::Crashed(_) => "crashed",
        }
    }
}

/// Which pipe of the wrapped tool a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Role of a transcript record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptRole {
    Prompt,
    Output,
    Permission,
    Error,
    System,
}
