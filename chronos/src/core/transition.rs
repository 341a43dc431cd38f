//! Transition table of the continuation engine.
//!
//! `decide` maps a turn outcome onto the next action without performing it.
//! The engine owns persistence and waiting; this module owns the rules.

use std::time::Duration;

use crate::core::retry::{RetryBudget, RetryPolicy};
use crate::core::types::{SessionStatus, TurnOutcome};

/// Next action after a turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Record the turn and run another one from the new cursor.
    Advance { cursor: Option<String> },
    /// Record the turn, move to the next step of the sequence.
    AdvanceStep,
    /// Record the turn; the final step is done.
    Complete { cursor: Option<String> },
    /// Penalize the limiter and wait for quota; cursor untouched.
    WaitForQuota { retry_after: Duration },
    /// Back off, then retry the same cursor.
    RetryAfterCrash { backoff: Duration, detail: String },
    /// Retry budget exhausted.
    Fail { detail: String },
    /// Stop the run without progress; the session stays active.
    AwaitPermission { prompt: String },
}

impl Decision {
    /// Status the session holds after the decision is applied.
    pub fn next_status(&self) -> SessionStatus {
        match self {
            Self::Complete { .. } => SessionStatus::Completed,
            Self::WaitForQuota { .. } => SessionStatus::WaitingForQuota,
            Self::Fail { .. } => SessionStatus::Failed,
            Self::Advance { .. }
            | Self::AdvanceStep
            | Self::RetryAfterCrash { .. }
            | Self::AwaitPermission { .. } => SessionStatus::Active,
        }
    }
}

/// Inputs that are not part of the outcome itself.
#[derive(Debug, Clone, Copy)]
pub struct DecisionContext<'a> {
    pub policy: &'a RetryPolicy,
    /// The current step is the last one of the sequence.
    pub last_step: bool,
    /// Wait applied when a rate-limit rejection carries no hint.
    pub default_penalty: Duration,
}

pub fn decide(outcome: &TurnOutcome, budget: &mut RetryBudget, ctx: DecisionContext<'_>) -> Decision {
    match outcome {
        TurnOutcome::Success(output) => {
            budget.record_success();
            match (output.task_complete, ctx.last_step) {
                (true, true) => Decision::Complete {
                    cursor: output.cursor.clone(),
                },
                (true, false) => Decision::AdvanceStep,
                (false, _) => Decision::Advance {
                    cursor: output.cursor.clone(),
                },
            }
        }
        TurnOutcome::PermissionRequested(prompt) => Decision::AwaitPermission {
            prompt: prompt.clone(),
        },
        TurnOutcome::RateLimited(hint) => Decision::WaitForQuota {
            retry_after: hint.unwrap_or(ctx.default_penalty),
        },
        TurnOutcome::Crashed(detail) => match budget.record_crash(ctx.policy) {
            Some(backoff) => Decision::RetryAfterCrash {
                backoff,
                detail: detail.clone(),
            },
            None => Decision::Fail {
                detail: format!(
                    "{} consecutive crashes, last: {detail}",
                    budget.consecutive_crashes()
                ),
            },
        },
    }
}
