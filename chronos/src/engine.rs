//! Continuation engine: drives one session turn by turn until it completes,
//! fails, is aborted, or needs a human.
//!
//! Each cycle is: admission from the limiter, one turn through the invoker,
//! a pure [`decide`] on the outcome, then the decision is committed to the
//! session store before anything else happens.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::TimeDelta;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::core::bucket::MAX_PENALTY;
use crate::core::retry::{RetryBudget, RetryPolicy};
use crate::core::session::Session;
use crate::core::transition::{Decision, DecisionContext, decide};
use crate::core::types::{SessionStatus, TranscriptRole, TurnOutcome};
use crate::error::SessionError;
use crate::io::config::ChronosConfig;
use crate::io::invoker::TurnInvoker;
use crate::io::session_store::{SessionStore, TurnRecord};
use crate::io::transcript::{TranscriptRecord, TranscriptSink, append_best_effort};
use crate::limiter::{LimiterError, RateLimiter};

/// Lines of turn output kept as the session's `last_summary`.
const SUMMARY_LINES: usize = 5;

/// Engine knobs derived from [`ChronosConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub policy: RetryPolicy,
    /// Turns per run; 0 means unlimited.
    pub max_turns: u64,
    pub default_penalty: Duration,
}

impl EngineSettings {
    pub fn from_config(config: &ChronosConfig) -> Self {
        Self {
            policy: config.retry.policy(),
            max_turns: config.max_turns,
            default_penalty: config.limiter.default_penalty(),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&ChronosConfig::default())
    }
}

/// Why a run stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Completed,
    Failed { detail: String },
    Aborted,
    /// The tool asked for approval outside YOLO mode. The session stays active.
    PermissionRequired { prompt: String },
    /// `max_turns` reached. The session stays active.
    TurnLimit,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub reason: StopReason,
    /// Session as committed when the run stopped.
    pub session: Session,
    /// Turns invoked during this run.
    pub turns_run: u64,
}

pub struct Engine<I> {
    store: SessionStore,
    invoker: I,
    limiter: Arc<RateLimiter>,
    clock: Arc<dyn Clock>,
    transcript: Arc<dyn TranscriptSink>,
    settings: EngineSettings,
    cancel: CancellationToken,
}

impl<I: TurnInvoker> Engine<I> {
    pub fn new(
        store: SessionStore,
        invoker: I,
        limiter: Arc<RateLimiter>,
        clock: Arc<dyn Clock>,
        transcript: Arc<dyn TranscriptSink>,
        settings: EngineSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            invoker,
            limiter,
            clock,
            transcript,
            settings,
            cancel,
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn invoker(&self) -> &I {
        &self.invoker
    }

    /// Drive the stored session `session_id` until a stop condition.
    ///
    /// Holds the working directory's run lock for the whole drive. Progress is
    /// committed after every turn, so an interrupted drive resumes exactly
    /// where the store says it stopped.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn drive(&self, session_id: &str) -> Result<RunOutcome> {
        let _run = self.store.acquire_run_lock()?;
        let session = self.load_expected(session_id)?;
        self.run_turns(session).await
    }

    /// Continue the stored session after a stop or a restart.
    ///
    /// A completed session is reported without running anything. A failed or
    /// aborted one is reactivated with a fresh crash budget at its persisted
    /// cursor. A session waiting for quota first waits out what remains of the
    /// server's delay. The run lock is held from reactivation to the end.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn resume(&self, session_id: &str) -> Result<RunOutcome> {
        let _run = self.store.acquire_run_lock()?;
        let session = self.load_expected(session_id)?;
        let session = match session.status {
            SessionStatus::Completed => {
                info!("session already completed");
                return Ok(self.stopped(StopReason::Completed, session, 0));
            }
            SessionStatus::Failed | SessionStatus::Aborted => {
                info!(previous = %session.status, cursor = ?session.cursor, "reactivating session");
                self.note(&session, format!("resumed after {}", session.status));
                self.store
                    .set_status(&session.session_id, SessionStatus::Active, None)?
            }
            SessionStatus::WaitingForQuota => {
                if let Some(available_at) = session.quota_available_at
                    && let Ok(remaining) = (available_at - self.clock.wall_now()).to_std()
                {
                    info!(remaining_secs = remaining.as_secs(), "quota not yet available");
                    self.limiter.penalize(remaining.min(MAX_PENALTY));
                }
                session
            }
            SessionStatus::Active => session,
        };
        self.run_turns(session).await
    }

    /// Read the session under the run lock; the store is authoritative.
    fn load_expected(&self, session_id: &str) -> Result<Session> {
        let session = self.store.load()?;
        if session.session_id != session_id {
            return Err(SessionError::SessionMismatch {
                expected: session_id.to_string(),
                found: session.session_id,
            }
            .into());
        }
        Ok(session)
    }

    async fn run_turns(&self, mut session: Session) -> Result<RunOutcome> {
        let mut budget = RetryBudget::default();
        let mut turns_run = 0;

        info!(
            turn = session.turn_count,
            step = session.step_index,
            cursor = ?session.cursor,
            status = %session.status,
            "drive started"
        );

        loop {
            if let Some(reason) = terminal_reason(&session) {
                return Ok(self.stopped(reason, session, turns_run));
            }
            if self.cancel.is_cancelled() {
                return self.abort(&session, turns_run);
            }
            if self.settings.max_turns > 0 && turns_run >= self.settings.max_turns {
                info!(max_turns = self.settings.max_turns, "turn limit reached");
                return Ok(self.stopped(StopReason::TurnLimit, session, turns_run));
            }

            match self.limiter.acquire(1, &self.cancel).await {
                Ok(waited) if !waited.is_zero() => {
                    debug!(waited_ms = waited.as_millis() as u64, "admitted after wait");
                }
                Ok(_) => {}
                Err(LimiterError::Cancelled) => return self.abort(&session, turns_run),
                Err(err) => return Err(err.into()),
            }
            if session.status == SessionStatus::WaitingForQuota {
                session = self
                    .store
                    .set_status(&session.session_id, SessionStatus::Active, None)?;
            }

            let outcome = self.invoker.run_turn(&session, &self.cancel).await;
            turns_run += 1;
            debug!(outcome = outcome.kind(), turn = session.turn_count + 1, "turn returned");

            // An interrupted turn made no durable progress; only a finished
            // successful turn is worth committing.
            if self.cancel.is_cancelled() && !matches!(outcome, TurnOutcome::Success(_)) {
                return self.abort(&session, turns_run);
            }

            let ctx = DecisionContext {
                policy: &self.settings.policy,
                last_step: session.is_last_step(),
                default_penalty: self.settings.default_penalty,
            };
            let decision = decide(&outcome, &mut budget, ctx);
            let summary = summary_of(&outcome);

            session = match decision {
                Decision::Advance { cursor } => self.store.record_turn(
                    &session.session_id,
                    &TurnRecord {
                        cursor,
                        summary,
                        step_completed: false,
                    },
                    self.transcript.as_ref(),
                )?,
                Decision::AdvanceStep => {
                    let next = self.store.record_turn(
                        &session.session_id,
                        &TurnRecord {
                            cursor: None,
                            summary,
                            step_completed: true,
                        },
                        self.transcript.as_ref(),
                    )?;
                    info!(step = next.step_index, "advanced to next step");
                    next
                }
                Decision::Complete { cursor } => self.store.record_turn(
                    &session.session_id,
                    &TurnRecord {
                        cursor,
                        summary,
                        step_completed: true,
                    },
                    self.transcript.as_ref(),
                )?,
                Decision::WaitForQuota { retry_after } => {
                    let retry_after = retry_after.min(MAX_PENALTY);
                    self.limiter.penalize(retry_after);
                    let available_at = self.clock.wall_now()
                        + TimeDelta::from_std(retry_after).unwrap_or_default();
                    self.note(
                        &session,
                        format!("rate limited; waiting {}s for quota", retry_after.as_secs()),
                    );
                    self.store.set_status(
                        &session.session_id,
                        SessionStatus::WaitingForQuota,
                        Some(available_at),
                    )?
                }
                Decision::RetryAfterCrash { backoff, detail } => {
                    warn!(
                        attempt = budget.consecutive_crashes(),
                        backoff_ms = backoff.as_millis() as u64,
                        detail = %detail,
                        "turn crashed, backing off"
                    );
                    let session = self.store.record_error(&session.session_id, &detail)?;
                    tokio::select! {
                        biased;
                        () = self.cancel.cancelled() => return self.abort(&session, turns_run),
                        () = self.clock.sleep(backoff) => {}
                    }
                    session
                }
                Decision::Fail { detail } => {
                    self.note(&session, format!("session failed: {detail}"));
                    let failed = self.store.fail(&session.session_id, &detail)?;
                    return Ok(self.stopped(StopReason::Failed { detail }, failed, turns_run));
                }
                Decision::AwaitPermission { prompt } => {
                    let waiting = self
                        .store
                        .record_error(&session.session_id, &format!("permission required: {prompt}"))?;
                    info!(prompt = %prompt, "stopping for permission");
                    return Ok(self.stopped(
                        StopReason::PermissionRequired { prompt },
                        waiting,
                        turns_run,
                    ));
                }
            };
        }
    }

    fn abort(&self, session: &Session, turns_run: u64) -> Result<RunOutcome> {
        self.note(session, "run aborted".to_string());
        let aborted = self
            .store
            .set_status(&session.session_id, SessionStatus::Aborted, None)?;
        Ok(self.stopped(StopReason::Aborted, aborted, turns_run))
    }

    fn stopped(&self, reason: StopReason, session: Session, turns_run: u64) -> RunOutcome {
        info!(
            reason = ?reason,
            turns_run,
            turn_count = session.turn_count,
            status = %session.status,
            "drive stopped"
        );
        RunOutcome {
            reason,
            session,
            turns_run,
        }
    }

    fn note(&self, session: &Session, content: String) {
        append_best_effort(
            self.transcript.as_ref(),
            &TranscriptRecord::new(
                &session.session_id,
                session.turn_count,
                TranscriptRole::System,
                content,
                self.clock.wall_now(),
            ),
        );
    }
}

fn terminal_reason(session: &Session) -> Option<StopReason> {
    match session.status {
        SessionStatus::Completed => Some(StopReason::Completed),
        SessionStatus::Failed => Some(StopReason::Failed {
            detail: session.last_error.clone().unwrap_or_default(),
        }),
        SessionStatus::Aborted => Some(StopReason::Aborted),
        SessionStatus::Active | SessionStatus::WaitingForQuota => None,
    }
}

fn summary_of(outcome: &TurnOutcome) -> String {
    let TurnOutcome::Success(output) = outcome else {
        return String::new();
    };
    let lines: Vec<&str> = output
        .text
        .lines()
        .map(str::trim_end)
        .filter(|l| !l.trim().is_empty())
        .collect();
    lines[lines.len().saturating_sub(SUMMARY_LINES)..].join("\n")
}
