//! One bounded interaction with the wrapped tool.
//!
//! The invoker owns the tool's string protocol. Everything the engine sees is
//! a [`TurnOutcome`]; raw lines only reach the transcript.

use std::future::Future;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::clock::Clock;
use crate::core::classifier::{LineSignal, OutputClassifier};
use crate::core::session::Session;
use crate::core::types::{Stream, TranscriptRole, TurnOutcome, TurnOutput};
use crate::io::config::{PromptMode, ToolConfig};
use crate::io::process::{LiveChild, OutputTail, SpawnRequest};
use crate::io::prompt::PromptRenderer;
use crate::io::transcript::{TranscriptRecord, TranscriptSink, append_best_effort};

/// Lines of stderr quoted in a crash diagnostic.
const STDERR_TAIL_LINES: usize = 20;
const STDERR_TAIL_BYTES: usize = 16 * 1024;

/// Runs one turn for a session.
///
/// Implementations never retry internally; cancellation must stop the turn
/// promptly.
pub trait TurnInvoker: Send + Sync {
    fn run_turn(
        &self,
        session: &Session,
        cancel: &CancellationToken,
    ) -> impl Future<Output = TurnOutcome> + Send;
}

/// Invoker backed by the configured command-line tool.
pub struct ToolInvoker {
    tool: ToolConfig,
    classifier: OutputClassifier,
    renderer: PromptRenderer,
    transcript: Arc<dyn TranscriptSink>,
    clock: Arc<dyn Clock>,
}

impl ToolInvoker {
    pub fn new(
        tool: ToolConfig,
        transcript: Arc<dyn TranscriptSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let classifier = OutputClassifier::new(
            &tool.completion_marker,
            &tool.extra_permission_patterns,
            &tool.extra_rate_limit_patterns,
        )?;
        let renderer = PromptRenderer::new(&tool.completion_marker);
        Ok(Self {
            tool,
            classifier,
            renderer,
            transcript,
            clock,
        })
    }

    fn record(&self, session: &Session, role: TranscriptRole, content: &str) {
        append_best_effort(
            self.transcript.as_ref(),
            &TranscriptRecord::new(
                &session.session_id,
                session.turn_count + 1,
                role,
                content,
                self.clock.wall_now(),
            ),
        );
    }

    fn spawn_request<'a>(&'a self, session: &'a Session, prompt: String) -> Result<SpawnRequest<'a>> {
        let (program, leading) = self
            .tool
            .command
            .split_first()
            .ok_or_else(|| anyhow!("tool.command is empty"))?;
        let mut args = leading.to_vec();
        if session.yolo_mode {
            args.extend(self.tool.yolo_args.iter().cloned());
        }
        let stdin_payload = match self.tool.prompt_mode {
            PromptMode::Arg => {
                args.push(prompt);
                None
            }
            PromptMode::Stdin => Some(prompt),
        };
        Ok(SpawnRequest {
            program,
            args,
            cwd: &session.working_directory,
            stdin_payload,
            keep_stdin_open: self.tool.keep_stdin_open,
        })
    }

    async fn drive(&self, session: &Session, cancel: &CancellationToken) -> Result<TurnOutcome> {
        let prompt = self.renderer.render(session)?;
        self.record(session, TranscriptRole::Prompt, &prompt);

        let mut child = LiveChild::spawn(self.spawn_request(session, prompt)?).await?;
        let mut output = OutputTail::new(self.tool.output_limit_bytes);
        let mut stderr = OutputTail::new(STDERR_TAIL_BYTES);
        let mut task_complete = false;
        let mut cursor = None;

        let deadline = tokio::time::sleep(self.tool.turn_timeout());
        tokio::pin!(deadline);

        loop {
            let line = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    child.kill().await?;
                    return Ok(TurnOutcome::Crashed("turn cancelled".to_string()));
                }
                () = &mut deadline => {
                    child.kill().await?;
                    return Ok(self.timed_out(&stderr));
                }
                line = child.next_line() => line,
            };
            let Some(line) = line else {
                break;
            };

            self.record(session, TranscriptRole::Output, &line.text);
            output.push(&line.text);
            if line.stream == Stream::Stderr {
                stderr.push(&line.text);
            }

            match self.classifier.classify(&line.text, line.stream) {
                LineSignal::Plain => {}
                LineSignal::Completion => task_complete = true,
                LineSignal::Cursor(marker) => {
                    debug!(cursor = %marker, "tool reported cursor");
                    cursor = Some(marker);
                }
                LineSignal::RateLimited(hint) => {
                    info!(retry_after = ?hint, "tool reported rate limit");
                    child.kill().await?;
                    return Ok(TurnOutcome::RateLimited(hint));
                }
                LineSignal::Permission(request) if session.yolo_mode => {
                    self.record(
                        session,
                        TranscriptRole::Permission,
                        &format!("auto-approved: {request}"),
                    );
                    if !child.stdin_open() {
                        warn!("stdin is closed, cannot answer permission prompt; set tool.keep_stdin_open");
                    } else if let Err(err) = child.write_line(&self.tool.approve_response).await {
                        warn!(err = %format!("{err:#}"), "failed to answer permission prompt");
                    }
                }
                LineSignal::Permission(request) => {
                    self.record(session, TranscriptRole::Permission, &request);
                    child.kill().await?;
                    return Ok(TurnOutcome::PermissionRequested(request));
                }
            }
        }

        let status = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                child.kill().await?;
                return Ok(TurnOutcome::Crashed("turn cancelled".to_string()));
            }
            () = &mut deadline => {
                child.kill().await?;
                return Ok(self.timed_out(&stderr));
            }
            status = child.wait() => status?,
        };

        if !status.success() {
            let code = status
                .code()
                .map_or_else(|| "terminated by signal".to_string(), |c| format!("exit code {c}"));
            return Ok(TurnOutcome::Crashed(with_stderr(
                format!("tool exited with {code}"),
                &stderr,
            )));
        }

        Ok(TurnOutcome::Success(TurnOutput {
            text: output.text(),
            task_complete,
            cursor,
        }))
    }

    fn timed_out(&self, stderr: &OutputTail) -> TurnOutcome {
        warn!(timeout_secs = self.tool.turn_timeout_secs, "turn timed out, killed");
        TurnOutcome::Crashed(with_stderr(
            format!("turn timed out after {}s", self.tool.turn_timeout_secs),
            stderr,
        ))
    }
}

impl TurnInvoker for ToolInvoker {
    fn run_turn(
        &self,
        session: &Session,
        cancel: &CancellationToken,
    ) -> impl Future<Output = TurnOutcome> + Send {
        let span = info_span!(
            "run_turn",
            session_id = %session.session_id,
            turn = session.turn_count + 1
        );
        async move {
            let outcome = match self.drive(session, cancel).await {
                Ok(outcome) => outcome,
                Err(err) => TurnOutcome::Crashed(format!("{err:#}")),
            };
            if let TurnOutcome::Crashed(detail) = &outcome {
                self.record(session, TranscriptRole::Error, detail);
            }
            debug!(outcome = outcome.kind(), "turn finished");
            outcome
        }
        .instrument(span)
    }
}

fn with_stderr(head: String, stderr: &OutputTail) -> String {
    if stderr.is_empty() {
        head
    } else {
        format!("{head}; stderr: {}", stderr.last_lines(STDERR_TAIL_LINES))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::test_support::{MemoryTranscript, session_fixture};

    const MARKER: &str = "<<<CHRONOS_TASK_COMPLETE>>>";

    /// Tool that ignores its prompt argument and runs `script`.
    fn tool(script: &str) -> ToolConfig {
        ToolConfig {
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string(), "sh".to_string()],
            yolo_args: Vec::new(),
            turn_timeout_secs: 10,
            completion_marker: MARKER.to_string(),
            ..ToolConfig::default()
        }
    }

    fn invoker(tool: ToolConfig, transcript: Arc<MemoryTranscript>) -> ToolInvoker {
        ToolInvoker::new(tool, transcript, Arc::new(SystemClock)).expect("invoker")
    }

    async fn run(script: &str) -> (TurnOutcome, Arc<MemoryTranscript>) {
        let temp = tempfile::tempdir().expect("tempdir");
        let session = session_fixture(&temp.path().canonicalize().expect("canonicalize"));
        let transcript = Arc::new(MemoryTranscript::default());
        let outcome = invoker(tool(script), transcript.clone())
            .run_turn(&session, &CancellationToken::new())
            .await;
        (outcome, transcript)
    }

    #[tokio::test]
    async fn clean_exit_with_marker_is_complete_success() {
        let script = format!("echo working; echo 'CHRONOS_CURSOR: step-3'; echo '{MARKER}'");
        let (outcome, transcript) = run(&script).await;
        let TurnOutcome::Success(output) = outcome else {
            panic!("expected success, got {outcome:?}");
        };
        assert!(output.task_complete);
        assert_eq!(output.cursor.as_deref(), Some("step-3"));
        assert!(output.text.contains("working"));

        let roles: Vec<TranscriptRole> = transcript.records().iter().map(|r| r.role).collect();
        assert_eq!(roles[0], TranscriptRole::Prompt);
        assert!(roles[1..].iter().all(|r| *r == TranscriptRole::Output));
    }

    #[tokio::test]
    async fn clean_exit_without_marker_has_more_work() {
        let (outcome, _) = run("echo partial progress").await;
        let TurnOutcome::Success(output) = outcome else {
            panic!("expected success, got {outcome:?}");
        };
        assert!(!output.task_complete);
        assert_eq!(output.cursor, None);
    }

    #[tokio::test]
    async fn non_zero_exit_is_crash_with_stderr() {
        let (outcome, transcript) = run("echo boom 1>&2; exit 2").await;
        let TurnOutcome::Crashed(detail) = outcome else {
            panic!("expected crash, got {outcome:?}");
        };
        assert!(detail.contains("exit code 2"));
        assert!(detail.contains("boom"));
        assert!(
            transcript
                .records()
                .iter()
                .any(|r| r.role == TranscriptRole::Error)
        );
    }

    #[tokio::test]
    async fn rate_limit_line_kills_turn_with_hint() {
        let (outcome, _) =
            run("echo '429 Too Many Requests, retry after 30s' 1>&2; sleep 5").await;
        assert_eq!(
            outcome,
            TurnOutcome::RateLimited(Some(std::time::Duration::from_secs(30)))
        );
    }

    #[tokio::test]
    async fn prose_mentioning_rate_limits_is_ordinary_output() {
        let script = format!(
            "echo 'Added a rate limit of 100 requests per minute.'; \
             echo 'The handler now returns status 429 when the quota is exceeded.'; \
             echo '{MARKER}'"
        );
        let (outcome, _) = run(&script).await;
        let TurnOutcome::Success(output) = outcome else {
            panic!("expected success, got {outcome:?}");
        };
        assert!(output.task_complete);
    }

    #[tokio::test]
    async fn permission_prompt_without_yolo_stops_turn() {
        let (outcome, transcript) = run("echo 'Allow write to src/lib.rs? (y/n)'; sleep 5").await;
        assert_eq!(
            outcome,
            TurnOutcome::PermissionRequested("Allow write to src/lib.rs? (y/n)".to_string())
        );
        assert!(
            transcript
                .records()
                .iter()
                .any(|r| r.role == TranscriptRole::Permission)
        );
    }

    #[tokio::test]
    async fn permission_prompt_in_yolo_is_answered() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut session = session_fixture(&temp.path().canonicalize().expect("canonicalize"));
        session.yolo_mode = true;
        let mut config = tool("echo 'Apply this change? (y/n)'; read answer; echo answered:$answer");
        config.keep_stdin_open = true;
        let transcript = Arc::new(MemoryTranscript::default());
        let outcome = invoker(config, transcript.clone())
            .run_turn(&session, &CancellationToken::new())
            .await;
        let TurnOutcome::Success(output) = outcome else {
            panic!("expected success, got {outcome:?}");
        };
        assert!(output.text.contains("answered:y"));
        assert!(
            transcript
                .records()
                .iter()
                .any(|r| r.role == TranscriptRole::Permission && r.content.starts_with("auto-approved"))
        );
    }

    #[tokio::test]
    async fn timeout_kills_turn() {
        let temp = tempfile::tempdir().expect("tempdir");
        let session = session_fixture(&temp.path().canonicalize().expect("canonicalize"));
        let mut config = tool("sleep 30");
        config.turn_timeout_secs = 1;
        let outcome = invoker(config, Arc::new(MemoryTranscript::default()))
            .run_turn(&session, &CancellationToken::new())
            .await;
        let TurnOutcome::Crashed(detail) = outcome else {
            panic!("expected crash, got {outcome:?}");
        };
        assert!(detail.contains("timed out"));
    }

    #[tokio::test]
    async fn cancellation_kills_turn() {
        let temp = tempfile::tempdir().expect("tempdir");
        let session = session_fixture(&temp.path().canonicalize().expect("canonicalize"));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = invoker(tool("sleep 30"), Arc::new(MemoryTranscript::default()))
            .run_turn(&session, &cancel)
            .await;
        assert_eq!(outcome, TurnOutcome::Crashed("turn cancelled".to_string()));
    }

    #[tokio::test]
    async fn stdin_mode_delivers_prompt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let session = session_fixture(&temp.path().canonicalize().expect("canonicalize"));
        let mut config = tool("head -n 1");
        config.prompt_mode = PromptMode::Stdin;
        let outcome = invoker(config, Arc::new(MemoryTranscript::default()))
            .run_turn(&session, &CancellationToken::new())
            .await;
        let TurnOutcome::Success(output) = outcome else {
            panic!("expected success, got {outcome:?}");
        };
        assert!(output.text.contains("<task>"));
    }

    #[tokio::test]
    async fn stdin_mode_closes_input_after_prompt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let session = session_fixture(&temp.path().canonicalize().expect("canonicalize"));
        let mut config = tool(&format!("cat >/dev/null; echo done; echo '{MARKER}'"));
        config.prompt_mode = PromptMode::Stdin;
        config.turn_timeout_secs = 5;
        let outcome = invoker(config, Arc::new(MemoryTranscript::default()))
            .run_turn(&session, &CancellationToken::new())
            .await;
        let TurnOutcome::Success(output) = outcome else {
            panic!("expected success, got {outcome:?}");
        };
        assert!(output.text.contains("done"));
        assert!(output.task_complete);
    }

    #[tokio::test]
    async fn missing_program_is_crash() {
        let temp = tempfile::tempdir().expect("tempdir");
        let session = session_fixture(&temp.path().canonicalize().expect("canonicalize"));
        let config = ToolConfig {
            command: vec!["chronos-definitely-not-a-real-program".to_string()],
            ..ToolConfig::default()
        };
        let outcome = invoker(config, Arc::new(MemoryTranscript::default()))
            .run_turn(&session, &CancellationToken::new())
            .await;
        assert!(matches!(outcome, TurnOutcome::Crashed(detail) if detail.contains("spawn")));
    }
}
