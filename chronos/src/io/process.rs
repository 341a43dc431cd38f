//! Child process plumbing for the wrapped tool.
//!
//! stdout and stderr are drained concurrently, line by line, into one channel
//! so the caller can react to each line while the child is still running.
//! The child is spawned with `kill_on_drop`, so dropping a [`LiveChild`]
//! never leaks a process.

use std::collections::VecDeque;
use std::path::Path;
use std::process::{ExitStatus, Stdio};

use anyhow::{Context, Result, anyhow};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tracing::{debug, error, instrument, warn};

use crate::core::types::Stream;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: Stream,
    pub text: String,
}

/// What to launch.
#[derive(Debug, Clone)]
pub struct SpawnRequest<'a> {
    pub program: &'a str,
    pub args: Vec<String>,
    pub cwd: &'a Path,
    /// Written to stdin right after spawn.
    pub stdin_payload: Option<String>,
    /// Keep stdin open after the payload so later lines can be written;
    /// otherwise the child sees EOF right away.
    pub keep_stdin_open: bool,
}

/// A running child with its output channel and, if requested, open stdin.
pub struct LiveChild {
    child: Child,
    stdin: Option<ChildStdin>,
    lines: mpsc::Receiver<OutputLine>,
}

impl LiveChild {
    #[instrument(skip_all, fields(program = request.program, cwd = %request.cwd.display()))]
    pub async fn spawn(request: SpawnRequest<'_>) -> Result<Self> {
        let mut cmd = Command::new(request.program);
        cmd.args(&request.args)
            .current_dir(request.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("spawning child process");
        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                error!(err = %e, "failed to spawn command");
                return Err(e).with_context(|| format!("spawn {}", request.program));
            }
        };

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr was not piped"))?;
        let stdin = child.stdin.take();

        let (tx, lines) = mpsc::channel(256);
        tokio::spawn(forward_lines(stdout, Stream::Stdout, tx.clone()));
        tokio::spawn(forward_lines(stderr, Stream::Stderr, tx));

        let mut live = Self {
            child,
            stdin,
            lines,
        };
        if let Some(payload) = request.stdin_payload {
            live.write_line(&payload).await.context("write prompt to stdin")?;
        }
        if !request.keep_stdin_open {
            live.close_stdin();
        }
        Ok(live)
    }

    /// Next output line; `None` once both pipes are closed.
    pub async fn next_line(&mut self) -> Option<OutputLine> {
        self.lines.recv().await
    }

    /// Write `text` plus a newline to the child's stdin.
    pub async fn write_line(&mut self, text: &str) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow!("stdin already closed"))?;
        stdin.write_all(text.as_bytes()).await.context("write stdin")?;
        if !text.ends_with('\n') {
            stdin.write_all(b"\n").await.context("write stdin")?;
        }
        stdin.flush().await.context("flush stdin")
    }

    pub fn stdin_open(&self) -> bool {
        self.stdin.is_some()
    }

    /// Drop our end of stdin so the child reads EOF.
    pub fn close_stdin(&mut self) {
        self.stdin = None;
    }

    /// Wait for exit after the output has been drained.
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        self.close_stdin();
        self.child.wait().await.context("wait for child")
    }

    /// Kill and reap the child.
    pub async fn kill(&mut self) -> Result<()> {
        self.close_stdin();
        if let Err(err) = self.child.kill().await {
            // Already exited between the last line and the kill.
            warn!(err = %err, "kill child failed");
            self.child.wait().await.context("reap child after failed kill")?;
        }
        Ok(())
    }
}

async fn forward_lines<R>(reader: R, stream: Stream, tx: mpsc::Sender<OutputLine>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\n', '\r'])
                    .to_string();
                if tx.send(OutputLine { stream, text }).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                warn!(?stream, err = %err, "read child output failed");
                break;
            }
        }
    }
}

/// Bounded in-memory tail of a stream of lines.
#[derive(Debug, Clone)]
pub struct OutputTail {
    limit: usize,
    len: usize,
    lines: VecDeque<String>,
    truncated: usize,
}

impl OutputTail {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            len: 0,
            lines: VecDeque::new(),
            truncated: 0,
        }
    }

    pub fn push(&mut self, line: &str) {
        self.len += line.len() + 1;
        self.lines.push_back(line.to_string());
        while self.len > self.limit {
            let Some(dropped) = self.lines.pop_front() else {
                break;
            };
            self.len -= dropped.len() + 1;
            self.truncated += dropped.len() + 1;
        }
    }

    /// Bytes discarded from the front.
    pub fn truncated(&self) -> usize {
        self.truncated
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn text(&self) -> String {
        let mut out = String::with_capacity(self.len);
        if self.truncated > 0 {
            out.push_str(&format!("[{} earlier bytes truncated]\n", self.truncated));
        }
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }

    /// The last `n` lines joined with newlines.
    pub fn last_lines(&self, n: usize) -> String {
        let skip = self.lines.len().saturating_sub(n);
        self.lines
            .iter()
            .skip(skip)
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }
}
