//! Configuration stored under `.chronos/config.toml`.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::bucket::MAX_PENALTY;
use crate::core::retry::RetryPolicy;
use crate::io::atomic::write_atomic;
use crate::limiter::LimiterConfig;

/// Chronos configuration (TOML).
///
/// Intended to be edited by humans. Missing fields fall back to defaults that
/// target a 60 requests/minute quota and the `gemini` CLI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChronosConfig {
    /// Stop a run after this many turns; 0 means unlimited.
    pub max_turns: u64,
    pub tool: ToolConfig,
    pub limiter: LimiterSection,
    pub retry: RetrySection,
}

/// How the prompt reaches the wrapped tool.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PromptMode {
    /// Final command-line argument.
    Arg,
    /// Written to stdin, which stays open for permission answers.
    Stdin,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ToolConfig {
    /// Program and leading arguments (e.g. `["gemini"]`).
    pub command: Vec<String>,
    /// Extra arguments passed when the session runs in YOLO mode.
    pub yolo_args: Vec<String>,
    pub prompt_mode: PromptMode,
    /// Wall-clock budget of a single turn.
    pub turn_timeout_secs: u64,
    /// Output kept in memory per turn (tail).
    pub output_limit_bytes: usize,
    /// Leave stdin open for the whole turn so YOLO mode can answer permission
    /// prompts. Off by default: tools that read their input until EOF would
    /// otherwise never start.
    pub keep_stdin_open: bool,
    /// Line written to stdin to approve a permission prompt.
    pub approve_response: String,
    /// Line the tool prints once the whole task is done.
    pub completion_marker: String,
    pub extra_permission_patterns: Vec<String>,
    pub extra_rate_limit_patterns: Vec<String>,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            command: vec!["gemini".to_string()],
            yolo_args: vec!["--yolo".to_string()],
            prompt_mode: PromptMode::Arg,
            turn_timeout_secs: 30 * 60,
            output_limit_bytes: 1_000_000,
            keep_stdin_open: false,
            approve_response: "y".to_string(),
            completion_marker: "<<<CHRONOS_TASK_COMPLETE>>>".to_string(),
            extra_permission_patterns: Vec::new(),
            extra_rate_limit_patterns: Vec::new(),
        }
    }
}

impl ToolConfig {
    pub fn turn_timeout(&self) -> Duration {
        Duration::from_secs(self.turn_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LimiterSection {
    pub capacity: u32,
    pub refill_per_second: f64,
    /// Penalty applied when a rate-limit rejection carries no retry hint.
    pub default_penalty_secs: u64,
}

impl Default for LimiterSection {
    fn default() -> Self {
        let limiter = LimiterConfig::default();
        Self {
            capacity: limiter.capacity,
            refill_per_second: limiter.refill_per_second,
            default_penalty_secs: 60,
        }
    }
}

impl LimiterSection {
    pub fn limiter_config(&self) -> LimiterConfig {
        LimiterConfig {
            capacity: self.capacity,
            refill_per_second: self.refill_per_second,
        }
    }

    pub fn default_penalty(&self) -> Duration {
        Duration::from_secs(self.default_penalty_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetrySection {
    /// Consecutive crashes after which the session fails.
    pub max_crash_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_crash_retries: policy.max_crash_retries,
            backoff_base_ms: policy.backoff_base.as_millis() as u64,
            backoff_max_ms: policy.backoff_max.as_millis() as u64,
        }
    }
}

impl RetrySection {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_crash_retries: self.max_crash_retries,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
        }
    }
}

impl Default for ChronosConfig {
    fn default() -> Self {
        Self {
            max_turns: 0,
            tool: ToolConfig::default(),
            limiter: LimiterSection::default(),
            retry: RetrySection::default(),
        }
    }
}

impl ChronosConfig {
    pub fn validate(&self) -> Result<()> {
        if self.tool.command.is_empty() || self.tool.command[0].trim().is_empty() {
            return Err(anyhow!("tool.command must be a non-empty array"));
        }
        if self.tool.turn_timeout_secs == 0 {
            return Err(anyhow!("tool.turn_timeout_secs must be > 0"));
        }
        if self.tool.output_limit_bytes == 0 {
            return Err(anyhow!("tool.output_limit_bytes must be > 0"));
        }
        if self.tool.completion_marker.trim().is_empty() {
            return Err(anyhow!("tool.completion_marker must not be empty"));
        }
        if self.limiter.capacity == 0 {
            return Err(anyhow!("limiter.capacity must be > 0"));
        }
        if !self.limiter.refill_per_second.is_finite() || self.limiter.refill_per_second <= 0.0 {
            return Err(anyhow!("limiter.refill_per_second must be a positive number"));
        }
        if self.limiter.default_penalty() > MAX_PENALTY {
            return Err(anyhow!(
                "limiter.default_penalty_secs must not exceed {}",
                MAX_PENALTY.as_secs()
            ));
        }
        if self.retry.max_crash_retries == 0 {
            return Err(anyhow!("retry.max_crash_retries must be > 0"));
        }
        if self.retry.backoff_base_ms > self.retry.backoff_max_ms {
            return Err(anyhow!("retry.backoff_base_ms must not exceed retry.backoff_max_ms"));
        }
        Ok(())
    }
}

/// Read `.chronos/config.toml`; a missing file means defaults.
pub fn load_config(path: &Path) -> Result<ChronosConfig> {
    let cfg = match fs::read_to_string(path) {
        Ok(contents) => toml::from_str::<ChronosConfig>(&contents)
            .with_context(|| format!("parse {}", path.display()))?,
        Err(err) if err.kind() == ErrorKind::NotFound => ChronosConfig::default(),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Persist `cfg` as TOML, replacing the file atomically.
pub fn write_config(path: &Path, cfg: &ChronosConfig) -> Result<()> {
    cfg.validate()?;
    let body = toml::to_string_pretty(cfg).context("serialize config")?;
    write_atomic(path, &format!("{body}\n"), "config")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, ChronosConfig::default());
        assert_eq!(cfg.limiter.capacity, 60);
        assert_eq!(cfg.retry.max_crash_retries, 5);
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = ChronosConfig::default();
        cfg.tool.command = vec!["claude".to_string(), "-p".to_string()];
        cfg.tool.prompt_mode = PromptMode::Stdin;
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "max_turns = 12\n[limiter]\ncapacity = 30\nrefill_per_second = 0.5\n")
            .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_turns, 12);
        assert_eq!(cfg.limiter.capacity, 30);
        assert_eq!(cfg.limiter.default_penalty_secs, 60);
        assert_eq!(cfg.tool, ToolConfig::default());
    }

    #[test]
    fn rejects_invalid_values() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[limiter]\nrefill_per_second = 0.0\n").expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("refill_per_second"));

        let mut cfg = ChronosConfig::default();
        cfg.tool.command.clear();
        assert!(cfg.validate().is_err());

        let mut cfg = ChronosConfig::default();
        cfg.limiter.default_penalty_secs = MAX_PENALTY.as_secs() + 1;
        assert!(cfg.validate().is_err());
    }
}
