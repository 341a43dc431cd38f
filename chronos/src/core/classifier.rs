//! Classification of the wrapped tool's output lines.
//!
//! The tool speaks an ad hoc, string-based protocol: a completion marker, an
//! optional resume marker, interactive permission prompts and quota errors.
//! Each output line maps to at most one [`LineSignal`].

use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::{Regex, RegexSet};

use crate::core::bucket::MAX_PENALTY;
use crate::core::types::Stream;

/// Prefix of a line through which the tool may report its own resume marker.
pub const CURSOR_PREFIX: &str = "CHRONOS_CURSOR:";

/// Interactive prompts end in an explicit choice such as `(y/n)` or `[y/N]`.
const DEFAULT_PERMISSION_PATTERNS: &[&str] = &[
    r"(?i)[(\[]\s*(?:y/n|yes/no)\s*[)\]]\s*[:?>]?\s*$",
    r"(?i)waiting for (?:user )?(?:approval|confirmation)\s*\.*\s*$",
];

const DEFAULT_RATE_LIMIT_PATTERNS: &[&str] = &[
    r"(?i)\brate[ _-]?limit(?:ed|s)?\b",
    r"(?i)too many requests",
    r"(?i)\b(?:status|code|error)\W{0,3}429\b",
    r"(?i)resource[ _]exhausted",
    r"(?i)quota (?:exceeded|exhausted)",
];

/// stdout lines only count as rate-limit errors when they look like an error
/// report rather than prose.
static ERROR_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s*(?:\[API Error\b|(?:[A-Z]\w*)?Error:|ERROR\b|\{.*"error")"#)
        .expect("error line regex is valid")
});

static RETRY_HINT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)retry(?:ing)?(?:[ _-]?after|[ _-]?delay|\s+in)"?\s*[:=]?\s*"?(\d+(?:\.\d+)?)\s*(ms|milliseconds?|s|secs?|seconds?|m|mins?|minutes?)?\b"#,
    )
    .expect("retry hint regex is valid")
});

static CURSOR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*CHRONOS_CURSOR:\s*(\S(?:.*\S)?)\s*$").expect("cursor regex is valid")
});

/// What a single output line means to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineSignal {
    Completion,
    Cursor(String),
    RateLimited(Option<Duration>),
    Permission(String),
    Plain,
}

/// Compiled line grammar for one tool configuration.
#[derive(Debug, Clone)]
pub struct OutputClassifier {
    completion_marker: String,
    permission: RegexSet,
    rate_limit: RegexSet,
}

impl OutputClassifier {
    /// Build a classifier from the completion marker plus user-supplied
    /// patterns appended to the defaults.
    pub fn new(
        completion_marker: &str,
        extra_permission_patterns: &[String],
        extra_rate_limit_patterns: &[String],
    ) -> Result<Self> {
        let permission = RegexSet::new(
            DEFAULT_PERMISSION_PATTERNS
                .iter()
                .copied()
                .chain(extra_permission_patterns.iter().map(String::as_str)),
        )
        .context("compile permission patterns")?;
        let rate_limit = RegexSet::new(
            DEFAULT_RATE_LIMIT_PATTERNS
                .iter()
                .copied()
                .chain(extra_rate_limit_patterns.iter().map(String::as_str)),
        )
        .context("compile rate limit patterns")?;
        Ok(Self {
            completion_marker: completion_marker.to_string(),
            permission,
            rate_limit,
        })
    }

    /// Rate-limit patterns apply to stderr and to error-shaped stdout lines;
    /// the model's own prose on stdout may mention quotas freely.
    pub fn classify(&self, line: &str, stream: Stream) -> LineSignal {
        // The marker must sit on its own line; prompt echoes that quote it inline
        // do not count.
        if line.trim() == self.completion_marker {
            return LineSignal::Completion;
        }
        if let Some(caps) = CURSOR_RE.captures(line) {
            return LineSignal::Cursor(caps[1].to_string());
        }
        let diagnostic = stream == Stream::Stderr || ERROR_LINE_RE.is_match(line);
        if diagnostic && self.rate_limit.is_match(line) {
            return LineSignal::RateLimited(parse_retry_hint(line));
        }
        if self.permission.is_match(line) {
            return LineSignal::Permission(line.trim().to_string());
        }
        LineSignal::Plain
    }
}

/// Extract a server-suggested retry delay such as `retry after 30s`,
/// `retrying in 1.5 seconds` or `"retryDelay": "37s"`. Unitless numbers are
/// seconds. Hints are capped at [`MAX_PENALTY`].
pub fn parse_retry_hint(line: &str) -> Option<Duration> {
    let caps = RETRY_HINT_RE.captures(line)?;
    let value: f64 = caps[1].parse().ok()?;
    let unit = caps.get(2).map(|m| m.as_str().to_ascii_lowercase());
    let seconds = match unit.as_deref() {
        Some(u) if u.starts_with("ms") || u.starts_with("milli") => value / 1000.0,
        Some(u) if u.starts_with('m') => value * 60.0,
        _ => value,
    };
    Some(Duration::try_from_secs_f64(seconds).map_or(MAX_PENALTY, |d| d.min(MAX_PENALTY)))
}
