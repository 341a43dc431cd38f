//! Autonomous, crash-safe runner for a code-generation CLI.
//!
//! chronos keeps re-invoking the wrapped tool on the same task until the tool
//! reports completion, while staying under a requests-per-minute quota and
//! surviving crashes and restarts. The architecture keeps a strict split:
//!
//! - **[`core`]**: Pure, deterministic logic (token bucket, output grammar,
//!   transition table, retry policy). No I/O.
//! - **[`io`]**: Side effects (session store, locks, transcript, child
//!   processes, config). Isolated behind traits so tests can script them.
//!
//! [`limiter`] and [`engine`] combine the two; [`commands`] wires them up for
//! the CLI.

pub mod clock;
pub mod commands;
pub mod core;
pub mod engine;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod limiter;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
