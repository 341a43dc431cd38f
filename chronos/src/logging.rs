//! Diagnostic tracing for chronos.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Diagnostics via `RUST_LOG`, output to stderr.
//!   Not persisted.
//!
//! - **Transcript (`io/transcript`)**: Product artifact in
//!   `.chronos/transcripts/`. Always written, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`. Defaults to `warn`, or `warn,chronos=info` with
/// `verbose`. Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=chronos=debug chronos resume
/// ```
pub fn init(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(verbose)));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}

fn default_directives(verbose: bool) -> &'static str {
    if verbose { "warn,chronos=info" } else { "warn" }
}
