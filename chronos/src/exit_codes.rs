//! Stable exit codes for chronos CLI commands.

/// Command succeeded or the session completed.
pub const OK: i32 = 0;
/// Invalid input, config or other unexpected error.
pub const INVALID: i32 = 1;
/// The session failed (crash budget exhausted).
pub const FAILED: i32 = 2;
/// The run was aborted by a signal.
pub const ABORTED: i32 = 3;
/// The tool asked for permission outside YOLO mode; the session is still active.
pub const PERMISSION_REQUIRED: i32 = 4;
/// Another session is active in the working directory, or another process drives it.
pub const ALREADY_ACTIVE: i32 = 5;
/// No session in the working directory.
pub const NOT_FOUND: i32 = 6;
/// `.chronos/session.json` is unreadable or violates its invariants.
pub const STORE_CORRUPTED: i32 = 7;
/// `max_turns` reached; the session is still active.
pub const TURN_LIMIT: i32 = 8;
