//! Structural and identity errors surfaced to the caller.
//!
//! These travel through `anyhow::Error` and are recovered with
//! `downcast_ref::<SessionError>()` where an exit code is chosen.

use std::path::PathBuf;

use crate::core::types::SessionStatus;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(
        "session {session_id} is {status} in {}; resume it or clear it first",
        working_directory.display()
    )]
    AlreadyActive {
        session_id: String,
        status: SessionStatus,
        working_directory: PathBuf,
    },

    #[error("another chronos process is driving the session in {}", working_directory.display())]
    RunLockHeld { working_directory: PathBuf },

    #[error("no session found in {}", working_directory.display())]
    NotFound { working_directory: PathBuf },

    #[error("session store {} is corrupted: {reason}", path.display())]
    StoreCorrupted { path: PathBuf, reason: String },

    #[error("session {found} does not match expected session {expected}")]
    SessionMismatch { expected: String, found: String },
}
