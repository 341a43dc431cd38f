//! Canonical locations under `.chronos/` for a working directory.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// All chronos-owned paths for one working directory.
#[derive(Debug, Clone)]
pub struct ChronosPaths {
    pub working_directory: PathBuf,
    pub chronos_dir: PathBuf,
    pub session_path: PathBuf,
    pub session_lock_path: PathBuf,
    pub run_lock_path: PathBuf,
    pub config_path: PathBuf,
    pub archive_dir: PathBuf,
    pub transcripts_dir: PathBuf,
}

impl ChronosPaths {
    pub fn new(working_directory: impl Into<PathBuf>) -> Self {
        let working_directory = working_directory.into();
        let chronos_dir = working_directory.join(".chronos");
        Self {
            working_directory: working_directory.clone(),
            chronos_dir: chronos_dir.clone(),
            session_path: chronos_dir.join("session.json"),
            session_lock_path: chronos_dir.join("session.lock"),
            run_lock_path: chronos_dir.join("run.lock"),
            config_path: chronos_dir.join("config.toml"),
            archive_dir: chronos_dir.join("sessions"),
            transcripts_dir: chronos_dir.join("transcripts"),
        }
    }

    pub fn archive_path(&self, session_id: &str) -> PathBuf {
        self.archive_dir.join(format!("{session_id}.json"))
    }

    pub fn transcript_path(&self, session_id: &str) -> PathBuf {
        self.transcripts_dir.join(format!("{session_id}.jsonl"))
    }
}

/// Resolve a user-supplied directory to the absolute path sessions are keyed by.
pub fn resolve_working_directory(dir: &Path) -> Result<PathBuf> {
    dir.canonicalize()
        .with_context(|| format!("resolve working directory {}", dir.display()))
}
