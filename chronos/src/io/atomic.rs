//! Whole-file replacement that survives a crash at any point.
//!
//! The new contents go to `<name>.tmp` in the same directory, are fsynced,
//! then renamed over the target. Readers see either the old file or the new
//! one, never a prefix.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Temp file used while replacing `path`.
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Replace `path` with `contents`; `what` names the file in errors.
pub fn write_atomic(path: &Path, contents: &str, what: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{what} path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = temp_path(path);
    let mut tmp = File::create(&tmp_path)
        .with_context(|| format!("create temp {what} {}", tmp_path.display()))?;
    tmp.write_all(contents.as_bytes())
        .with_context(|| format!("write temp {what} {}", tmp_path.display()))?;
    tmp.sync_all()
        .with_context(|| format!("sync temp {what} {}", tmp_path.display()))?;
    drop(tmp);
    fs::rename(&tmp_path, path).with_context(|| format!("replace {what} {}", path.display()))?;
    Ok(())
}
