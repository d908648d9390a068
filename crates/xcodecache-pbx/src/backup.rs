//! Project file backup protocol.
//!
//! `pre` copies the pristine `project.pbxproj` aside before mutating it;
//! `post` renames the copy back, which also guarantees the byte-identical
//! round trip of every mutated project. All operations are idempotent so a
//! repeated `pre` after a crashed pipeline behaves.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Sibling backup file name inside a `.xcodeproj` directory.
pub const BACKUP_FILE_NAME: &str = "project.xcodecache_backup_pbxproj";

pub fn backup_path(xcodeproj_dir: &Path) -> PathBuf {
    xcodeproj_dir.join(BACKUP_FILE_NAME)
}

/// Copy `project.pbxproj` to its backup name. Overwrites a stale backup.
pub fn backup(xcodeproj_dir: &Path) -> io::Result<()> {
    let original = xcodeproj_dir.join("project.pbxproj");
    fs::copy(&original, backup_path(xcodeproj_dir))?;
    debug!("backed up {}", original.display());
    Ok(())
}

/// Rename the backup over `project.pbxproj` if one exists.
/// Returns whether a restore happened.
pub fn restore(xcodeproj_dir: &Path) -> io::Result<bool> {
    let path = backup_path(xcodeproj_dir);
    if !path.exists() {
        return Ok(false);
    }
    fs::rename(&path, xcodeproj_dir.join("project.pbxproj"))?;
    debug!("restored {}", xcodeproj_dir.display());
    Ok(true)
}

/// Remove the backup without restoring it. Returns whether one was present.
pub fn clean_backup(xcodeproj_dir: &Path) -> io::Result<bool> {
    let path = backup_path(xcodeproj_dir);
    if !path.exists() {
        return Ok(false);
    }
    fs::remove_file(&path)?;
    Ok(true)
}
