//! Writing the mount table. Only the privileged helper calls into here.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use super::ledger::now_secs;
use super::APP_MARKER;
use crate::error::Result;

pub fn backup_path(table: &Path, epoch: u64) -> PathBuf {
    PathBuf::from(format!("{}.{APP_MARKER}.bak.{epoch}", table.display()))
}

/// Copies the table next to itself as `<table>.lindy.bak.<epoch>`.
pub fn backup_table(table: &Path) -> Result<PathBuf> {
    let backup = backup_path(table, now_secs());
    fs::copy(table, &backup)?;
    Ok(backup)
}

/// Writes `contents` to a sibling temp file and renames it over the table,
/// so readers see either the old or the new table.
pub fn replace_table(table: &Path, contents: &str) -> Result<()> {
    let tmp = PathBuf::from(format!("{}.{APP_MARKER}.tmp", table.display()));
    fs::write(&tmp, contents)?;
    fs::set_permissions(&tmp, fs::Permissions::from_mode(0o644))?;
    if let Err(err) = fs::rename(&tmp, table) {
        let _ = fs::remove_file(&tmp);
        return Err(err.into());
    }
    Ok(())
}
