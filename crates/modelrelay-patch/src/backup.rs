use crate::error::{Error, Result};
use crate::{PATCH_MARKER, backup_path_for};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FileStatus {
    pub patched: bool,
    pub backup_exists: bool,
}

pub fn has_backup(path: &Path) -> bool {
    backup_path_for(path).is_file()
}

pub fn is_patched(path: &Path) -> bool {
    contains_marker(path, PATCH_MARKER)
}

/// Unreadable files count as unmarked.
pub fn contains_marker(path: &Path, marker: &str) -> bool {
    fs::read_to_string(path)
        .map(|content| content.contains(marker))
        .unwrap_or(false)
}

pub fn inspect(path: &Path) -> FileStatus {
    FileStatus {
        patched: is_patched(path),
        backup_exists: has_backup(path),
    }
}

/// Copies the backup over the live file. The backup stays in place.
pub fn restore_backup(path: &Path) -> Result<()> {
    let backup = backup_path_for(path);
    let data = match fs::read(&backup) {
        Ok(data) => data,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(Error::NotFound(format!(
                "no backup found at {}",
                backup.display()
            )));
        }
        Err(err) => return Err(Error::io("read backup", &backup)(err)),
    };

    fs::write(path, data).map_err(Error::io("restore", path))?;
    info!(path = %path.display(), "restored from backup");
    Ok(())
}
