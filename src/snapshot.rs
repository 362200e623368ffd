//! Whole-file JSON snapshots for the on-disk caches.
//!
//! A snapshot is loaded in full at startup and rewritten in full on save.
//! Writes go to a sibling temp file first and are renamed into place.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Unix mode applied to snapshot files.
pub const SNAPSHOT_FILE_MODE: u32 = 0o600;

/// Load a snapshot, returning `T::default()` if the file does not exist.
///
/// A file that exists but cannot be parsed is treated as empty and logged;
/// the next save overwrites it.
pub fn load<T>(path: &Path) -> T
where
    T: DeserializeOwned + Default,
{
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return T::default(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read snapshot");
            return T::default();
        }
    };

    match serde_json::from_str(&contents) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "discarding unreadable snapshot");
            T::default()
        }
    }
}

/// Atomically replace the snapshot at `path` with `value`.
pub fn save<T>(path: &Path, value: &T) -> io::Result<()>
where
    T: Serialize,
{
    let parent = path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(parent)?;

    let bytes = serde_json::to_vec(value).map_err(io::Error::other)?;
    let temp_path = temp_path_for(path);
    fs::write(&temp_path, &bytes)?;
    set_permissions(&temp_path)?;
    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }
    Ok(())
}

/// Delete the snapshot file. A missing file is not an error.
pub fn remove(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Write raw bytes atomically (used for icon files).
pub fn write_bytes(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(parent)?;

    let temp_path = temp_path_for(path);
    fs::write(&temp_path, bytes)?;
    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }
    Ok(())
}

fn set_permissions(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(SNAPSHOT_FILE_MODE))?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

fn temp_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("snapshot");
    path.with_file_name(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()))
}
