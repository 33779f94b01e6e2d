//! File metadata carried through archives: size, mode and mtime.

use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Metadata preserved for each archived file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMetadata {
    pub size: u64,

    pub mtime: SystemTime,

    /// Unix permission bits, when the platform has them
    pub mode: Option<u32>,
}

impl FileMetadata {
    pub fn from_metadata(metadata: &fs::Metadata) -> Self {
        #[cfg(unix)]
        let mode = {
            use std::os::unix::fs::PermissionsExt;
            Some(metadata.permissions().mode() & 0o7777)
        };

        #[cfg(not(unix))]
        let mode = None;

        Self {
            size: metadata.len(),
            mtime: metadata.modified().unwrap_or(UNIX_EPOCH),
            mode,
        }
    }

    /// Does not follow symlinks
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        Ok(Self::from_metadata(&fs::symlink_metadata(path)?))
    }

    /// Seconds since the epoch, as stored in tar headers
    pub fn mtime_secs(&self) -> u64 {
        self.mtime
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }

    pub fn from_parts(size: u64, mtime_secs: u64, mode: Option<u32>) -> Self {
        Self {
            size,
            mtime: UNIX_EPOCH + Duration::from_secs(mtime_secs),
            mode,
        }
    }
}

/// Set permission bits on `path`
#[cfg(unix)]
pub fn apply_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
pub fn apply_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

/// Set the modification time of a regular file
pub fn apply_mtime(path: &Path, mtime: SystemTime) -> std::io::Result<()> {
    let file = fs::OpenOptions::new().write(true).open(path)?;
    file.set_modified(mtime)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_extract_metadata() -> std::io::Result<()> {
        let mut temp_file = NamedTempFile::new()?;
        temp_file.write_all(b"test content")?;
        temp_file.flush()?;

        let metadata = FileMetadata::from_path(temp_file.path())?;

        assert_eq!(metadata.size, 12);
        assert!(metadata.mtime_secs() > 0);

        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn test_mode_and_mtime_round_trip() -> std::io::Result<()> {
        let temp_file = NamedTempFile::new()?;
        let stamp = UNIX_EPOCH + Duration::from_secs(1_700_000_000);

        apply_mode(temp_file.path(), 0o640)?;
        apply_mtime(temp_file.path(), stamp)?;

        let metadata = FileMetadata::from_path(temp_file.path())?;
        assert_eq!(metadata.mode, Some(0o640));
        assert_eq!(metadata.mtime_secs(), 1_700_000_000);

        Ok(())
    }
}
