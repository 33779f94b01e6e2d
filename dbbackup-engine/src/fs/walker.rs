//! Lazy directory traversal.
//!
//! Yields files and symlinks one at a time so that callers can stream them
//! straight into an archive without collecting the whole tree first.

use super::metadata::FileMetadata;
use std::fs::FileType;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Symlink(PathBuf),
}

/// A file discovered during walking
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Path relative to the walk root
    pub relative_path: PathBuf,

    pub absolute_path: PathBuf,

    pub kind: EntryKind,

    pub metadata: FileMetadata,
}

impl FileEntry {
    fn from_entry(entry: &DirEntry, root: &Path) -> io::Result<Option<Self>> {
        let file_type = entry.file_type();
        let kind = if file_type.is_file() {
            EntryKind::File
        } else if file_type.is_symlink() {
            EntryKind::Symlink(std::fs::read_link(entry.path())?)
        } else {
            // directories, sockets, fifos, devices
            return Ok(None);
        };

        let absolute_path = entry.path().to_path_buf();
        let relative_path = absolute_path
            .strip_prefix(root)
            .unwrap_or(&absolute_path)
            .to_path_buf();
        let metadata = FileMetadata::from_metadata(&entry.metadata().map_err(io::Error::from)?);

        Ok(Some(Self {
            relative_path,
            absolute_path,
            kind,
            metadata,
        }))
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }
}

/// Walk `root` without following symlinks, in a stable (name-sorted) order.
///
/// `exclude` sees each path relative to `root` with its file type; an
/// excluded directory is not descended into. Directories themselves are not
/// yielded.
pub fn walk_entries<'a, F>(root: &'a Path, mut exclude: F) -> impl Iterator<Item = io::Result<FileEntry>> + 'a
where
    F: FnMut(&Path, &FileType) -> bool + 'a,
{
    WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(move |entry| {
            if entry.depth() == 0 {
                return true;
            }
            let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
            !exclude(relative, &entry.file_type())
        })
        .filter_map(move |entry| match entry {
            Ok(entry) if entry.depth() == 0 => None,
            Ok(entry) => FileEntry::from_entry(&entry, root).transpose(),
            Err(e) => Some(Err(io::Error::from(e))),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_walk_directory() -> io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::create_dir(temp_dir.path().join("subdir"))?;
        fs::write(temp_dir.path().join("file1.txt"), b"content1")?;
        fs::write(temp_dir.path().join("subdir/file2.txt"), b"content2")?;

        let files: Vec<FileEntry> = walk_entries(temp_dir.path(), |_, _| false).collect::<io::Result<_>>()?;
        let names: Vec<_> = files.iter().map(|f| f.relative_path.clone()).collect();
        assert_eq!(names, vec![PathBuf::from("file1.txt"), PathBuf::from("subdir/file2.txt")]);

        Ok(())
    }

    #[test]
    fn test_excluded_directory_is_pruned() -> io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::create_dir(temp_dir.path().join("pg_wal"))?;
        fs::write(temp_dir.path().join("pg_wal/000000010000000000000001"), b"wal")?;
        fs::write(temp_dir.path().join("keep"), b"keep")?;

        let mut seen = Vec::new();
        let files: Vec<FileEntry> = walk_entries(temp_dir.path(), |path, _| {
            seen.push(path.to_path_buf());
            path.starts_with("pg_wal")
        })
        .collect::<io::Result<_>>()?;

        assert_eq!(files.len(), 1);
        assert_eq!(files[0].relative_path, PathBuf::from("keep"));
        assert!(!seen.iter().any(|p| p.starts_with("pg_wal/")));

        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn test_symlinks_are_not_followed() -> io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join("target"), b"data")?;
        std::os::unix::fs::symlink("target", temp_dir.path().join("link"))?;

        let files: Vec<FileEntry> = walk_entries(temp_dir.path(), |_, _| false).collect::<io::Result<_>>()?;
        let link = files.iter().find(|f| f.relative_path == Path::new("link")).unwrap();
        assert_eq!(link.kind, EntryKind::Symlink(PathBuf::from("target")));

        Ok(())
    }
}
