use crate::fs::metadata::{apply_mode, FileMetadata};
use crate::runtime::CancelScope;
use crate::utils::errors::{EngineError, Result};
use flate2::read::MultiGzDecoder;
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, EntryType};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractStats {
    pub files: u64,
    pub directories: u64,
    pub symlinks: u64,
    pub skipped: u64,
    pub bytes: u64,
}

fn open(archive: &Path) -> Result<Archive<MultiGzDecoder<BufReader<File>>>> {
    let file = File::open(archive)?;
    Ok(Archive::new(MultiGzDecoder::new(BufReader::with_capacity(256 * 1024, file))))
}

/// Lexically clean an entry name into a relative path. `.` components are
/// dropped; `..`, a root or a drive prefix make the entry unsafe.
pub fn sanitize_entry_path(name: &Path) -> Result<PathBuf> {
    let mut clean = PathBuf::new();
    for component in name.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => clean.push(part),
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(EngineError::Integrity(format!(
                    "archive entry '{}' escapes the target directory",
                    name.display()
                )));
            }
        }
    }
    Ok(clean)
}

fn create_parent_dirs(path: &Path) -> io::Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o755);
    }
    builder.create(parent)
}

/// Entry paths of an archive, in archive order
pub fn list_entries(archive: &Path) -> Result<Vec<PathBuf>> {
    let mut reader = open(archive)?;
    let mut names = Vec::new();
    for entry in reader.entries()? {
        let entry = entry?;
        let path = sanitize_entry_path(&entry.path()?)?;
        if !path.as_os_str().is_empty() && entry.header().entry_type() != EntryType::Directory {
            names.push(path);
        }
    }
    Ok(names)
}

/// Extract `archive` into `target`. Entries are applied in order, so a later
/// entry overwrites an earlier one with the same path.
pub fn extract_archive(scope: &CancelScope, archive: &Path, target: &Path) -> Result<ExtractStats> {
    fs::create_dir_all(target)?;
    let root = target.canonicalize()?;
    let mut reader = open(archive)?;
    let mut stats = ExtractStats::default();

    for entry in reader.entries()? {
        scope.check()?;
        let mut entry = entry?;
        let name = entry.path()?.into_owned();
        let relative = sanitize_entry_path(&name)?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let dest = root.join(&relative);

        create_parent_dirs(&dest)?;
        if let Some(parent) = dest.parent() {
            // a symlinked directory inside the target must not redirect writes
            if !parent.canonicalize()?.starts_with(&root) {
                return Err(EngineError::Integrity(format!(
                    "archive entry '{}' resolves outside the target directory",
                    name.display()
                )));
            }
        }

        let header = entry.header();
        let entry_type = header.entry_type();
        let mode = header.mode().ok();
        let mtime = header.mtime().unwrap_or(0);

        match entry_type {
            EntryType::Directory => {
                fs::create_dir_all(&dest)?;
                if let Some(mode) = mode {
                    apply_mode(&dest, mode & 0o7777)?;
                }
                stats.directories += 1;
            }
            EntryType::Regular | EntryType::Continuous | EntryType::GNUSparse => {
                if fs::symlink_metadata(&dest).is_ok_and(|m| m.file_type().is_symlink()) {
                    fs::remove_file(&dest)?;
                }
                let mut file = File::create(&dest)?;
                let written = io::copy(&mut entry, &mut file)?;
                if let Some(mode) = mode {
                    apply_mode(&dest, mode & 0o7777)?;
                }
                let meta = FileMetadata::from_parts(written, mtime, mode);
                if let Err(e) = file.set_modified(meta.mtime) {
                    warn!(path = %dest.display(), error = %e, "Failed to restore modification time");
                }
                stats.files += 1;
                stats.bytes += written;
            }
            EntryType::Symlink => {
                let Some(link) = entry.link_name()?.map(|l| l.into_owned()) else {
                    warn!(path = %relative.display(), "Symlink entry without a target, skipping");
                    stats.skipped += 1;
                    continue;
                };
                if let Err(e) = create_symlink(&link, &dest) {
                    warn!(path = %relative.display(), target = %link.display(), error = %e, "Failed to create symlink");
                    stats.skipped += 1;
                } else {
                    stats.symlinks += 1;
                }
            }
            other => {
                debug!(path = %relative.display(), entry_type = ?other, "Skipping unsupported archive entry");
                stats.skipped += 1;
            }
        }
    }

    debug!(archive = %archive.display(), files = stats.files, bytes = stats.bytes, "Archive extracted");
    Ok(stats)
}

#[cfg(unix)]
fn create_symlink(link: &Path, dest: &Path) -> io::Result<()> {
    if fs::symlink_metadata(dest).is_ok() {
        fs::remove_file(dest)?;
    }
    std::os::unix::fs::symlink(link, dest)
}

#[cfg(not(unix))]
fn create_symlink(_link: &Path, _dest: &Path) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "symlinks are not supported on this platform"))
}
