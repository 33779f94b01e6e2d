use crate::fs::{walk_entries, EntryKind, FileEntry};
use crate::runtime::CancelScope;
use crate::utils::errors::Result;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{self, BufWriter, Read};
use std::path::Path;
use tar::{Builder, EntryType, Header};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveStats {
    pub entries: u64,
    /// Uncompressed payload bytes
    pub bytes: u64,
}

/// Write `entries` in iteration order into a new `.tar.gz` at `output`.
///
/// A file whose size changed since it was scanned is archived at its current
/// size. A partial archive is left behind on error; removing it is up to the
/// caller.
pub fn write_archive<I>(scope: &CancelScope, output: &Path, entries: I, level: u32) -> Result<ArchiveStats>
where
    I: IntoIterator<Item = io::Result<FileEntry>>,
{
    let file = File::create(output)?;
    let encoder = GzEncoder::new(BufWriter::with_capacity(256 * 1024, file), Compression::new(level.min(9)));
    let mut builder = Builder::new(encoder);
    builder.follow_symlinks(false);

    let mut stats = ArchiveStats::default();
    for entry in entries {
        scope.check()?;
        let entry = entry?;
        match &entry.kind {
            EntryKind::File => {
                let written = append_file(&mut builder, &entry)?;
                stats.bytes += written;
            }
            EntryKind::Symlink(target) => {
                let mut header = Header::new_gnu();
                header.set_entry_type(EntryType::Symlink);
                header.set_size(0);
                header.set_mode(0o777);
                header.set_mtime(entry.metadata.mtime_secs());
                builder.append_link(&mut header, &entry.relative_path, target)?;
            }
        }
        stats.entries += 1;
    }

    let encoder = builder.into_inner()?;
    let writer = encoder.finish()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;

    debug!(output = %output.display(), entries = stats.entries, bytes = stats.bytes, "Archive written");
    Ok(stats)
}

fn append_file<W: io::Write>(builder: &mut Builder<W>, entry: &FileEntry) -> Result<u64> {
    let file = File::open(&entry.absolute_path)?;
    let current = file.metadata()?;
    let size = current.len();
    if size != entry.metadata.size {
        warn!(
            path = %entry.relative_path.display(),
            scanned = entry.metadata.size,
            current = size,
            "File size changed since scan, archiving current size"
        );
    }

    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(size);
    header.set_mtime(entry.metadata.mtime_secs());
    header.set_mode(entry.metadata.mode.unwrap_or(0o644));
    builder.append_data(&mut header, &entry.relative_path, file.take(size))?;
    Ok(size)
}

/// Archive every file below `root`
pub fn pack_directory(scope: &CancelScope, root: &Path, output: &Path, level: u32) -> Result<ArchiveStats> {
    write_archive(scope, output, walk_entries(root, |_, _| false), level)
}
