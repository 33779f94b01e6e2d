//! Archive and restore commands for WAL files.
//!
//! The database calls the archive command once per finished segment. Each
//! segment is optionally gzip-compressed, then optionally sealed with
//! AES-256-GCM, and lands in the archive directory via a scratch file in
//! `.tmp/` and a rename, so a partially written copy never shadows a good
//! one. Timeline history files and other auxiliary WAL files are stored
//! verbatim.

use super::segment::{parse_history_name, parse_segment_name, ArchiveMode, WalSegmentRecord, SEGMENT_NAME_LEN};
use crate::checksum::sha256_bytes;
use crate::compress::{gunzip_bytes, gzip_bytes};
use crate::config::WalConfig;
use crate::crypto::key::{derive_key, random_bytes, WAL_KDF_ITERATIONS};
use crate::crypto::{decrypt_segment, encrypt_segment, EncryptionKey, SALT_SIZE};
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// Salt for passphrase-derived WAL keys, created once per archive directory
pub const SALT_FILE: &str = ".wal-key-salt";
const SCRATCH_DIR: &str = ".tmp";

/// Key material for encrypted WAL
#[derive(Clone)]
pub enum WalKey {
    Raw(EncryptionKey),
    Passphrase(String),
}

#[derive(Debug, Clone)]
pub struct ArchivedFile {
    pub archive_path: PathBuf,
    pub original_size: u64,
    pub archived_size: u64,
    pub mode: ArchiveMode,
    /// The identical file was already archived
    pub already_present: bool,
}

pub struct WalArchiver {
    archive_dir: PathBuf,
    mode: ArchiveMode,
    level: u32,
    key: Option<EncryptionKey>,
}

impl std::fmt::Debug for WalArchiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalArchiver")
            .field("archive_dir", &self.archive_dir)
            .field("mode", &self.mode)
            .field("has_key", &self.key.is_some())
            .finish()
    }
}

impl WalArchiver {
    pub fn new(archive_dir: impl Into<PathBuf>, mode: ArchiveMode, level: u32, key: Option<WalKey>) -> Result<Self> {
        let archive_dir = archive_dir.into();
        if mode.encrypted && key.is_none() {
            return Err(EngineError::Config(
                "WAL encryption is enabled but no key or passphrase is configured".to_string(),
            ));
        }
        let key = match key {
            Some(WalKey::Raw(key)) => Some(key),
            Some(WalKey::Passphrase(passphrase)) => {
                fs::create_dir_all(&archive_dir)?;
                let salt = load_or_create_salt(&archive_dir)?;
                Some(derive_key(&passphrase, &salt, WAL_KDF_ITERATIONS))
            }
            None => None,
        };
        Ok(Self {
            archive_dir,
            mode,
            level,
            key,
        })
    }

    /// `[wal]` settings; a key file wins over the passphrase
    pub fn from_config(config: &WalConfig, passphrase: Option<&str>) -> Result<Self> {
        let key = match (&config.key_file, passphrase) {
            (Some(path), _) => Some(WalKey::Raw(EncryptionKey::from_file(path)?)),
            (None, Some(p)) if !p.is_empty() => Some(WalKey::Passphrase(p.to_string())),
            _ => None,
        };
        let mode = ArchiveMode {
            compressed: config.compress,
            encrypted: config.encrypt,
        };
        // a key is only derived when something may need it
        let key = if config.encrypt || config.key_file.is_some() { key } else { None };
        Self::new(config.archive_dir.clone(), mode, config.compression_level, key)
    }

    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    /// Archive `source` under `name`. Re-archiving identical content
    /// succeeds; different content under an existing name is an integrity
    /// error.
    pub fn archive_file(&self, source: &Path, name: &str) -> Result<ArchivedFile> {
        let verbatim = match classify(name)? {
            WalFileKind::Segment => false,
            WalFileKind::Auxiliary => true,
        };
        let data = fs::read(source).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => EngineError::FileNotFound(source.display().to_string()),
            _ => e.into(),
        })?;
        fs::create_dir_all(&self.archive_dir)?;

        if let Some((existing, existing_mode)) = self.find_archived(name) {
            let stored = fs::read(&existing)?;
            let decoded = self.decode(&stored, existing_mode)?;
            if sha256_bytes(&decoded) == sha256_bytes(&data) {
                info!(file = %name, "WAL file already archived with identical content");
                return Ok(ArchivedFile {
                    archive_path: existing,
                    original_size: data.len() as u64,
                    archived_size: stored.len() as u64,
                    mode: existing_mode,
                    already_present: true,
                });
            }
            return Err(EngineError::Integrity(format!(
                "{} is already archived with different content",
                name
            )));
        }

        let mode = if verbatim { ArchiveMode::default() } else { self.mode };
        let encoded = self.encode(&data, mode)?;
        let archive_path = self.archive_dir.join(mode.archived_name(name));
        write_atomic(&self.archive_dir.join(SCRATCH_DIR), &archive_path, &encoded)?;

        info!(
            file = %name,
            original = data.len(),
            archived = encoded.len(),
            compressed = mode.compressed,
            encrypted = mode.encrypted,
            "WAL file archived"
        );
        Ok(ArchivedFile {
            archive_path,
            original_size: data.len() as u64,
            archived_size: encoded.len() as u64,
            mode,
            already_present: false,
        })
    }

    /// Counterpart of the archive command: decode `name` into `dest`.
    pub fn restore_file(&self, name: &str, dest: &Path) -> Result<()> {
        classify(name)?;
        let (path, mode) = self
            .find_archived(name)
            .ok_or_else(|| EngineError::FileNotFound(format!("{} is not in the WAL archive", name)))?;
        let decoded = self.decode(&fs::read(&path)?, mode)?;

        let scratch = dest.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
        write_atomic(scratch, dest, &decoded)?;
        debug!(file = %name, dest = %dest.display(), "WAL file restored");
        Ok(())
    }

    /// The stored copy of `name`, probing the most processed variant first
    pub fn find_archived(&self, name: &str) -> Option<(PathBuf, ArchiveMode)> {
        ArchiveMode::ALL.into_iter().find_map(|mode| {
            let path = self.archive_dir.join(mode.archived_name(name));
            path.is_file().then_some((path, mode))
        })
    }

    pub fn list_segments(&self) -> Result<Vec<WalSegmentRecord>> {
        list_segments(&self.archive_dir)
    }

    fn encode(&self, data: &[u8], mode: ArchiveMode) -> Result<Vec<u8>> {
        let mut bytes = if mode.compressed {
            gzip_bytes(data, self.level)?
        } else {
            data.to_vec()
        };
        if mode.encrypted {
            bytes = encrypt_segment(&bytes, self.require_key()?)?;
        }
        Ok(bytes)
    }

    fn decode(&self, stored: &[u8], mode: ArchiveMode) -> Result<Vec<u8>> {
        let bytes = if mode.encrypted {
            decrypt_segment(stored, self.require_key()?)?
        } else {
            stored.to_vec()
        };
        if mode.compressed {
            Ok(gunzip_bytes(&bytes)?)
        } else {
            Ok(bytes)
        }
    }

    fn require_key(&self) -> Result<&EncryptionKey> {
        self.key
            .as_ref()
            .ok_or_else(|| EngineError::Config("encrypted WAL requires a key or passphrase".to_string()))
    }
}

enum WalFileKind {
    Segment,
    /// `.history`, `.partial` and `.backup` files
    Auxiliary,
}

fn classify(name: &str) -> Result<WalFileKind> {
    if parse_segment_name(name).is_ok() {
        return Ok(WalFileKind::Segment);
    }
    if parse_history_name(name).is_some() {
        return Ok(WalFileKind::Auxiliary);
    }
    let has_segment_prefix = name.len() > SEGMENT_NAME_LEN
        && name.is_char_boundary(SEGMENT_NAME_LEN)
        && parse_segment_name(&name[..SEGMENT_NAME_LEN]).is_ok();
    if has_segment_prefix && (name.ends_with(".partial") || name.ends_with(".backup")) && !name.contains('/') {
        return Ok(WalFileKind::Auxiliary);
    }
    Err(EngineError::Config(format!("'{}' is not a WAL file name", name)))
}

fn write_atomic(scratch_dir: &Path, dest: &Path, bytes: &[u8]) -> Result<()> {
    fs::create_dir_all(scratch_dir)?;
    let mut tmp = NamedTempFile::new_in(scratch_dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| e.error)?;
    if let Some(parent) = dest.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

/// Read the directory's salt, creating it on first use. Concurrent
/// creators race on `create_new`; the loser reads the winner's salt.
pub fn load_or_create_salt(archive_dir: &Path) -> Result<[u8; SALT_SIZE]> {
    let path = archive_dir.join(SALT_FILE);
    match fs::read(&path) {
        Ok(bytes) if bytes.len() == SALT_SIZE => {
            let mut salt = [0u8; SALT_SIZE];
            salt.copy_from_slice(&bytes);
            return Ok(salt);
        }
        Ok(bytes) => {
            return Err(EngineError::Integrity(format!(
                "{} holds {} bytes, expected {}",
                path.display(),
                bytes.len(),
                SALT_SIZE
            )));
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let salt = random_bytes::<SALT_SIZE>();
    match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
        Ok(mut file) => {
            file.write_all(&salt)?;
            file.sync_all()?;
            Ok(salt)
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => load_or_create_salt(archive_dir),
        Err(e) => Err(e.into()),
    }
}

/// Archived segments in `archive_dir`, ordered by timeline then index
pub fn list_segments(archive_dir: &Path) -> Result<Vec<WalSegmentRecord>> {
    let mut records = Vec::new();
    let entries = match fs::read_dir(archive_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(records),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        let archived = entry.file_name().to_string_lossy().to_string();
        let (name, mode) = ArchiveMode::split(&archived);
        let Ok((timeline, segment)) = parse_segment_name(name) else {
            continue;
        };
        let archived_at: DateTime<Utc> = meta.modified().map(DateTime::from).unwrap_or_else(|_| Utc::now());
        records.push(WalSegmentRecord {
            file_name: name.to_string(),
            timeline,
            segment,
            archive_path: entry.path(),
            original_size: None,
            archived_size: meta.len(),
            compressed: mode.compressed,
            encrypted: mode.encrypted,
            archived_at,
        });
    }
    records.sort_by_key(|r| (r.timeline, r.segment));
    Ok(records)
}
