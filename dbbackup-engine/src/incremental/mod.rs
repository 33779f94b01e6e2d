//! Physical full and incremental backups of a data directory.
//!
//! A full backup archives every non-excluded file. An incremental backup
//! archives only files modified after its base was taken and records the
//! chain back to the full backup; restore verifies every link of that chain
//! by SHA-256 before anything is extracted.

pub mod exclude;

use crate::adapter::DatabaseType;
use crate::archive::{extract_archive, write_archive};
use crate::checksum::sha256_file;
use crate::fs::{walk_entries, FileEntry};
use crate::metadata::{timestamp_suffix, BackupManifest, BackupType, CompressionKind, IncrementalInfo};
use crate::runtime::{run_blocking, CancelScope};
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::{Instant, SystemTime};
use tracing::{info, warn};

/// Files below `data_dir` modified strictly after `since`, lazily.
pub fn find_changed_files<'a>(
    kind: DatabaseType,
    data_dir: &'a Path,
    since: DateTime<Utc>,
) -> impl Iterator<Item = io::Result<FileEntry>> + 'a {
    let since = SystemTime::from(since);
    walk_entries(data_dir, move |path, file_type| exclude::is_excluded(kind, path, file_type)).filter(
        move |entry| match entry {
            Ok(entry) => entry.is_file() && entry.metadata.mtime > since,
            Err(_) => true,
        },
    )
}

/// Lexical cleanup: drops `.` and resolves `..` against earlier components
pub fn clean_path(path: &Path) -> PathBuf {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !clean.pop() {
                    clean.push("..");
                }
            }
            other => clean.push(other.as_os_str()),
        }
    }
    clean
}

#[derive(Debug, Clone)]
pub struct IncrementalEngine {
    kind: DatabaseType,
    compression_level: u32,
}

impl IncrementalEngine {
    pub fn new(kind: DatabaseType, compression_level: u32) -> Self {
        Self {
            kind,
            compression_level,
        }
    }

    /// Archive the whole data directory as `<db>_full_<ts>.tar.gz`
    pub async fn create_full_backup(
        &self,
        scope: &CancelScope,
        database: &str,
        data_dir: &Path,
        backup_dir: &Path,
    ) -> Result<BackupManifest> {
        if !data_dir.is_dir() {
            return Err(EngineError::Preflight(format!(
                "data directory {} does not exist",
                data_dir.display()
            )));
        }
        std::fs::create_dir_all(backup_dir)?;
        let output = backup_dir.join(format!("{}_full_{}.tar.gz", database, timestamp_suffix()));
        // taken before the walk so changes made during it land in the next incremental
        let started_at = Utc::now();
        let started = Instant::now();
        info!(database = %database, data_dir = %data_dir.display(), "Starting full physical backup");

        let (kind, level, scope, dir, out) = (
            self.kind,
            self.compression_level,
            scope.clone(),
            data_dir.to_path_buf(),
            output.clone(),
        );
        let database_name = database.to_string();
        let manifest = run_blocking(move || {
            let entries = walk_entries(&dir, |path, ft| exclude::is_excluded(kind, path, ft));
            let stats = write_archive(&scope, &out, entries, level).inspect_err(|_| {
                let _ = std::fs::remove_file(&out);
            })?;

            let mut manifest = BackupManifest::for_artifact(&out, &database_name, kind)?;
            manifest.timestamp = started_at;
            manifest.compression = CompressionKind::Gzip;
            manifest.backup_type = BackupType::Full;
            manifest.duration_seconds = started.elapsed().as_secs_f64();
            manifest
                .extra_info
                .insert("data_directory".to_string(), dir.display().to_string());
            manifest.extra_info.insert("file_count".to_string(), stats.entries.to_string());
            Ok(manifest)
        })
        .await?;

        save_manifest(&manifest);
        info!(artifact = %output.display(), size = manifest.size_bytes, "Full physical backup complete");
        Ok(manifest)
    }

    /// Archive the files changed since `base_artifact` was taken as
    /// `<db>_incr_<ts>.tar.gz` next to the base. Fails with
    /// [`EngineError::NoChanges`] when nothing changed.
    pub async fn create_incremental_backup(
        &self,
        scope: &CancelScope,
        base_artifact: &Path,
        data_dir: &Path,
    ) -> Result<BackupManifest> {
        let base = BackupManifest::load(base_artifact)?;
        if !data_dir.is_dir() {
            return Err(EngineError::Preflight(format!(
                "data directory {} does not exist",
                data_dir.display()
            )));
        }

        let backup_dir = base_artifact.parent().map(Path::to_path_buf).unwrap_or_default();
        let output = backup_dir.join(format!("{}_incr_{}.tar.gz", base.database, timestamp_suffix()));
        let started_at = Utc::now();
        let started = Instant::now();
        info!(base = %base_artifact.display(), since = %base.timestamp, "Starting incremental backup");

        let (kind, level, scope, dir, out, base_path) = (
            self.kind,
            self.compression_level,
            scope.clone(),
            data_dir.to_path_buf(),
            output.clone(),
            base_artifact.to_path_buf(),
        );
        let since = base.timestamp;
        let (stats, base_sha) = run_blocking(move || {
            let mut changed = find_changed_files(kind, &dir, since).peekable();
            if changed.peek().is_none() {
                return Err(EngineError::NoChanges);
            }
            let stats = write_archive(&scope, &out, changed, level).inspect_err(|_| {
                let _ = std::fs::remove_file(&out);
            })?;
            Ok((stats, sha256_file(&base_path)?))
        })
        .await?;

        let file_name = file_name_of(&output);
        let base_name = file_name_of(base_artifact);
        let backup_chain = match (&base.backup_type, &base.incremental) {
            (BackupType::Incremental, Some(info)) => {
                let mut chain = info.backup_chain.clone();
                chain.push(file_name.clone());
                chain
            }
            _ => vec![base_name.clone(), file_name.clone()],
        };

        let out = output.clone();
        let mut manifest = run_blocking(move || BackupManifest::for_artifact(&out, &base.database, kind)).await?;
        manifest.timestamp = started_at;
        manifest.compression = CompressionKind::Gzip;
        manifest.backup_type = BackupType::Incremental;
        manifest.base_backup = Some(base_name.clone());
        manifest.duration_seconds = started.elapsed().as_secs_f64();
        manifest.incremental = Some(IncrementalInfo {
            base_backup_id: base_sha,
            base_backup_path: base_name,
            base_backup_timestamp: since,
            incremental_files: stats.entries,
            total_size: stats.bytes,
            backup_chain,
        });

        save_manifest(&manifest);
        info!(
            artifact = %output.display(),
            files = stats.entries,
            bytes = stats.bytes,
            "Incremental backup complete"
        );
        Ok(manifest)
    }

    /// Extract `base` and then `incremental` over it into `target`.
    pub async fn restore_incremental(
        &self,
        scope: &CancelScope,
        base_artifact: &Path,
        incremental_artifact: &Path,
        target: &Path,
    ) -> Result<()> {
        let incremental = BackupManifest::load(incremental_artifact)?;
        let info = incremental_info(&incremental)?;

        let expected_base = incremental_artifact.with_file_name(&info.base_backup_path);
        if clean_path(&expected_base) != clean_path(base_artifact) {
            warn!(
                expected = %expected_base.display(),
                supplied = %base_artifact.display(),
                "Base path differs from the one recorded in the incremental manifest"
            );
        }

        let base = BackupManifest::load(base_artifact)?;
        if base.backup_type != BackupType::Full {
            return Err(EngineError::ChainInconsistency(format!(
                "{} is not a full backup",
                base_artifact.display()
            )));
        }
        if !base.sha256.is_empty() && !info.base_backup_id.is_empty() && base.sha256 != info.base_backup_id {
            return Err(EngineError::ChainInconsistency(format!(
                "base {} has checksum {} but the incremental expects {}",
                base_artifact.display(),
                base.sha256,
                info.base_backup_id
            )));
        }

        let (scope, base_path, incr_path, target, expected_id) = (
            scope.clone(),
            base_artifact.to_path_buf(),
            incremental_artifact.to_path_buf(),
            target.to_path_buf(),
            info.base_backup_id.clone(),
        );
        run_blocking(move || {
            verify_link(&base_path, &expected_id)?;
            verify_own_checksum(&incr_path, &incremental.sha256)?;
            extract_archive(&scope, &base_path, &target)?;
            extract_archive(&scope, &incr_path, &target)?;
            Ok(())
        })
        .await?;

        info!(incremental = %incremental_artifact.display(), "Incremental restore complete");
        Ok(())
    }

    /// Restore the full chain ending at `incremental_artifact` into `target`.
    /// Every link is verified before anything is extracted.
    pub async fn restore_chain(&self, scope: &CancelScope, incremental_artifact: &Path, target: &Path) -> Result<()> {
        let tip = BackupManifest::load(incremental_artifact)?;
        let info = incremental_info(&tip)?;
        let dir = incremental_artifact.parent().map(Path::to_path_buf).unwrap_or_default();

        if info.backup_chain.last().map(String::as_str) != Some(file_name_of(incremental_artifact).as_str()) {
            return Err(EngineError::ChainInconsistency(format!(
                "chain recorded in {} does not end with it",
                incremental_artifact.display()
            )));
        }

        let mut links = Vec::with_capacity(info.backup_chain.len());
        for (index, name) in info.backup_chain.iter().enumerate() {
            let path = dir.join(name);
            let manifest = BackupManifest::load(&path)?;
            match (index, manifest.backup_type) {
                (0, BackupType::Full) => {}
                (0, _) => {
                    return Err(EngineError::ChainInconsistency(format!("chain starts with non-full {}", name)));
                }
                (_, BackupType::Incremental) => {}
                (_, BackupType::Full) => {
                    return Err(EngineError::ChainInconsistency(format!("full backup {} inside a chain", name)));
                }
            }
            links.push((path, manifest));
        }

        let (scope, target) = (scope.clone(), target.to_path_buf());
        let count = links.len();
        run_blocking(move || {
            let mut previous_sha: Option<String> = None;
            for (path, manifest) in &links {
                let actual = verify_own_checksum(path, &manifest.sha256)?;
                if let (Some(expected), Some(prev)) = (manifest.incremental.as_ref(), previous_sha.as_ref()) {
                    if &expected.base_backup_id != prev {
                        return Err(EngineError::ChainInconsistency(format!(
                            "{} was not taken from its predecessor in the chain",
                            path.display()
                        )));
                    }
                }
                previous_sha = Some(actual);
            }
            for (path, _) in &links {
                extract_archive(&scope, path, &target)?;
            }
            Ok(())
        })
        .await?;

        info!(links = count, "Chain restore complete");
        Ok(())
    }
}

fn incremental_info(manifest: &BackupManifest) -> Result<&IncrementalInfo> {
    match (&manifest.backup_type, &manifest.incremental) {
        (BackupType::Incremental, Some(info)) => Ok(info),
        _ => Err(EngineError::ChainInconsistency(format!(
            "{} is not an incremental backup",
            manifest.backup_file
        ))),
    }
}

/// The base on disk must still be the one the incremental was taken from
fn verify_link(base: &Path, expected_id: &str) -> Result<()> {
    if expected_id.is_empty() {
        return Ok(());
    }
    let actual = sha256_file(base)?;
    if actual != expected_id {
        return Err(EngineError::ChainInconsistency(format!(
            "base {} has checksum {} but the incremental expects {}",
            base.display(),
            actual,
            expected_id
        )));
    }
    Ok(())
}

fn verify_own_checksum(artifact: &Path, recorded: &str) -> Result<String> {
    let actual = sha256_file(artifact)?;
    if !recorded.is_empty() && actual != recorded {
        return Err(EngineError::Integrity(format!(
            "{} checksum mismatch: manifest {}, actual {}",
            artifact.display(),
            recorded,
            actual
        )));
    }
    Ok(actual)
}

/// The artifact is the source of truth; a missing sidecar only costs a warning
fn save_manifest(manifest: &BackupManifest) {
    if let Err(e) = manifest.save() {
        warn!(artifact = %manifest.backup_file, error = %e, "Failed to write backup manifest");
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::list_entries;
    use crate::fs::metadata::apply_mtime;
    use std::time::Duration;
    use tempfile::TempDir;

    fn set_age(path: &Path, offset_secs: i64) {
        let now = SystemTime::now();
        let when = if offset_secs >= 0 {
            now + Duration::from_secs(offset_secs as u64)
        } else {
            now - Duration::from_secs(offset_secs.unsigned_abs())
        };
        apply_mtime(path, when).unwrap();
    }

    struct Fixture {
        _root: TempDir,
        data: PathBuf,
        backups: PathBuf,
    }

    fn fixture() -> Fixture {
        let root = TempDir::new().unwrap();
        let data = root.path().join("data");
        let backups = root.path().join("backups");
        std::fs::create_dir_all(&data).unwrap();
        std::fs::write(data.join("a"), b"x").unwrap();
        std::fs::write(data.join("b"), b"y").unwrap();
        set_age(&data.join("a"), -60);
        set_age(&data.join("b"), -60);
        Fixture {
            _root: root,
            data,
            backups,
        }
    }

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path(Path::new("/b/./x/../full.tar.gz")), PathBuf::from("/b/full.tar.gz"));
        assert_ne!(clean_path(Path::new("/b/Full.tar.gz")), clean_path(Path::new("/b/full.tar.gz")));
    }

    #[tokio::test]
    async fn test_incremental_backup_and_restore() -> Result<()> {
        let fx = fixture();
        let engine = IncrementalEngine::new(DatabaseType::Postgres, 6);
        let scope = CancelScope::root();

        let base = engine.create_full_backup(&scope, "testdb", &fx.data, &fx.backups).await?;
        assert!(base.backup_file.contains("testdb_full_"));

        std::fs::write(fx.data.join("a"), b"x2")?;
        std::fs::write(fx.data.join("c"), b"z")?;
        std::fs::write(fx.data.join("postmaster.pid"), b"123")?;
        set_age(&fx.data.join("a"), 10);
        set_age(&fx.data.join("c"), 10);
        set_age(&fx.data.join("postmaster.pid"), 10);

        let mut changed: Vec<PathBuf> = find_changed_files(DatabaseType::Postgres, &fx.data, base.timestamp)
            .map(|e| e.map(|e| e.relative_path))
            .collect::<io::Result<_>>()?;
        changed.sort();
        assert_eq!(changed, vec![PathBuf::from("a"), PathBuf::from("c")]);

        let incr = engine
            .create_incremental_backup(&scope, &base.artifact_path(), &fx.data)
            .await?;
        assert!(incr.backup_file.contains("testdb_incr_"));
        assert_eq!(list_entries(&incr.artifact_path())?, vec![PathBuf::from("a"), PathBuf::from("c")]);

        let info = incr.incremental.as_ref().unwrap();
        assert_eq!(info.base_backup_id, sha256_file(&base.artifact_path())?);
        assert_eq!(info.incremental_files, 2);
        assert_eq!(info.backup_chain, vec![base.artifact_file_name(), incr.artifact_file_name()]);

        let target = fx.backups.join("restored");
        engine
            .restore_incremental(&scope, &base.artifact_path(), &incr.artifact_path(), &target)
            .await?;
        assert_eq!(std::fs::read(target.join("a"))?, b"x2");
        assert_eq!(std::fs::read(target.join("b"))?, b"y");
        assert_eq!(std::fs::read(target.join("c"))?, b"z");

        let chained = fx.backups.join("chained");
        engine.restore_chain(&scope, &incr.artifact_path(), &chained).await?;
        assert_eq!(std::fs::read(chained.join("a"))?, b"x2");
        Ok(())
    }

    #[tokio::test]
    async fn test_no_changes_is_an_error() -> Result<()> {
        let fx = fixture();
        let engine = IncrementalEngine::new(DatabaseType::Postgres, 6);
        let scope = CancelScope::root();
        let base = engine.create_full_backup(&scope, "testdb", &fx.data, &fx.backups).await?;

        let err = engine
            .create_incremental_backup(&scope, &base.artifact_path(), &fx.data)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NoChanges));
        Ok(())
    }

    #[tokio::test]
    async fn test_tampered_base_breaks_the_chain() -> Result<()> {
        let fx = fixture();
        let engine = IncrementalEngine::new(DatabaseType::Postgres, 6);
        let scope = CancelScope::root();
        let base = engine.create_full_backup(&scope, "testdb", &fx.data, &fx.backups).await?;

        std::fs::write(fx.data.join("c"), b"z")?;
        set_age(&fx.data.join("c"), 10);
        let incr = engine
            .create_incremental_backup(&scope, &base.artifact_path(), &fx.data)
            .await?;

        // replace the base artifact but keep its manifest
        let mut bytes = std::fs::read(base.artifact_path())?;
        bytes.push(0);
        std::fs::write(base.artifact_path(), bytes)?;

        let err = engine
            .restore_incremental(&scope, &base.artifact_path(), &incr.artifact_path(), &fx.backups.join("t"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ChainInconsistency(_)));
        assert!(!fx.backups.join("t").exists());
        Ok(())
    }
}
