//! Age-based cleanup of backup artifacts and archived WAL segments, always
//! keeping a configurable floor of the newest entries.

use crate::config::{RetentionConfig, WalConfig};
use crate::metadata::{list_artifacts, metadata_path};
use crate::utils::errors::Result;
use crate::wal::archiver::list_segments;
use chrono::{DateTime, Duration, Utc};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Legacy sidecars written by older releases next to the artifact
const LEGACY_SIDECARS: [&str; 2] = [".sha256", ".info"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub retention_days: u32,
    /// Never delete below this many entries
    pub min_keep: usize,
    pub dry_run: bool,
}

impl RetentionPolicy {
    pub fn for_backups(config: &RetentionConfig, dry_run: bool) -> Self {
        Self {
            retention_days: config.retention_days,
            min_keep: config.min_backups,
            dry_run,
        }
    }

    pub fn for_wal(config: &WalConfig, dry_run: bool) -> Self {
        Self {
            retention_days: config.retention_days,
            min_keep: config.min_segments,
            dry_run,
        }
    }

    fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(i64::from(self.retention_days))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub examined: usize,
    /// Deleted, or in a dry run, the entries that would have been
    pub deleted: Vec<PathBuf>,
    pub bytes_freed: u64,
    pub dry_run: bool,
}

/// Oldest-first selection shared by both cleanups: entries older than the
/// cutoff, stopping once only `min_keep` would remain.
fn select_expired<T>(entries: &[T], policy: &RetentionPolicy, now: DateTime<Utc>, at: impl Fn(&T) -> DateTime<Utc>) -> Vec<usize> {
    let cutoff = policy.cutoff(now);
    let mut remaining = entries.len();
    let mut expired = Vec::new();
    for (index, entry) in entries.iter().enumerate() {
        if remaining <= policy.min_keep {
            break;
        }
        if at(entry) < cutoff {
            expired.push(index);
            remaining -= 1;
        }
    }
    expired
}

fn remove_if_present(path: &Path) -> io::Result<u64> {
    let size = match std::fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    std::fs::remove_file(path)?;
    debug!(path = %path.display(), "Removed");
    Ok(size)
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Delete expired backups in `dir` along with their sidecars
pub fn cleanup_backups(dir: &Path, policy: &RetentionPolicy, now: DateTime<Utc>) -> Result<CleanupReport> {
    let artifacts = list_artifacts(dir)?;
    let mut report = CleanupReport {
        examined: artifacts.len(),
        dry_run: policy.dry_run,
        ..CleanupReport::default()
    };

    for index in select_expired(&artifacts, policy, now, |a| a.timestamp) {
        let artifact = &artifacts[index];
        if policy.dry_run {
            info!(artifact = %artifact.artifact.display(), "Would delete expired backup");
            report.bytes_freed += artifact.size_bytes;
            report.deleted.push(artifact.artifact.clone());
            continue;
        }
        let mut freed = remove_if_present(&artifact.artifact)?;
        freed += remove_if_present(&metadata_path(&artifact.artifact))?;
        for suffix in LEGACY_SIDECARS {
            let legacy = with_suffix(&artifact.artifact, suffix);
            if let Err(e) = remove_if_present(&legacy) {
                warn!(path = %legacy.display(), error = %e, "Failed to remove legacy sidecar");
            }
        }
        info!(
            artifact = %artifact.artifact.display(),
            database = %artifact.database,
            age_days = (now - artifact.timestamp).num_days(),
            "Deleted expired backup"
        );
        report.bytes_freed += freed;
        report.deleted.push(artifact.artifact.clone());
    }

    info!(
        examined = report.examined,
        deleted = report.deleted.len(),
        bytes_freed = report.bytes_freed,
        dry_run = report.dry_run,
        "Backup retention finished"
    );
    Ok(report)
}

/// Delete archived WAL segments older than the policy by archive time.
/// History and other auxiliary files are never touched.
pub fn cleanup_wal(archive_dir: &Path, policy: &RetentionPolicy, now: DateTime<Utc>) -> Result<CleanupReport> {
    let mut segments = list_segments(archive_dir)?;
    segments.sort_by_key(|s| s.archived_at);
    let mut report = CleanupReport {
        examined: segments.len(),
        dry_run: policy.dry_run,
        ..CleanupReport::default()
    };

    for index in select_expired(&segments, policy, now, |s| s.archived_at) {
        let segment = &segments[index];
        if !policy.dry_run {
            remove_if_present(&segment.archive_path)?;
        }
        report.bytes_freed += segment.archived_size;
        report.deleted.push(segment.archive_path.clone());
    }

    info!(
        examined = report.examined,
        deleted = report.deleted.len(),
        bytes_freed = report.bytes_freed,
        dry_run = report.dry_run,
        "WAL retention finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::DatabaseType;
    use crate::fs::metadata::apply_mtime;
    use crate::metadata::BackupManifest;
    use std::time::SystemTime;
    use tempfile::TempDir;

    fn backup_aged(dir: &Path, name: &str, now: DateTime<Utc>, days: i64) -> Result<PathBuf> {
        let artifact = dir.join(name);
        std::fs::write(&artifact, vec![b'x'; 100])?;
        let mut manifest = BackupManifest::for_artifact(&artifact, "app", DatabaseType::Postgres)?;
        manifest.timestamp = now - Duration::days(days);
        manifest.save()?;
        Ok(artifact)
    }

    #[test]
    fn test_minimum_backups_survive() -> Result<()> {
        let dir = TempDir::new()?;
        let now = Utc::now();
        let mut artifacts = Vec::new();
        for (i, age) in [40, 35, 31, 2].iter().enumerate() {
            artifacts.push(backup_aged(dir.path(), &format!("db_app_{}.dump", i), now, *age)?);
        }
        std::fs::write(with_suffix(&artifacts[0], ".sha256"), b"legacy")?;
        std::fs::write(with_suffix(&artifacts[0], ".info"), b"legacy")?;

        let policy = RetentionPolicy {
            retention_days: 30,
            min_keep: 2,
            dry_run: false,
        };
        let report = cleanup_backups(dir.path(), &policy, now)?;
        assert_eq!(report.examined, 4);
        assert_eq!(report.deleted, artifacts[..2].to_vec());
        assert!(report.bytes_freed >= 200);

        assert!(!artifacts[0].exists());
        assert!(!metadata_path(&artifacts[0]).exists());
        assert!(!with_suffix(&artifacts[0], ".sha256").exists());
        assert!(!with_suffix(&artifacts[0], ".info").exists());
        // third one is expired too but the floor keeps it
        assert!(artifacts[2].exists());
        assert!(artifacts[3].exists());
        Ok(())
    }

    #[test]
    fn test_dry_run_deletes_nothing() -> Result<()> {
        let dir = TempDir::new()?;
        let now = Utc::now();
        let old = backup_aged(dir.path(), "db_app_old.dump", now, 90)?;
        backup_aged(dir.path(), "db_app_new.dump", now, 1)?;

        let policy = RetentionPolicy {
            retention_days: 30,
            min_keep: 0,
            dry_run: true,
        };
        let report = cleanup_backups(dir.path(), &policy, now)?;
        assert_eq!(report.deleted, vec![old.clone()]);
        assert_eq!(report.bytes_freed, 100);
        assert!(old.exists());
        assert!(metadata_path(&old).exists());
        Ok(())
    }

    #[test]
    fn test_at_or_below_floor_is_untouched() -> Result<()> {
        let dir = TempDir::new()?;
        let now = Utc::now();
        let only = backup_aged(dir.path(), "db_app_only.dump", now, 400)?;
        let policy = RetentionPolicy {
            retention_days: 1,
            min_keep: 1,
            dry_run: false,
        };
        assert!(cleanup_backups(dir.path(), &policy, now)?.deleted.is_empty());
        assert!(only.exists());
        Ok(())
    }

    #[test]
    fn test_wal_cleanup_skips_history_files() -> Result<()> {
        let dir = TempDir::new()?;
        let now = Utc::now();
        let old_time = SystemTime::now() - std::time::Duration::from_secs(20 * 86400);
        let old = dir.path().join("000000010000000000000001.gz");
        let recent = dir.path().join("000000010000000000000002");
        let history = dir.path().join("00000002.history");
        for path in [&old, &recent, &history] {
            std::fs::write(path, b"wal")?;
        }
        apply_mtime(&old, old_time)?;
        apply_mtime(&history, old_time)?;

        let policy = RetentionPolicy {
            retention_days: 7,
            min_keep: 0,
            dry_run: false,
        };
        let report = cleanup_wal(dir.path(), &policy, now)?;
        assert_eq!(report.examined, 2);
        assert_eq!(report.deleted, vec![old.clone()]);
        assert!(!old.exists());
        assert!(recent.exists());
        assert!(history.exists());
        Ok(())
    }
}
