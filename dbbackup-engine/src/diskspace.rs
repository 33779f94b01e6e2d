//! Free-space checks for backup targets with a short-lived cache.

use crate::config::DiskConfig;
use crate::utils::errors::{EngineError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Raw capacity numbers for the filesystem holding a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskCapacity {
    pub total: u64,
    pub available: u64,
}

pub trait DiskProbe: Send + Sync {
    fn capacity(&self, path: &Path) -> Result<DiskCapacity>;
}

/// `statvfs(2)` on the nearest existing ancestor of the path
#[derive(Debug, Default, Clone, Copy)]
pub struct StatvfsProbe;

#[cfg(unix)]
impl DiskProbe for StatvfsProbe {
    fn capacity(&self, path: &Path) -> Result<DiskCapacity> {
        let existing = nearest_existing(path);
        let stat = nix::sys::statvfs::statvfs(existing.as_path())
            .map_err(|e| EngineError::Io(std::io::Error::from(e)))?;
        let fragment = stat.fragment_size() as u64;
        Ok(DiskCapacity {
            total: (stat.blocks() as u64).saturating_mul(fragment),
            available: (stat.blocks_available() as u64).saturating_mul(fragment),
        })
    }
}

#[cfg(not(unix))]
impl DiskProbe for StatvfsProbe {
    fn capacity(&self, path: &Path) -> Result<DiskCapacity> {
        Err(EngineError::Preflight(format!(
            "disk space probing is not supported on this platform ({})",
            path.display()
        )))
    }
}

fn nearest_existing(path: &Path) -> PathBuf {
    let mut current = path;
    loop {
        if current.exists() {
            return current.to_path_buf();
        }
        match current.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => current = parent,
            _ => return PathBuf::from("."),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiskSpaceCheck {
    pub path: PathBuf,
    pub total: u64,
    pub available: u64,
    pub used: u64,
    pub used_percent: f64,
    pub warning: bool,
    pub critical: bool,
    sampled_at: Instant,
}

impl DiskSpaceCheck {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.sampled_at.elapsed() < ttl
    }
}

pub struct DiskSpaceCache {
    entries: DashMap<PathBuf, DiskSpaceCheck>,
    ttl: Duration,
    warning_percent: f64,
    critical_percent: f64,
    probe: Box<dyn DiskProbe>,
}

impl DiskSpaceCache {
    pub fn new(config: &DiskConfig) -> Self {
        Self::with_probe(config, Box::new(StatvfsProbe))
    }

    pub fn with_probe(config: &DiskConfig, probe: Box<dyn DiskProbe>) -> Self {
        Self {
            entries: DashMap::new(),
            ttl: Duration::from_secs(config.cache_ttl_secs),
            warning_percent: config.warning_percent,
            critical_percent: config.critical_percent,
            probe,
        }
    }

    /// Cached capacity of the filesystem holding `path`
    pub fn check(&self, path: &Path) -> Result<DiskSpaceCheck> {
        let key = path.to_path_buf();
        if let Some(hit) = self.entries.get(&key) {
            if hit.is_fresh(self.ttl) {
                return Ok(hit.clone());
            }
        }
        // the shard stays write-locked while a miss is populated
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_fresh(self.ttl) {
                    return Ok(occupied.get().clone());
                }
                let sample = self.sample(path)?;
                occupied.insert(sample.clone());
                Ok(sample)
            }
            Entry::Vacant(vacant) => {
                let sample = self.sample(path)?;
                vacant.insert(sample.clone());
                Ok(sample)
            }
        }
    }

    /// Preflight: fail when the target filesystem is critically full
    pub fn ensure_capacity(&self, path: &Path) -> Result<DiskSpaceCheck> {
        let check = self.check(path)?;
        if check.critical {
            return Err(EngineError::Preflight(format!(
                "disk space critical at {}: {:.1}% used, {} bytes available",
                path.display(),
                check.used_percent,
                check.available
            )));
        }
        if check.warning {
            warn!(path = %path.display(), used_percent = check.used_percent, "disk space is running low");
        }
        Ok(check)
    }

    pub fn invalidate(&self, path: &Path) {
        self.entries.remove(path);
    }

    fn sample(&self, path: &Path) -> Result<DiskSpaceCheck> {
        let capacity = self.probe.capacity(path)?;
        let used = capacity.total.saturating_sub(capacity.available);
        let used_percent = if capacity.total == 0 {
            0.0
        } else {
            used as f64 / capacity.total as f64 * 100.0
        };
        debug!(path = %path.display(), total = capacity.total, available = capacity.available, "disk space sampled");
        Ok(DiskSpaceCheck {
            path: path.to_path_buf(),
            total: capacity.total,
            available: capacity.available,
            used,
            used_percent,
            warning: used_percent >= self.warning_percent,
            critical: used_percent >= self.critical_percent,
            sampled_at: Instant::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FixedProbe {
        calls: Arc<AtomicUsize>,
        available: u64,
    }

    impl DiskProbe for FixedProbe {
        fn capacity(&self, _path: &Path) -> Result<DiskCapacity> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(DiskCapacity {
                total: 1000,
                available: self.available,
            })
        }
    }

    fn cache(available: u64, ttl_secs: u64) -> (DiskSpaceCache, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let config = DiskConfig {
            cache_ttl_secs: ttl_secs,
            ..DiskConfig::default()
        };
        let probe = FixedProbe {
            calls: calls.clone(),
            available,
        };
        (DiskSpaceCache::with_probe(&config, Box::new(probe)), calls)
    }

    #[test]
    fn test_hits_are_served_from_cache() -> Result<()> {
        let (cache, calls) = cache(500, 30);
        let first = cache.check(Path::new("/backups"))?;
        let second = cache.check(Path::new("/backups"))?;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.used, 500);
        assert!((second.used_percent - 50.0).abs() < 0.01);

        cache.invalidate(Path::new("/backups"));
        cache.check(Path::new("/backups"))?;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[test]
    fn test_expired_entries_are_resampled() -> Result<()> {
        let (cache, calls) = cache(500, 0);
        cache.check(Path::new("/b"))?;
        cache.check(Path::new("/b"))?;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[test]
    fn test_critical_fails_preflight() {
        let (cache, _) = cache(10, 30);
        let err = cache.ensure_capacity(Path::new("/full")).unwrap_err();
        assert!(matches!(err, EngineError::Preflight(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_statvfs_on_missing_child_uses_ancestor() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let capacity = StatvfsProbe.capacity(&dir.path().join("not/yet/created"))?;
        assert!(capacity.total > 0);
        assert!(capacity.available <= capacity.total);
        Ok(())
    }
}
