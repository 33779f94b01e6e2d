//! Cluster manifest: one per cluster archive, listing a member manifest for
//! every database dump inside the archive tree.

use super::manifest::{metadata_path, BackupManifest, MANIFEST_VERSION};
use crate::adapter::DatabaseType;
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterManifest {
    pub version: String,
    pub cluster_name: String,
    pub timestamp: DateTime<Utc>,
    pub database_type: DatabaseType,
    pub host: String,
    pub port: u16,
    pub backup_file: String,
    /// Size of the cluster archive itself
    pub size_bytes: u64,
    #[serde(default)]
    pub sha256: String,
    /// Member artifacts; `backup_file` is relative to the archive root
    pub databases: Vec<BackupManifest>,
    /// Sum of member artifact sizes
    pub total_size: u64,
    #[serde(default)]
    pub duration_seconds: f64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub encrypted: bool,
}

impl ClusterManifest {
    pub fn new(cluster_name: &str, database_type: DatabaseType, host: &str, port: u16, archive: &Path) -> Self {
        Self {
            version: MANIFEST_VERSION.to_string(),
            cluster_name: cluster_name.to_string(),
            timestamp: Utc::now(),
            database_type,
            host: host.to_string(),
            port,
            backup_file: archive.to_string_lossy().to_string(),
            size_bytes: 0,
            sha256: String::new(),
            databases: Vec::new(),
            total_size: 0,
            duration_seconds: 0.0,
            encrypted: false,
        }
    }

    pub fn add_member(&mut self, member: BackupManifest) {
        self.total_size += member.size_bytes;
        self.databases.push(member);
    }

    pub fn archive_path(&self) -> PathBuf {
        PathBuf::from(&self.backup_file)
    }

    pub fn save(&self) -> Result<PathBuf> {
        let path = metadata_path(&self.archive_path());
        super::write_json_atomic(&path, self)?;
        Ok(path)
    }

    pub fn load(archive: &Path) -> Result<Self> {
        let path = metadata_path(archive);
        let content = std::fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                EngineError::FileNotFound(path.display().to_string())
            } else {
                e.into()
            }
        })?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::list_artifacts;
    use tempfile::TempDir;

    #[test]
    fn test_cluster_manifest_round_trip_and_listing() -> Result<()> {
        let dir = TempDir::new()?;
        let archive = dir.path().join("cluster_20240101_000000.tar.gz");
        std::fs::write(&archive, b"archive")?;

        let member_path = dir.path().join("alpha.dump");
        std::fs::write(&member_path, b"dump")?;
        let mut member = BackupManifest::for_artifact(&member_path, "alpha", DatabaseType::Postgres)?;
        member.backup_file = "dumps/alpha.dump".to_string();

        let mut manifest = ClusterManifest::new("main", DatabaseType::Postgres, "localhost", 5432, &archive);
        manifest.size_bytes = 7;
        manifest.add_member(member);
        manifest.save()?;

        let loaded = ClusterManifest::load(&archive)?;
        assert_eq!(loaded.databases.len(), 1);
        assert_eq!(loaded.total_size, 4);

        let listed = list_artifacts(dir.path())?;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].artifact, archive);
        assert_eq!(listed[0].size_bytes, 7);
        Ok(())
    }
}
