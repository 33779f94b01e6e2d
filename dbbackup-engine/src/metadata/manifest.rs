//! Backup manifest, serialized as `<artifact>.meta.json`.
//!
//! The manifest records what the artifact is (database, engine, format), how
//! big it is and its SHA-256, plus the incremental sub-record that chains an
//! incremental archive back to its full base.

use crate::adapter::DatabaseType;
use crate::checksum::sha256_file;
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use super::METADATA_SUFFIX;

pub const MANIFEST_VERSION: &str = "2.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    #[default]
    Full,
    Incremental,
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupType::Full => f.write_str("full"),
            BackupType::Incremental => f.write_str("incremental"),
        }
    }
}

// Legacy manifests wrote an empty string (or nothing) for full backups.
impl<'de> Deserialize<'de> for BackupType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        match raw.as_deref().map(str::trim) {
            None | Some("") | Some("full") => Ok(BackupType::Full),
            Some("incremental") => Ok(BackupType::Incremental),
            Some(other) => Err(serde::de::Error::custom(format!("unknown backup_type '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionKind {
    #[default]
    None,
    Gzip,
    Pigz,
}

/// Links an incremental archive to its base
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncrementalInfo {
    /// SHA-256 of the base artifact
    pub base_backup_id: String,
    /// File name of the base artifact
    pub base_backup_path: String,
    pub base_backup_timestamp: DateTime<Utc>,
    pub incremental_files: u64,
    /// Uncompressed bytes of the changed files
    pub total_size: u64,
    /// File names oldest to newest: a full backup first, this archive last
    pub backup_chain: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub database: String,
    pub database_type: DatabaseType,
    #[serde(default)]
    pub database_version: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    pub backup_file: String,
    pub size_bytes: u64,
    pub sha256: String,
    #[serde(default)]
    pub compression: CompressionKind,
    #[serde(default)]
    pub backup_type: BackupType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_backup: Option<String>,
    #[serde(default)]
    pub duration_seconds: f64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub encrypted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_algorithm: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incremental: Option<IncrementalInfo>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_info: BTreeMap<String, String>,
}

/// `<artifact>.meta.json`
pub fn metadata_path(artifact: &Path) -> PathBuf {
    let mut name = artifact.as_os_str().to_os_string();
    name.push(METADATA_SUFFIX);
    PathBuf::from(name)
}

impl BackupManifest {
    /// A manifest for an artifact already on disk: size and SHA-256 are
    /// taken from the file itself.
    pub fn for_artifact(artifact: &Path, database: &str, database_type: DatabaseType) -> Result<Self> {
        let size_bytes = std::fs::metadata(artifact)?.len();
        let sha256 = sha256_file(artifact)?;
        Ok(Self {
            version: MANIFEST_VERSION.to_string(),
            timestamp: Utc::now(),
            database: database.to_string(),
            database_type,
            database_version: String::new(),
            host: String::new(),
            port: 0,
            user: String::new(),
            backup_file: artifact.to_string_lossy().to_string(),
            size_bytes,
            sha256,
            compression: CompressionKind::None,
            backup_type: BackupType::Full,
            base_backup: None,
            duration_seconds: 0.0,
            encrypted: false,
            encryption_algorithm: None,
            incremental: None,
            extra_info: BTreeMap::new(),
        })
    }

    pub fn artifact_path(&self) -> PathBuf {
        PathBuf::from(&self.backup_file)
    }

    pub fn artifact_file_name(&self) -> String {
        Path::new(&self.backup_file)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.backup_file.clone())
    }

    /// Re-read size and SHA-256 from the artifact on disk
    pub fn refresh_integrity(&mut self) -> Result<()> {
        let artifact = self.artifact_path();
        self.size_bytes = std::fs::metadata(&artifact)?.len();
        self.sha256 = sha256_file(&artifact)?;
        Ok(())
    }

    pub fn is_full(&self) -> bool {
        self.backup_type == BackupType::Full
    }

    pub fn validate(&self) -> Result<()> {
        if self.backup_type == BackupType::Incremental && self.incremental.is_none() {
            return Err(EngineError::Integrity(format!(
                "manifest for {} is incremental but has no incremental record",
                self.backup_file
            )));
        }
        if !self.sha256.is_empty()
            && (self.sha256.len() != 64 || !self.sha256.bytes().all(|b| b.is_ascii_hexdigit()))
        {
            return Err(EngineError::Integrity(format!(
                "manifest for {} has a malformed sha256",
                self.backup_file
            )));
        }
        Ok(())
    }

    /// Write the sidecar next to the artifact
    pub fn save(&self) -> Result<PathBuf> {
        let path = metadata_path(&self.artifact_path());
        super::write_json_atomic(&path, self)?;
        Ok(path)
    }

    /// Load the sidecar of `artifact`
    pub fn load(artifact: &Path) -> Result<Self> {
        let path = metadata_path(artifact);
        let content = std::fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                EngineError::FileNotFound(path.display().to_string())
            } else {
                e.into()
            }
        })?;
        let manifest: Self = serde_json::from_str(&content)?;
        manifest.validate()?;
        Ok(manifest)
    }
}
