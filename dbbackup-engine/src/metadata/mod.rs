//! Artifact manifests: per-artifact `.meta.json` sidecars, cluster
//! manifests and the incremental sub-record.

pub mod cluster;
pub mod manifest;

pub use cluster::ClusterManifest;
pub use manifest::{
    metadata_path, BackupManifest, BackupType, CompressionKind, IncrementalInfo, MANIFEST_VERSION,
};

use crate::utils::errors::Result;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const METADATA_SUFFIX: &str = ".meta.json";

/// The fields retention and listing need, read from either manifest kind
#[derive(Debug, Clone)]
pub struct ArtifactSummary {
    pub artifact: PathBuf,
    pub timestamp: DateTime<Utc>,
    pub size_bytes: u64,
    pub database: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AnyManifest {
    Backup(BackupManifest),
    Cluster(ClusterManifest),
}

/// Summaries of every artifact described by a sidecar in `dir`. Unreadable
/// sidecars are skipped with a warning.
pub fn list_artifacts(dir: &Path) -> Result<Vec<ArtifactSummary>> {
    let mut summaries = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(artifact_name) = name.strip_suffix(METADATA_SUFFIX) else {
            continue;
        };
        let content = match std::fs::read_to_string(entry.path()) {
            Ok(c) => c,
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "Skipping unreadable manifest");
                continue;
            }
        };
        let artifact = dir.join(artifact_name);
        match serde_json::from_str::<AnyManifest>(&content) {
            Ok(AnyManifest::Backup(m)) => summaries.push(ArtifactSummary {
                artifact,
                timestamp: m.timestamp,
                size_bytes: m.size_bytes,
                database: m.database,
            }),
            Ok(AnyManifest::Cluster(m)) => summaries.push(ArtifactSummary {
                artifact,
                timestamp: m.timestamp,
                size_bytes: m.size_bytes,
                database: format!("cluster:{}", m.cluster_name),
            }),
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "Skipping malformed manifest");
            }
        }
    }
    summaries.sort_by_key(|s| s.timestamp);
    Ok(summaries)
}

/// Write JSON next to its final name and rename into place
pub(crate) fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_file_name(format!(
        ".{}.tmp",
        path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
    ));
    std::fs::write(&tmp, json)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

/// `YYYYMMDD_HHMMSS` in local time, as used in artifact names
pub fn timestamp_suffix() -> String {
    chrono::Local::now().format("%Y%m%d_%H%M%S").to_string()
}
