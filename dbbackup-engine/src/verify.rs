//! Artifact verification against its manifest.
//!
//! Per artifact: `unknown -> present -> sized-match | sized-mismatch`, then
//! for a full check `sized-match -> checksum-match | checksum-mismatch`.

use crate::checksum::sha256_file;
use crate::metadata::BackupManifest;
use crate::runtime::run_blocking;
use crate::utils::errors::Result;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyMode {
    /// Size only
    Quick,
    /// Size and SHA-256
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyState {
    Unknown,
    Present,
    SizedMatch,
    SizedMismatch { expected: u64, actual: u64 },
    ChecksumMatch,
    ChecksumMismatch { expected: String, actual: String },
}

impl VerifyState {
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            VerifyState::SizedMismatch { .. } | VerifyState::ChecksumMatch | VerifyState::ChecksumMismatch { .. }
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub artifact: PathBuf,
    pub mode: VerifyMode,
    pub state: VerifyState,
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Check `artifact` against the size and checksum recorded in `manifest`
pub fn verify_against(artifact: &Path, manifest: &BackupManifest, mode: VerifyMode) -> VerifyReport {
    let mut report = VerifyReport {
        artifact: artifact.to_path_buf(),
        mode,
        state: VerifyState::Unknown,
        valid: false,
        error: None,
    };

    let actual_size = match std::fs::metadata(artifact) {
        Ok(meta) => meta.len(),
        Err(e) => {
            report.error = Some(format!("cannot stat artifact: {}", e));
            return report;
        }
    };
    report.state = VerifyState::Present;

    if actual_size != manifest.size_bytes {
        report.state = VerifyState::SizedMismatch {
            expected: manifest.size_bytes,
            actual: actual_size,
        };
        return report;
    }
    report.state = VerifyState::SizedMatch;
    if mode == VerifyMode::Quick {
        report.valid = true;
        return report;
    }

    match sha256_file(artifact) {
        Ok(actual) if actual.eq_ignore_ascii_case(&manifest.sha256) => {
            report.state = VerifyState::ChecksumMatch;
            report.valid = true;
        }
        Ok(actual) => {
            report.state = VerifyState::ChecksumMismatch {
                expected: manifest.sha256.clone(),
                actual,
            };
        }
        Err(e) => report.error = Some(format!("cannot read artifact: {}", e)),
    }
    report
}

/// Load the sidecar of `artifact` and verify against it
pub async fn verify_artifact(artifact: &Path, mode: VerifyMode) -> Result<VerifyReport> {
    let artifact = artifact.to_path_buf();
    let report = run_blocking(move || {
        let manifest = BackupManifest::load(&artifact)?;
        Ok(verify_against(&artifact, &manifest, mode))
    })
    .await?;

    if report.valid {
        info!(artifact = %report.artifact.display(), state = ?report.state, "Artifact verified");
    } else {
        warn!(artifact = %report.artifact.display(), state = ?report.state, error = ?report.error, "Artifact failed verification");
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::DatabaseType;
    use crate::utils::errors::EngineError;
    use tempfile::TempDir;

    fn artifact(dir: &Path) -> Result<(PathBuf, BackupManifest)> {
        let path = dir.join("db_testdb_20240101_000000.dump");
        std::fs::write(&path, vec![3u8; 2 * 1024 * 1024])?;
        let manifest = BackupManifest::for_artifact(&path, "testdb", DatabaseType::Postgres)?;
        manifest.save()?;
        Ok((path, manifest))
    }

    #[tokio::test]
    async fn test_full_verification_passes() -> Result<()> {
        let dir = TempDir::new()?;
        let (path, _) = artifact(dir.path())?;
        let report = verify_artifact(&path, VerifyMode::Full).await?;
        assert!(report.valid);
        assert_eq!(report.state, VerifyState::ChecksumMatch);
        assert!(report.state.is_final());
        Ok(())
    }

    #[tokio::test]
    async fn test_tampered_content_fails_only_full_check() -> Result<()> {
        let dir = TempDir::new()?;
        let (path, _) = artifact(dir.path())?;
        let mut bytes = std::fs::read(&path)?;
        bytes[10] ^= 0xff;
        std::fs::write(&path, bytes)?;

        let quick = verify_artifact(&path, VerifyMode::Quick).await?;
        assert!(quick.valid);
        assert_eq!(quick.state, VerifyState::SizedMatch);

        let full = verify_artifact(&path, VerifyMode::Full).await?;
        assert!(!full.valid);
        assert!(matches!(full.state, VerifyState::ChecksumMismatch { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn test_size_mismatch_is_final() -> Result<()> {
        let dir = TempDir::new()?;
        let (path, _) = artifact(dir.path())?;
        std::fs::write(&path, b"short")?;
        let report = verify_artifact(&path, VerifyMode::Full).await?;
        assert!(!report.valid);
        assert!(matches!(report.state, VerifyState::SizedMismatch { actual: 5, .. }));
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_artifact_and_manifest() -> Result<()> {
        let dir = TempDir::new()?;
        let (path, manifest) = artifact(dir.path())?;
        std::fs::remove_file(&path)?;
        let report = verify_against(&path, &manifest, VerifyMode::Quick);
        assert_eq!(report.state, VerifyState::Unknown);
        assert!(report.error.is_some());

        let err = verify_artifact(&dir.path().join("nope.dump"), VerifyMode::Quick).await.unwrap_err();
        assert!(matches!(err, EngineError::FileNotFound(_)));
        Ok(())
    }
}
