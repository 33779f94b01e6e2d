//! Logical backups of single databases: full dumps, sample dumps and the
//! per-database restore routine the cluster orchestrator shares.

use crate::adapter::{BackupOptions, DatabaseType, DumpFormat, RestoreOptions};
use crate::compress::{compressed_output_path, open_gzip_reader};
use crate::config::ToolPaths;
use crate::crypto::{decrypt_file, encrypt_in_place, is_encrypted_file, ENCRYPTION_ALGORITHM};
use crate::executor::ToolCommand;
use crate::metadata::{timestamp_suffix, BackupManifest, CompressionKind};
use crate::runtime::{run_blocking, CancelScope};
use crate::state::EngineState;
use crate::utils::errors::{EngineError, Result};
use crate::verify::{verify_against, VerifyMode};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

/// How rows are picked for a sample backup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleStrategy {
    /// About one row in N
    Ratio(u32),
    /// About P percent of rows
    Percent(u32),
    /// The first N rows of every table
    Count(u64),
}

impl SampleStrategy {
    fn postgres_select(&self, table: &str) -> String {
        match self {
            SampleStrategy::Ratio(n) => format!("SELECT * FROM {} WHERE random() < 1.0 / {}", table, n),
            SampleStrategy::Percent(p) => format!("SELECT * FROM {} TABLESAMPLE BERNOULLI ({})", table, p),
            SampleStrategy::Count(n) => format!("SELECT * FROM {} LIMIT {}", table, n),
        }
    }

    fn mysql_where(&self) -> String {
        match self {
            SampleStrategy::Ratio(n) => format!("RAND() < 1.0 / {}", n),
            SampleStrategy::Percent(p) => format!("RAND() < {} / 100.0", p),
            SampleStrategy::Count(n) => format!("1 LIMIT {}", n),
        }
    }
}

impl fmt::Display for SampleStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleStrategy::Ratio(n) => write!(f, "ratio{}", n),
            SampleStrategy::Percent(p) => write!(f, "percent{}", p),
            SampleStrategy::Count(n) => write!(f, "count{}", n),
        }
    }
}

impl FromStr for SampleStrategy {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || EngineError::Config(format!("invalid sample strategy '{}' (ratio<N>, percent<P>, count<N>)", s));
        let split = s.find(|c: char| c.is_ascii_digit()).ok_or_else(invalid)?;
        let (name, value) = s.split_at(split);
        let strategy = match name {
            "ratio" => SampleStrategy::Ratio(value.parse().map_err(|_| invalid())?),
            "percent" => SampleStrategy::Percent(value.parse().map_err(|_| invalid())?),
            "count" => SampleStrategy::Count(value.parse().map_err(|_| invalid())?),
            _ => return Err(invalid()),
        };
        match strategy {
            SampleStrategy::Ratio(0) | SampleStrategy::Count(0) | SampleStrategy::Percent(0) => Err(invalid()),
            SampleStrategy::Percent(p) if p > 100 => Err(invalid()),
            other => Ok(other),
        }
    }
}

/// `pigz` when a parallel compressor is wanted, `gzip` otherwise; both
/// compress stdin to stdout.
pub(crate) fn compressor_command(tools: &ToolPaths, parallel: bool, threads: usize, level: u32) -> ToolCommand {
    let level = format!("-{}", level.clamp(1, 9));
    if parallel {
        ToolCommand::new(&tools.pigz)
            .arg(level)
            .arg("-p")
            .arg(threads.max(1).to_string())
            .arg("-c")
    } else {
        ToolCommand::new(&tools.gzip).arg(level).arg("-c")
    }
}

/// Dump `db` next to `requested` (a `.dump` path). Large PostgreSQL
/// databases and every MySQL database are dumped as plain SQL through a
/// compressor, which renames the artifact to `.sql.gz`. The partial artifact
/// is removed on failure.
pub(crate) async fn dump_database(
    state: &EngineState,
    scope: &CancelScope,
    db: &str,
    requested: &Path,
    server_version: &str,
) -> Result<BackupManifest> {
    let started = Instant::now();
    let adapter = &state.adapter;
    let backup = &state.config.backup;
    let kind = adapter.kind();

    let plain_with = match kind {
        DatabaseType::Postgres => {
            let size = adapter.get_database_size(scope, db).await?;
            if size > backup.large_database_threshold {
                info!(database = %db, size, "Large database, dumping plain SQL through pigz");
                Some(CompressionKind::Pigz)
            } else {
                None
            }
        }
        DatabaseType::MySql | DatabaseType::MariaDb => Some(CompressionKind::Gzip),
    };

    let (artifact, compression, result) = match plain_with {
        Some(compression) => {
            let artifact = compressed_output_path(requested);
            let options = BackupOptions {
                format: DumpFormat::Plain,
                compression_level: backup.compression_level,
                ..BackupOptions::default()
            };
            let producer = adapter.build_backup_argv(db, None, &options);
            let consumer = compressor_command(
                adapter.tools(),
                compression == CompressionKind::Pigz,
                backup.compressor_threads,
                backup.compression_level,
            );
            let result = state.executor.run_pipeline(scope, &producer, &consumer, &artifact).await;
            (artifact, compression, result)
        }
        None => {
            let artifact = requested.to_path_buf();
            let options = BackupOptions {
                format: DumpFormat::Custom,
                compression_level: backup.compression_level,
                ..BackupOptions::default()
            };
            let command = adapter.build_backup_argv(db, Some(&artifact), &options);
            let result = state.executor.run_single(scope, &command, &artifact).await;
            (artifact, CompressionKind::None, result)
        }
    };

    if let Err(e) = result {
        if let Err(rm) = tokio::fs::remove_file(&artifact).await {
            if rm.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %artifact.display(), error = %rm, "Failed to remove partial artifact");
            }
        }
        return Err(e);
    }

    let path = artifact.clone();
    let name = db.to_string();
    let mut manifest = run_blocking(move || BackupManifest::for_artifact(&path, &name, kind)).await?;
    let conn = adapter.connection();
    manifest.host = conn.host.clone();
    manifest.port = conn.port();
    manifest.user = conn.user.clone();
    manifest.database_version = server_version.to_string();
    manifest.compression = compression;
    manifest.duration_seconds = started.elapsed().as_secs_f64();
    let format = if compression == CompressionKind::None { "custom" } else { "plain" };
    manifest.extra_info.insert("dump_format".to_string(), format.to_string());

    info!(
        database = %db,
        artifact = %artifact.display(),
        size = manifest.size_bytes,
        duration_secs = manifest.duration_seconds,
        "Database dumped"
    );
    Ok(manifest)
}

/// Recreate `db` and load `artifact` into it: terminate sessions, drop,
/// create from template0, then restore with the tool the suffix calls for.
pub(crate) async fn restore_into(
    state: &EngineState,
    scope: &CancelScope,
    db: &str,
    artifact: &Path,
    options: &RestoreOptions,
) -> Result<()> {
    let adapter = &state.adapter;
    let name = artifact
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    adapter.terminate_connections(scope, db).await?;
    adapter.drop_database(scope, db).await?;
    adapter.create_database(scope, db).await?;

    if name.ends_with(".gz") {
        let reader = open_gzip_reader(artifact).await?;
        let client = adapter.build_sql_client_argv(Some(db));
        state.executor.run_with_stdin(scope, &client, reader).await?;
    } else if name.ends_with(".dump") {
        if adapter.kind() != DatabaseType::Postgres {
            return Err(EngineError::Config(format!(
                "{} is a custom-format dump, which {} cannot restore",
                name,
                adapter.kind()
            )));
        }
        let command = adapter.build_restore_argv(db, artifact, options);
        state.executor.run_status(scope, &command).await?;
    } else if name.ends_with(".sql") {
        let file = tokio::fs::File::open(artifact).await?;
        let client = adapter.build_sql_client_argv(Some(db));
        state.executor.run_with_stdin(scope, &client, file).await?;
    } else {
        return Err(EngineError::Config(format!("don't know how to restore '{}'", name)));
    }

    info!(database = %db, artifact = %artifact.display(), "Database restored");
    Ok(())
}

async fn append_text(path: &Path, text: &str) -> Result<()> {
    let mut file = tokio::fs::OpenOptions::new().append(true).open(path).await?;
    file.write_all(text.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

/// Single-database operations
pub struct BackupRunner {
    state: Arc<EngineState>,
}

impl BackupRunner {
    pub fn new(state: Arc<EngineState>) -> Self {
        Self { state }
    }

    /// Dump `db` to `db_<db>_<ts>.dump` (or `.sql.gz`) with its sidecar.
    pub async fn backup_database(&self, scope: &CancelScope, db: &str) -> Result<BackupManifest> {
        let audit = self.state.audit_start("backup");
        let result = self.backup_database_inner(scope, db).await;
        self.state.audit_finish(audit, "backup", &result);
        result
    }

    async fn backup_database_inner(&self, scope: &CancelScope, db: &str) -> Result<BackupManifest> {
        let dir = self.state.config.backup.backup_dir.clone();
        tokio::fs::create_dir_all(&dir).await?;
        self.state.disk.ensure_capacity(&dir)?;

        let version = self.server_version(scope).await;
        let requested = dir.join(format!("db_{}_{}.dump", db, timestamp_suffix()));
        let mut manifest = dump_database(&self.state, scope, db, &requested, &version).await?;

        if self.state.config.encryption.enabled {
            self.encrypt_manifest(&mut manifest).await?;
        }
        if let Err(e) = manifest.save() {
            warn!(artifact = %manifest.backup_file, error = %e, "Failed to write manifest");
        }
        self.state.disk.invalidate(&dir);
        Ok(manifest)
    }

    /// Schema plus a sample of every table, as a plain SQL script
    pub async fn backup_sample(&self, scope: &CancelScope, db: &str, strategy: SampleStrategy) -> Result<BackupManifest> {
        let audit = self.state.audit_start("backup-sample");
        let result = self.backup_sample_inner(scope, db, strategy).await;
        self.state.audit_finish(audit, "backup-sample", &result);
        result
    }

    async fn backup_sample_inner(&self, scope: &CancelScope, db: &str, strategy: SampleStrategy) -> Result<BackupManifest> {
        let started = Instant::now();
        let adapter = &self.state.adapter;
        let executor = &self.state.executor;
        let dir = self.state.config.backup.backup_dir.clone();
        tokio::fs::create_dir_all(&dir).await?;
        self.state.disk.ensure_capacity(&dir)?;

        let path = dir.join(format!("sample_{}_{}_{}.sql", db, strategy, timestamp_suffix()));
        let schema = BackupOptions {
            format: DumpFormat::Plain,
            schema_only: true,
            ..BackupOptions::default()
        };
        executor
            .run_single(scope, &adapter.build_backup_argv(db, Some(&path), &schema), &path)
            .await?;

        let tables = adapter.list_tables(scope, db).await?;
        for table in &tables {
            scope.check()?;
            match adapter.kind() {
                DatabaseType::Postgres => {
                    append_text(&path, &format!("\nCOPY {} FROM stdin;\n", table)).await?;
                    let sql = format!("COPY ({}) TO STDOUT", strategy.postgres_select(table));
                    executor
                        .run_to_file(scope, &adapter.build_query_argv(Some(db), &sql), &path, true)
                        .await?;
                    append_text(&path, "\\.\n").await?;
                }
                DatabaseType::MySql | DatabaseType::MariaDb => {
                    let options = BackupOptions {
                        format: DumpFormat::Plain,
                        data_only: true,
                        tables: vec![table.clone()],
                        where_clause: Some(strategy.mysql_where()),
                        ..BackupOptions::default()
                    };
                    executor
                        .run_to_file(scope, &adapter.build_backup_argv(db, None, &options), &path, true)
                        .await?;
                }
            }
        }

        let (artifact, name, kind) = (path.clone(), db.to_string(), adapter.kind());
        let mut manifest = run_blocking(move || BackupManifest::for_artifact(&artifact, &name, kind)).await?;
        let conn = adapter.connection();
        manifest.host = conn.host.clone();
        manifest.port = conn.port();
        manifest.user = conn.user.clone();
        manifest.duration_seconds = started.elapsed().as_secs_f64();
        manifest.extra_info.insert("sample_strategy".to_string(), strategy.to_string());
        manifest.extra_info.insert("tables".to_string(), tables.len().to_string());
        if let Err(e) = manifest.save() {
            warn!(artifact = %path.display(), error = %e, "Failed to write manifest");
        }
        info!(database = %db, artifact = %path.display(), tables = tables.len(), "Sample backup written");
        Ok(manifest)
    }

    /// Restore `artifact` into `target_db` (the manifest's database by
    /// default). Encrypted artifacts are decrypted into a scratch file first.
    pub async fn restore_database(&self, scope: &CancelScope, artifact: &Path, target_db: Option<&str>) -> Result<()> {
        let audit = self.state.audit_start("restore");
        let result = self.restore_database_inner(scope, artifact, target_db).await;
        self.state.audit_finish(audit, "restore", &result);
        result
    }

    async fn restore_database_inner(&self, scope: &CancelScope, artifact: &Path, target_db: Option<&str>) -> Result<()> {
        if !artifact.is_file() {
            return Err(EngineError::FileNotFound(artifact.display().to_string()));
        }
        let manifest = match BackupManifest::load(artifact) {
            Ok(manifest) => Some(manifest),
            Err(EngineError::FileNotFound(_)) => None,
            Err(e) => return Err(e),
        };
        let db = match (target_db, &manifest) {
            (Some(db), _) => db.to_string(),
            (None, Some(m)) => m.database.clone(),
            (None, None) => {
                return Err(EngineError::Config(format!(
                    "{} has no manifest; name the target database",
                    artifact.display()
                )))
            }
        };
        if let Some(manifest) = &manifest {
            let report = verify_against(artifact, manifest, VerifyMode::Quick);
            if !report.valid {
                return Err(EngineError::Integrity(format!(
                    "{} does not match its manifest: {:?}",
                    artifact.display(),
                    report.state
                )));
            }
        }

        let scratch = tempfile::Builder::new()
            .prefix(".restore_")
            .tempdir_in(artifact.parent().unwrap_or(Path::new(".")))?;
        let source = self.decrypted_source(artifact, scratch.path()).await?;

        let superuser = self.probe_superuser(scope).await;
        let options = RestoreOptions {
            preserve_ownership: self.state.config.backup.preserve_ownership && superuser,
            ..RestoreOptions::default()
        };
        restore_into(&self.state, scope, &db, &source, &options).await
    }

    /// Encrypt an existing artifact in place and refresh its manifest
    pub async fn encrypt_artifact(&self, artifact: &Path) -> Result<BackupManifest> {
        let mut manifest = match BackupManifest::load(artifact) {
            Ok(manifest) => manifest,
            Err(EngineError::FileNotFound(_)) => {
                let (path, kind) = (artifact.to_path_buf(), self.state.adapter.kind());
                run_blocking(move || {
                    let name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
                    BackupManifest::for_artifact(&path, &name, kind)
                })
                .await?
            }
            Err(e) => return Err(e),
        };
        if manifest.encrypted || is_encrypted_file(artifact)? {
            return Err(EngineError::Config(format!("{} is already encrypted", artifact.display())));
        }
        self.encrypt_manifest(&mut manifest).await?;
        manifest.save()?;
        Ok(manifest)
    }

    /// Decrypt `artifact` into `output`
    pub async fn decrypt_artifact(&self, artifact: &Path, output: &Path) -> Result<u64> {
        let key = self.state.require_key_source()?;
        let (src, dst) = (artifact.to_path_buf(), output.to_path_buf());
        run_blocking(move || decrypt_file(&src, &dst, &key)).await
    }

    async fn encrypt_manifest(&self, manifest: &mut BackupManifest) -> Result<()> {
        let key = self.state.require_key_source()?;
        let path = manifest.artifact_path();
        let mut updated = manifest.clone();
        *manifest = run_blocking(move || {
            encrypt_in_place(&path, &key)?;
            updated.encrypted = true;
            updated.encryption_algorithm = Some(ENCRYPTION_ALGORITHM.to_string());
            updated.refresh_integrity()?;
            Ok(updated)
        })
        .await?;
        info!(artifact = %manifest.backup_file, "Artifact encrypted");
        Ok(())
    }

    async fn decrypted_source(&self, artifact: &Path, scratch: &Path) -> Result<PathBuf> {
        if !is_encrypted_file(artifact)? {
            return Ok(artifact.to_path_buf());
        }
        let key = self.state.require_key_source()?;
        let target = scratch.join(artifact.file_name().unwrap_or_default());
        let (src, dst) = (artifact.to_path_buf(), target.clone());
        run_blocking(move || decrypt_file(&src, &dst, &key)).await?;
        Ok(target)
    }

    async fn probe_superuser(&self, scope: &CancelScope) -> bool {
        match self.state.adapter.is_superuser(scope).await {
            Ok(true) => true,
            Ok(false) => {
                warn!("Not connected as superuser; restoring without ownership and privileges");
                false
            }
            Err(e) => {
                warn!(error = %e, "Superuser probe failed; restoring without ownership and privileges");
                false
            }
        }
    }

    async fn server_version(&self, scope: &CancelScope) -> String {
        self.state.adapter.get_version(scope).await.unwrap_or_else(|e| {
            warn!(error = %e, "Could not read server version");
            String::new()
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::compress::gunzip_bytes;
    use crate::testutil::FakeServer;
    use crate::verify::verify_artifact;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_single_database_backup_verifies() -> Result<()> {
        let server = FakeServer::new(&["testdb"])?;
        let backups = TempDir::new()?;
        let runner = BackupRunner::new(server.engine(backups.path()));

        let manifest = runner.backup_database(&CancelScope::root(), "testdb").await?;
        let artifact = manifest.artifact_path();
        let name = manifest.artifact_file_name();
        assert!(name.starts_with("db_testdb_") && name.ends_with(".dump"), "{}", name);
        assert_eq!(manifest.size_bytes, std::fs::metadata(&artifact)?.len());
        assert_eq!(manifest.database_version, "16.2");
        assert_eq!(manifest.extra_info["dump_format"], "custom");

        let report = verify_artifact(&artifact, VerifyMode::Full).await?;
        assert!(report.valid);
        Ok(())
    }

    #[tokio::test]
    async fn test_large_database_goes_through_compressor() -> Result<()> {
        let server = FakeServer::new(&["big"])?;
        server.set_size("big", 6 * 1024 * 1024 * 1024)?;
        let backups = TempDir::new()?;
        let runner = BackupRunner::new(server.engine(backups.path()));

        let manifest = runner.backup_database(&CancelScope::root(), "big").await?;
        assert!(manifest.backup_file.ends_with(".sql.gz"));
        assert_eq!(manifest.compression, CompressionKind::Pigz);
        let plain = gunzip_bytes(&std::fs::read(manifest.artifact_path())?)?;
        assert_eq!(String::from_utf8_lossy(&plain), "-- plain dump of big\n");

        runner.restore_database(&CancelScope::root(), &manifest.artifact_path(), None).await?;
        assert_eq!(server.read_state("restored_big.sql")?, "-- plain dump of big\n");
        let sql = server.sql_log()?;
        assert!(sql.contains("DROP DATABASE IF EXISTS \"big\""));
        assert!(sql.contains("CREATE DATABASE \"big\" WITH TEMPLATE template0"));
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_dump_leaves_no_artifact() -> Result<()> {
        let server = FakeServer::new(&["broken"])?;
        server.fail_dump("broken")?;
        let backups = TempDir::new()?;
        let runner = BackupRunner::new(server.engine(backups.path()));

        let err = runner.backup_database(&CancelScope::root(), "broken").await.unwrap_err();
        match err {
            EngineError::ToolFailure { tool, stderr, .. } => {
                assert_eq!(tool, "pg_dump");
                assert!(stderr.contains("forced failure"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(std::fs::read_dir(backups.path())?.count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_encrypted_backup_restores() -> Result<()> {
        let server = FakeServer::new(&["secure"])?;
        let backups = TempDir::new()?;
        let key_file = backups.path().join("key.bin");
        std::fs::write(&key_file, [5u8; 32])?;
        let mut config = server.config(backups.path());
        config.encryption.enabled = true;
        config.encryption.key_file = Some(key_file);
        let runner = BackupRunner::new(server.engine_with(config));

        let manifest = runner.backup_database(&CancelScope::root(), "secure").await?;
        assert!(manifest.encrypted);
        assert_eq!(manifest.encryption_algorithm.as_deref(), Some("AES-256-GCM"));
        assert!(is_encrypted_file(&manifest.artifact_path())?);
        assert!(verify_artifact(&manifest.artifact_path(), VerifyMode::Full).await?.valid);

        runner.restore_database(&CancelScope::root(), &manifest.artifact_path(), Some("copy")).await?;
        assert_eq!(server.read_state("restored_copy.dump")?, "PGDMP custom dump of secure\n");
        Ok(())
    }

    #[tokio::test]
    async fn test_sample_backup_contains_copy_blocks() -> Result<()> {
        let server = FakeServer::new(&["testdb"])?;
        let backups = TempDir::new()?;
        let runner = BackupRunner::new(server.engine(backups.path()));

        let manifest = runner
            .backup_sample(&CancelScope::root(), "testdb", "ratio10".parse()?)
            .await?;
        assert!(manifest.artifact_file_name().starts_with("sample_testdb_ratio10_"));
        let script = std::fs::read_to_string(manifest.artifact_path())?;
        assert!(script.starts_with("CREATE TABLE public.items"));
        assert!(script.contains("COPY public.items FROM stdin;\n1\tfirst\n2\tsecond\n\\.\n"));
        assert!(server.sql_log()?.contains("WHERE random() < 1.0 / 10"));
        Ok(())
    }

    #[test]
    fn test_sample_strategy_parsing() {
        assert_eq!("percent5".parse::<SampleStrategy>().unwrap(), SampleStrategy::Percent(5));
        assert_eq!("count1000".parse::<SampleStrategy>().unwrap(), SampleStrategy::Count(1000));
        assert!("percent150".parse::<SampleStrategy>().is_err());
        assert!("ratio0".parse::<SampleStrategy>().is_err());
        assert!("every10".parse::<SampleStrategy>().is_err());
    }
}
