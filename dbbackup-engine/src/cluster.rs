//! Cluster orchestrator: every database of a server backed up into, or
//! restored from, one `cluster_<ts>.tar.gz`.
//!
//! Per-database work fans out under a semaphore sized by the configured
//! parallelism. A failing database never aborts its siblings; failures are
//! collected and reported together once every task has finished.

use crate::adapter::postgres::is_large_object_entry;
use crate::adapter::{DatabaseType, RestoreOptions};
use crate::archive::{extract_archive, pack_directory};
use crate::backup::{compressor_command, dump_database, restore_into};
use crate::checksum::sha256_file;
use crate::crypto::{decrypt_file, encrypt_in_place, is_encrypted_file};
use crate::executor::ToolCommand;
use crate::metadata::{timestamp_suffix, ClusterManifest};
use crate::progress::ClusterProgress;
use crate::runtime::{run_blocking, CancelScope};
use crate::state::EngineState;
use crate::utils::errors::{EngineError, Result};
use crate::verify::{verify_against, VerifyMode, VerifyReport};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tempfile::TempDir;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

const GLOBALS_FILE: &str = "globals.sql";
const DUMPS_DIR: &str = "dumps";

/// Outcome of a successful cluster restore
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterRestoreReport {
    pub restored: Vec<String>,
    /// Large objects were found, so databases were restored one at a time
    pub sequential: bool,
    pub preserve_ownership: bool,
    pub globals_restored: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterVerifyReport {
    pub archive: PathBuf,
    pub archive_valid: bool,
    pub members: Vec<VerifyReport>,
}

impl ClusterVerifyReport {
    pub fn is_valid(&self) -> bool {
        self.archive_valid && self.members.iter().all(|m| m.valid)
    }
}

pub struct ClusterOrchestrator {
    state: Arc<EngineState>,
}

impl ClusterOrchestrator {
    pub fn new(state: Arc<EngineState>) -> Self {
        Self { state }
    }

    /// Back up globals and every user database into one archive.
    ///
    /// Returns `PartialFailure` (with the archive path) when some databases
    /// failed; the archive and its manifest still hold every database that
    /// succeeded.
    pub async fn backup_cluster(&self, scope: &CancelScope) -> Result<ClusterManifest> {
        let audit = self.state.audit_start("backup-cluster");
        let result = self.backup_cluster_inner(scope).await;
        self.state.audit_finish(audit, "backup-cluster", &result);
        result
    }

    async fn backup_cluster_inner(&self, scope: &CancelScope) -> Result<ClusterManifest> {
        let started = Instant::now();
        let state = &self.state;
        let backup_dir = state.config.backup.backup_dir.clone();
        tokio::fs::create_dir_all(&backup_dir).await?;
        state.disk.ensure_capacity(&backup_dir)?;

        let scratch = tempfile::Builder::new().prefix(".cluster_").tempdir_in(&backup_dir)?;
        let dumps = scratch.path().join(DUMPS_DIR);
        tokio::fs::create_dir_all(&dumps).await?;

        let globals = scratch.path().join(GLOBALS_FILE);
        if let Some(command) = state.adapter.build_globals_argv(&globals) {
            state.executor.run_single(scope, &command, &globals).await?;
            info!("Global objects dumped");
        }

        let databases = state.adapter.list_databases(scope).await?;
        let version = state.adapter.get_version(scope).await.unwrap_or_else(|e| {
            warn!(error = %e, "Could not read server version");
            String::new()
        });
        let parallelism = state.config.backup.parallelism();
        info!(databases = databases.len(), parallelism, "Starting cluster backup");

        let progress = ClusterProgress::new(state.progress.clone(), "Cluster backup", &databases);
        let semaphore = Arc::new(Semaphore::new(parallelism));
        let timeout = state.config.backup.task_timeout();
        let mut tasks = JoinSet::new();

        for db in databases.iter().cloned() {
            let (state, scope, progress) = (state.clone(), scope.child(), progress.clone());
            let (semaphore, dumps, version) = (semaphore.clone(), dumps.clone(), version.clone());
            tasks.spawn(async move {
                let result = async {
                    let _permit = semaphore.acquire_owned().await.map_err(|_| EngineError::Cancelled)?;
                    scope.check()?;
                    progress.task_started(&db).await;
                    let task_scope = scope.with_timeout(timeout);
                    let requested = dumps.join(format!("{}.dump", dump_stem(&db)));
                    dump_database(&state, &task_scope, &db, &requested, &version).await
                }
                .await;
                let outcome = result.as_ref().map(|_| ()).map_err(|e| e.to_string());
                progress.task_finished(&db, outcome).await;
                (db, result)
            });
        }

        let (members, failures) = collect(&mut tasks).await;
        scope.check()?;

        let archive = backup_dir.join(format!("cluster_{}.tar.gz", timestamp_suffix()));
        self.pack(scope, scratch.path(), &archive).await?;

        let conn = state.adapter.connection();
        let cluster_name = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| conn.host.clone());
        let mut manifest = ClusterManifest::new(&cluster_name, state.adapter.kind(), &conn.host, conn.port(), &archive);
        for mut member in members {
            member.backup_file = format!("{}/{}", DUMPS_DIR, member.artifact_file_name());
            manifest.add_member(member);
        }
        manifest.databases.sort_by(|a, b| a.database.cmp(&b.database));

        if state.config.encryption.enabled {
            let key = state.require_key_source()?;
            let path = archive.clone();
            run_blocking(move || encrypt_in_place(&path, &key)).await?;
            manifest.encrypted = true;
            info!(archive = %archive.display(), "Cluster archive encrypted");
        }

        let path = archive.clone();
        let (size, sha) = run_blocking(move || Ok((std::fs::metadata(&path)?.len(), sha256_file(&path)?))).await?;
        manifest.size_bytes = size;
        manifest.sha256 = sha;
        manifest.duration_seconds = started.elapsed().as_secs_f64();
        manifest.save()?;
        drop(scratch);
        state.disk.invalidate(&backup_dir);

        if failures.is_empty() {
            state.progress.complete(&format!("{} databases backed up", manifest.databases.len()));
            info!(archive = %archive.display(), size, "Cluster backup complete");
            Ok(manifest)
        } else {
            state.progress.fail(&format!("{} of {} databases failed", failures.len(), databases.len()));
            Err(EngineError::PartialFailure {
                operation: "cluster backup".to_string(),
                total: databases.len(),
                failures,
                artifact: Some(archive),
            })
        }
    }

    /// `tar | pigz` first; the in-process archive writer when the external
    /// pipeline cannot be set up or fails.
    async fn pack(&self, scope: &CancelScope, root: &Path, archive: &Path) -> Result<()> {
        let mut tar = ToolCommand::new(&self.state.config.tools.tar)
            .arg("-C")
            .arg(root)
            .arg("-cf")
            .arg("-");
        for entry in [GLOBALS_FILE, DUMPS_DIR] {
            if root.join(entry).exists() {
                tar = tar.arg(entry);
            }
        }
        let backup = &self.state.config.backup;
        let compressor = compressor_command(
            &self.state.config.tools,
            true,
            backup.compressor_threads,
            backup.compression_level,
        );
        match self.state.executor.run_pipeline(scope, &tar, &compressor, archive).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_interruption() => {
                remove_partial(archive).await;
                return Err(e);
            }
            Err(e) => warn!(error = %e, "Parallel packing failed, falling back to built-in archiver"),
        }

        let (scope, root, output, level) = (scope.clone(), root.to_path_buf(), archive.to_path_buf(), backup.compression_level);
        let result = run_blocking(move || pack_directory(&scope, &root, &output, level)).await;
        match result {
            Ok(stats) => {
                debug!(entries = stats.entries, bytes = stats.bytes, "Cluster archive written");
                Ok(())
            }
            Err(e) => {
                remove_partial(archive).await;
                Err(e)
            }
        }
    }

    /// Restore globals and every database dump of a cluster archive.
    pub async fn restore_cluster(&self, scope: &CancelScope, archive: &Path) -> Result<ClusterRestoreReport> {
        let audit = self.state.audit_start("restore-cluster");
        let result = self.restore_cluster_inner(scope, archive).await;
        self.state.audit_finish(audit, "restore-cluster", &result);
        result
    }

    async fn restore_cluster_inner(&self, scope: &CancelScope, archive: &Path) -> Result<ClusterRestoreReport> {
        let state = &self.state;
        let scratch = self.extract(scope, archive).await?;
        let tree = scratch.path().join("tree");

        let superuser = match state.adapter.is_superuser(scope).await {
            Ok(superuser) => superuser,
            Err(e) => {
                warn!(error = %e, "Superuser probe failed");
                false
            }
        };
        let preserve_ownership = superuser && state.config.backup.preserve_ownership;
        if !superuser {
            warn!("Not connected as superuser; ownership and privileges will not be restored");
        }

        let mut globals_restored = false;
        let globals = tree.join(GLOBALS_FILE);
        if globals.is_file() {
            let file = tokio::fs::File::open(&globals).await?;
            let client = state.adapter.build_sql_client_argv(None);
            match state.executor.run_with_stdin(scope, &client, file).await {
                Ok(()) => {
                    globals_restored = true;
                    info!("Global objects restored");
                }
                Err(e) if superuser || e.is_interruption() => return Err(e),
                Err(e) => warn!(error = %e, "Global objects not restored, continuing without them"),
            }
        }

        let dumps = member_dumps(&tree.join(DUMPS_DIR)).await?;
        let sequential = self.has_large_objects(scope, &dumps).await?;
        let parallelism = if sequential {
            warn!("Large objects found, restoring databases sequentially");
            1
        } else {
            state.config.backup.parallelism()
        };

        let names: Vec<String> = dumps.iter().map(|(db, _)| db.clone()).collect();
        let progress = ClusterProgress::new(state.progress.clone(), "Cluster restore", &names);
        let semaphore = Arc::new(Semaphore::new(parallelism));
        let timeout = state.config.backup.task_timeout();
        let options = RestoreOptions {
            preserve_ownership,
            single_transaction: false,
            jobs: 1,
        };
        let mut tasks = JoinSet::new();

        for (db, path) in dumps.iter().cloned() {
            let (state, scope, progress) = (state.clone(), scope.child(), progress.clone());
            let (semaphore, options) = (semaphore.clone(), options.clone());
            tasks.spawn(async move {
                let result: Result<String> = async {
                    let _permit = semaphore.acquire_owned().await.map_err(|_| EngineError::Cancelled)?;
                    scope.check()?;
                    progress.task_started(&db).await;
                    let task_scope = scope.with_timeout(timeout);
                    restore_into(&state, &task_scope, &db, &path, &options).await?;
                    Ok(db.clone())
                }
                .await;
                let outcome = result.as_ref().map(|_| ()).map_err(|e| e.to_string());
                progress.task_finished(&db, outcome).await;
                (db, result)
            });
        }

        let (mut restored, failures) = collect(&mut tasks).await;
        scope.check()?;
        drop(scratch);
        restored.sort();

        if !failures.is_empty() {
            state.progress.fail(&format!("{} of {} databases failed", failures.len(), dumps.len()));
            return Err(EngineError::PartialFailure {
                operation: "cluster restore".to_string(),
                total: dumps.len(),
                failures,
                artifact: None,
            });
        }
        state.progress.complete(&format!("{} databases restored", restored.len()));
        Ok(ClusterRestoreReport {
            restored,
            sequential,
            preserve_ownership,
            globals_restored,
        })
    }

    /// Check the archive against its cluster manifest, then every member
    /// dump inside it (size and SHA-256).
    pub async fn verify_cluster(&self, scope: &CancelScope, archive: &Path) -> Result<ClusterVerifyReport> {
        let manifest = ClusterManifest::load(archive)?;
        let path = archive.to_path_buf();
        let (size, sha) = run_blocking(move || Ok((std::fs::metadata(&path)?.len(), sha256_file(&path)?))).await?;
        let archive_valid = size == manifest.size_bytes && (manifest.sha256.is_empty() || sha == manifest.sha256);
        if !archive_valid {
            error!(archive = %archive.display(), "Cluster archive does not match its manifest");
            return Ok(ClusterVerifyReport {
                archive: archive.to_path_buf(),
                archive_valid,
                members: Vec::new(),
            });
        }

        let scratch = self.extract(scope, archive).await?;
        let tree = scratch.path().join("tree");
        let members = manifest.databases.clone();
        let scope = scope.clone();
        let reports = run_blocking(move || {
            let mut reports = Vec::with_capacity(members.len());
            for member in &members {
                scope.check()?;
                reports.push(verify_against(&tree.join(&member.backup_file), member, VerifyMode::Full));
            }
            Ok(reports)
        })
        .await?;

        for report in reports.iter().filter(|r| !r.valid) {
            warn!(artifact = %report.artifact.display(), state = ?report.state, "Cluster member failed verification");
        }
        Ok(ClusterVerifyReport {
            archive: archive.to_path_buf(),
            archive_valid,
            members: reports,
        })
    }

    /// Decrypt (when needed) and extract `archive` into `<scratch>/tree`
    async fn extract(&self, scope: &CancelScope, archive: &Path) -> Result<TempDir> {
        if !archive.is_file() {
            return Err(EngineError::FileNotFound(archive.display().to_string()));
        }
        let parent = archive.parent().unwrap_or(Path::new("."));
        let scratch = tempfile::Builder::new().prefix(".cluster_restore_").tempdir_in(parent)?;

        let mut source = archive.to_path_buf();
        if is_encrypted_file(archive)? {
            let key = self.state.require_key_source()?;
            let decrypted = scratch.path().join("archive.tar.gz");
            let (src, dst) = (archive.to_path_buf(), decrypted.clone());
            run_blocking(move || decrypt_file(&src, &dst, &key)).await?;
            source = decrypted;
        }

        let (scope, target) = (scope.clone(), scratch.path().join("tree"));
        let stats = run_blocking(move || extract_archive(&scope, &source, &target)).await?;
        debug!(files = stats.files, bytes = stats.bytes, "Cluster archive extracted");
        Ok(scratch)
    }

    async fn has_large_objects(&self, scope: &CancelScope, dumps: &[(String, PathBuf)]) -> Result<bool> {
        if self.state.adapter.kind() != DatabaseType::Postgres {
            return Ok(false);
        }
        for (db, path) in dumps.iter().filter(|(_, p)| p.extension().is_some_and(|e| e == "dump")) {
            match self.state.adapter.list_dump_contents(scope, path).await {
                Ok(toc) if toc.iter().any(|line| is_large_object_entry(line)) => {
                    info!(database = %db, "Dump contains large objects");
                    return Ok(true);
                }
                Ok(_) => {}
                Err(e) if e.is_interruption() => return Err(e),
                Err(e) => warn!(database = %db, error = %e, "Could not list dump contents"),
            }
        }
        Ok(false)
    }
}

/// Fan-in: successes in completion order, and one `<db>: <reason>` per failure
async fn collect<T: 'static>(tasks: &mut JoinSet<(String, Result<T>)>) -> (Vec<T>, Vec<String>)
where
    T: Send,
{
    let mut succeeded = Vec::new();
    let mut failures = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((_, Ok(value))) => succeeded.push(value),
            Ok((db, Err(e))) => {
                error!(database = %db, error = %e, "Database task failed");
                failures.push(format!("{}: {}", db, e));
            }
            Err(e) => failures.push(format!("worker task aborted: {}", e)),
        }
    }
    failures.sort();
    (succeeded, failures)
}

/// File stem for a database dump: bytes outside `[A-Za-z0-9_-]` become `%XX`,
/// so no database name can escape the dumps directory or collide with another.
fn dump_stem(db: &str) -> String {
    let mut stem = String::with_capacity(db.len());
    for byte in db.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            stem.push(char::from(byte));
        } else {
            stem.push_str(&format!("%{:02X}", byte));
        }
    }
    stem
}

fn database_from_stem(stem: &str) -> Option<String> {
    let mut bytes = Vec::with_capacity(stem.len());
    let mut rest = stem.as_bytes();
    while let Some((&byte, tail)) = rest.split_first() {
        if byte == b'%' {
            let digits = std::str::from_utf8(tail.get(..2)?).ok()?;
            if !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
                return None;
            }
            bytes.push(u8::from_str_radix(digits, 16).ok()?);
            rest = &tail[2..];
        } else {
            bytes.push(byte);
            rest = tail;
        }
    }
    String::from_utf8(bytes).ok()
}

/// `(database, dump path)` for every dump in the extracted tree
async fn member_dumps(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut dumps = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(dumps),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        let db = [".dump", ".sql.gz", ".sql"]
            .iter()
            .find_map(|suffix| name.strip_suffix(suffix));
        match db.filter(|stem| !stem.is_empty()).and_then(database_from_stem) {
            Some(db) => dumps.push((db, entry.path())),
            None => warn!(file = %name, "Skipping unrecognised file in cluster archive"),
        }
    }
    dumps.sort();
    Ok(dumps)
}

async fn remove_partial(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove partial archive");
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::testutil::FakeServer;

    fn archives(dir: &Path) -> Vec<PathBuf> {
        let mut found: Vec<PathBuf> = std::fs::read_dir(dir)
            .map(|rd| rd.filter_map(|e| e.ok()).map(|e| e.path()).collect())
            .unwrap_or_default();
        found.retain(|p| p.to_string_lossy().ends_with(".tar.gz"));
        found
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_healthy_members() -> Result<()> {
        let server = FakeServer::new(&["alpha", "bad", "beta", "delta", "gamma"])?;
        server.fail_dump("bad")?;
        let backups = TempDir::new()?;
        let orchestrator = ClusterOrchestrator::new(server.engine(backups.path()));

        let err = orchestrator.backup_cluster(&CancelScope::root()).await.unwrap_err();
        let archive = match &err {
            EngineError::PartialFailure { total, failures, artifact, .. } => {
                assert_eq!(*total, 5);
                assert_eq!(failures.len(), 1);
                assert!(failures[0].starts_with("bad: "), "{}", failures[0]);
                artifact.clone().expect("archive path")
            }
            other => panic!("unexpected error: {other}"),
        };
        assert!(err.to_string().contains("bad"));

        let manifest = ClusterManifest::load(&archive)?;
        let names: Vec<&str> = manifest.databases.iter().map(|m| m.database.as_str()).collect();
        assert_eq!(names, ["alpha", "beta", "delta", "gamma"]);
        assert!(manifest.databases.iter().all(|m| m.backup_file.starts_with("dumps/")));

        let report = orchestrator.verify_cluster(&CancelScope::root(), &archive).await?;
        assert!(report.is_valid());
        assert_eq!(report.members.len(), 4);
        Ok(())
    }

    #[tokio::test]
    async fn test_backup_and_restore_round_trip() -> Result<()> {
        let server = FakeServer::new(&["alpha", "beta"])?;
        let backups = TempDir::new()?;
        let orchestrator = ClusterOrchestrator::new(server.engine(backups.path()));

        let manifest = orchestrator.backup_cluster(&CancelScope::root()).await?;
        assert!(manifest.archive_path().is_file());
        assert!(manifest.backup_file.contains("cluster_"));
        // only the archive is left behind, the scratch tree is gone
        let leftovers: Vec<_> = std::fs::read_dir(backups.path())?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".cluster_"))
            .collect();
        assert!(leftovers.is_empty());

        let report = orchestrator
            .restore_cluster(&CancelScope::root(), &manifest.archive_path())
            .await?;
        assert_eq!(report.restored.len(), 2);
        assert!(report.globals_restored);
        assert!(report.preserve_ownership);
        assert!(!report.sequential);
        assert_eq!(server.read_state("restored_alpha.dump")?, "PGDMP custom dump of alpha\n");
        assert_eq!(server.read_state("restored_postgres.sql")?, "CREATE ROLE app;\n");
        let sql = server.sql_log()?;
        assert!(sql.contains("DROP DATABASE IF EXISTS \"beta\""));
        assert!(sql.contains("pg_terminate_backend"));
        Ok(())
    }

    #[tokio::test]
    async fn test_large_objects_force_sequential_restore() -> Result<()> {
        let server = FakeServer::new(&["alpha", "beta", "gamma"])?;
        server.with_large_objects("beta")?;
        server.slow_restores()?;
        let backups = TempDir::new()?;
        let mut config = server.config(backups.path());
        config.backup.cluster_parallelism = 3;
        let orchestrator = ClusterOrchestrator::new(server.engine_with(config));

        let manifest = orchestrator.backup_cluster(&CancelScope::root()).await?;
        let report = orchestrator
            .restore_cluster(&CancelScope::root(), &manifest.archive_path())
            .await?;
        assert!(report.sequential);

        let log = server.restore_log()?;
        let lines: Vec<&str> = log.lines().filter(|l| l.starts_with("start") || l.starts_with("end")).collect();
        assert_eq!(lines.len(), 6);
        for pair in lines.chunks(2) {
            let db = pair[0].trim_start_matches("start ");
            assert_eq!(pair[1], format!("end {}", db));
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_globals_failure_only_fatal_for_superuser() -> Result<()> {
        let server = FakeServer::new(&["alpha"])?;
        let backups = TempDir::new()?;
        let orchestrator = ClusterOrchestrator::new(server.engine(backups.path()));
        let manifest = orchestrator.backup_cluster(&CancelScope::root()).await?;
        server.fail_restore("postgres")?;

        let err = orchestrator
            .restore_cluster(&CancelScope::root(), &manifest.archive_path())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ToolFailure { .. }), "{err}");

        server.set_superuser(false)?;
        let report = orchestrator
            .restore_cluster(&CancelScope::root(), &manifest.archive_path())
            .await?;
        assert!(!report.globals_restored);
        assert!(!report.preserve_ownership);
        assert_eq!(report.restored.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_restore_failures_are_aggregated() -> Result<()> {
        let server = FakeServer::new(&["alpha", "beta"])?;
        let backups = TempDir::new()?;
        let orchestrator = ClusterOrchestrator::new(server.engine(backups.path()));
        let manifest = orchestrator.backup_cluster(&CancelScope::root()).await?;
        server.fail_restore("beta")?;

        let err = orchestrator
            .restore_cluster(&CancelScope::root(), &manifest.archive_path())
            .await
            .unwrap_err();
        match err {
            EngineError::PartialFailure { failures, artifact, .. } => {
                assert_eq!(failures.len(), 1);
                assert!(failures[0].starts_with("beta: "));
                assert!(failures[0].contains("forced failure"));
                assert!(artifact.is_none());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(server.read_state("restored_alpha.dump")?, "PGDMP custom dump of alpha\n");
        Ok(())
    }

    #[tokio::test]
    async fn test_globals_dump_failure_aborts_backup() -> Result<()> {
        let server = FakeServer::new(&["alpha"])?;
        server.fail_globals()?;
        let backups = TempDir::new()?;
        let orchestrator = ClusterOrchestrator::new(server.engine(backups.path()));

        let err = orchestrator.backup_cluster(&CancelScope::root()).await.unwrap_err();
        assert!(matches!(err, EngineError::ToolFailure { ref tool, .. } if tool == "pg_dumpall"));
        assert!(archives(backups.path()).is_empty());
        assert!(server.read_state("dump.log")?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_encrypted_cluster_round_trip() -> Result<()> {
        let server = FakeServer::new(&["alpha"])?;
        let backups = TempDir::new()?;
        let key_file = backups.path().join("cluster.key");
        std::fs::write(&key_file, hex::encode([9u8; 32]))?;
        let mut config = server.config(backups.path());
        config.encryption.enabled = true;
        config.encryption.key_file = Some(key_file);
        let orchestrator = ClusterOrchestrator::new(server.engine_with(config));

        let manifest = orchestrator.backup_cluster(&CancelScope::root()).await?;
        assert!(manifest.encrypted);
        assert!(is_encrypted_file(&manifest.archive_path())?);
        assert!(orchestrator
            .verify_cluster(&CancelScope::root(), &manifest.archive_path())
            .await?
            .is_valid());

        orchestrator
            .restore_cluster(&CancelScope::root(), &manifest.archive_path())
            .await?;
        assert_eq!(server.read_state("restored_alpha.dump")?, "PGDMP custom dump of alpha\n");
        Ok(())
    }

    #[test]
    fn test_dump_stem_is_reversible() {
        for db in ["alpha", "../etc", "a/b", "sales.2024", "a%2Fb", "naïve db"] {
            let stem = dump_stem(db);
            assert!(stem.bytes().all(|b| b.is_ascii_alphanumeric() || b"_-%".contains(&b)), "{stem}");
            assert_eq!(database_from_stem(&stem).as_deref(), Some(db));
        }
        assert_eq!(dump_stem("a/b"), "a%2Fb");
        assert_eq!(dump_stem("../etc"), "%2E%2E%2Fetc");
        assert_eq!(database_from_stem("legacy.name").as_deref(), Some("legacy.name"));
        assert_eq!(database_from_stem("bad%2"), None);
        assert_eq!(database_from_stem("bad%zz"), None);
    }

    #[tokio::test]
    async fn test_unsafe_database_names_stay_inside_dumps() -> Result<()> {
        let server = FakeServer::new(&["a/b", "../escape"])?;
        let backups = TempDir::new()?;
        let orchestrator = ClusterOrchestrator::new(server.engine(backups.path()));

        let manifest = orchestrator.backup_cluster(&CancelScope::root()).await?;
        let mut files: Vec<(&str, &str)> = manifest
            .databases
            .iter()
            .map(|m| (m.database.as_str(), m.backup_file.as_str()))
            .collect();
        files.sort();
        assert_eq!(files, [("../escape", "dumps/%2E%2E%2Fescape.dump"), ("a/b", "dumps/a%2Fb.dump")]);
        assert!(orchestrator
            .verify_cluster(&CancelScope::root(), &manifest.archive_path())
            .await?
            .is_valid());

        let extracted = TempDir::new()?;
        std::fs::write(extracted.path().join("a%2Fb.dump"), b"x")?;
        std::fs::write(extracted.path().join("%2E%2E%2Fescape.sql.gz"), b"x")?;
        std::fs::write(extracted.path().join("broken%2.dump"), b"x")?;
        let names: Vec<String> = member_dumps(extracted.path()).await?.into_iter().map(|(db, _)| db).collect();
        assert_eq!(names, ["../escape", "a/b"]);
        Ok(())
    }
}
