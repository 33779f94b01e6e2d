//! Configuration management for the backup engine.
//!
//! Loads configuration from a TOML file with environment variable overrides
//! (a `.env` file is honoured through dotenvy).

use crate::adapter::DatabaseType;
use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub wal: WalConfig,
    #[serde(default)]
    pub encryption: EncryptionConfig,
    #[serde(default)]
    pub disk: DiskConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub tools: ToolPaths,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// postgresql, mysql or mariadb
    #[serde(default)]
    pub kind: DatabaseType,

    #[serde(default = "default_host")]
    pub host: String,

    /// Defaults to the engine's standard port when unset
    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default = "default_user")]
    pub user: String,

    /// Never written back out; prefer PGPASSWORD / MYSQL_PWD
    #[serde(default, skip_serializing)]
    pub password: Option<String>,

    /// Database used for server-level queries
    #[serde(default = "default_maintenance_db")]
    pub maintenance_db: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Directory holding artifacts and their `.meta.json` sidecars
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,

    /// Compression level (1-9)
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,

    /// Concurrent per-database tasks in cluster operations
    #[serde(default = "default_cluster_parallelism")]
    pub cluster_parallelism: usize,

    /// Per-database task timeout in seconds
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,

    /// Databases above this size are dumped as plain SQL through an
    /// external parallel compressor
    #[serde(default = "default_large_database_threshold")]
    pub large_database_threshold: u64,

    /// Threads handed to pigz
    #[serde(default = "default_compressor_threads")]
    pub compressor_threads: usize,

    /// Keep ownership on restore when running as superuser
    #[serde(default = "default_true")]
    pub preserve_ownership: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    #[serde(default = "default_min_backups")]
    pub min_backups: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalConfig {
    #[serde(default = "default_wal_archive_dir")]
    pub archive_dir: PathBuf,

    #[serde(default)]
    pub compress: bool,

    #[serde(default = "default_compression_level")]
    pub compression_level: u32,

    #[serde(default)]
    pub encrypt: bool,

    /// File holding a raw 32-byte key; a passphrase is used otherwise
    #[serde(default)]
    pub key_file: Option<PathBuf>,

    #[serde(default = "default_wal_retention_days")]
    pub retention_days: u32,

    /// Floor of segments that WAL retention never deletes
    #[serde(default)]
    pub min_segments: usize,

    /// Overrides `cp <archive_dir>/%f %p` in generated recovery configs
    #[serde(default)]
    pub restore_command: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EncryptionConfig {
    /// Encrypt backup artifacts in place after they are written
    #[serde(default)]
    pub enabled: bool,

    /// Passphrase, usually supplied via DBBACKUP_ENCRYPTION_KEY
    #[serde(default, skip_serializing)]
    pub passphrase: Option<String>,

    /// File holding a raw 32-byte key (takes precedence over the passphrase)
    #[serde(default)]
    pub key_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskConfig {
    #[serde(default = "default_warning_percent")]
    pub warning_percent: f64,

    #[serde(default = "default_critical_percent")]
    pub critical_percent: f64,

    #[serde(default = "default_disk_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Seconds between SIGTERM and SIGKILL for a cancelled process group
    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,

    /// Timeout for short catalog queries
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,

    /// Consecutive connection failures per host before giving up
    #[serde(default = "default_max_connect_attempts")]
    pub max_connect_attempts: u32,
}

/// Locations of the external tools. Plain names are resolved through PATH.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolPaths {
    #[serde(default = "tool_pg_dump")]
    pub pg_dump: PathBuf,
    #[serde(default = "tool_pg_dumpall")]
    pub pg_dumpall: PathBuf,
    #[serde(default = "tool_pg_restore")]
    pub pg_restore: PathBuf,
    #[serde(default = "tool_psql")]
    pub psql: PathBuf,
    #[serde(default = "tool_mysqldump")]
    pub mysqldump: PathBuf,
    #[serde(default = "tool_mysql")]
    pub mysql: PathBuf,
    #[serde(default = "tool_pigz")]
    pub pigz: PathBuf,
    #[serde(default = "tool_gzip")]
    pub gzip: PathBuf,
    #[serde(default = "tool_tar")]
    pub tar: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuditConfig {
    /// JSON-lines audit log; events go to the tracing log when unset
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_host() -> String {
    "localhost".to_string()
}

fn default_user() -> String {
    "postgres".to_string()
}

fn default_maintenance_db() -> String {
    "postgres".to_string()
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("/var/lib/dbbackup")
}

fn default_compression_level() -> u32 {
    6
}

fn default_cluster_parallelism() -> usize {
    2
}

fn default_task_timeout_secs() -> u64 {
    2 * 60 * 60
}

fn default_large_database_threshold() -> u64 {
    5 * 1024 * 1024 * 1024 // 5 GiB
}

fn default_compressor_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_true() -> bool {
    true
}

fn default_retention_days() -> u32 {
    30
}

fn default_min_backups() -> usize {
    5
}

fn default_wal_archive_dir() -> PathBuf {
    PathBuf::from("/var/lib/dbbackup/wal")
}

fn default_wal_retention_days() -> u32 {
    7
}

fn default_warning_percent() -> f64 {
    80.0
}

fn default_critical_percent() -> f64 {
    95.0
}

fn default_disk_cache_ttl_secs() -> u64 {
    30
}

fn default_kill_grace_secs() -> u64 {
    5
}

fn default_query_timeout_secs() -> u64 {
    60
}

fn default_max_connect_attempts() -> u32 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

fn tool_pg_dump() -> PathBuf {
    PathBuf::from("pg_dump")
}

fn tool_pg_dumpall() -> PathBuf {
    PathBuf::from("pg_dumpall")
}

fn tool_pg_restore() -> PathBuf {
    PathBuf::from("pg_restore")
}

fn tool_psql() -> PathBuf {
    PathBuf::from("psql")
}

fn tool_mysqldump() -> PathBuf {
    PathBuf::from("mysqldump")
}

fn tool_mysql() -> PathBuf {
    PathBuf::from("mysql")
}

fn tool_pigz() -> PathBuf {
    PathBuf::from("pigz")
}

fn tool_gzip() -> PathBuf {
    PathBuf::from("gzip")
}

fn tool_tar() -> PathBuf {
    PathBuf::from("tar")
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            kind: DatabaseType::default(),
            host: default_host(),
            port: None,
            user: default_user(),
            password: None,
            maintenance_db: default_maintenance_db(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            backup_dir: default_backup_dir(),
            compression_level: default_compression_level(),
            cluster_parallelism: default_cluster_parallelism(),
            task_timeout_secs: default_task_timeout_secs(),
            large_database_threshold: default_large_database_threshold(),
            compressor_threads: default_compressor_threads(),
            preserve_ownership: true,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
            min_backups: default_min_backups(),
        }
    }
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            archive_dir: default_wal_archive_dir(),
            compress: false,
            compression_level: default_compression_level(),
            encrypt: false,
            key_file: None,
            retention_days: default_wal_retention_days(),
            min_segments: 0,
            restore_command: None,
        }
    }
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            warning_percent: default_warning_percent(),
            critical_percent: default_critical_percent(),
            cache_ttl_secs: default_disk_cache_ttl_secs(),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            kill_grace_secs: default_kill_grace_secs(),
            query_timeout_secs: default_query_timeout_secs(),
            max_connect_attempts: default_max_connect_attempts(),
        }
    }
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            pg_dump: tool_pg_dump(),
            pg_dumpall: tool_pg_dumpall(),
            pg_restore: tool_pg_restore(),
            psql: tool_psql(),
            mysqldump: tool_mysqldump(),
            mysql: tool_mysql(),
            pigz: tool_pigz(),
            gzip: tool_gzip(),
            tar: tool_tar(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl BackupConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    /// Parallelism clamped to at least one worker
    pub fn parallelism(&self) -> usize {
        self.cluster_parallelism.max(1)
    }
}

impl DatabaseConfig {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.kind.default_port())
    }
}

impl Config {
    /// Load configuration from an optional TOML file, then apply `.env` and
    /// environment overrides and validate the result.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| EngineError::Config(format!("invalid config: {}", e)))
    }

    /// Apply overrides from a variable lookup (the process environment in
    /// production).
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let password_var = self.database.kind.password_env();
        if let Some(password) = lookup(password_var).filter(|p| !p.is_empty()) {
            self.database.password = Some(password);
        }
        if let Some(dir) = lookup("DBBACKUP_BACKUP_DIR").filter(|d| !d.is_empty()) {
            self.backup.backup_dir = PathBuf::from(dir);
        }
        if let Some(parallelism) = lookup("DBBACKUP_PARALLELISM").and_then(|v| v.parse().ok()) {
            self.backup.cluster_parallelism = parallelism;
        }
        if let Some(passphrase) = lookup("DBBACKUP_ENCRYPTION_KEY").filter(|p| !p.is_empty()) {
            self.encryption.passphrase = Some(passphrase);
        }
        if let Some(dir) = lookup("DBBACKUP_WAL_ARCHIVE_DIR").filter(|d| !d.is_empty()) {
            self.wal.archive_dir = PathBuf::from(dir);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=9).contains(&self.backup.compression_level) {
            return Err(EngineError::Config(format!(
                "backup.compression_level must be 1-9, got {}",
                self.backup.compression_level
            )));
        }
        if !(1..=9).contains(&self.wal.compression_level) {
            return Err(EngineError::Config(format!(
                "wal.compression_level must be 1-9, got {}",
                self.wal.compression_level
            )));
        }
        if self.disk.warning_percent > self.disk.critical_percent {
            return Err(EngineError::Config(
                "disk.warning_percent must not exceed disk.critical_percent".to_string(),
            ));
        }
        if self.backup.task_timeout_secs == 0 {
            return Err(EngineError::Config("backup.task_timeout_secs must be > 0".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.database.kind, DatabaseType::Postgres);
        assert_eq!(config.database.port(), 5432);
        assert_eq!(config.backup.task_timeout(), Duration::from_secs(7200));
        assert_eq!(config.backup.large_database_threshold, 5 * 1024 * 1024 * 1024);
        assert_eq!(config.disk.cache_ttl_secs, 30);
        assert_eq!(config.wal.min_segments, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = Config::from_toml(
            r#"
            [database]
            kind = "mysql"
            user = "root"

            [backup]
            backup_dir = "/srv/backups"
            cluster_parallelism = 0
            "#,
        )
        .unwrap();

        assert_eq!(config.database.kind, DatabaseType::MySql);
        assert_eq!(config.database.port(), 3306);
        assert_eq!(config.backup.backup_dir, PathBuf::from("/srv/backups"));
        assert_eq!(config.backup.parallelism(), 1);
        assert_eq!(config.tools.pg_dump, PathBuf::from("pg_dump"));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("PGPASSWORD", "secret"),
            ("DBBACKUP_BACKUP_DIR", "/tmp/b"),
            ("DBBACKUP_PARALLELISM", "8"),
            ("DBBACKUP_ENCRYPTION_KEY", "pw"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_env_overrides(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.database.password.as_deref(), Some("secret"));
        assert_eq!(config.backup.backup_dir, PathBuf::from("/tmp/b"));
        assert_eq!(config.backup.cluster_parallelism, 8);
        assert_eq!(config.encryption.passphrase.as_deref(), Some("pw"));
    }

    #[test]
    fn test_password_is_not_serialized() {
        let mut config = Config::default();
        config.database.password = Some("hunter2".to_string());
        let rendered = toml::to_string(&config).unwrap();
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_validate_rejects_bad_level() {
        let mut config = Config::default();
        config.backup.compression_level = 12;
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }
}
