//! Database adapters.
//!
//! PostgreSQL and MySQL/MariaDB expose the same closed set of capabilities:
//! building dump and restore command lines and answering a handful of
//! catalog questions through the SQL client. [`DatabaseAdapter`] dispatches
//! on [`DatabaseType`]; the argv builders live in the per-engine modules.

pub mod mysql;
pub mod postgres;

use crate::config::{DatabaseConfig, ToolPaths};
use crate::executor::{PipelineExecutor, ToolCommand};
use crate::ratelimit::ConnectionLimiter;
use crate::runtime::CancelScope;
use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DatabaseType {
    #[default]
    #[serde(rename = "postgresql", alias = "postgres")]
    Postgres,
    #[serde(rename = "mysql")]
    MySql,
    #[serde(rename = "mariadb")]
    MariaDb,
}

impl DatabaseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseType::Postgres => "postgresql",
            DatabaseType::MySql => "mysql",
            DatabaseType::MariaDb => "mariadb",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            DatabaseType::Postgres => 5432,
            DatabaseType::MySql | DatabaseType::MariaDb => 3306,
        }
    }

    /// Environment variable the client tools read the password from
    pub fn password_env(&self) -> &'static str {
        match self {
            DatabaseType::Postgres => "PGPASSWORD",
            DatabaseType::MySql | DatabaseType::MariaDb => "MYSQL_PWD",
        }
    }

    pub fn is_mysql_family(&self) -> bool {
        matches!(self, DatabaseType::MySql | DatabaseType::MariaDb)
    }

    /// Databases that are never dropped or recreated
    pub fn is_system_database(&self, name: &str) -> bool {
        match self {
            DatabaseType::Postgres => matches!(name, "postgres" | "template0" | "template1"),
            DatabaseType::MySql | DatabaseType::MariaDb => {
                matches!(name, "mysql" | "sys" | "information_schema" | "performance_schema")
            }
        }
    }
}

impl fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatabaseType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "postgresql" | "postgres" | "pg" => Ok(DatabaseType::Postgres),
            "mysql" => Ok(DatabaseType::MySql),
            "mariadb" => Ok(DatabaseType::MariaDb),
            other => Err(EngineError::Config(format!("unknown database type '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpFormat {
    /// Tool-native archive (`pg_dump -Fc`), restorable with pg_restore
    Custom,
    /// SQL text
    Plain,
}

#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub format: DumpFormat,
    pub compression_level: u32,
    pub schema_only: bool,
    pub data_only: bool,
    /// Restrict to these tables
    pub tables: Vec<String>,
    /// Row filter (mysqldump `--where`)
    pub where_clause: Option<String>,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            format: DumpFormat::Custom,
            compression_level: 6,
            schema_only: false,
            data_only: false,
            tables: Vec::new(),
            where_clause: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Keep object owners and grants; requires superuser
    pub preserve_ownership: bool,
    /// One transaction for the whole restore. Off for large restores, where
    /// it exhausts the lock table.
    pub single_transaction: bool,
    pub jobs: usize,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            preserve_ownership: true,
            single_transaction: false,
            jobs: 1,
        }
    }
}

/// Quote an identifier for the given engine
pub fn quote_ident(kind: DatabaseType, ident: &str) -> String {
    match kind {
        DatabaseType::Postgres => format!("\"{}\"", ident.replace('"', "\"\"")),
        DatabaseType::MySql | DatabaseType::MariaDb => format!("`{}`", ident.replace('`', "``")),
    }
}

/// Quote a string literal for the given engine
pub fn quote_literal(kind: DatabaseType, value: &str) -> String {
    match kind {
        DatabaseType::Postgres => format!("'{}'", value.replace('\'', "''")),
        DatabaseType::MySql | DatabaseType::MariaDb => {
            format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
        }
    }
}

/// Client-tool access to one database server.
#[derive(Debug, Clone)]
pub struct DatabaseAdapter {
    kind: DatabaseType,
    conn: DatabaseConfig,
    tools: ToolPaths,
    executor: PipelineExecutor,
    limiter: Option<Arc<ConnectionLimiter>>,
    query_timeout: Duration,
}

impl DatabaseAdapter {
    pub fn new(conn: DatabaseConfig, tools: ToolPaths, executor: PipelineExecutor, query_timeout: Duration) -> Self {
        Self {
            kind: conn.kind,
            conn,
            tools,
            executor,
            limiter: None,
            query_timeout,
        }
    }

    pub fn with_limiter(mut self, limiter: Arc<ConnectionLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn kind(&self) -> DatabaseType {
        self.kind
    }

    pub fn connection(&self) -> &DatabaseConfig {
        &self.conn
    }

    pub fn tools(&self) -> &ToolPaths {
        &self.tools
    }

    pub fn executor(&self) -> &PipelineExecutor {
        &self.executor
    }

    /// Dump command for `db`. With `output` the tool writes the file itself;
    /// without it the dump goes to stdout.
    pub fn build_backup_argv(&self, db: &str, output: Option<&Path>, options: &BackupOptions) -> ToolCommand {
        match self.kind {
            DatabaseType::Postgres => postgres::backup_command(&self.conn, &self.tools, db, output, options),
            DatabaseType::MySql | DatabaseType::MariaDb => {
                mysql::backup_command(&self.conn, &self.tools, db, output, options)
            }
        }
    }

    /// Restore command for `input` into `db`. Custom-format PostgreSQL dumps
    /// are read by pg_restore from the file; everything else is SQL the
    /// caller streams into the returned command's stdin.
    pub fn build_restore_argv(&self, db: &str, input: &Path, options: &RestoreOptions) -> ToolCommand {
        match self.kind {
            DatabaseType::Postgres => postgres::restore_command(&self.conn, &self.tools, db, input, options),
            DatabaseType::MySql | DatabaseType::MariaDb => mysql::client_command(&self.conn, &self.tools, Some(db)),
        }
    }

    /// Global objects (roles, tablespaces). MySQL has no equivalent.
    pub fn build_globals_argv(&self, output: &Path) -> Option<ToolCommand> {
        match self.kind {
            DatabaseType::Postgres => Some(postgres::globals_command(&self.conn, &self.tools, output)),
            DatabaseType::MySql | DatabaseType::MariaDb => None,
        }
    }

    /// SQL client reading a script from stdin
    pub fn build_sql_client_argv(&self, db: Option<&str>) -> ToolCommand {
        match self.kind {
            DatabaseType::Postgres => postgres::psql_command(&self.conn, &self.tools, db.unwrap_or(&self.conn.maintenance_db)),
            DatabaseType::MySql | DatabaseType::MariaDb => mysql::client_command(&self.conn, &self.tools, db),
        }
    }

    /// Query command whose raw stdout the caller consumes (COPY ... TO STDOUT)
    pub fn build_query_argv(&self, db: Option<&str>, sql: &str) -> ToolCommand {
        match self.kind {
            DatabaseType::Postgres => {
                postgres::query_command(&self.conn, &self.tools, db.unwrap_or(&self.conn.maintenance_db), sql)
            }
            DatabaseType::MySql | DatabaseType::MariaDb => mysql::query_command(&self.conn, &self.tools, db, sql),
        }
    }

    /// Run `sql` and return the rows, one unaligned line each.
    pub async fn query(&self, scope: &CancelScope, db: Option<&str>, sql: &str) -> Result<Vec<String>> {
        let command = self.build_query_argv(db, sql);
        debug!(sql = %sql, "Running catalog query");

        if let Some(limiter) = &self.limiter {
            limiter.acquire(&self.conn.host).await?;
        }
        let scope = scope.with_timeout(self.query_timeout);
        let result = self.executor.run_lines(&scope, &command).await;
        if let Some(limiter) = &self.limiter {
            match &result {
                Ok(_) => limiter.record_success(&self.conn.host),
                Err(EngineError::ToolFailure { .. }) => limiter.record_failure(&self.conn.host),
                Err(_) => {}
            }
        }
        result
    }

    pub async fn execute(&self, scope: &CancelScope, db: Option<&str>, sql: &str) -> Result<()> {
        self.query(scope, db, sql).await.map(|_| ())
    }

    /// Databases worth backing up. Postgres templates and MySQL schemas are excluded;
    /// the `postgres` maintenance database is kept since it can hold user objects.
    pub async fn list_databases(&self, scope: &CancelScope) -> Result<Vec<String>> {
        let sql = match self.kind {
            DatabaseType::Postgres => {
                "SELECT datname FROM pg_database WHERE datistemplate = false AND datallowconn ORDER BY datname"
            }
            DatabaseType::MySql | DatabaseType::MariaDb => "SHOW DATABASES",
        };
        let rows = self.query(scope, None, sql).await?;
        Ok(rows
            .into_iter()
            .filter(|db| db == "postgres" || !self.kind.is_system_database(db))
            .collect())
    }

    /// Tables of `db`, already quoted for use in SQL
    pub async fn list_tables(&self, scope: &CancelScope, db: &str) -> Result<Vec<String>> {
        let sql = match self.kind {
            DatabaseType::Postgres => {
                "SELECT quote_ident(schemaname) || '.' || quote_ident(tablename) FROM pg_tables \
                 WHERE schemaname NOT IN ('pg_catalog', 'information_schema') ORDER BY 1"
                    .to_string()
            }
            DatabaseType::MySql | DatabaseType::MariaDb => format!(
                "SELECT table_name FROM information_schema.tables WHERE table_schema = {} \
                 AND table_type = 'BASE TABLE' ORDER BY table_name",
                quote_literal(self.kind, db)
            ),
        };
        self.query(scope, Some(db), &sql).await
    }

    /// Size of `db` in bytes
    pub async fn get_database_size(&self, scope: &CancelScope, db: &str) -> Result<u64> {
        let sql = match self.kind {
            DatabaseType::Postgres => format!("SELECT pg_database_size({})", quote_literal(self.kind, db)),
            DatabaseType::MySql | DatabaseType::MariaDb => format!(
                "SELECT COALESCE(SUM(data_length + index_length), 0) FROM information_schema.tables \
                 WHERE table_schema = {}",
                quote_literal(self.kind, db)
            ),
        };
        let rows = self.query(scope, None, &sql).await?;
        rows.first()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or_else(|| EngineError::ToolFailure {
                tool: "size query".to_string(),
                exit_code: Some(0),
                stderr: format!("unexpected size result for {}: {:?}", db, rows.first()),
            })
    }

    /// Server version string
    pub async fn get_version(&self, scope: &CancelScope) -> Result<String> {
        let sql = match self.kind {
            DatabaseType::Postgres => "SHOW server_version",
            DatabaseType::MySql | DatabaseType::MariaDb => "SELECT VERSION()",
        };
        let rows = self.query(scope, None, sql).await?;
        Ok(rows.into_iter().next().unwrap_or_default())
    }

    /// Whether the connected role may restore ownership and global objects
    pub async fn is_superuser(&self, scope: &CancelScope) -> Result<bool> {
        let sql = match self.kind {
            DatabaseType::Postgres => "SELECT usesuper FROM pg_user WHERE usename = current_user",
            DatabaseType::MySql | DatabaseType::MariaDb => {
                "SELECT COUNT(*) > 0 FROM information_schema.user_privileges WHERE privilege_type = 'SUPER'"
            }
        };
        let rows = self.query(scope, None, sql).await?;
        Ok(rows
            .first()
            .map(|v| matches!(v.trim(), "t" | "true" | "1" | "on"))
            .unwrap_or(false))
    }

    /// Disconnect every other session from `db`
    pub async fn terminate_connections(&self, scope: &CancelScope, db: &str) -> Result<()> {
        if self.kind != DatabaseType::Postgres {
            return Ok(());
        }
        let sql = format!(
            "SELECT pg_terminate_backend(pid) FROM pg_stat_activity WHERE datname = {} AND pid <> pg_backend_pid()",
            quote_literal(self.kind, db)
        );
        self.execute(scope, None, &sql).await
    }

    /// `DROP DATABASE IF EXISTS`; system databases are left alone
    pub async fn drop_database(&self, scope: &CancelScope, db: &str) -> Result<()> {
        if self.kind.is_system_database(db) {
            info!(database = %db, "Not dropping system database");
            return Ok(());
        }
        let sql = format!("DROP DATABASE IF EXISTS {}", quote_ident(self.kind, db));
        self.execute(scope, None, &sql).await
    }

    /// PostgreSQL databases are created from template0 so that local
    /// additions to template1 cannot collide with restored objects.
    pub async fn create_database(&self, scope: &CancelScope, db: &str) -> Result<()> {
        if self.kind.is_system_database(db) {
            return Ok(());
        }
        let sql = match self.kind {
            DatabaseType::Postgres => format!("CREATE DATABASE {} WITH TEMPLATE template0", quote_ident(self.kind, db)),
            DatabaseType::MySql | DatabaseType::MariaDb => format!("CREATE DATABASE {}", quote_ident(self.kind, db)),
        };
        self.execute(scope, None, &sql).await
    }

    /// Table of contents of a custom-format dump (`pg_restore -l`)
    pub async fn list_dump_contents(&self, scope: &CancelScope, dump: &Path) -> Result<Vec<String>> {
        let command = postgres::toc_command(&self.tools, dump);
        self.executor.run_lines(scope, &command).await
    }
}
