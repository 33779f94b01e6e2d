//! Files that never belong in a physical backup.

use crate::adapter::DatabaseType;
use std::fs::FileType;
use std::path::Path;

const PG_SUFFIXES: &[&str] = &[".tmp", ".lock"];
const PG_NAMES: &[&str] = &["postmaster.pid", "postmaster.opts"];
const PG_DIRS: &[&str] = &["pg_wal", "pg_xlog", "pg_replslot"];

const MYSQL_SUFFIXES: &[&str] = &[".tmp", ".lock", ".pid", ".sock", ".err"];
const MYSQL_PREFIXES: &[&str] = &["#sql", "ib_logfile", "undo_", "ndb_"];
const MYSQL_PATH_PARTS: &[&str] = &["relay-log", "mysql-bin", "binlog", "performance_schema"];
const MYSQL_NAMES: &[&str] = &["auto.cnf.lock", "mysqld.pid", "general.log", "query.log", "error.log"];

/// True when `relative` (a path inside the data directory) is runtime state
/// rather than data.
pub fn is_excluded(kind: DatabaseType, relative: &Path, file_type: &FileType) -> bool {
    let name = relative
        .file_name()
        .map(|n| n.to_string_lossy())
        .unwrap_or_default();
    let full = relative.to_string_lossy();

    match kind {
        DatabaseType::Postgres => {
            is_socket(file_type)
                || PG_SUFFIXES.iter().any(|s| name.ends_with(s))
                || PG_NAMES.contains(&&*name)
                || PG_DIRS.iter().any(|d| full.contains(d))
        }
        DatabaseType::MySql | DatabaseType::MariaDb => {
            is_socket(file_type)
                || MYSQL_SUFFIXES.iter().any(|s| name.ends_with(s))
                || MYSQL_PREFIXES.iter().any(|p| name.starts_with(p))
                || MYSQL_PATH_PARTS.iter().any(|p| full.contains(p))
                || MYSQL_NAMES.contains(&&*name)
                || is_slow_query_log(&name)
        }
    }
}

fn is_slow_query_log(name: &str) -> bool {
    name.ends_with(".log") && name.contains("slow")
}

#[cfg(unix)]
fn is_socket(file_type: &FileType) -> bool {
    use std::os::unix::fs::FileTypeExt;
    file_type.is_socket()
}

#[cfg(not(unix))]
fn is_socket(_file_type: &FileType) -> bool {
    false
}
