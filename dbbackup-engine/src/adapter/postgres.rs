//! PostgreSQL client-tool command lines.

use super::{BackupOptions, DumpFormat, RestoreOptions};
use crate::config::{DatabaseConfig, ToolPaths};
use crate::executor::ToolCommand;
use std::path::Path;

/// Highest custom-format compression level used; higher levels cost a lot of
/// memory in pg_dump for little gain.
pub const MAX_CUSTOM_COMPRESSION: u32 = 6;

fn with_connection(command: ToolCommand, conn: &DatabaseConfig) -> ToolCommand {
    let command = command
        .arg("-h")
        .arg(&conn.host)
        .arg("-p")
        .arg(conn.port().to_string())
        .arg("-U")
        .arg(&conn.user)
        .arg("--no-password");
    match &conn.password {
        Some(password) => command.env("PGPASSWORD", password.clone()),
        None => command,
    }
}

pub fn backup_command(
    conn: &DatabaseConfig,
    tools: &ToolPaths,
    db: &str,
    output: Option<&Path>,
    options: &BackupOptions,
) -> ToolCommand {
    let mut command = with_connection(ToolCommand::new(&tools.pg_dump), conn);
    command = match options.format {
        DumpFormat::Custom => command
            .arg("-Fc")
            .arg(format!("-Z{}", options.compression_level.min(MAX_CUSTOM_COMPRESSION))),
        DumpFormat::Plain => command.arg("-Fp"),
    };
    if options.schema_only {
        command = command.arg("--schema-only");
    }
    if options.data_only {
        command = command.arg("--data-only");
    }
    for table in &options.tables {
        command = command.arg("-t").arg(table);
    }
    if let Some(output) = output {
        command = command.arg("-f").arg(output);
    }
    command.arg(db)
}

pub fn restore_command(
    conn: &DatabaseConfig,
    tools: &ToolPaths,
    db: &str,
    input: &Path,
    options: &RestoreOptions,
) -> ToolCommand {
    let is_custom = input.extension().is_some_and(|ext| ext == "dump");
    if !is_custom {
        return psql_command(conn, tools, db);
    }

    let mut command = with_connection(ToolCommand::new(&tools.pg_restore), conn)
        .arg("-d")
        .arg(db);
    if !options.preserve_ownership {
        command = command.arg("--no-owner").arg("--no-privileges");
    }
    if options.single_transaction {
        command = command.arg("--single-transaction");
    } else if options.jobs > 1 {
        command = command.arg("-j").arg(options.jobs.to_string());
    }
    command.arg(input)
}

/// `pg_dumpall --globals-only`: roles and tablespaces
pub fn globals_command(conn: &DatabaseConfig, tools: &ToolPaths, output: &Path) -> ToolCommand {
    with_connection(ToolCommand::new(&tools.pg_dumpall), conn)
        .arg("--globals-only")
        .arg("-f")
        .arg(output)
}

/// psql reading a script from stdin, stopping at the first error
pub fn psql_command(conn: &DatabaseConfig, tools: &ToolPaths, db: &str) -> ToolCommand {
    with_connection(ToolCommand::new(&tools.psql), conn)
        .args(["-X", "-q", "-v", "ON_ERROR_STOP=1", "-d"])
        .arg(db)
}

/// psql running one statement with unaligned, tuples-only output
pub fn query_command(conn: &DatabaseConfig, tools: &ToolPaths, db: &str, sql: &str) -> ToolCommand {
    with_connection(ToolCommand::new(&tools.psql), conn)
        .args(["-X", "-A", "-t", "-q", "-v", "ON_ERROR_STOP=1", "-d"])
        .arg(db)
        .arg("-c")
        .arg(sql)
}

/// `pg_restore -l`: table of contents without connecting
pub fn toc_command(tools: &ToolPaths, dump: &Path) -> ToolCommand {
    ToolCommand::new(&tools.pg_restore).arg("-l").arg(dump)
}

/// True when a table-of-contents line describes a large object
pub fn is_large_object_entry(toc_line: &str) -> bool {
    let line = toc_line.trim_start();
    if line.starts_with(';') {
        return false;
    }
    line.contains(" BLOB ") || line.contains(" BLOBS ") || line.contains(" LARGE OBJECT ")
        || line.ends_with(" BLOBS")
}
