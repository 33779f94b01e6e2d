//! MySQL / MariaDB client-tool command lines.

use super::BackupOptions;
use crate::config::{DatabaseConfig, ToolPaths};
use crate::executor::ToolCommand;
use std::path::Path;

fn with_connection(command: ToolCommand, conn: &DatabaseConfig) -> ToolCommand {
    let command = command
        .arg("-h")
        .arg(&conn.host)
        .arg("-P")
        .arg(conn.port().to_string())
        .arg("-u")
        .arg(&conn.user);
    match &conn.password {
        Some(password) => command.env("MYSQL_PWD", password.clone()),
        None => command,
    }
}

/// mysqldump always produces SQL text; compression happens downstream.
pub fn backup_command(
    conn: &DatabaseConfig,
    tools: &ToolPaths,
    db: &str,
    output: Option<&Path>,
    options: &BackupOptions,
) -> ToolCommand {
    let mut command = with_connection(ToolCommand::new(&tools.mysqldump), conn)
        .args(["--single-transaction", "--quick", "--routines", "--triggers", "--events"]);
    if options.schema_only {
        command = command.arg("--no-data");
    }
    if options.data_only {
        command = command.arg("--no-create-info");
    }
    if let Some(filter) = &options.where_clause {
        command = command.arg(format!("--where={}", filter));
    }
    if let Some(output) = output {
        let mut flag = std::ffi::OsString::from("--result-file=");
        flag.push(output);
        command = command.arg(flag);
    }
    command.arg(db).args(&options.tables)
}

/// mysql client reading SQL from stdin
pub fn client_command(conn: &DatabaseConfig, tools: &ToolPaths, db: Option<&str>) -> ToolCommand {
    let command = with_connection(ToolCommand::new(&tools.mysql), conn);
    match db {
        Some(db) => command.arg(db),
        None => command,
    }
}

/// Batch mode, no column names: one row per line
pub fn query_command(conn: &DatabaseConfig, tools: &ToolPaths, db: Option<&str>, sql: &str) -> ToolCommand {
    let command = with_connection(ToolCommand::new(&tools.mysql), conn)
        .args(["-N", "-B", "-e"])
        .arg(sql);
    match db {
        Some(db) => command.arg(db),
        None => command,
    }
}
