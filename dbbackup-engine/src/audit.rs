//! Audit trail of engine operations.
//!
//! Sinks never fail the operation being audited: write errors are logged
//! and swallowed.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Started,
    Succeeded,
    PartiallyFailed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub id: Uuid,
    /// Shared by every event of one operation
    pub operation_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub operation: String,
    pub outcome: AuditOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<PathBuf>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, String>,
}

impl AuditEvent {
    pub fn new(operation_id: Uuid, operation: &str, outcome: AuditOutcome) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation_id,
            timestamp: Utc::now(),
            operation: operation.to_string(),
            outcome,
            database: None,
            artifact: None,
            details: BTreeMap::new(),
        }
    }

    pub fn database(mut self, database: &str) -> Self {
        self.database = Some(database.to_string());
        self
    }

    pub fn artifact(mut self, artifact: &Path) -> Self {
        self.artifact = Some(artifact.to_path_buf());
        self
    }

    pub fn detail(mut self, key: &str, value: impl ToString) -> Self {
        self.details.insert(key.to_string(), value.to_string());
        self
    }
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent);
}

/// Emits audit events into the regular log
#[derive(Debug, Default)]
pub struct TracingAudit;

impl AuditSink for TracingAudit {
    fn record(&self, event: &AuditEvent) {
        info!(
            target: "audit",
            operation_id = %event.operation_id,
            operation = %event.operation,
            outcome = ?event.outcome,
            database = event.database.as_deref().unwrap_or(""),
            "audit event"
        );
    }
}

/// Appends one JSON document per line
#[derive(Debug)]
pub struct JsonLinesAudit {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonLinesAudit {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn append(&self, event: &AuditEvent) -> std::io::Result<()> {
        let mut line = serde_json::to_string(event).map_err(std::io::Error::other)?;
        line.push('\n');
        let _guard = self.lock.lock().map_err(|_| std::io::Error::other("audit lock poisoned"))?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(line.as_bytes())
    }
}

impl AuditSink for JsonLinesAudit {
    fn record(&self, event: &AuditEvent) {
        if let Err(e) = self.append(event) {
            warn!(path = %self.path.display(), error = %e, "failed to write audit event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_json_lines_append() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audit/events.jsonl");
        let sink = JsonLinesAudit::new(&path);
        let op = Uuid::new_v4();

        sink.record(&AuditEvent::new(op, "backup", AuditOutcome::Started).database("app"));
        sink.record(
            &AuditEvent::new(op, "backup", AuditOutcome::Succeeded)
                .artifact(Path::new("/b/db_app.dump"))
                .detail("size_bytes", 42),
        );

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["outcome"], "started");
        assert_eq!(lines[0]["database"], "app");
        assert_eq!(lines[1]["details"]["size_bytes"], "42");
        assert_eq!(lines[0]["operation_id"], lines[1]["operation_id"]);
    }

    #[test]
    fn test_write_failure_does_not_panic() {
        let dir = TempDir::new().unwrap();
        // a directory where the log file should be
        let sink = JsonLinesAudit::new(dir.path());
        sink.record(&AuditEvent::new(Uuid::new_v4(), "cleanup", AuditOutcome::Failed));
    }
}
