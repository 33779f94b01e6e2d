//! Engine state shared by every operation.

use crate::adapter::DatabaseAdapter;
use crate::audit::{AuditEvent, AuditOutcome, AuditSink, JsonLinesAudit, TracingAudit};
use crate::config::Config;
use crate::crypto::{EncryptionKey, KeySource};
use crate::diskspace::{DiskProbe, DiskSpaceCache};
use crate::executor::PipelineExecutor;
use crate::progress::{ProgressReporter, TracingProgress};
use crate::ratelimit::ConnectionLimiter;
use crate::utils::errors::{EngineError, Result};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Built once by the binary and handed to operations behind an `Arc`
pub struct EngineState {
    pub config: Config,
    pub adapter: DatabaseAdapter,
    pub executor: PipelineExecutor,
    pub disk: DiskSpaceCache,
    pub limiter: Arc<ConnectionLimiter>,
    pub progress: Arc<dyn ProgressReporter>,
    pub audit: Arc<dyn AuditSink>,
}

impl EngineState {
    pub fn new(config: Config) -> Self {
        let executor = PipelineExecutor::new(Duration::from_secs(config.executor.kill_grace_secs));
        let limiter = Arc::new(ConnectionLimiter::new(config.executor.max_connect_attempts));
        let adapter = DatabaseAdapter::new(
            config.database.clone(),
            config.tools.clone(),
            executor.clone(),
            Duration::from_secs(config.executor.query_timeout_secs),
        )
        .with_limiter(limiter.clone());
        let audit: Arc<dyn AuditSink> = match &config.audit.path {
            Some(path) => Arc::new(JsonLinesAudit::new(path)),
            None => Arc::new(TracingAudit),
        };

        Self {
            disk: DiskSpaceCache::new(&config.disk),
            adapter,
            executor,
            limiter,
            progress: Arc::new(TracingProgress::new()),
            audit,
            config,
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_disk_probe(mut self, probe: Box<dyn DiskProbe>) -> Self {
        self.disk = DiskSpaceCache::with_probe(&self.config.disk, probe);
        self
    }

    /// Artifact key from `[encryption]`; a key file wins over a passphrase
    pub fn key_source(&self) -> Result<Option<KeySource>> {
        let encryption = &self.config.encryption;
        if let Some(path) = &encryption.key_file {
            return Ok(Some(KeySource::Raw(EncryptionKey::from_file(path)?)));
        }
        Ok(encryption
            .passphrase
            .as_ref()
            .filter(|p| !p.is_empty())
            .map(|p| KeySource::Passphrase(p.clone())))
    }

    /// Key source, failing when none is configured
    pub fn require_key_source(&self) -> Result<KeySource> {
        self.key_source()?.ok_or_else(|| {
            EngineError::Config(
                "no encryption key configured: set encryption.key_file or DBBACKUP_ENCRYPTION_KEY".to_string(),
            )
        })
    }

    /// Start an audited operation
    pub fn audit_start(&self, operation: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.audit.record(&AuditEvent::new(id, operation, AuditOutcome::Started));
        id
    }

    /// Record how an audited operation ended
    pub fn audit_finish<T>(&self, id: Uuid, operation: &str, result: &Result<T>) {
        let event = match result {
            Ok(_) => AuditEvent::new(id, operation, AuditOutcome::Succeeded),
            Err(EngineError::PartialFailure { failures, .. }) => {
                AuditEvent::new(id, operation, AuditOutcome::PartiallyFailed).detail("failures", failures.join("; "))
            }
            Err(e) => AuditEvent::new(id, operation, AuditOutcome::Failed).detail("error", e),
        };
        self.audit.record(&event);
    }
}
