//! Progress reporting for long-running operations.
//!
//! `ProgressReporter` is the sink; the default implementation writes
//! structured `tracing` events. `ClusterProgress` tracks per-database task
//! state for the orchestrator and feeds an `EtaEstimator`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{error, info};

pub trait ProgressReporter: Send + Sync {
    fn start(&self, title: &str);
    fn update(&self, message: &str);
    fn complete(&self, message: &str);
    fn fail(&self, message: &str);
    fn set_estimator(&self, estimator: EtaEstimator);
}

/// Completion estimate from the average time per finished item
#[derive(Debug, Clone)]
pub struct EtaEstimator {
    start_time: Instant,
    total: usize,
    completed: usize,
}

impl EtaEstimator {
    pub fn new(total: usize) -> Self {
        Self {
            start_time: Instant::now(),
            total,
            completed: 0,
        }
    }

    pub fn record(&mut self, completed: usize) {
        self.completed = completed.min(self.total);
    }

    pub fn completed(&self) -> usize {
        self.completed
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn percent_complete(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        (self.completed as f64 / self.total as f64) * 100.0
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// `None` until the first item finishes
    pub fn eta(&self) -> Option<Duration> {
        self.eta_after(self.elapsed())
    }

    fn eta_after(&self, elapsed: Duration) -> Option<Duration> {
        if self.completed == 0 {
            return None;
        }
        let remaining = self.total.saturating_sub(self.completed) as u32;
        Some(elapsed / self.completed as u32 * remaining)
    }
}

/// Writes progress as `tracing` events
#[derive(Default)]
pub struct TracingProgress {
    title: Mutex<String>,
    estimator: Mutex<Option<EtaEstimator>>,
}

impl TracingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    fn title(&self) -> String {
        self.title.lock().map(|t| t.clone()).unwrap_or_default()
    }

    fn eta_suffix(&self) -> String {
        let Ok(guard) = self.estimator.lock() else {
            return String::new();
        };
        match guard.as_ref().and_then(|e| e.eta().map(|eta| (e, eta))) {
            Some((e, eta)) => format!(
                " ({}/{}, {:.0}%, eta {})",
                e.completed(),
                e.total(),
                e.percent_complete(),
                format_duration(eta.as_secs())
            ),
            None => String::new(),
        }
    }
}

impl ProgressReporter for TracingProgress {
    fn start(&self, title: &str) {
        if let Ok(mut t) = self.title.lock() {
            *t = title.to_string();
        }
        info!(operation = %title, "started");
    }

    fn update(&self, message: &str) {
        info!(operation = %self.title(), "{}{}", message, self.eta_suffix());
    }

    fn complete(&self, message: &str) {
        info!(operation = %self.title(), "completed: {}", message);
    }

    fn fail(&self, message: &str) {
        error!(operation = %self.title(), "failed: {}", message);
    }

    fn set_estimator(&self, estimator: EtaEstimator) {
        if let Ok(mut slot) = self.estimator.lock() {
            *slot = Some(estimator);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub total: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl ProgressSnapshot {
    pub fn finished(&self) -> usize {
        self.succeeded + self.failed
    }
}

struct ProgressState {
    tasks: BTreeMap<String, TaskStatus>,
    estimator: EtaEstimator,
}

/// Per-database task state shared by the orchestrator's workers
#[derive(Clone)]
pub struct ClusterProgress {
    state: Arc<RwLock<ProgressState>>,
    reporter: Arc<dyn ProgressReporter>,
}

impl ClusterProgress {
    pub fn new(reporter: Arc<dyn ProgressReporter>, title: &str, databases: &[String]) -> Self {
        let estimator = EtaEstimator::new(databases.len());
        reporter.start(title);
        reporter.set_estimator(estimator.clone());
        let tasks = databases
            .iter()
            .map(|db| (db.clone(), TaskStatus::Pending))
            .collect();
        Self {
            state: Arc::new(RwLock::new(ProgressState { tasks, estimator })),
            reporter,
        }
    }

    pub async fn task_started(&self, database: &str) {
        let mut state = self.state.write().await;
        state.tasks.insert(database.to_string(), TaskStatus::Running);
        drop(state);
        self.reporter.update(&format!("{}: started", database));
    }

    pub async fn task_finished(&self, database: &str, outcome: std::result::Result<(), String>) {
        let mut state = self.state.write().await;
        let message = match outcome {
            Ok(()) => {
                state.tasks.insert(database.to_string(), TaskStatus::Succeeded);
                format!("{}: done", database)
            }
            Err(reason) => {
                let message = format!("{}: failed: {}", database, reason);
                state.tasks.insert(database.to_string(), TaskStatus::Failed(reason));
                message
            }
        };
        let finished = state
            .tasks
            .values()
            .filter(|s| matches!(s, TaskStatus::Succeeded | TaskStatus::Failed(_)))
            .count();
        state.estimator.record(finished);
        let estimator = state.estimator.clone();
        drop(state);

        self.reporter.set_estimator(estimator);
        self.reporter.update(&message);
    }

    pub async fn status(&self, database: &str) -> Option<TaskStatus> {
        self.state.read().await.tasks.get(database).cloned()
    }

    pub async fn snapshot(&self) -> ProgressSnapshot {
        let state = self.state.read().await;
        let mut snapshot = ProgressSnapshot {
            total: state.tasks.len(),
            running: 0,
            succeeded: 0,
            failed: 0,
        };
        for status in state.tasks.values() {
            match status {
                TaskStatus::Running => snapshot.running += 1,
                TaskStatus::Succeeded => snapshot.succeeded += 1,
                TaskStatus::Failed(_) => snapshot.failed += 1,
                TaskStatus::Pending => {}
            }
        }
        snapshot
    }

    pub fn reporter(&self) -> &Arc<dyn ProgressReporter> {
        &self.reporter
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}
