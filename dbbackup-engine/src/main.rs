//! dbbackup - command line entry point for the backup engine

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use dbbackup_engine::backup::{BackupRunner, SampleStrategy};
use dbbackup_engine::cluster::ClusterOrchestrator;
use dbbackup_engine::executor::sweep::sweep_orphans;
use dbbackup_engine::incremental::IncrementalEngine;
use dbbackup_engine::pitr::{RecoveryAction, RecoveryConfigGenerator, RecoveryTarget, TargetKind, TargetTimeline};
use dbbackup_engine::retention::{cleanup_backups, cleanup_wal, RetentionPolicy};
use dbbackup_engine::runtime::{run_blocking, CancelScope, ShutdownCoordinator};
use dbbackup_engine::verify::{verify_artifact, VerifyMode};
use dbbackup_engine::wal::{TimelineHistory, WalArchiver};
use dbbackup_engine::{utils, Config, EngineState};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Dump one database
    Backup { database: String },
    /// Dump globals and every database into one archive
    BackupCluster,
    /// Schema plus a row sample (ratio<N>, percent<P>, count<N>)
    BackupSample { database: String, strategy: String },
    /// Archive a stopped data directory as an incremental base
    BackupFull {
        database: String,
        #[arg(long)]
        data_dir: PathBuf,
    },
    /// Archive files changed since a base backup
    BackupIncremental {
        #[arg(long)]
        base: PathBuf,
        #[arg(long)]
        data_dir: PathBuf,
    },
    /// Restore a single-database artifact
    Restore {
        artifact: PathBuf,
        #[arg(long)]
        target_db: Option<String>,
    },
    /// Restore a cluster archive
    RestoreCluster { archive: PathBuf },
    /// Restore an incremental backup; the whole chain unless --base is given
    RestoreIncremental {
        incremental: PathBuf,
        #[arg(long)]
        target: PathBuf,
        #[arg(long)]
        base: Option<PathBuf>,
    },
    /// archive_command: dbbackup wal-archive %p %f
    WalArchive { source: PathBuf, name: String },
    /// restore_command: dbbackup wal-restore %f %p
    WalRestore { name: String, dest: PathBuf },
    /// Show the timeline graph of the WAL archive
    Timelines {
        /// Print the files needed to reach this timeline
        #[arg(long)]
        target: Option<u32>,
    },
    /// Write recovery configuration into a restored data directory
    Pitr {
        #[arg(long)]
        data_dir: PathBuf,
        /// time, xid, lsn, name or immediate
        #[arg(long, default_value = "immediate")]
        target_kind: String,
        #[arg(long, default_value = "")]
        target_value: String,
        /// promote, pause or shutdown
        #[arg(long, default_value = "promote")]
        action: String,
        /// latest or a timeline id
        #[arg(long)]
        timeline: Option<String>,
        /// Stop just before the target instead of just after it
        #[arg(long)]
        exclusive: bool,
    },
    /// Delete expired backups
    Cleanup {
        #[arg(long)]
        dry_run: bool,
    },
    /// Delete expired archived WAL segments
    CleanupWal {
        #[arg(long)]
        dry_run: bool,
    },
    /// Check an artifact (or with --cluster, a cluster archive) against its manifest
    Verify {
        artifact: PathBuf,
        #[arg(long)]
        quick: bool,
        #[arg(long)]
        cluster: bool,
    },
    /// Encrypt an artifact in place
    Encrypt { artifact: PathBuf },
    /// Decrypt an artifact into a new file
    Decrypt { artifact: PathBuf, output: PathBuf },
    /// Terminate client tools left behind by an interrupted run
    SweepOrphans,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;

    let log_level = cli.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;
    tracing::debug!("Starting dbbackup v{}", env!("CARGO_PKG_VERSION"));

    let coordinator = ShutdownCoordinator::new(Duration::from_secs(config.executor.kill_grace_secs + 5));
    let scope = coordinator.scope();
    let state = Arc::new(EngineState::new(config));

    match coordinator.run(execute(cli.command, state, scope)).await {
        Some(result) => result,
        None => bail!("operation did not stop after cancellation"),
    }
}

async fn execute(command: Command, state: Arc<EngineState>, scope: CancelScope) -> Result<()> {
    let config = state.config.clone();
    match command {
        Command::Backup { database } => {
            let manifest = BackupRunner::new(state).backup_database(&scope, &database).await?;
            println!("{}", manifest.backup_file);
        }
        Command::BackupCluster => {
            let manifest = ClusterOrchestrator::new(state).backup_cluster(&scope).await?;
            println!("{}", manifest.backup_file);
        }
        Command::BackupSample { database, strategy } => {
            let strategy: SampleStrategy = strategy.parse()?;
            let manifest = BackupRunner::new(state).backup_sample(&scope, &database, strategy).await?;
            println!("{}", manifest.backup_file);
        }
        Command::BackupFull { database, data_dir } => {
            let engine = IncrementalEngine::new(config.database.kind, config.backup.compression_level);
            let manifest = engine
                .create_full_backup(&scope, &database, &data_dir, &config.backup.backup_dir)
                .await?;
            println!("{}", manifest.backup_file);
        }
        Command::BackupIncremental { base, data_dir } => {
            let engine = IncrementalEngine::new(config.database.kind, config.backup.compression_level);
            let manifest = engine.create_incremental_backup(&scope, &base, &data_dir).await?;
            println!("{}", manifest.backup_file);
        }
        Command::Restore { artifact, target_db } => {
            BackupRunner::new(state)
                .restore_database(&scope, &artifact, target_db.as_deref())
                .await?;
        }
        Command::RestoreCluster { archive } => {
            let report = ClusterOrchestrator::new(state).restore_cluster(&scope, &archive).await?;
            println!("restored {} databases", report.restored.len());
        }
        Command::RestoreIncremental { incremental, target, base } => {
            let engine = IncrementalEngine::new(config.database.kind, config.backup.compression_level);
            match base {
                Some(base) => engine.restore_incremental(&scope, &base, &incremental, &target).await?,
                None => engine.restore_chain(&scope, &incremental, &target).await?,
            }
        }
        Command::WalArchive { source, name } => {
            let archiver = wal_archiver(&config)?;
            let archived = run_blocking(move || archiver.archive_file(&source, &name)).await?;
            tracing::info!(path = %archived.archive_path.display(), "WAL file archived");
        }
        Command::WalRestore { name, dest } => {
            let archiver = wal_archiver(&config)?;
            run_blocking(move || archiver.restore_file(&name, &dest)).await?;
        }
        Command::Timelines { target } => {
            let history = TimelineHistory::load(&config.wal.archive_dir)?;
            history.validate()?;
            match target {
                Some(target) => {
                    for file in history.required_files(target)? {
                        println!("{}", file.display());
                    }
                }
                None => {
                    let timelines: Vec<_> = history.timelines().collect();
                    println!("{}", serde_json::to_string_pretty(&timelines)?);
                }
            }
        }
        Command::Pitr {
            data_dir,
            target_kind,
            target_value,
            action,
            timeline,
            exclusive,
        } => {
            let target = recovery_target(&target_kind, &target_value, &action, timeline.as_deref(), exclusive)?;
            let generator = RecoveryConfigGenerator::new(&config.wal.archive_dir)
                .with_restore_command(config.wal.restore_command.clone());
            let files = generator.write(&data_dir, &target)?;
            for path in &files.written {
                println!("{}", path.display());
            }
        }
        Command::Cleanup { dry_run } => {
            let policy = RetentionPolicy::for_backups(&config.retention, dry_run);
            let dir = config.backup.backup_dir.clone();
            let audit = state.audit_start("cleanup");
            let result = run_blocking(move || cleanup_backups(&dir, &policy, Utc::now())).await;
            state.audit_finish(audit, "cleanup", &result);
            let report = result?;
            println!("{} of {} backups removed, {} bytes freed", report.deleted.len(), report.examined, report.bytes_freed);
        }
        Command::CleanupWal { dry_run } => {
            let policy = RetentionPolicy::for_wal(&config.wal, dry_run);
            let dir = config.wal.archive_dir.clone();
            let report = run_blocking(move || cleanup_wal(&dir, &policy, Utc::now())).await?;
            println!("{} of {} segments removed, {} bytes freed", report.deleted.len(), report.examined, report.bytes_freed);
        }
        Command::Verify { artifact, quick, cluster } => {
            let valid = if cluster {
                let report = ClusterOrchestrator::new(state).verify_cluster(&scope, &artifact).await?;
                println!("{}", serde_json::to_string_pretty(&report)?);
                report.is_valid()
            } else {
                let mode = if quick { VerifyMode::Quick } else { VerifyMode::Full };
                let report = verify_artifact(&artifact, mode).await?;
                println!("{}", serde_json::to_string_pretty(&report)?);
                report.valid
            };
            if !valid {
                bail!("{} failed verification", artifact.display());
            }
        }
        Command::Encrypt { artifact } => {
            BackupRunner::new(state).encrypt_artifact(&artifact).await?;
        }
        Command::Decrypt { artifact, output } => {
            let bytes = BackupRunner::new(state).decrypt_artifact(&artifact, &output).await?;
            tracing::info!(bytes, output = %output.display(), "Artifact decrypted");
        }
        Command::SweepOrphans => {
            let killed = sweep_orphans(Duration::from_secs(config.executor.kill_grace_secs)).await;
            println!("{} orphaned processes terminated", killed);
        }
    }
    Ok(())
}

fn wal_archiver(config: &Config) -> Result<WalArchiver> {
    Ok(WalArchiver::from_config(&config.wal, config.encryption.passphrase.as_deref())?)
}

fn recovery_target(
    kind: &str,
    value: &str,
    action: &str,
    timeline: Option<&str>,
    exclusive: bool,
) -> Result<RecoveryTarget> {
    let kind: TargetKind = kind.parse()?;
    let mut target = match kind {
        TargetKind::Immediate => RecoveryTarget::immediate(),
        _ => RecoveryTarget::new(kind, value)?,
    };
    target = target.with_action(action.parse::<RecoveryAction>()?);
    if let Some(timeline) = timeline {
        target = target.with_timeline(timeline.parse::<TargetTimeline>()?);
    }
    if exclusive {
        target = target.with_inclusive(false);
    }
    Ok(target)
}
