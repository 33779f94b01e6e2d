//! Recovery configuration written into a stopped data directory.
//!
//! Version 12 and later read recovery parameters from `postgresql.auto.conf`
//! and enter recovery when `recovery.signal` exists; older servers read a
//! standalone `recovery.conf`.

use super::target::RecoveryTarget;
use crate::metadata::timestamp_suffix;
use crate::utils::errors::{EngineError, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const SIGNAL_FILE: &str = "recovery.signal";
pub const RECOVERY_CONF: &str = "recovery.conf";
pub const AUTO_CONF: &str = "postgresql.auto.conf";
const BLOCK_BEGIN: &str = "# BEGIN dbbackup recovery settings";
const BLOCK_END: &str = "# END dbbackup recovery settings";

/// First version that uses `recovery.signal`
const SIGNAL_FILE_VERSION: u32 = 12;

/// Files touched by one generation run
#[derive(Debug, Clone, Default)]
pub struct RecoveryFiles {
    pub version: u32,
    pub written: Vec<PathBuf>,
    pub backups: Vec<PathBuf>,
}

/// Major version of a stopped data directory
pub fn detect_version(data_dir: &Path) -> Result<u32> {
    if !data_dir.is_dir() {
        return Err(EngineError::Preflight(format!(
            "data directory {} does not exist",
            data_dir.display()
        )));
    }
    if data_dir.join("postmaster.pid").exists() {
        return Err(EngineError::Preflight(format!(
            "postmaster.pid present in {}; stop the server before configuring recovery",
            data_dir.display()
        )));
    }
    let version_file = data_dir.join("PG_VERSION");
    let raw = fs::read_to_string(&version_file).map_err(|_| {
        EngineError::Preflight(format!("{} not found; not a data directory", version_file.display()))
    })?;
    let trimmed = raw.trim();
    let digits: String = trimmed.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits
        .parse::<u32>()
        .map_err(|_| EngineError::Config(format!("cannot parse PG_VERSION '{}'", trimmed)))
}

#[derive(Debug, Clone)]
pub struct RecoveryConfigGenerator {
    archive_dir: PathBuf,
    restore_command: Option<String>,
}

impl RecoveryConfigGenerator {
    pub fn new(archive_dir: impl Into<PathBuf>) -> Self {
        Self {
            archive_dir: archive_dir.into(),
            restore_command: None,
        }
    }

    /// Replace the default `cp` restore command
    pub fn with_restore_command(mut self, command: Option<String>) -> Self {
        self.restore_command = command.filter(|c| !c.trim().is_empty());
        self
    }

    pub fn restore_command(&self) -> String {
        match &self.restore_command {
            Some(command) => command.clone(),
            None => format!("cp {}/%f %p", self.archive_dir.display()),
        }
    }

    /// `key = value` lines for `target`
    pub fn render_settings(&self, target: &RecoveryTarget) -> Vec<String> {
        let mut lines = vec![setting("restore_command", &self.restore_command())];
        lines.extend(target.parameters().into_iter().map(|(key, value)| setting(key, &value)));
        lines
    }

    pub fn write(&self, data_dir: &Path, target: &RecoveryTarget) -> Result<RecoveryFiles> {
        let version = detect_version(data_dir)?;
        let mut files = RecoveryFiles {
            version,
            ..Default::default()
        };

        let stamp = timestamp_suffix();
        for name in [RECOVERY_CONF, AUTO_CONF] {
            let path = data_dir.join(name);
            if path.is_file() {
                let backup = data_dir.join(format!("{}.{}.bak", name, stamp));
                fs::copy(&path, &backup)?;
                files.backups.push(backup);
            }
        }

        let settings = self.render_settings(target);
        if version >= SIGNAL_FILE_VERSION {
            let signal = data_dir.join(SIGNAL_FILE);
            write_private(&signal, b"")?;
            files.written.push(signal);

            let auto_conf = data_dir.join(AUTO_CONF);
            let existing = match fs::read_to_string(&auto_conf) {
                Ok(content) => content,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
                Err(e) => return Err(e.into()),
            };
            fs::write(&auto_conf, replace_block(&existing, &settings))?;
            files.written.push(auto_conf);

            if data_dir.join(RECOVERY_CONF).exists() {
                warn!("recovery.conf is ignored by version {} and will prevent startup; remove it", version);
            }
        } else {
            let conf = data_dir.join(RECOVERY_CONF);
            let mut content = format!("{}\n", BLOCK_BEGIN);
            for line in &settings {
                content.push_str(line);
                content.push('\n');
            }
            content.push_str(BLOCK_END);
            content.push('\n');
            write_private(&conf, content.as_bytes())?;
            files.written.push(conf);
        }

        info!(
            data_dir = %data_dir.display(),
            version,
            target = %target.kind().as_str(),
            value = %target.value(),
            "recovery configuration written"
        );
        Ok(files)
    }
}

fn setting(key: &str, value: &str) -> String {
    format!("{} = {}", key, quote_value(value))
}

/// Bare identifiers and numbers stay unquoted; anything else is quoted
/// with embedded single quotes doubled.
pub fn quote_value(value: &str) -> String {
    let bare = !value.is_empty()
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'.');
    if bare {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', "''"))
    }
}

/// Drop any previous generated block and append a fresh one
fn replace_block(existing: &str, settings: &[String]) -> String {
    let mut out = String::new();
    let mut inside = false;
    for line in existing.lines() {
        if line.starts_with(BLOCK_BEGIN) {
            inside = true;
            continue;
        }
        if inside {
            if line.starts_with(BLOCK_END) {
                inside = false;
            }
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.push_str(BLOCK_BEGIN);
    out.push('\n');
    for line in settings {
        out.push_str(line);
        out.push('\n');
    }
    out.push_str(BLOCK_END);
    out.push('\n');
    out
}

fn write_private(path: &Path, content: &[u8]) -> Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
        options.mode(0o600);
        let mut file = options.open(path)?;
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
        file.write_all(content)?;
        file.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let mut file = options.open(path)?;
        file.write_all(content)?;
        file.sync_all()?;
    }
    Ok(())
}
