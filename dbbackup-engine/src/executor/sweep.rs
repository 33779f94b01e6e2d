//! Orphan-process sweeper: finds dump/compress tools left behind by an
//! earlier crashed run and terminates them.

use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Process names the sweeper considers ours
pub const KNOWN_TOOLS: &[&str] = &["pg_dump", "pg_restore", "gzip", "pigz", "gunzip", "mysqldump"];

/// PIDs under `proc_root` whose command name is one of `names`, excluding
/// the current process.
pub fn find_tool_processes(proc_root: &Path, names: &[&str]) -> Vec<i32> {
    let own_pid = std::process::id() as i32;
    let Ok(entries) = std::fs::read_dir(proc_root) else {
        return Vec::new();
    };

    let mut pids: Vec<i32> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str()?.parse::<i32>().ok())
        .filter(|&pid| pid != own_pid)
        .filter(|&pid| {
            std::fs::read_to_string(proc_root.join(pid.to_string()).join("comm"))
                .map(|comm| names.contains(&comm.trim()))
                .unwrap_or(false)
        })
        .collect();
    pids.sort_unstable();
    pids
}

/// Terminate orphaned tool processes. Each one's process group gets SIGTERM,
/// then SIGKILL after `grace` if anything survived. A tool that shares our own
/// process group is signalled individually. Returns how many were found.
#[cfg(unix)]
pub async fn sweep_orphans(grace: Duration) -> usize {
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::{getpgid, getpgrp, Pid};

    let pids = find_tool_processes(Path::new("/proc"), KNOWN_TOOLS);
    if pids.is_empty() {
        return 0;
    }
    let own_group = getpgrp();

    let send = |pid: i32, signal: Signal| {
        let target = Pid::from_raw(pid);
        let result = match getpgid(Some(target)) {
            Ok(group) if group != own_group => killpg(group, signal),
            _ => kill(target, signal),
        };
        if let Err(e) = result {
            warn!(pid, ?signal, error = %e, "Failed to signal orphaned tool");
        }
    };

    for &pid in &pids {
        info!(pid, "Terminating orphaned tool process");
        send(pid, Signal::SIGTERM);
    }

    tokio::time::sleep(grace).await;

    for &pid in &pids {
        if kill(Pid::from_raw(pid), None).is_ok() {
            warn!(pid, "Orphaned tool survived SIGTERM, sending SIGKILL");
            send(pid, Signal::SIGKILL);
        }
    }
    pids.len()
}

#[cfg(not(unix))]
pub async fn sweep_orphans(_grace: Duration) -> usize {
    0
}
