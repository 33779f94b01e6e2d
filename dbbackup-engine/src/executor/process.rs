//! Process-group spawning and termination.

use crate::utils::errors::{EngineError, Result};
use std::io;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

#[cfg(windows)]
const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

const SPAWN_ATTEMPTS: u32 = 5;

/// Spawn `cmd` as the leader of a new process group.
///
/// A script that was just written may still be open for writing in another
/// thread's forked child, in which case exec fails with ETXTBSY; that is
/// retried a few times.
pub async fn spawn_in_group(cmd: &mut Command, tool: &str) -> Result<Child> {
    #[cfg(unix)]
    cmd.process_group(0);
    #[cfg(windows)]
    cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
    cmd.kill_on_drop(true);

    let mut attempt = 0;
    loop {
        match cmd.spawn() {
            Ok(child) => {
                debug!(tool = %tool, pid = ?child.id(), "Spawned tool");
                return Ok(child);
            }
            Err(e) if is_text_busy(&e) && attempt + 1 < SPAWN_ATTEMPTS => {
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(20 * attempt as u64)).await;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(EngineError::Preflight(format!("{} not found", tool)));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(unix)]
fn is_text_busy(err: &io::Error) -> bool {
    err.raw_os_error() == Some(nix::errno::Errno::ETXTBSY as i32)
}

#[cfg(not(unix))]
fn is_text_busy(_err: &io::Error) -> bool {
    false
}

/// SIGTERM the child's process group, then SIGKILL once `grace` passes.
/// The child is always reaped before this returns.
#[cfg(unix)]
pub async fn terminate_group(child: &mut Child, grace: Duration) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        // already reaped
        return;
    };
    let pgid = Pid::from_raw(pid as i32);

    if let Err(e) = killpg(pgid, Signal::SIGTERM) {
        debug!(pid, error = %e, "SIGTERM to process group failed");
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            warn!(pid, "Process group ignored SIGTERM, sending SIGKILL");
            if let Err(e) = killpg(pgid, Signal::SIGKILL) {
                debug!(pid, error = %e, "SIGKILL to process group failed");
            }
            let _ = child.wait().await;
        }
    }
}

#[cfg(not(unix))]
pub async fn terminate_group(child: &mut Child, grace: Duration) {
    let _ = child.start_kill();
    let _ = tokio::time::timeout(grace, child.wait()).await;
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Stdio;

    #[tokio::test]
    async fn test_terminate_stops_the_group() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg("sleep 30 & sleep 30; wait")
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let mut child = spawn_in_group(&mut cmd, "sh").await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let started = std::time::Instant::now();
        terminate_group(&mut child, Duration::from_secs(2)).await;

        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(child.try_wait().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_missing_tool_is_preflight_error() {
        let mut cmd = Command::new("/nonexistent/pg_dump");
        let err = spawn_in_group(&mut cmd, "pg_dump").await.unwrap_err();
        assert!(matches!(err, EngineError::Preflight(_)));
    }
}
