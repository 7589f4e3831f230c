use crate::cancel::CancelToken;
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub const PARENT_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }

    #[cfg(unix)]
    {
        std::process::Command::new("kill")
            .arg("-0")
            .arg(pid.to_string())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    #[cfg(not(unix))]
    {
        true
    }
}

/// Cancels `shutdown` once `parent_pid` exits, so an orphaned service does
/// not outlive the client process that spawned it.
pub fn spawn_parent_watchdog(
    parent_pid: u32,
    shutdown: CancelToken,
    interval: Duration,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        if shutdown.wait_timeout(interval) {
            return;
        }
        if !is_process_alive(parent_pid) {
            tracing::info!(parent_pid, "watchdog: parent process exited, shutting down");
            shutdown.cancel();
            return;
        }
    })
}
