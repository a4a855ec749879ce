//! Process group management for helper commands
//!
//! Remote checks shell out to the object store CLI, which in turn forks its
//! own workers. A hung helper must not outlive its timeout or the engine.
//!
//! # Solution
//! - Spawn helpers in their own process group
//! - Ask the kernel to SIGTERM them if the engine dies
//! - On timeout, send SIGTERM to the whole group, then SIGKILL after a grace
//!   period

use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::time::{Duration, Instant};

/// Send a signal to an entire process group
///
/// Uses negative PID so grandchildren of the helper also receive it.
fn send_signal_to_group(pgid: u32, signal: Signal) -> Result<(), nix::Error> {
    signal::kill(Pid::from_raw(-(pgid as i32)), signal)
}

/// Check if a process is still alive (not dead or zombie)
pub fn is_process_alive(pid: u32) -> bool {
    if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }

    // Field 3 of /proc/pid/stat is the state; Z and X are not running
    if let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        let fields: Vec<&str> = stat.split_whitespace().collect();
        if fields.len() > 2 {
            return !matches!(fields[2], "Z" | "X");
        }
    }

    true
}

/// Terminate a process group: SIGTERM, wait up to `grace`, then SIGKILL
pub fn terminate_group(pgid: u32, grace: Duration) {
    if let Err(e) = send_signal_to_group(pgid, Signal::SIGTERM) {
        tracing::debug!("SIGTERM to process group {} failed: {}", pgid, e);
        return;
    }

    let start = Instant::now();
    while start.elapsed() < grace {
        if !is_process_alive(pgid) {
            tracing::debug!("Process group {} exited after SIGTERM", pgid);
            return;
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    tracing::warn!("Process group {} ignored SIGTERM, sending SIGKILL", pgid);
    if let Err(e) = send_signal_to_group(pgid, Signal::SIGKILL) {
        tracing::warn!("SIGKILL to process group {} failed: {}", pgid, e);
    }
}

/// Extension trait for std::process::Command to set up process groups
pub trait CommandProcessGroup {
    /// Configure the command to run in its own process group
    fn in_new_process_group(&mut self) -> &mut Self;
}

impl CommandProcessGroup for std::process::Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        unsafe {
            self.pre_exec(|| {
                // Become the leader of a new process group (PGID = PID)
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(std::io::Error::other)?;

                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }

                Ok(())
            });
        }
        self
    }
}
