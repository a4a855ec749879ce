//! Helper command execution with a hard timeout.
//!
//! Every external helper (the object store CLI) goes through [`run_command`]:
//!
//! - The helper runs in its own process group
//! - Output pipes are drained on background threads so a chatty helper
//!   cannot block on a full pipe
//! - When the deadline passes the whole group is terminated and the call
//!   fails with [`CommandTimedOut`]

use crate::process_guard::{terminate_group, CommandProcessGroup};
use anyhow::{Context, Result};
use std::io::Read;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const KILL_GRACE: Duration = Duration::from_secs(2);

/// The helper did not finish before its deadline and was killed
#[derive(Error, Debug)]
#[error("{program} timed out after {timeout:?}")]
pub struct CommandTimedOut {
    pub program: String,
    pub timeout: Duration,
}

/// Output from a helper command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Raw standard output (object contents may be binary).
    pub stdout: Vec<u8>,
    /// Standard error, lossily decoded.
    pub stderr: String,
    /// Exit code (None if terminated by signal).
    pub exit_code: Option<i32>,
    /// Whether the command exited with code 0.
    pub success: bool,
}

impl CommandOutput {
    /// Standard output, lossily decoded
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Standard error folded onto one line
    pub fn stderr_line(&self) -> String {
        self.stderr.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    /// Check if the command succeeded and return an error if not.
    pub fn ensure_success(&self, context: &str) -> Result<()> {
        if self.success {
            Ok(())
        } else {
            anyhow::bail!(
                "{} failed (exit code {}): {}",
                context,
                self.exit_code.unwrap_or(-1),
                self.stderr_line()
            )
        }
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

/// Run `program args...` and wait at most `timeout` for it.
///
/// A non-zero exit is *not* an error; callers inspect [`CommandOutput`].
///
/// # Errors
///
/// - Spawn failures (including a missing binary, see [`is_missing_program`])
/// - [`CommandTimedOut`] when the deadline passes
pub fn run_command(program: &str, args: &[&str], timeout: Duration) -> Result<CommandOutput> {
    debug!("run_command: {} args={:?} timeout={:?}", program, args, timeout);

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .in_new_process_group();

    let mut child = cmd
        .spawn()
        .with_context(|| format!("Failed to spawn {}", program))?;
    let pid = child.id();

    let stdout_reader = drain(child.stdout.take());
    let stderr_reader = drain(child.stderr.take());

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child
            .try_wait()
            .with_context(|| format!("Failed waiting for {}", program))?
        {
            break status;
        }
        if Instant::now() >= deadline {
            warn!("{} exceeded {:?}, terminating process group {}", program, timeout, pid);
            terminate_group(pid, KILL_GRACE);
            let _ = child.wait();
            return Err(CommandTimedOut {
                program: program.to_string(),
                timeout,
            }
            .into());
        }
        thread::sleep(POLL_INTERVAL);
    };

    let stdout = stdout_reader.join().unwrap_or_default();
    let stderr = String::from_utf8_lossy(&stderr_reader.join().unwrap_or_default()).into_owned();

    debug!("{} exited with {:?}", program, status.code());
    Ok(CommandOutput {
        stdout,
        stderr,
        exit_code: status.code(),
        success: status.success(),
    })
}

/// Whether `err` means the program binary does not exist
pub fn is_missing_program(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<std::io::Error>()
            .is_some_and(|io| io.kind() == std::io::ErrorKind::NotFound)
    })
}

/// Whether `err` is a helper timeout
pub fn is_timeout(err: &anyhow::Error) -> bool {
    err.downcast_ref::<CommandTimedOut>().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_captures_output_and_exit_code() {
        let out = run_command("bash", &["-c", "echo hi; echo oops >&2; exit 3"], Duration::from_secs(5))
            .unwrap();
        assert_eq!(out.stdout_text(), "hi\n");
        assert_eq!(out.stderr_line(), "oops");
        assert_eq!(out.exit_code, Some(3));
        assert!(!out.success);
        assert!(out.ensure_success("probe").is_err());
    }

    #[test]
    fn test_missing_binary_is_detected() {
        let err = run_command("definitely-not-a-real-binary-xyz", &[], Duration::from_secs(1))
            .unwrap_err();
        assert!(is_missing_program(&err));
        assert!(!is_timeout(&err));
    }

    #[test]
    fn test_timeout_kills_helper() {
        let start = Instant::now();
        let err = run_command("bash", &["-c", "sleep 30"], Duration::from_millis(200)).unwrap_err();
        assert!(is_timeout(&err));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_large_output_does_not_block() {
        let out = run_command(
            "bash",
            &["-c", "head -c 1000000 /dev/zero"],
            Duration::from_secs(10),
        )
        .unwrap();
        assert_eq!(out.stdout.len(), 1_000_000);
        assert!(out.success);
    }
}
