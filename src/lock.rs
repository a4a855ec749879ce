//! Exclusive advisory lock on a contract file.
//!
//! Writers take `flock(LOCK_EX | LOCK_NB)` on `<contract>.lock`, polling until
//! the bounded wait expires. The lock is released when the guard is dropped
//! (closing the descriptor drops the flock), including when the process dies.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tracing::debug;

use crate::error::{ContractError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Lock file path for a contract
pub fn lock_path_for(contract: &Path) -> PathBuf {
    let mut name = contract.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

/// Held exclusive lock; released on drop
pub struct ContractLock {
    _lock: Flock<File>,
    path: PathBuf,
}

impl std::fmt::Debug for ContractLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContractLock").field("path", &self.path).finish()
    }
}

impl ContractLock {
    /// Acquire the lock for `contract`, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// - `LockContention` if another holder keeps it past the timeout
    /// - `Io` if the lock file cannot be created
    pub fn acquire(contract: &Path, timeout: Duration) -> Result<Self> {
        let path = lock_path_for(contract);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let start = Instant::now();
        loop {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?;

            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(lock) => {
                    debug!("Acquired {} after {:?}", path.display(), start.elapsed());
                    return Ok(Self { _lock: lock, path });
                }
                Err((_, Errno::EAGAIN)) => {}
                Err((_, errno)) => {
                    return Err(ContractError::Io(std::io::Error::from(errno)));
                }
            }

            if start.elapsed() >= timeout {
                return Err(ContractError::LockContention {
                    path: path.display().to_string(),
                    waited_ms: start.elapsed().as_millis() as u64,
                });
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Returns the path to the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}
