//! Durable contract persistence.
//!
//! Each subcommand is its own process doing load → validate → mutate →
//! persist. Writers serialise through [`ContractLock`]; each committed write
//! bumps `revision` and lands via temp file + fsync + rename, so a reader
//! (or a killed writer) only ever sees the previous or the next revision.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{ContractError, Result};
use crate::lock::ContractLock;
use crate::model::Contract;

/// Serialize a contract the way it is stored on disk
pub fn to_document(contract: &Contract) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec_pretty(contract)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Write `bytes` to `path` atomically (temp + fsync + rename).
///
/// The temp file sits beside the target so the rename never crosses a
/// filesystem.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(parent) = parent {
        fs::create_dir_all(parent)?;
    }

    let mut tmp_name = path.as_os_str().to_os_string();
    tmp_name.push(format!(".{}.tmp", std::process::id()));
    let tmp = PathBuf::from(tmp_name);

    let result = (|| -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        if let Some(parent) = parent {
            // Persist the rename itself
            if let Ok(dir) = fs::File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

/// Read access and locked read-modify-write for one contract file
#[derive(Debug, Clone)]
pub struct ContractStore {
    path: PathBuf,
    lock_timeout: Duration,
}

impl ContractStore {
    pub fn new(path: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            lock_timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist a brand-new contract at revision 1.
    ///
    /// An existing file at the same path is replaced.
    pub fn create(&self, contract: &mut Contract) -> Result<()> {
        contract.validate()?;
        let _lock = ContractLock::acquire(&self.path, self.lock_timeout)?;
        if self.path.exists() {
            warn!("Replacing existing contract {}", self.path.display());
        }
        contract.revision = 1;
        write_atomic(&self.path, &to_document(contract)?)?;
        info!("Created contract {}", self.path.display());
        Ok(())
    }

    /// Load and validate the contract without taking the lock.
    ///
    /// # Errors
    ///
    /// `Config` when the file is missing or is not a valid contract.
    pub fn load(&self) -> Result<Contract> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ContractError::config(format!(
                    "contract file not found: {} (run init first)",
                    self.path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        let contract: Contract = serde_json::from_str(&text).map_err(|e| {
            ContractError::config(format!("malformed contract {}: {}", self.path.display(), e))
        })?;
        contract.validate()?;
        Ok(contract)
    }

    /// Locked read-modify-write.
    ///
    /// `mutate` runs against the freshly loaded document while the lock is
    /// held. If it fails nothing is written; if it leaves the document
    /// unchanged nothing is written and `revision` stays put.
    pub fn update<T, F>(&self, mutate: F) -> Result<(Contract, T)>
    where
        F: FnOnce(&mut Contract) -> Result<T>,
    {
        let _lock = ContractLock::acquire(&self.path, self.lock_timeout)?;
        let mut contract = self.load()?;
        let before = contract.clone();

        let value = mutate(&mut contract)?;

        if contract == before {
            debug!("No changes to {}, skipping write", self.path.display());
            return Ok((contract, value));
        }

        contract.revision = before.revision + 1;
        contract.validate()?;
        write_atomic(&self.path, &to_document(&contract)?)?;
        debug!(
            "Committed {} at revision {}",
            self.path.display(),
            contract.revision
        );
        Ok((contract, value))
    }
}
