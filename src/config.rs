//! Engine settings read from the environment.
//!
//! The CLI carries everything that describes *a run*; the knobs here describe
//! *the machine the engine runs on* (lock patience, worker count, how to reach
//! object storage) and so come from `RUN_CONTRACT_*` variables instead.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ContractError, Result};
use crate::retry::RetryPolicy;

pub const ENV_LOCK_TIMEOUT_MS: &str = "RUN_CONTRACT_LOCK_TIMEOUT_MS";
pub const ENV_CHECK_WORKERS: &str = "RUN_CONTRACT_CHECK_WORKERS";
pub const ENV_CHECK_RETRIES: &str = "RUN_CONTRACT_CHECK_RETRIES";
pub const ENV_RETRY_BASE_MS: &str = "RUN_CONTRACT_RETRY_BASE_MS";
pub const ENV_REMOTE_TIMEOUT_SECS: &str = "RUN_CONTRACT_REMOTE_TIMEOUT_SECS";
pub const ENV_GSUTIL: &str = "RUN_CONTRACT_GSUTIL";
pub const ENV_GCS_MIRROR: &str = "RUN_CONTRACT_GCS_MIRROR";

/// Upper bound on the check worker pool
pub const MAX_CHECK_WORKERS: usize = 64;

/// Runtime knobs shared by every subcommand
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    /// Bounded wait for the contract lock
    pub lock_timeout: Duration,
    /// Worker pool size for asset checks
    pub check_workers: usize,
    /// Retries for transient remote errors (attempts = retries + 1)
    pub check_retries: u32,
    /// Exponential backoff base
    pub retry_base: Duration,
    /// Per remote call timeout
    pub remote_timeout: Duration,
    /// Object store CLI binary
    pub gsutil: String,
    /// Serve `gs://` from this directory instead of the object store CLI
    pub gcs_mirror: Option<PathBuf>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_millis(10_000),
            check_workers: 8,
            check_retries: 3,
            retry_base: Duration::from_millis(250),
            remote_timeout: Duration::from_secs(60),
            gsutil: "gsutil".to_string(),
            gcs_mirror: None,
        }
    }
}

impl EngineSettings {
    /// Load settings from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings through an arbitrary variable lookup.
    ///
    /// Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut settings = Self::default();

        if let Some(raw) = get(ENV_LOCK_TIMEOUT_MS) {
            settings.lock_timeout = Duration::from_millis(parse_number(ENV_LOCK_TIMEOUT_MS, &raw)?);
        }
        if let Some(raw) = get(ENV_CHECK_WORKERS) {
            settings.check_workers = parse_number(ENV_CHECK_WORKERS, &raw)?;
        }
        if let Some(raw) = get(ENV_CHECK_RETRIES) {
            settings.check_retries = parse_number(ENV_CHECK_RETRIES, &raw)?;
        }
        if let Some(raw) = get(ENV_RETRY_BASE_MS) {
            settings.retry_base = Duration::from_millis(parse_number(ENV_RETRY_BASE_MS, &raw)?);
        }
        if let Some(raw) = get(ENV_REMOTE_TIMEOUT_SECS) {
            settings.remote_timeout =
                Duration::from_secs(parse_number(ENV_REMOTE_TIMEOUT_SECS, &raw)?);
        }
        if let Some(raw) = get(ENV_GSUTIL) {
            settings.gsutil = raw;
        }
        settings.gcs_mirror = get(ENV_GCS_MIRROR).map(PathBuf::from);

        settings.validate()?;
        Ok(settings)
    }

    /// Validate the settings
    pub fn validate(&self) -> Result<()> {
        if self.check_workers == 0 || self.check_workers > MAX_CHECK_WORKERS {
            return Err(ContractError::config(format!(
                "{} must be between 1 and {}, got {}",
                ENV_CHECK_WORKERS, MAX_CHECK_WORKERS, self.check_workers
            )));
        }
        if self.remote_timeout.is_zero() {
            return Err(ContractError::config(format!(
                "{} must be at least 1 second",
                ENV_REMOTE_TIMEOUT_SECS
            )));
        }
        if self.gsutil.contains(char::is_whitespace) {
            return Err(ContractError::config(format!(
                "{} must name a single executable, got '{}'",
                ENV_GSUTIL, self.gsutil
            )));
        }
        Ok(())
    }

    /// Backoff policy for transient remote errors
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.check_retries + 1, self.retry_base)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.parse::<T>()
        .map_err(|_| ContractError::config(format!("{} must be a non-negative integer, got '{}'", key, raw)))
}
