//! Existence and corruption checks.
//!
//! Every asset check folds its failures into an [`AssetStatus`]; nothing in
//! here aborts a subcommand. Checks are read-only and idempotent, so running
//! them twice against unchanged storage yields the same statuses.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::config::EngineSettings;
use crate::error::{ContractError, Result};
use crate::integrity::{self, Validator, Verdict, METADATA_READ_LIMIT};
use crate::locator::{self, CheckTarget};
use crate::model::{Asset, CheckResult};
use crate::remote::{ObjectMeta, ObjectStore};
use crate::retry::RetryPolicy;
use crate::types::AssetStatus;

/// File names the engine itself writes; never reported as unexpected output
pub const CONTRACT_FILE_NAME: &str = "_run_contract.json";

/// Result of probing one concrete location
#[derive(Debug, Clone, PartialEq)]
struct Probe {
    location: String,
    status: AssetStatus,
    size: Option<u64>,
    detail: Option<String>,
}

impl Probe {
    fn new(location: impl Into<String>, status: AssetStatus) -> Self {
        Self {
            location: location.into(),
            status,
            size: None,
            detail: None,
        }
    }

    fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    fn size(mut self, size: Option<u64>) -> Self {
        self.size = size;
        self
    }

    fn exists(&self) -> bool {
        matches!(self.status, AssetStatus::Ok | AssetStatus::Corrupt)
    }
}

/// Checks assets against local disk and object storage
pub struct Checker<'a> {
    store: &'a dyn ObjectStore,
    retry: RetryPolicy,
    workers: usize,
    audit_corruption: bool,
}

impl<'a> Checker<'a> {
    pub fn new(store: &'a dyn ObjectStore, settings: &EngineSettings) -> Self {
        Self {
            store,
            retry: settings.retry_policy(),
            workers: settings.check_workers,
            audit_corruption: true,
        }
    }

    /// With `false`, existing assets are OK regardless of content
    pub fn audit_corruption(mut self, enabled: bool) -> Self {
        self.audit_corruption = enabled;
        self
    }

    /// Check many assets on a bounded pool; results keep input order
    pub fn check_all(&self, assets: &[&Asset]) -> Result<Vec<CheckResult>> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .thread_name(|i| format!("asset-check-{}", i))
            .build()
            .map_err(|e| ContractError::config(format!("cannot start check workers: {}", e)))?;

        debug!("Checking {} asset(s) on {} worker(s)", assets.len(), self.workers);
        Ok(pool.install(|| assets.par_iter().map(|asset| self.check(asset)).collect()))
    }

    /// Check a single asset
    pub fn check(&self, asset: &Asset) -> CheckResult {
        let validator = Validator::select(asset);
        let target = locator::resolve(&asset.location);

        let (probe, matches) = match &target {
            CheckTarget::LocalFile(path) => (self.probe_local(path, validator), None),
            CheckTarget::RemoteObject(uri) => (self.probe_remote(uri, validator), None),
            CheckTarget::Unsupported { uri, scheme } => (
                Probe::new(uri.clone(), AssetStatus::Unverified)
                    .detail(format!("unsupported scheme '{}'", scheme)),
                None,
            ),
            CheckTarget::LocalGlob(pattern) => {
                let probes = self.expand_local_glob(pattern, validator);
                (summarize_matches(pattern, &probes), Some(probes))
            }
            CheckTarget::RemoteGlob(pattern) => {
                let probes = self.expand_remote_glob(pattern, validator);
                (summarize_matches(pattern, &probes), Some(probes))
            }
        };

        debug!(
            "{} {} -> {} {}",
            asset.asset_id,
            target.display(),
            probe.status,
            probe.detail.as_deref().unwrap_or("")
        );

        let (match_count, matched) = match matches {
            Some(Ok(probes)) => (
                Some(probes.len()),
                probes.iter().map(|p| p.location.clone()).collect(),
            ),
            Some(Err(_)) => (None, Vec::new()),
            None if probe.exists() => (None, vec![probe.location.clone()]),
            None => (None, Vec::new()),
        };

        CheckResult {
            status: probe.status,
            size_bytes: probe.size,
            error_detail: probe.detail,
            checked_at: Utc::now(),
            match_count,
            matched,
        }
    }

    fn probe_local(&self, path: &Path, validator: Validator) -> Probe {
        let location = path.display().to_string();
        let meta = match fs::metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Probe::new(location, AssetStatus::Missing);
            }
            Err(e) => {
                return Probe::new(location, AssetStatus::Unverified)
                    .detail(format!("cannot stat: {}", e));
            }
        };

        if meta.is_dir() {
            return match fs::read_dir(path).map(|mut entries| entries.next().is_some()) {
                Ok(true) => Probe::new(location, AssetStatus::Ok),
                Ok(false) if self.audit_corruption => {
                    Probe::new(location, AssetStatus::Corrupt).detail("empty directory")
                }
                Ok(false) => Probe::new(location, AssetStatus::Ok),
                Err(e) => Probe::new(location, AssetStatus::Unverified)
                    .detail(format!("cannot list directory: {}", e)),
            };
        }

        let size = meta.len();
        if !self.audit_corruption {
            return Probe::new(location, AssetStatus::Ok).size(Some(size));
        }
        match integrity::check_local_file(validator, path, size) {
            Ok(Verdict::Valid) => Probe::new(location, AssetStatus::Ok).size(Some(size)),
            Ok(Verdict::Corrupt(reason)) => Probe::new(location, AssetStatus::Corrupt)
                .size(Some(size))
                .detail(reason),
            Err(e) => Probe::new(location, AssetStatus::Unverified)
                .size(Some(size))
                .detail(format!("cannot read: {}", e)),
        }
    }

    fn probe_remote(&self, uri: &str, validator: Validator) -> Probe {
        let label = format!("stat {}", uri);
        match self.retry.run(&label, || self.store.stat(uri)) {
            Ok(Some(meta)) => self.judge_remote(meta, validator),
            Ok(None) => Probe::new(uri, AssetStatus::Missing),
            Err(e) => Probe::new(uri, AssetStatus::Unverified).detail(e.to_string()),
        }
    }

    /// Decide the status of an object known to exist
    fn judge_remote(&self, meta: ObjectMeta, validator: Validator) -> Probe {
        let ObjectMeta { uri, size } = meta;
        if !self.audit_corruption {
            return Probe::new(uri, AssetStatus::Ok).size(size);
        }
        let Some(bytes) = size else {
            return Probe::new(uri, AssetStatus::Corrupt)
                .detail("object metadata has no content length (partial upload?)");
        };
        if bytes == 0 {
            return Probe::new(uri, AssetStatus::Corrupt)
                .size(size)
                .detail("zero content-length");
        }
        if validator != Validator::MetadataJson || bytes > METADATA_READ_LIMIT {
            return Probe::new(uri, AssetStatus::Ok).size(size);
        }

        let label = format!("read {}", uri);
        match self.retry.run(&label, || self.store.read(&uri)) {
            Ok(content) => match integrity::check_metadata(&content) {
                Verdict::Valid => Probe::new(uri, AssetStatus::Ok).size(size),
                Verdict::Corrupt(reason) => {
                    Probe::new(uri, AssetStatus::Corrupt).size(size).detail(reason)
                }
            },
            Err(e) => Probe::new(uri, AssetStatus::Unverified)
                .size(size)
                .detail(format!("cannot read metadata: {}", e)),
        }
    }

    fn expand_local_glob(
        &self,
        pattern: &str,
        validator: Validator,
    ) -> std::result::Result<Vec<Probe>, String> {
        let paths = glob::glob(pattern).map_err(|e| format!("invalid glob pattern: {}", e))?;
        let mut files: Vec<PathBuf> = paths
            .filter_map(|entry| match entry {
                Ok(path) => Some(path),
                Err(e) => {
                    warn!("Skipping unreadable glob entry: {}", e);
                    None
                }
            })
            .filter(|path| path.is_file())
            .collect();
        files.sort();
        files.dedup();
        Ok(files
            .iter()
            .map(|path| self.probe_local(path, validator))
            .collect())
    }

    fn expand_remote_glob(
        &self,
        pattern: &str,
        validator: Validator,
    ) -> std::result::Result<Vec<Probe>, String> {
        let label = format!("ls {}", pattern);
        let objects = self
            .retry
            .run(&label, || self.store.list(pattern))
            .map_err(|e| e.to_string())?;
        Ok(objects
            .into_iter()
            .map(|meta| self.judge_remote(meta, validator))
            .collect())
    }
}

/// Fold per-match probes into one glob result.
///
/// Any valid match makes the asset OK; corrupt matches are only noted.
fn summarize_matches(pattern: &str, probes: &std::result::Result<Vec<Probe>, String>) -> Probe {
    let probes = match probes {
        Ok(probes) => probes,
        Err(reason) => {
            return Probe::new(pattern, AssetStatus::Unverified).detail(reason.clone());
        }
    };
    let total = probes.len();
    if total == 0 {
        return Probe::new(pattern, AssetStatus::Missing).detail("no matches");
    }

    let count = |status: AssetStatus| probes.iter().filter(|p| p.status == status).count();
    let ok = count(AssetStatus::Ok);
    let corrupt = count(AssetStatus::Corrupt);
    let unverified = count(AssetStatus::Unverified);
    let size: u64 = probes
        .iter()
        .filter(|p| p.status == AssetStatus::Ok)
        .filter_map(|p| p.size)
        .sum();

    let mut notes = Vec::new();
    if corrupt > 0 {
        notes.push(format!("{} of {} matches corrupt", corrupt, total));
    }
    if unverified > 0 {
        notes.push(format!("{} of {} matches unverified", unverified, total));
    }
    let detail = (!notes.is_empty()).then(|| notes.join("; "));

    let status = if ok > 0 {
        AssetStatus::Ok
    } else if unverified > 0 {
        AssetStatus::Unverified
    } else {
        AssetStatus::Corrupt
    };

    let mut probe = Probe::new(pattern, status).size((ok > 0).then_some(size));
    probe.detail = match (status, detail) {
        (AssetStatus::Corrupt, _) => {
            let first = probes.iter().find_map(|p| p.detail.clone()).unwrap_or_default();
            Some(format!("all {} matches corrupt: {}", total, first))
        }
        (_, detail) => detail,
    };
    probe
}

/// Whether a scanned file is engine bookkeeping
pub fn is_engine_file(location: &str) -> bool {
    let name = location.rsplit('/').next().unwrap_or(location);
    name == CONTRACT_FILE_NAME || name.ends_with(".lock") || name.ends_with(".tmp")
}

/// Every regular file under the given local directories
pub fn scan_local(dirs: &[PathBuf]) -> Vec<String> {
    let mut found = Vec::new();
    for dir in dirs {
        let root = locator::normalize_local_path(&dir.to_string_lossy());
        if root.is_file() {
            found.push(root.display().to_string());
            continue;
        }
        walk(&root, &mut found);
    }
    found.retain(|f| !is_engine_file(f));
    found.sort();
    found.dedup();
    found
}

fn walk(dir: &Path, out: &mut Vec<String>) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("Skipping scan of {}: {}", dir.display(), e);
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        match entry.file_type() {
            Ok(t) if t.is_dir() => walk(&path, out),
            Ok(t) if t.is_file() => out.push(path.display().to_string()),
            _ => {}
        }
    }
}

/// Every object under the given `gs://` prefixes; unreachable prefixes are
/// skipped with a warning
pub fn scan_remote(store: &dyn ObjectStore, retry: RetryPolicy, prefixes: &[String]) -> Vec<String> {
    let mut found = Vec::new();
    for raw in prefixes {
        let prefix = locator::normalize_gs_uri(raw);
        let pattern = if locator::has_wildcard(&prefix) {
            prefix
        } else {
            format!("{}/**", prefix)
        };
        match retry.run(&format!("scan {}", pattern), || store.list(&pattern)) {
            Ok(objects) => found.extend(objects.into_iter().map(|o| o.uri)),
            Err(e) => warn!("Scan of {} failed: {}", pattern, e),
        }
    }
    found.retain(|f| !is_engine_file(f));
    found.sort();
    found.dedup();
    found
}
