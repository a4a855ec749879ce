//! Subcommand implementations.
//!
//! Each operation is one load → mutate → persist cycle against the contract
//! store. Operations return an outcome that knows how to render its stdout
//! listing and which exit code the calling shell should see; only structural
//! failures come back as errors.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use indexmap::IndexMap;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::aggregate::{self, asset_key, CheckedAsset, VerificationParams};
use crate::checker::{self, Checker, CONTRACT_FILE_NAME};
use crate::config::EngineSettings;
use crate::error::{ContractError, Result, EXIT_OK, EXIT_STRICT};
use crate::locator;
use crate::model::{
    Asset, AssetLocation, Contract, ContractPaths, FolderUpload, PreflightReport,
    VerificationReport, SCHEMA_VERSION,
};
use crate::publish::Publisher;
use crate::remote::ObjectStore;
use crate::runtime::{self, JOB_ID_ENV};
use crate::spec::{self, AssetDef, AssetOverrides, InitBundle, JobDef};
use crate::store::{write_atomic, ContractStore};
use crate::task_state::TaskState;
use crate::template::{self, TemplateContext};
use crate::types::{AssetStatus, ContractScope, EnvFormat, PipelineOutcome, Role, RunStatus};

/// Root under which default run directories are created
pub const DEFAULT_RUN_ROOT: &str = "run_contracts";

/// Something a subcommand prints and exits with
pub trait CommandReport {
    /// Lines for stdout; the last one is the `key=value` summary
    fn lines(&self) -> Vec<String>;

    fn exit_code(&self) -> i32 {
        EXIT_OK
    }
}

fn read_object(path: &Path, flag: &str) -> Result<Value> {
    let value = spec::read_json_file(path, flag)?;
    if !value.is_object() {
        return Err(ContractError::config(format!(
            "{} {} must contain a JSON object",
            flag,
            path.display()
        )));
    }
    Ok(value)
}

fn absolute(path: &Path) -> PathBuf {
    locator::normalize_local_path(&path.to_string_lossy())
}

fn listing_line(asset: &Asset) -> String {
    let mut line = format!(
        "  {} {:<30} {}",
        asset.status.tag(),
        asset.asset_id,
        asset.location.as_str()
    );
    if asset.status == AssetStatus::Missing {
        line.push_str(if asset.required { "  (required)" } else { "  (optional)" });
    }
    if let Some(detail) = &asset.error_detail {
        line.push_str(&format!("  [{}]", detail));
    }
    line
}

/// Non-zero status counts as a compact JSON object
fn compact_counts(counts: &BTreeMap<String, usize>) -> String {
    let nonzero: BTreeMap<String, usize> = counts
        .iter()
        .filter(|(_, n)| **n > 0)
        .map(|(k, n)| (k.to_ascii_lowercase(), *n))
        .collect();
    serde_json::to_string(&nonzero).unwrap_or_else(|_| "{}".to_string())
}

// ============================================================================
// init
// ============================================================================

/// Arguments of `init`
#[derive(Debug, Clone, Default)]
pub struct InitRequest {
    pub job_id: Option<String>,
    pub run_id: Option<String>,
    pub contract_file: Option<PathBuf>,
    pub run_dir: Option<PathBuf>,
    pub pipeline_title: Option<String>,
    pub output_location: Option<String>,
    pub spec_file: Option<PathBuf>,
    pub init_json_file: Option<PathBuf>,
    pub expected_assets_file: Option<PathBuf>,
    pub expected_inputs_file: Option<PathBuf>,
    pub config_json_file: Option<PathBuf>,
    pub inputs_json_file: Option<PathBuf>,
    pub run_metadata_json_file: Option<PathBuf>,
    pub vars_file: Option<PathBuf>,
    pub vars: Vec<String>,
    pub upload_gcs_dir: Option<String>,
}

#[derive(Debug, Clone)]
pub struct InitOutcome {
    pub contract_file: PathBuf,
    pub contract: Contract,
    pub uploaded: Option<String>,
}

impl CommandReport for InitOutcome {
    fn lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        if let Some(dest) = &self.uploaded {
            lines.push(format!("  uploaded: {}", dest));
        }
        lines.push(format!("run_contract init: {}", self.contract_file.display()));
        lines.push(format!("run_id={}", self.contract.run_id));
        lines.push(format!(
            "tasks={} assets={} (inputs={} outputs={})",
            self.contract.tasks.len(),
            self.contract.asset_count(),
            self.contract.role_count(Role::Input),
            self.contract.role_count(Role::Output)
        ));
        lines
    }
}

// ============================================================================
// preflight
// ============================================================================

#[derive(Debug, Clone)]
pub struct PreflightRequest {
    pub contract_file: PathBuf,
    pub strict: bool,
    pub upload_gcs_dir: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PreflightOutcome {
    pub contract_file: PathBuf,
    pub report: PreflightReport,
    pub listing: Vec<String>,
    pub strict: bool,
    /// Whether some required input is not OK
    pub required_unresolved: bool,
}

impl CommandReport for PreflightOutcome {
    fn lines(&self) -> Vec<String> {
        let mut lines = self.listing.clone();
        let c = &self.report.counts;
        lines.push(format!("run_contract preflight: {}", self.contract_file.display()));
        lines.push(format!(
            "total_inputs={} ok={} missing_required={} missing_optional={} corrupt={} unverified={}",
            self.report.total_inputs, c.ok, c.missing_required, c.missing_optional, c.corrupt, c.unverified
        ));
        lines
    }

    fn exit_code(&self) -> i32 {
        if self.strict && self.required_unresolved {
            EXIT_STRICT
        } else {
            EXIT_OK
        }
    }
}

// ============================================================================
// record-produced
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct RecordProducedRequest {
    pub contract_file: PathBuf,
    pub task_id: String,
    pub asset_id: Option<String>,
    pub kind: Option<String>,
    pub required: Option<bool>,
    pub local_path: Option<String>,
    pub uri: Option<String>,
    pub local_glob: Option<String>,
    pub gcs_glob: Option<String>,
    pub extra_json_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct RecordProducedOutcome {
    pub task_id: String,
    pub asset_id: String,
    /// `false` when an existing asset was updated
    pub created: bool,
    pub revision: u64,
}

impl CommandReport for RecordProducedOutcome {
    fn lines(&self) -> Vec<String> {
        vec![format!(
            "run_contract record-produced: task={} asset={} created={} revision={}",
            self.task_id, self.asset_id, self.created, self.revision
        )]
    }
}

/// Id given to a produced asset registered without `--asset-id`
pub fn default_produced_id(task_id: &str, location: &AssetLocation) -> String {
    format!(
        "{}/produced/{}",
        task_id,
        runtime::short_digest(location.as_str(), 12)
    )
}

// ============================================================================
// mark-task-*
// ============================================================================

#[derive(Debug, Clone)]
pub struct MarkTaskRequest {
    pub contract_file: PathBuf,
    pub task_id: String,
    pub target: TaskState,
    pub error_json_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct MarkTaskOutcome {
    pub task_id: String,
    pub state: TaskState,
    pub changed: bool,
}

impl CommandReport for MarkTaskOutcome {
    fn lines(&self) -> Vec<String> {
        vec![format!(
            "run_contract mark-task-{}: task={} state={} changed={}",
            self.state.as_str().to_ascii_lowercase(),
            self.task_id,
            self.state,
            self.changed
        )]
    }
}

// ============================================================================
// finalize
// ============================================================================

#[derive(Debug, Clone)]
pub struct FinalizeRequest {
    pub contract_file: PathBuf,
    pub status: Option<PipelineOutcome>,
    pub scope: ContractScope,
    pub scan_local_dirs: Vec<PathBuf>,
    pub scan_gcs_prefixes: Vec<String>,
    pub strict: bool,
    pub output_location: Option<String>,
    pub verification_json_file: Option<PathBuf>,
    pub audit_corruption: bool,
}

impl FinalizeRequest {
    pub fn new(contract_file: impl Into<PathBuf>) -> Self {
        Self {
            contract_file: contract_file.into(),
            status: None,
            scope: ContractScope::Folder,
            scan_local_dirs: Vec::new(),
            scan_gcs_prefixes: Vec::new(),
            strict: false,
            output_location: None,
            verification_json_file: None,
            audit_corruption: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FinalizeOutcome {
    pub contract_file: PathBuf,
    pub contract: Contract,
    pub listing: Vec<String>,
    pub strict: bool,
}

impl FinalizeOutcome {
    pub fn verification(&self) -> Option<&VerificationReport> {
        self.contract.verification.as_ref()
    }

    /// Whether strict mode turns this result into a failure
    pub fn violates_strict(&self) -> bool {
        self.verification()
            .is_some_and(|v| v.has_required_failures() || v.has_required_upload_failures())
    }
}

impl CommandReport for FinalizeOutcome {
    fn lines(&self) -> Vec<String> {
        let mut lines = self.listing.clone();
        if let Some(v) = self.verification() {
            for upload in &v.folder_uploads {
                lines.push(if upload.success {
                    format!("  uploaded: {} ({} assets)", upload.dest, upload.asset_count)
                } else {
                    format!(
                        "  FAILED:   {}: {}",
                        upload.dest,
                        upload.error.as_deref().unwrap_or("unknown error")
                    )
                });
            }
        }
        lines.push(format!("run_contract finalize: {}", self.contract_file.display()));
        if let Some(v) = self.verification() {
            let failed_uploads = v.folder_uploads.iter().filter(|u| !u.success).count();
            lines.push(format!(
                "status={} required_missing={} required_corrupt={} required_unverified={} unexpected_outputs={} failed_uploads={}",
                self.contract.status,
                v.missing_required_asset_ids.len(),
                v.corrupt_required_asset_ids.len(),
                v.unverified_required_asset_ids.len(),
                v.unexpected_outputs_count,
                failed_uploads
            ));
            lines.push(format!("input_assets={}", compact_counts(&v.input_asset_status_counts)));
            lines.push(format!("output_assets={}", compact_counts(&v.output_asset_status_counts)));
        }
        lines
    }

    fn exit_code(&self) -> i32 {
        if self.strict && self.violates_strict() {
            EXIT_STRICT
        } else {
            EXIT_OK
        }
    }
}

// ============================================================================
// cloud-run-env
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct CloudRunEnvRequest {
    pub job_id: Option<String>,
    pub spec_file: Option<PathBuf>,
    pub run_dir: Option<String>,
    pub contract_file: Option<String>,
    pub gcs_run_dir: Option<String>,
    pub format: EnvFormat,
    pub output_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct CloudRunEnvOutcome {
    pub values: IndexMap<String, String>,
    pub rendered: String,
    pub written_to: Option<PathBuf>,
}

impl CommandReport for CloudRunEnvOutcome {
    fn lines(&self) -> Vec<String> {
        match &self.written_to {
            Some(path) => vec![format!("run_contract cloud-run-env: wrote {}", path.display())],
            None => self.rendered.lines().map(str::to_string).collect(),
        }
    }
}

/// Render environment values in one of the supported formats
pub fn format_env(values: &IndexMap<String, String>, format: EnvFormat) -> String {
    match format {
        EnvFormat::Json => {
            let sorted: BTreeMap<&String, &String> = values.iter().collect();
            serde_json::to_string_pretty(&sorted).unwrap_or_else(|_| "{}".to_string())
        }
        EnvFormat::SetEnvVars => values
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(","),
        EnvFormat::Shell => values
            .iter()
            .map(|(k, v)| format!("export {}={}", k, Value::String(v.clone())))
            .collect::<Vec<_>>()
            .join("\n"),
        EnvFormat::Dotenv => values
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

// ============================================================================
// engine
// ============================================================================

type EnvLookup<'a> = Box<dyn Fn(&str) -> Option<String> + 'a>;

/// Runs subcommands against contract files
pub struct Engine<'a> {
    settings: &'a EngineSettings,
    objects: &'a dyn ObjectStore,
    env: EnvLookup<'a>,
}

impl<'a> Engine<'a> {
    pub fn new(settings: &'a EngineSettings, objects: &'a dyn ObjectStore) -> Self {
        Self {
            settings,
            objects,
            env: Box::new(|key: &str| std::env::var(key).ok()),
        }
    }

    /// Replace the process environment used for ids and runtime metadata
    pub fn with_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + 'a,
    {
        self.env = Box::new(lookup);
        self
    }

    fn store(&self, contract_file: &Path) -> ContractStore {
        ContractStore::new(absolute(contract_file), self.settings.lock_timeout)
    }

    fn upload_copy(&self, contract_file: &Path, dir: &str) -> Option<String> {
        let publisher = Publisher::new(self.objects, contract_file);
        match publisher.upload_full(dir) {
            Ok(dest) => {
                info!("Uploaded contract to {}", dest);
                Some(dest)
            }
            Err(e) => {
                warn!("Contract upload to {} failed: {}", dir, e);
                None
            }
        }
    }

    /// Create a new contract from a job spec
    pub fn init(&self, req: &InitRequest) -> Result<InitOutcome> {
        let lookup = |key: &str| (self.env)(key);
        let now = Utc::now();

        let requested_job = req
            .job_id
            .clone()
            .or_else(|| lookup(JOB_ID_ENV))
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let (job, job_id) = match &req.spec_file {
            Some(path) => {
                let root = spec::read_json_file(path, "--spec-file")?;
                spec::select_job(&root, requested_job.as_deref())?
            }
            None => {
                let job_id = requested_job.ok_or_else(|| {
                    ContractError::config(format!("--job-id is required (or set {})", JOB_ID_ENV))
                })?;
                (JobDef::default(), job_id)
            }
        };

        let run_id = runtime::safe_slug(
            &req.run_id
                .clone()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| runtime::default_run_id(&job_id, now, &lookup)),
        );
        let run_dir = match &req.run_dir {
            Some(dir) => absolute(dir),
            None => absolute(
                &Path::new(DEFAULT_RUN_ROOT)
                    .join(runtime::safe_slug(&job_id))
                    .join(&run_id),
            ),
        };
        let contract_file = match &req.contract_file {
            Some(path) => absolute(path),
            None => run_dir.join(CONTRACT_FILE_NAME),
        };
        let output_location = req
            .output_location
            .clone()
            .filter(|s| !s.trim().is_empty());

        let runtime_meta = runtime::runtime_metadata(&lookup);
        let ctx = self.template_context(
            &runtime_meta,
            &job_id,
            &run_id,
            &run_dir,
            &contract_file,
            output_location.as_deref(),
            req,
        )?;

        let bundle: InitBundle = match &req.init_json_file {
            Some(path) => spec::from_value(read_object(path, "--init-json-file")?, "--init-json-file")?,
            None => InitBundle::default(),
        };
        let read_assets = |path: &Option<PathBuf>, flag: &str| -> Result<Option<Vec<AssetDef>>> {
            path.as_ref()
                .map(|p| spec::from_value(spec::read_json_file(p, flag)?, flag))
                .transpose()
        };
        let overrides = AssetOverrides {
            expected_assets: read_assets(&req.expected_assets_file, "--expected-assets-file")?
                .or(bundle.expected_assets.clone()),
            expected_inputs: read_assets(&req.expected_inputs_file, "--expected-inputs-file")?
                .or(bundle.expected_inputs.clone()),
        };

        let tasks = spec::resolve_tasks(&job_id, &job, &overrides, &ctx, now)?;

        let read_opaque = |path: &Option<PathBuf>, flag: &str| -> Result<Option<Value>> {
            path.as_ref().map(|p| read_object(p, flag)).transpose()
        };
        let config = read_opaque(&req.config_json_file, "--config-json-file")?
            .or(bundle.config)
            .unwrap_or_else(|| Value::Object(Map::new()));
        let input_data = read_opaque(&req.inputs_json_file, "--inputs-json-file")?
            .or(bundle.inputs)
            .unwrap_or_else(|| Value::Object(Map::new()));
        let run_metadata =
            read_opaque(&req.run_metadata_json_file, "--run-metadata-json-file")?.or(bundle.run_metadata);

        let pipeline_title = req
            .pipeline_title
            .clone()
            .or_else(|| job.pipeline_title.clone())
            .or_else(|| job.name.clone())
            .unwrap_or_else(|| job_id.clone());

        let mut contract = Contract {
            schema_version: SCHEMA_VERSION,
            revision: 0,
            job_id,
            run_id,
            pipeline_title,
            output_location,
            status: RunStatus::Started,
            started_at: now,
            completed_at: None,
            runtime: runtime_meta,
            config,
            input_data,
            run_metadata,
            tasks,
            preflight: None,
            verification: None,
            paths: ContractPaths {
                contract_json: contract_file.display().to_string(),
                run_dir: run_dir.display().to_string(),
                spec_file: req.spec_file.as_deref().map(|p| absolute(p).display().to_string()),
            },
        };

        self.store(&contract_file).create(&mut contract)?;
        info!(
            "Initialised run {} of job {} with {} task(s)",
            contract.run_id,
            contract.job_id,
            contract.tasks.len()
        );

        let uploaded = req
            .upload_gcs_dir
            .as_deref()
            .and_then(|dir| self.upload_copy(&contract_file, dir));

        Ok(InitOutcome {
            contract_file,
            contract,
            uploaded,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn template_context(
        &self,
        runtime_meta: &Map<String, Value>,
        job_id: &str,
        run_id: &str,
        run_dir: &Path,
        contract_file: &Path,
        output_location: Option<&str>,
        req: &InitRequest,
    ) -> Result<TemplateContext> {
        let mut ctx = TemplateContext::new();
        ctx.extend_from_json(runtime_meta);
        let run_dir = run_dir.display().to_string();
        let contract_file = contract_file.display().to_string();
        let output_location = output_location.unwrap_or_default();
        for (lower, upper, value) in [
            ("job_id", "JOB_ID", job_id),
            ("run_id", "RUN_ID", run_id),
            ("run_dir", "RUN_DIR", run_dir.as_str()),
            ("contract_file", "CONTRACT_FILE", contract_file.as_str()),
            ("output_location", "OUTPUT_LOCATION", output_location),
        ] {
            ctx.insert(lower, value);
            ctx.insert(upper, value);
        }

        if let Some(path) = &req.vars_file {
            if let Value::Object(vars) = read_object(path, "--vars-file")? {
                ctx.extend_from_json(&vars);
            }
        }
        for (key, value) in template::parse_var_pairs(&req.vars)? {
            ctx.insert(key, value);
        }
        debug!("Template context has {} variable(s)", ctx.len());
        Ok(ctx)
    }

    /// Check every input asset
    pub fn preflight(&self, req: &PreflightRequest) -> Result<PreflightOutcome> {
        let store = self.store(&req.contract_file);
        let snapshot = store.load()?;

        let inputs: Vec<(&str, &Asset)> = snapshot
            .assets()
            .filter(|(_, a)| a.role == Role::Input)
            .collect();
        let checker = Checker::new(self.objects, self.settings);
        let refs: Vec<&Asset> = inputs.iter().map(|(_, a)| *a).collect();
        let results = checker.check_all(&refs)?;
        let checked: Vec<CheckedAsset> = inputs
            .iter()
            .zip(results)
            .map(|((task_id, a), result)| CheckedAsset::new(task_id, a, result))
            .collect();

        let (contract, report) = store.update(|c| {
            aggregate::merge_results(c, &checked);
            let report = aggregate::preflight_report(c, Utc::now());
            c.preflight = Some(report.clone());
            Ok(report)
        })?;

        let inputs: Vec<&Asset> = contract
            .assets()
            .map(|(_, a)| a)
            .filter(|a| a.role == Role::Input)
            .collect();
        let listing = inputs.iter().map(|a| listing_line(a)).collect();
        let required_unresolved = inputs
            .iter()
            .any(|a| a.required && a.status != AssetStatus::Ok);

        if let Some(dir) = &req.upload_gcs_dir {
            self.upload_copy(store.path(), dir);
        }

        Ok(PreflightOutcome {
            contract_file: store.path().to_path_buf(),
            report,
            listing,
            strict: req.strict,
            required_unresolved,
        })
    }

    /// Register (or update) an asset a task produced
    pub fn record_produced(&self, req: &RecordProducedRequest) -> Result<RecordProducedOutcome> {
        let task_id = req.task_id.trim().to_string();
        if task_id.is_empty() {
            return Err(ContractError::config("--task-id must not be empty"));
        }
        let label = req.asset_id.clone().unwrap_or_else(|| format!("{}/produced", task_id));
        let location = AssetLocation::from_fields(
            &label,
            req.local_path.clone(),
            req.uri.clone(),
            req.local_glob.clone(),
            req.gcs_glob.clone(),
        )?;
        let asset_id = req
            .asset_id
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| default_produced_id(&task_id, &location));
        let extra = req
            .extra_json_file
            .as_ref()
            .map(|p| read_object(p, "--extra-json-file"))
            .transpose()?;

        let store = self.store(&req.contract_file);
        let now = Utc::now();
        let (contract, created) = store.update(|c| {
            let task = c.task_mut(&task_id)?;
            if task.state == TaskState::Pending {
                task.transition_to(TaskState::Running, now)?;
            }

            let created = match task.asset_mut(&asset_id) {
                Some(existing) => {
                    if existing.location != location {
                        debug!("Asset {} moved to {}", asset_id, location.as_str());
                        existing.location = location.clone();
                        existing.status = AssetStatus::Pending;
                        existing.size_bytes = None;
                        existing.error_detail = None;
                        existing.last_checked_at = None;
                        existing.match_count = None;
                        existing.matched.clear();
                    }
                    if let Some(kind) = &req.kind {
                        existing.kind = kind.clone();
                    }
                    if let Some(required) = req.required {
                        existing.required = required;
                    }
                    existing.produced = true;
                    merge_extra(&mut existing.extra, extra.as_ref());
                    false
                }
                None => {
                    let mut asset = Asset::new(asset_id.clone(), Role::Output, location.clone(), now);
                    if let Some(kind) = req.kind.as_ref().filter(|k| !k.trim().is_empty()) {
                        asset.kind = kind.clone();
                    }
                    asset.required = req.required.unwrap_or(true);
                    asset.produced = true;
                    merge_extra(&mut asset.extra, extra.as_ref());
                    task.push_asset(asset)?;
                    true
                }
            };
            c.mark_running();
            Ok(created)
        })?;

        Ok(RecordProducedOutcome {
            task_id,
            asset_id,
            created,
            revision: contract.revision,
        })
    }

    /// Move a task through its lifecycle
    pub fn mark_task(&self, req: &MarkTaskRequest) -> Result<MarkTaskOutcome> {
        let error = req
            .error_json_file
            .as_ref()
            .map(|p| read_object(p, "--error-json-file"))
            .transpose()?;
        let store = self.store(&req.contract_file);
        let now = Utc::now();

        let (_, changed) = store.update(|c| {
            let task = c.task_mut(&req.task_id)?;
            let changed = task.transition_to(req.target, now)?;
            if let Some(error) = &error {
                task.error = Some(error.clone());
            }
            let started = task.started_at.is_some();
            if started {
                c.mark_running();
            }
            Ok(changed)
        })?;

        if !changed {
            info!("Task {} already {}", req.task_id, req.target);
        }
        Ok(MarkTaskOutcome {
            task_id: req.task_id.clone(),
            state: req.target,
            changed,
        })
    }

    /// Audit outputs (and unchecked inputs), set the terminal status, publish
    pub fn finalize(&self, req: &FinalizeRequest) -> Result<FinalizeOutcome> {
        let store = self.store(&req.contract_file);
        let snapshot = store.load()?;

        let targets: Vec<(&str, &Asset)> = snapshot
            .assets()
            .filter(|(_, a)| a.role == Role::Output || !a.status.is_checked())
            .collect();
        let checker = Checker::new(self.objects, self.settings).audit_corruption(req.audit_corruption);
        let refs: Vec<&Asset> = targets.iter().map(|(_, a)| *a).collect();
        let results = checker.check_all(&refs)?;
        let checked: Vec<CheckedAsset> = targets
            .iter()
            .zip(results)
            .map(|((task_id, a), result)| CheckedAsset::new(task_id, a, result))
            .collect();

        let mut found = checker::scan_local(&req.scan_local_dirs);
        if !req.scan_gcs_prefixes.is_empty() {
            found.extend(checker::scan_remote(
                self.objects,
                self.settings.retry_policy(),
                &req.scan_gcs_prefixes,
            ));
        }

        let extra = req
            .verification_json_file
            .as_ref()
            .map(|p| read_object(p, "--verification-json-file"))
            .transpose()?
            .unwrap_or_else(|| Value::Object(Map::new()));

        let (committed, audited) = store.update(|c| {
            if let Some(location) = req.output_location.as_ref().filter(|s| !s.trim().is_empty()) {
                c.output_location = Some(location.clone());
            }
            let audited = aggregate::merge_results(c, &checked);

            let now = Utc::now();
            let unexpected_outputs = aggregate::unexpected_outputs(c, &found);
            let report = aggregate::verification_report(
                c,
                VerificationParams {
                    finished_at: now,
                    scope: req.scope,
                    folder: None,
                    reported_status: req.status,
                    audit_corruption: req.audit_corruption,
                    audited: audited.clone(),
                    unexpected_outputs,
                    folder_uploads: Vec::new(),
                    extra: extra.clone(),
                },
            );
            c.verification = Some(report);
            c.status = aggregate::run_status(c, req.status);
            c.completed_at = Some(now);
            Ok(audited)
        })?;
        info!("Run {} finalized as {}", committed.run_id, committed.status);

        let uploads: Vec<FolderUpload> =
            Publisher::new(self.objects, store.path()).publish(&committed, req.scope, &audited);
        let contract = if uploads.is_empty() {
            committed
        } else {
            store
                .update(|c| {
                    if let Some(v) = c.verification.as_mut() {
                        v.folder_uploads = uploads.clone();
                    }
                    Ok(())
                })?
                .0
        };

        let listing = contract
            .assets()
            .filter(|(task_id, a)| audited.contains(&asset_key(task_id, a)))
            .map(|(_, a)| listing_line(a))
            .collect();

        Ok(FinalizeOutcome {
            contract_file: store.path().to_path_buf(),
            contract,
            listing,
            strict: req.strict,
        })
    }

    /// Environment wiring for a containerised run
    pub fn cloud_run_env(&self, req: &CloudRunEnvRequest) -> Result<CloudRunEnvOutcome> {
        let job_id = req
            .job_id
            .clone()
            .or_else(|| (self.env)(JOB_ID_ENV))
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                ContractError::config(format!("--job-id is required (or set {})", JOB_ID_ENV))
            })?;

        if let Some(path) = &req.spec_file {
            let root = spec::read_json_file(path, "--spec-file")?;
            spec::select_job(&root, Some(&job_id))?;
        }

        let run_dir = req
            .run_dir
            .clone()
            .unwrap_or_else(|| format!("/tmp/{}/{}", DEFAULT_RUN_ROOT, runtime::safe_slug(&job_id)));
        let contract_file = req
            .contract_file
            .clone()
            .unwrap_or_else(|| locator::contract_dest(&run_dir, CONTRACT_FILE_NAME));

        let mut values = IndexMap::new();
        values.insert("RUN_CONTRACT_ENABLED".to_string(), "true".to_string());
        values.insert("RUN_CONTRACT_JOB_ID".to_string(), job_id);
        values.insert("RUN_CONTRACT_RUN_DIR".to_string(), run_dir);
        values.insert("RUN_CONTRACT_FILE".to_string(), contract_file);
        values.insert(
            "RUN_CONTRACT_SPEC_FILE".to_string(),
            req.spec_file
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
        );
        values.insert(
            "RUN_CONTRACT_GCS_DIR".to_string(),
            req.gcs_run_dir.clone().unwrap_or_default(),
        );
        values.insert(
            "RUN_CONTRACT_RUN_ID_ENV".to_string(),
            "CLOUD_RUN_EXECUTION".to_string(),
        );

        let rendered = format_env(&values, req.format);
        if let Some(path) = &req.output_file {
            write_atomic(path, format!("{}\n", rendered).as_bytes())?;
        }
        Ok(CloudRunEnvOutcome {
            values,
            rendered,
            written_to: req.output_file.clone(),
        })
    }
}

fn merge_extra(target: &mut Value, extra: Option<&Value>) {
    let Some(Value::Object(incoming)) = extra else {
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(existing) = target {
        for (k, v) in incoming {
            existing.insert(k.clone(), v.clone());
        }
    }
}
