//! The persisted contract document.
//!
//! A [`Contract`] is the aggregate root: tasks own their assets, and every
//! mutation goes through the store's load/mutate/persist cycle. Opaque
//! pipeline payloads (`config`, `run_metadata`, `input_data`, `extra`) are
//! kept as `serde_json::Value` and never interpreted.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ContractError, Result};
use crate::task_state::{plan_transition, TaskState, TaskTransitionError, Transition};
use crate::types::{AssetStatus, ContractScope, PipelineOutcome, Role, RunStatus};

/// Current document layout
pub const SCHEMA_VERSION: u32 = 1;

/// Number of glob matches kept on an asset
pub const MATCHED_SAMPLE_LIMIT: usize = 200;

/// Where an asset lives. Exactly one form per asset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetLocation {
    LocalPath(String),
    Uri(String),
    LocalGlob(String),
    GcsGlob(String),
}

impl AssetLocation {
    /// Build a location from the four optional spec/CLI fields.
    ///
    /// # Errors
    ///
    /// `LocationUnresolvable` unless exactly one field is a non-blank string.
    pub fn from_fields(
        asset_id: &str,
        local_path: Option<String>,
        uri: Option<String>,
        local_glob: Option<String>,
        gcs_glob: Option<String>,
    ) -> Result<Self> {
        let present = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
        let mut candidates: Vec<AssetLocation> = [
            present(local_path).map(AssetLocation::LocalPath),
            present(uri).map(AssetLocation::Uri),
            present(local_glob).map(AssetLocation::LocalGlob),
            present(gcs_glob).map(AssetLocation::GcsGlob),
        ]
        .into_iter()
        .flatten()
        .collect();

        if candidates.len() > 1 {
            return Err(ContractError::location(
                asset_id,
                format!("{} location fields set, expected exactly one", candidates.len()),
            ));
        }
        candidates.pop().ok_or_else(|| {
            ContractError::location(
                asset_id,
                "no location field set (expected one of local_path, uri, local_glob, gcs_glob)",
            )
        })
    }

    /// The raw location string
    pub fn as_str(&self) -> &str {
        match self {
            Self::LocalPath(s) | Self::Uri(s) | Self::LocalGlob(s) | Self::GcsGlob(s) => s,
        }
    }

    /// Name of the field this location came from
    pub fn field_name(&self) -> &'static str {
        match self {
            Self::LocalPath(_) => "local_path",
            Self::Uri(_) => "uri",
            Self::LocalGlob(_) => "local_glob",
            Self::GcsGlob(_) => "gcs_glob",
        }
    }

    pub fn is_glob(&self) -> bool {
        matches!(self, Self::LocalGlob(_) | Self::GcsGlob(_))
    }

    /// Apply `f` to the inner string, keeping the variant
    pub fn map<F>(&self, f: F) -> Result<Self>
    where
        F: FnOnce(&str) -> Result<String>,
    {
        Ok(match self {
            Self::LocalPath(s) => Self::LocalPath(f(s)?),
            Self::Uri(s) => Self::Uri(f(s)?),
            Self::LocalGlob(s) => Self::LocalGlob(f(s)?),
            Self::GcsGlob(s) => Self::GcsGlob(f(s)?),
        })
    }

    /// Fail when the location value is blank
    pub fn ensure_present(&self, asset_id: &str) -> Result<()> {
        if self.as_str().trim().is_empty() {
            return Err(ContractError::location(
                asset_id,
                format!("{} is empty", self.field_name()),
            ));
        }
        Ok(())
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// One expected or produced artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub asset_id: String,
    pub role: Role,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default = "default_required")]
    pub required: bool,
    pub location: AssetLocation,
    #[serde(default)]
    pub status: AssetStatus,
    #[serde(default)]
    pub size_bytes: Option<u64>,
    #[serde(default)]
    pub last_checked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matched: Vec<String>,
    #[serde(default)]
    pub expected: bool,
    #[serde(default)]
    pub produced: bool,
    #[serde(default = "empty_object")]
    pub extra: Value,
    pub created_at: DateTime<Utc>,
}

fn default_kind() -> String {
    "output".to_string()
}

fn default_required() -> bool {
    true
}

impl Asset {
    /// A freshly declared asset, PENDING and never checked
    pub fn new(
        asset_id: impl Into<String>,
        role: Role,
        location: AssetLocation,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            asset_id: asset_id.into(),
            role,
            kind: default_kind(),
            required: true,
            location,
            status: AssetStatus::Pending,
            size_bytes: None,
            last_checked_at: None,
            error_detail: None,
            match_count: None,
            matched: Vec::new(),
            expected: false,
            produced: false,
            extra: empty_object(),
            created_at: now,
        }
    }

    /// Whether a required asset in this status fails the run
    pub fn blocks_completion(&self) -> bool {
        self.required && self.status.is_unresolved()
    }

    /// Validator override from `extra.validator`
    pub fn validator_override(&self) -> Option<&str> {
        self.extra.get("validator").and_then(Value::as_str)
    }

    /// Copy the result of a check onto this asset
    pub fn apply_check(&mut self, result: &CheckResult) {
        self.status = result.status;
        self.size_bytes = result.size_bytes;
        self.error_detail = result.error_detail.clone();
        self.last_checked_at = Some(result.checked_at);
        self.match_count = result.match_count;
        self.matched = result
            .matched
            .iter()
            .take(MATCHED_SAMPLE_LIMIT)
            .cloned()
            .collect();
    }
}

/// Outcome of checking one asset
#[derive(Debug, Clone, PartialEq)]
pub struct CheckResult {
    pub status: AssetStatus,
    pub size_bytes: Option<u64>,
    pub error_detail: Option<String>,
    pub checked_at: DateTime<Utc>,
    /// Set for glob assets only
    pub match_count: Option<usize>,
    /// Resolved locations that exist
    pub matched: Vec<String>,
}

/// One entry of a task's state history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub state: TaskState,
    pub at: DateTime<Utc>,
}

/// A unit of pipeline work owning an ordered list of assets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub state: TaskState,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub state_history: Vec<StateChange>,
    #[serde(default)]
    pub assets: Vec<Asset>,
}

impl Task {
    pub fn new(task_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            task_id: task_id.into(),
            labels: BTreeMap::new(),
            state: TaskState::Pending,
            created_at: now,
            started_at: None,
            finished_at: None,
            error: None,
            state_history: vec![StateChange {
                state: TaskState::Pending,
                at: now,
            }],
            assets: Vec::new(),
        }
    }

    pub fn asset(&self, asset_id: &str) -> Option<&Asset> {
        self.assets.iter().find(|a| a.asset_id == asset_id)
    }

    pub fn asset_mut(&mut self, asset_id: &str) -> Option<&mut Asset> {
        self.assets.iter_mut().find(|a| a.asset_id == asset_id)
    }

    /// Append an asset, rejecting a duplicate id
    pub fn push_asset(&mut self, asset: Asset) -> Result<()> {
        if self.asset(&asset.asset_id).is_some() {
            return Err(ContractError::config(format!(
                "duplicate asset id '{}' in task '{}'",
                asset.asset_id, self.task_id
            )));
        }
        self.assets.push(asset);
        Ok(())
    }

    /// Move the task to `target`, recording every state entered.
    ///
    /// Returns `false` when the task was already in `target`.
    pub fn transition_to(
        &mut self,
        target: TaskState,
        now: DateTime<Utc>,
    ) -> std::result::Result<bool, TaskTransitionError> {
        let entered = match plan_transition(self.state, target)? {
            Transition::Unchanged => return Ok(false),
            Transition::Entered(states) => states,
        };

        for state in entered {
            if state == TaskState::Running && self.started_at.is_none() {
                self.started_at = Some(now);
            }
            if state.is_terminal() {
                self.finished_at = Some(now);
            }
            self.state = state;
            self.state_history.push(StateChange { state, at: now });
        }
        Ok(true)
    }
}

/// File locations recorded at init
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractPaths {
    #[serde(default)]
    pub contract_json: String,
    #[serde(default)]
    pub run_dir: String,
    #[serde(default)]
    pub spec_file: Option<String>,
}

/// Per-role status counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleCounts {
    pub total: usize,
    pub ok: usize,
    pub missing_required: usize,
    pub missing_optional: usize,
    pub corrupt: usize,
    pub unverified: usize,
    pub pending: usize,
}

/// Result block written by `preflight`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreflightReport {
    pub checked_at: DateTime<Utc>,
    pub total_inputs: usize,
    pub counts: RoleCounts,
    pub missing_required: Vec<String>,
    pub missing_optional: Vec<String>,
    pub corrupt: Vec<String>,
    pub unverified: Vec<String>,
}

/// Publish result for one contract document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderUpload {
    pub folder: String,
    pub dest: String,
    pub asset_count: usize,
    pub required_asset_count: usize,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// Result block written by `finalize`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub finished_at: DateTime<Utc>,
    pub scope: ContractScope,
    /// Set on folder-scoped documents only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
    #[serde(default)]
    pub reported_status: Option<PipelineOutcome>,
    pub audit_corruption: bool,
    pub audited_assets: usize,
    pub required_assets_count: usize,
    pub expected_assets_count: usize,
    pub produced_assets_count: usize,
    pub input_counts: RoleCounts,
    pub output_counts: RoleCounts,
    pub asset_status_counts: BTreeMap<String, usize>,
    pub input_asset_status_counts: BTreeMap<String, usize>,
    pub output_asset_status_counts: BTreeMap<String, usize>,
    pub task_state_counts: BTreeMap<String, usize>,
    pub missing_required_asset_ids: Vec<String>,
    pub corrupt_required_asset_ids: Vec<String>,
    pub unverified_required_asset_ids: Vec<String>,
    #[serde(default)]
    pub unexpected_outputs: Vec<String>,
    #[serde(default)]
    pub unexpected_outputs_count: usize,
    #[serde(default)]
    pub folder_uploads: Vec<FolderUpload>,
    #[serde(default = "empty_object")]
    pub extra: Value,
}

impl VerificationReport {
    /// Whether any required audited asset is unresolved
    pub fn has_required_failures(&self) -> bool {
        !self.missing_required_asset_ids.is_empty()
            || !self.corrupt_required_asset_ids.is_empty()
            || !self.unverified_required_asset_ids.is_empty()
    }

    /// Whether a publish failed for a folder holding a required asset
    pub fn has_required_upload_failures(&self) -> bool {
        self.folder_uploads
            .iter()
            .any(|u| !u.success && u.required_asset_count > 0)
    }
}

/// Aggregate root: one pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub schema_version: u32,
    #[serde(default)]
    pub revision: u64,
    pub job_id: String,
    pub run_id: String,
    pub pipeline_title: String,
    #[serde(default)]
    pub output_location: Option<String>,
    #[serde(default)]
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub runtime: Map<String, Value>,
    #[serde(default = "empty_object")]
    pub config: Value,
    #[serde(default = "empty_object")]
    pub input_data: Value,
    #[serde(default)]
    pub run_metadata: Option<Value>,
    #[serde(default)]
    pub tasks: IndexMap<String, Task>,
    #[serde(default)]
    pub preflight: Option<PreflightReport>,
    #[serde(default)]
    pub verification: Option<VerificationReport>,
    #[serde(default)]
    pub paths: ContractPaths,
}

impl Contract {
    /// Structural checks applied after every load and before every write
    pub fn validate(&self) -> Result<()> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(ContractError::config(format!(
                "unsupported schema_version {} (expected {})",
                self.schema_version, SCHEMA_VERSION
            )));
        }
        if self.job_id.trim().is_empty() {
            return Err(ContractError::config("contract has an empty job_id"));
        }
        for (key, task) in &self.tasks {
            if key != &task.task_id {
                return Err(ContractError::config(format!(
                    "task key '{}' does not match task_id '{}'",
                    key, task.task_id
                )));
            }
            let mut seen = HashSet::new();
            for asset in &task.assets {
                if !seen.insert(asset.asset_id.as_str()) {
                    return Err(ContractError::config(format!(
                        "duplicate asset id '{}' in task '{}'",
                        asset.asset_id, task.task_id
                    )));
                }
                asset.location.ensure_present(&asset.asset_id)?;
            }
        }
        Ok(())
    }

    /// Every asset with its owning task id, in declaration order
    pub fn assets(&self) -> impl Iterator<Item = (&str, &Asset)> {
        self.tasks
            .values()
            .flat_map(|t| t.assets.iter().map(move |a| (t.task_id.as_str(), a)))
    }

    pub fn asset_count(&self) -> usize {
        self.tasks.values().map(|t| t.assets.len()).sum()
    }

    pub fn role_count(&self, role: Role) -> usize {
        self.assets().filter(|(_, a)| a.role == role).count()
    }

    pub fn asset_mut(&mut self, task_id: &str, asset_id: &str) -> Option<&mut Asset> {
        self.tasks.get_mut(task_id)?.asset_mut(asset_id)
    }

    /// Look up a task or fail with a config error naming it
    pub fn task_mut(&mut self, task_id: &str) -> Result<&mut Task> {
        let job_id = self.job_id.clone();
        self.tasks.get_mut(task_id).ok_or_else(|| {
            ContractError::config(format!("unknown task '{}' in job '{}'", task_id, job_id))
        })
    }

    /// STARTED → RUNNING on first activity; later statuses are left alone
    pub fn mark_running(&mut self) {
        if self.status == RunStatus::Started {
            self.status = RunStatus::Running;
        }
    }
}
