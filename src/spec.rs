//! Job spec resolution.
//!
//! Turns a job specification plus a template context into the task/asset
//! skeleton of a new contract. Nothing here touches the filesystem except
//! [`read_json_file`]; the resolver itself is side-effect free.

use std::path::Path;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{ContractError, Result};
use crate::model::{Asset, AssetLocation, Task};
use crate::template::TemplateContext;
use crate::types::Role;

/// One declared asset as written in a spec
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AssetDef {
    #[serde(default)]
    pub asset_id: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub required: Option<bool>,
    #[serde(default)]
    pub local_path: Option<String>,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub local_glob: Option<String>,
    #[serde(default)]
    pub gcs_glob: Option<String>,
    #[serde(default)]
    pub extra: Option<Map<String, Value>>,
}

/// One declared task
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TaskDef {
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub labels: Map<String, Value>,
    #[serde(default)]
    pub expected_assets: Vec<AssetDef>,
    #[serde(default)]
    pub expected_inputs: Vec<AssetDef>,
}

/// A job definition: either explicit tasks or one implicit task
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct JobDef {
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub pipeline_title: Option<String>,
    #[serde(default)]
    pub default_task_id: Option<String>,
    #[serde(default)]
    pub default_labels: Map<String, Value>,
    #[serde(default)]
    pub tasks: Vec<TaskDef>,
    #[serde(default)]
    pub expected_assets: Vec<AssetDef>,
    #[serde(default)]
    pub expected_inputs: Vec<AssetDef>,
}

/// Single-file init payload (`--init-json-file`)
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct InitBundle {
    #[serde(default)]
    pub config: Option<Value>,
    #[serde(default)]
    pub inputs: Option<Value>,
    #[serde(default)]
    pub expected_assets: Option<Vec<AssetDef>>,
    #[serde(default)]
    pub expected_inputs: Option<Vec<AssetDef>>,
    #[serde(default)]
    pub run_metadata: Option<Value>,
}

/// Read and parse a JSON file named by a CLI flag
pub fn read_json_file(path: &Path, flag: &str) -> Result<Value> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        ContractError::config(format!("cannot read {} {}: {}", flag, path.display(), e))
    })?;
    serde_json::from_str(&text).map_err(|e| {
        ContractError::config(format!("{} {} is not valid JSON: {}", flag, path.display(), e))
    })
}

/// Deserialize a JSON value into a spec structure, reporting `what` on failure
pub fn from_value<T: serde::de::DeserializeOwned>(value: Value, what: &str) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| ContractError::config(format!("malformed {}: {}", what, e)))
}

/// Pick the job definition out of a spec document.
///
/// A document with a `jobs` object is looked up by `job_id`; when no id was
/// requested and there is exactly one job, that job is used. Any other
/// document is itself the job.
pub fn select_job(root: &Value, job_id: Option<&str>) -> Result<(JobDef, String)> {
    let obj = root
        .as_object()
        .ok_or_else(|| ContractError::config("spec file must be a JSON object"))?;
    let requested = job_id.map(str::trim).filter(|s| !s.is_empty());

    if let Some(jobs) = obj.get("jobs") {
        let jobs = jobs
            .as_object()
            .ok_or_else(|| ContractError::config("spec key 'jobs' must be an object"))?;

        let (id, raw) = match requested {
            Some(id) => match jobs.get(id) {
                Some(raw) => (id.to_string(), raw),
                None => {
                    let available: Vec<&str> = jobs.keys().map(String::as_str).collect();
                    return Err(ContractError::config(format!(
                        "job '{}' not found in spec (available: [{}])",
                        id,
                        available.join(", ")
                    )));
                }
            },
            None if jobs.len() == 1 => match jobs.iter().next() {
                Some((id, raw)) => (id.clone(), raw),
                None => return Err(ContractError::config("spec has no jobs")),
            },
            None => {
                return Err(ContractError::config(
                    "spec defines several jobs; --job-id is required",
                ));
            }
        };
        let job: JobDef = from_value(raw.clone(), &format!("job '{}'", id))?;
        return Ok((job, id));
    }

    let job: JobDef = from_value(root.clone(), "job spec")?;
    let id = requested
        .map(str::to_string)
        .or_else(|| job.job_id.clone())
        .or_else(|| job.name.clone())
        .unwrap_or_else(|| "job".to_string());
    Ok((job, id))
}

/// Asset list overrides that replace the job's declared assets
#[derive(Debug, Clone, Default)]
pub struct AssetOverrides {
    pub expected_assets: Option<Vec<AssetDef>>,
    pub expected_inputs: Option<Vec<AssetDef>>,
}

impl AssetOverrides {
    fn is_set(&self) -> bool {
        self.expected_assets.is_some() || self.expected_inputs.is_some()
    }
}

/// Resolve a job into ordered, validated tasks.
///
/// # Errors
///
/// - `Config` on an unresolved placeholder or duplicate task/asset id
/// - `LocationUnresolvable` when an asset has zero or several location fields
pub fn resolve_tasks(
    job_id: &str,
    job: &JobDef,
    overrides: &AssetOverrides,
    ctx: &TemplateContext,
    now: DateTime<Utc>,
) -> Result<IndexMap<String, Task>> {
    let implicit = |assets: Vec<AssetDef>, inputs: Vec<AssetDef>| TaskDef {
        task_id: Some(job.default_task_id.clone().unwrap_or_else(|| job_id.to_string())),
        labels: job.default_labels.clone(),
        expected_assets: assets,
        expected_inputs: inputs,
    };

    let task_defs: Vec<TaskDef> = if overrides.is_set() {
        vec![implicit(
            overrides
                .expected_assets
                .clone()
                .unwrap_or_else(|| job.expected_assets.clone()),
            overrides
                .expected_inputs
                .clone()
                .unwrap_or_else(|| job.expected_inputs.clone()),
        )]
    } else if job.tasks.is_empty() {
        vec![implicit(job.expected_assets.clone(), job.expected_inputs.clone())]
    } else {
        job.tasks.clone()
    };

    let mut tasks = IndexMap::with_capacity(task_defs.len());
    for (index, def) in task_defs.iter().enumerate() {
        let raw_id = def
            .task_id
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| format!("{}/task_{}", job_id, index + 1));
        let task_id = ctx.render(&raw_id)?;
        if task_id.trim().is_empty() {
            return Err(ContractError::config(format!(
                "task #{} resolved to an empty task_id",
                index + 1
            )));
        }
        if tasks.contains_key(&task_id) {
            return Err(ContractError::config(format!("duplicate task_id '{}'", task_id)));
        }

        let task = resolve_task(task_id.clone(), def, ctx, now)?;
        debug!("Resolved task {} with {} asset(s)", task_id, task.assets.len());
        tasks.insert(task_id, task);
    }
    Ok(tasks)
}

fn resolve_task(
    task_id: String,
    def: &TaskDef,
    ctx: &TemplateContext,
    now: DateTime<Utc>,
) -> Result<Task> {
    let mut task = Task::new(task_id, now);

    for (key, value) in &def.labels {
        let rendered = match ctx.render_value(value)? {
            Value::String(s) => s,
            Value::Null => continue,
            other => other.to_string(),
        };
        task.labels.insert(key.clone(), rendered);
    }

    let tagged = def
        .expected_assets
        .iter()
        .map(|a| (a, Role::Output))
        .chain(def.expected_inputs.iter().map(|a| (a, Role::Input)));

    for (index, (asset_def, role)) in tagged.enumerate() {
        let asset = resolve_asset(&task.task_id, index + 1, asset_def, role, ctx, now)?;
        task.push_asset(asset)?;
    }
    Ok(task)
}

fn resolve_asset(
    task_id: &str,
    position: usize,
    def: &AssetDef,
    role: Role,
    ctx: &TemplateContext,
    now: DateTime<Utc>,
) -> Result<Asset> {
    let raw_id = def
        .asset_id
        .clone()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| {
            let suffix = match role {
                Role::Output => "asset",
                Role::Input => "input",
            };
            format!("{}/{}_{}", task_id, suffix, position)
        });
    let asset_id = ctx.render(&raw_id)?;

    let location = AssetLocation::from_fields(
        &asset_id,
        def.local_path.clone(),
        def.uri.clone(),
        def.local_glob.clone(),
        def.gcs_glob.clone(),
    )?
    .map(|raw| ctx.render(raw))?;
    location.ensure_present(&asset_id)?;

    let mut asset = Asset::new(asset_id, role, location, now);
    if let Some(kind) = def.kind.as_ref().filter(|k| !k.trim().is_empty()) {
        asset.kind = kind.clone();
    }
    asset.required = def.required.unwrap_or(true);
    asset.expected = true;
    if let Some(extra) = &def.extra {
        asset.extra = ctx.render_value(&Value::Object(extra.clone()))?;
    }
    Ok(asset)
}
