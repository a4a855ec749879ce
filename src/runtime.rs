//! Runtime detection and run identifiers.
//!
//! Every lookup goes through a closure so tests can feed a fake environment
//! instead of mutating the real one.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use strum::{Display, EnumString};

/// Where the engine believes it is running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum RuntimeKind {
    CloudRun,
    CloudBuild,
    Vm,
    Local,
}

/// Environment variables consulted, in order, for a run id
pub const RUN_ID_ENV_CANDIDATES: &[&str] = &[
    "RUN_CONTRACT_RUN_ID",
    "SDM_RUN_ID",
    "BUILD_ID",
    "CLOUD_RUN_EXECUTION",
];

/// Environment variable consulted for a job id
pub const JOB_ID_ENV: &str = "RUN_CONTRACT_JOB_ID";

fn non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Classify the runtime from well-known platform variables
pub fn detect_kind<F>(lookup: &F) -> RuntimeKind
where
    F: Fn(&str) -> Option<String>,
{
    if non_empty(lookup, "K_SERVICE").is_some() || non_empty(lookup, "CLOUD_RUN_JOB").is_some() {
        RuntimeKind::CloudRun
    } else if non_empty(lookup, "BUILD_ID").is_some() && non_empty(lookup, "PROJECT_ID").is_some() {
        RuntimeKind::CloudBuild
    } else if non_empty(lookup, "VM_NAME").is_some() {
        RuntimeKind::Vm
    } else {
        RuntimeKind::Local
    }
}

/// Metadata object stored under `contract.runtime`.
///
/// Unset variables are recorded as `null` so the document shape is stable
/// across runtimes.
pub fn runtime_metadata<F>(lookup: &F) -> Map<String, Value>
where
    F: Fn(&str) -> Option<String>,
{
    let kind = detect_kind(lookup);
    let field = |key: &str| non_empty(lookup, key).map_or(Value::Null, Value::String);

    let mut meta = Map::new();
    meta.insert("runtime".into(), Value::String(kind.to_string()));
    meta.insert("project_id".into(), field("PROJECT_ID"));
    meta.insert("build_id".into(), field("BUILD_ID"));
    let commit = ["SHORT_SHA", "COMMIT_SHA", "GIT_COMMIT"]
        .iter()
        .find_map(|key| non_empty(lookup, key))
        .map_or(Value::Null, Value::String);
    meta.insert("commit_sha".into(), commit);
    meta.insert("vm_name".into(), field("VM_NAME"));
    meta.insert("vm_zone".into(), field("VM_ZONE"));
    meta.insert("cloudbuild_yaml".into(), field("CLOUDBUILD_YAML"));

    if kind == RuntimeKind::CloudRun {
        meta.insert("service".into(), field("K_SERVICE"));
        meta.insert("revision".into(), field("K_REVISION"));
        meta.insert("configuration".into(), field("K_CONFIGURATION"));
        meta.insert("cloud_run_job".into(), field("CLOUD_RUN_JOB"));
        meta.insert("cloud_run_execution".into(), field("CLOUD_RUN_EXECUTION"));
        meta.insert("cloud_run_task_index".into(), field("CLOUD_RUN_TASK_INDEX"));
    }
    meta
}

fn slug_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[^A-Za-z0-9_.-]+").unwrap_or_else(|e| panic!("slug regex is invalid: {}", e))
    })
}

/// Make a value safe for use as a single path segment
pub fn safe_slug(value: &str) -> String {
    let replaced = slug_regex().replace_all(value, "_");
    let trimmed = replaced.trim_matches(|c| matches!(c, '.' | '_' | '-'));
    if trimmed.is_empty() {
        "run".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Lower-case hex SHA-256 of `input`, truncated to `len` characters
pub fn short_digest(input: &str, len: usize) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex[..len.min(hex.len())].to_string()
}

/// Run id from the environment, or `<UTC timestamp>_<digest of job id>`
pub fn default_run_id<F>(job_id: &str, now: DateTime<Utc>, lookup: &F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(candidate) = RUN_ID_ENV_CANDIDATES
        .iter()
        .find_map(|key| non_empty(lookup, key))
    {
        return safe_slug(&candidate);
    }
    format!("{}_{}", now.format("%Y%m%dT%H%M%SZ"), short_digest(job_id, 8))
}
