//! Status aggregation over a contract.
//!
//! Pure functions: they read asset statuses and task states and produce the
//! `preflight` and `verification` blocks plus the terminal run status.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde_json::Value;
use strum::IntoEnumIterator;
use tracing::debug;

use crate::locator::{self, CheckTarget};
use crate::model::{
    Asset, AssetLocation, CheckResult, Contract, FolderUpload, PreflightReport, RoleCounts,
    VerificationReport,
};
use crate::task_state::TaskState;
use crate::types::{AssetStatus, ContractScope, PipelineOutcome, Role, RunStatus};

/// Identity of an asset across reloads
pub type AssetKey = (String, String);

pub fn asset_key(task_id: &str, asset: &Asset) -> AssetKey {
    (task_id.to_string(), asset.asset_id.clone())
}

/// Tally one role
pub fn role_counts<'a, I>(assets: I) -> RoleCounts
where
    I: IntoIterator<Item = &'a Asset>,
{
    let mut counts = RoleCounts::default();
    for asset in assets {
        counts.total += 1;
        match asset.status {
            AssetStatus::Ok => counts.ok += 1,
            AssetStatus::Missing if asset.required => counts.missing_required += 1,
            AssetStatus::Missing => counts.missing_optional += 1,
            AssetStatus::Corrupt => counts.corrupt += 1,
            AssetStatus::Unverified => counts.unverified += 1,
            AssetStatus::Pending => counts.pending += 1,
        }
    }
    counts
}

/// Count per status name, every status present even at zero
pub fn status_counts<'a, I>(assets: I) -> BTreeMap<String, usize>
where
    I: IntoIterator<Item = &'a Asset>,
{
    let mut counts: BTreeMap<String, usize> =
        AssetStatus::iter().map(|s| (s.to_string(), 0)).collect();
    for asset in assets {
        *counts.entry(asset.status.to_string()).or_default() += 1;
    }
    counts
}

pub fn task_state_counts(contract: &Contract) -> BTreeMap<String, usize> {
    let mut counts: BTreeMap<String, usize> = TaskState::all_states()
        .iter()
        .map(|s| (s.as_str().to_string(), 0))
        .collect();
    for task in contract.tasks.values() {
        *counts.entry(task.state.as_str().to_string()).or_default() += 1;
    }
    counts
}

fn assets_with_role(contract: &Contract, role: Role) -> impl Iterator<Item = &Asset> {
    contract.assets().map(|(_, a)| a).filter(move |a| a.role == role)
}

/// A check result together with the asset and location it was taken from
#[derive(Debug, Clone)]
pub struct CheckedAsset {
    pub key: AssetKey,
    pub location: AssetLocation,
    pub result: CheckResult,
}

impl CheckedAsset {
    pub fn new(task_id: &str, asset: &Asset, result: CheckResult) -> Self {
        Self {
            key: asset_key(task_id, asset),
            location: asset.location.clone(),
            result,
        }
    }
}

/// Write check results back onto the matching assets.
///
/// A result is dropped when its asset no longer exists or now points at a
/// different location than the one checked; such assets keep their current
/// status. Returns the keys that were updated.
pub fn merge_results(contract: &mut Contract, results: &[CheckedAsset]) -> HashSet<AssetKey> {
    let mut merged = HashSet::new();
    for checked in results {
        let (task_id, asset_id) = &checked.key;
        let Some(asset) = contract.asset_mut(task_id, asset_id) else {
            continue;
        };
        if asset.location != checked.location {
            debug!(
                "Asset {}/{} moved to {} during the check, keeping its status",
                task_id,
                asset_id,
                asset.location.as_str()
            );
            continue;
        }
        asset.apply_check(&checked.result);
        merged.insert(checked.key.clone());
    }
    merged
}

/// Build the `preflight` block from the input assets
pub fn preflight_report(contract: &Contract, checked_at: DateTime<Utc>) -> PreflightReport {
    let inputs: Vec<&Asset> = assets_with_role(contract, Role::Input).collect();
    let ids = |pred: &dyn Fn(&Asset) -> bool| -> Vec<String> {
        inputs
            .iter()
            .filter(|a| pred(a))
            .map(|a| a.asset_id.clone())
            .collect()
    };

    PreflightReport {
        checked_at,
        total_inputs: inputs.len(),
        counts: role_counts(inputs.iter().copied()),
        missing_required: ids(&|a| a.required && a.status == AssetStatus::Missing),
        missing_optional: ids(&|a| !a.required && a.status == AssetStatus::Missing),
        corrupt: ids(&|a| a.status == AssetStatus::Corrupt),
        unverified: ids(&|a| a.status == AssetStatus::Unverified),
    }
}

/// Terminal run status.
///
/// A reported failure always wins. Otherwise the run is complete when no
/// required asset is unresolved and every required output is OK; inputs that
/// were never checked do not count against it.
pub fn run_status(contract: &Contract, reported: Option<PipelineOutcome>) -> RunStatus {
    if reported == Some(PipelineOutcome::Failed) {
        return RunStatus::Failed;
    }
    let blocked = contract.assets().any(|(_, a)| a.blocks_completion());
    let outputs_ok = assets_with_role(contract, Role::Output)
        .filter(|a| a.required)
        .all(|a| a.status == AssetStatus::Ok);
    if !blocked && outputs_ok {
        RunStatus::Complete
    } else {
        RunStatus::Incomplete
    }
}

/// Inputs to a verification block that do not come from the contract itself
#[derive(Debug, Clone)]
pub struct VerificationParams {
    pub finished_at: DateTime<Utc>,
    pub scope: ContractScope,
    pub folder: Option<String>,
    pub reported_status: Option<PipelineOutcome>,
    pub audit_corruption: bool,
    /// Assets checked by this finalize
    pub audited: HashSet<AssetKey>,
    pub unexpected_outputs: Vec<String>,
    pub folder_uploads: Vec<FolderUpload>,
    pub extra: Value,
}

/// Build the `verification` block.
///
/// Required-failure id lists cover only the audited assets, so inputs that
/// kept their preflight status do not re-trigger strict mode.
pub fn verification_report(contract: &Contract, params: VerificationParams) -> VerificationReport {
    let audited: Vec<&Asset> = contract
        .assets()
        .filter(|(task_id, a)| params.audited.contains(&asset_key(task_id, a)))
        .map(|(_, a)| a)
        .collect();
    let required_ids = |status: AssetStatus| -> Vec<String> {
        audited
            .iter()
            .filter(|a| a.required && a.status == status)
            .map(|a| a.asset_id.clone())
            .collect()
    };
    let all = || contract.assets().map(|(_, a)| a);

    VerificationReport {
        finished_at: params.finished_at,
        scope: params.scope,
        folder: params.folder,
        reported_status: params.reported_status,
        audit_corruption: params.audit_corruption,
        audited_assets: audited.len(),
        required_assets_count: all().filter(|a| a.required).count(),
        expected_assets_count: all().filter(|a| a.expected).count(),
        produced_assets_count: all().filter(|a| a.produced).count(),
        input_counts: role_counts(assets_with_role(contract, Role::Input)),
        output_counts: role_counts(assets_with_role(contract, Role::Output)),
        asset_status_counts: status_counts(all()),
        input_asset_status_counts: status_counts(assets_with_role(contract, Role::Input)),
        output_asset_status_counts: status_counts(assets_with_role(contract, Role::Output)),
        task_state_counts: task_state_counts(contract),
        missing_required_asset_ids: required_ids(AssetStatus::Missing),
        corrupt_required_asset_ids: required_ids(AssetStatus::Corrupt),
        unverified_required_asset_ids: required_ids(AssetStatus::Unverified),
        unexpected_outputs_count: params.unexpected_outputs.len(),
        unexpected_outputs: params.unexpected_outputs,
        folder_uploads: params.folder_uploads,
        extra: params.extra,
    }
}

/// Scanned files no declared asset accounts for.
///
/// A file is accounted for when it is a declared location, lies under a
/// declared directory, matches a declared glob, or was recorded as a match.
pub fn unexpected_outputs(contract: &Contract, found: &[String]) -> Vec<String> {
    let mut exact: HashSet<String> = HashSet::new();
    let mut patterns: Vec<glob::Pattern> = Vec::new();
    for (_, asset) in contract.assets() {
        exact.extend(asset.matched.iter().cloned());
        match locator::resolve(&asset.location) {
            CheckTarget::LocalGlob(p) | CheckTarget::RemoteGlob(p) => {
                if let Ok(pattern) = glob::Pattern::new(&p) {
                    patterns.push(pattern);
                }
            }
            target => {
                exact.insert(target.display());
            }
        }
    }

    let separator_aware = glob::MatchOptions {
        require_literal_separator: true,
        ..glob::MatchOptions::new()
    };
    found
        .iter()
        .filter(|f| {
            !exact.contains(f.as_str())
                && !exact.iter().any(|e| f.starts_with(&format!("{}/", e)))
                && !patterns.iter().any(|p| p.matches_with(f, separator_aware))
        })
        .cloned()
        .collect()
}
