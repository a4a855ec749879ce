//! Folder grouping and contract publishing.
//!
//! `run` scope writes the full contract once at the output root. `folder`
//! scope partitions assets by [`locator::folder_of`] and writes one filtered
//! contract beside each folder's data. A failed publish is recorded and
//! never undoes the local write.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use tracing::{debug, info, warn};

use crate::aggregate::{self, asset_key, AssetKey, VerificationParams};
use crate::checker::CONTRACT_FILE_NAME;
use crate::error::{ContractError, Result};
use crate::locator::{self, GCS_SCHEME};
use crate::model::{Contract, FolderUpload};
use crate::remote::ObjectStore;
use crate::store::{to_document, write_atomic};
use crate::types::ContractScope;

/// Assets grouped by folder, folders in order of first appearance
pub fn group_by_folder(contract: &Contract) -> IndexMap<String, Vec<AssetKey>> {
    let mut groups: IndexMap<String, Vec<AssetKey>> = IndexMap::new();
    for (task_id, asset) in contract.assets() {
        groups
            .entry(locator::folder_of(&asset.location))
            .or_default()
            .push(asset_key(task_id, asset));
    }
    groups
}

/// The subset of `contract` stored in one folder.
///
/// Only tasks owning one of `keys` are kept, each with just those assets.
/// The verification block is recomputed over the subset.
pub fn folder_contract(
    contract: &Contract,
    folder: &str,
    keys: &[AssetKey],
    audited: &HashSet<AssetKey>,
) -> Contract {
    let wanted: HashSet<&AssetKey> = keys.iter().collect();
    let mut subset = contract.clone();
    subset.tasks.retain(|task_id, task| {
        task.assets
            .retain(|a| wanted.contains(&(task_id.clone(), a.asset_id.clone())));
        !task.assets.is_empty()
    });

    if let Some(full) = &contract.verification {
        let folder_prefix = format!("{}/", folder);
        subset.verification = Some(aggregate::verification_report(
            &subset,
            VerificationParams {
                finished_at: full.finished_at,
                scope: ContractScope::Folder,
                folder: Some(folder.to_string()),
                reported_status: full.reported_status,
                audit_corruption: full.audit_corruption,
                audited: keys.iter().filter(|k| audited.contains(*k)).cloned().collect(),
                unexpected_outputs: full
                    .unexpected_outputs
                    .iter()
                    .filter(|f| f.starts_with(&folder_prefix))
                    .cloned()
                    .collect(),
                folder_uploads: Vec::new(),
                extra: full.extra.clone(),
            },
        ));
    }
    subset
}

fn is_same_local_file(a: &Path, b: &Path) -> bool {
    locator::normalize_local_path(&a.to_string_lossy())
        == locator::normalize_local_path(&b.to_string_lossy())
}

/// Writes contract documents to local or `gs://` destinations
pub struct Publisher<'a> {
    store: &'a dyn ObjectStore,
    local_contract: PathBuf,
}

impl<'a> Publisher<'a> {
    /// `local_contract` is the full contract; it is never overwritten
    pub fn new(store: &'a dyn ObjectStore, local_contract: impl Into<PathBuf>) -> Self {
        Self {
            store,
            local_contract: local_contract.into(),
        }
    }

    /// Publish for the given scope.
    ///
    /// `audited` names the assets checked by the finalize being published.
    /// Returns one entry per document; nothing is published without an
    /// `output_location`.
    pub fn publish(
        &self,
        contract: &Contract,
        scope: ContractScope,
        audited: &HashSet<AssetKey>,
    ) -> Vec<FolderUpload> {
        let Some(output_location) = contract
            .output_location
            .as_deref()
            .filter(|s| !s.trim().is_empty())
        else {
            debug!("No output_location, skipping publish");
            return Vec::new();
        };

        match scope {
            ContractScope::Run => {
                let folder = normalize_folder(output_location);
                let dest = locator::contract_dest(&folder, CONTRACT_FILE_NAME);
                let required = contract.assets().filter(|(_, a)| a.required).count();
                vec![self.publish_one(contract, folder, dest, contract.asset_count(), required, 0)]
            }
            ContractScope::Folder => group_by_folder(contract)
                .into_iter()
                .enumerate()
                .map(|(index, (folder, keys))| {
                    let subset = folder_contract(contract, &folder, &keys, audited);
                    let dest = locator::contract_dest(&folder, CONTRACT_FILE_NAME);
                    let required = subset.assets().filter(|(_, a)| a.required).count();
                    self.publish_one(&subset, folder, dest, keys.len(), required, index)
                })
                .collect(),
        }
    }

    fn publish_one(
        &self,
        document: &Contract,
        folder: String,
        dest: String,
        asset_count: usize,
        required_asset_count: usize,
        index: usize,
    ) -> FolderUpload {
        let outcome = to_document(document).and_then(|bytes| self.write_to(&dest, &bytes, index));
        match &outcome {
            Ok(()) => info!("Published contract for {} to {}", folder, dest),
            Err(e) => warn!("Publishing contract for {} failed: {}", folder, e),
        }
        FolderUpload {
            folder,
            dest,
            asset_count,
            required_asset_count,
            success: outcome.is_ok(),
            error: outcome.err().map(|e| e.to_string()),
        }
    }

    fn write_to(&self, dest: &str, bytes: &[u8], index: usize) -> Result<()> {
        if dest.starts_with(GCS_SCHEME) {
            let staging = self.staging_path(index);
            write_atomic(&staging, bytes)?;
            let uploaded = self.store.upload(&staging, dest);
            if let Err(e) = fs::remove_file(&staging) {
                debug!("Could not remove {}: {}", staging.display(), e);
            }
            return uploaded;
        }

        let path = locator::normalize_local_path(dest);
        if is_same_local_file(&path, &self.local_contract) {
            // The full contract already lists every asset of this folder
            info!("{} is the full local contract, leaving it in place", dest);
            return Ok(());
        }
        write_atomic(&path, bytes).map_err(|e| ContractError::upload(dest, e.to_string()))
    }

    fn staging_path(&self, index: usize) -> PathBuf {
        let dir = self
            .local_contract
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(std::env::temp_dir);
        dir.join(format!(
            "{}.publish.{}.{}.tmp",
            CONTRACT_FILE_NAME,
            std::process::id(),
            index
        ))
    }

    /// Copy the full local contract to `<dir>/_run_contract.json`
    pub fn upload_full(&self, dir: &str) -> Result<String> {
        let dest = locator::contract_dest(&normalize_folder(dir), CONTRACT_FILE_NAME);
        let bytes = fs::read(&self.local_contract)?;
        self.write_to(&dest, &bytes, usize::MAX)?;
        Ok(dest)
    }
}

fn normalize_folder(location: &str) -> String {
    if location.trim().starts_with(GCS_SCHEME) {
        locator::normalize_gs_uri(location)
    } else {
        locator::normalize_local_path(location).display().to_string()
    }
}
