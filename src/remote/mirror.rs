//! Filesystem-backed stand-in for object storage.
//!
//! `gs://bucket/key` lives at `<root>/bucket/key`.

use std::fs;
use std::path::{Path, PathBuf};

use super::{ObjectMeta, ObjectStore};
use crate::error::{ContractError, Result};
use crate::locator::{normalize_gs_uri, split_gs_uri, GCS_SCHEME};

#[derive(Debug, Clone)]
pub struct MirrorStore {
    root: PathBuf,
}

impl MirrorStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Local path backing a `gs://` uri
    pub fn local_path(&self, uri: &str) -> Result<PathBuf> {
        let normalized = normalize_gs_uri(uri);
        let (bucket, key) = split_gs_uri(&normalized)
            .ok_or_else(|| ContractError::config(format!("not a gs:// uri: {}", uri)))?;
        let mut path = self.root.join(bucket);
        if !key.is_empty() {
            path.push(key);
        }
        Ok(path)
    }

    fn to_uri(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let rel = rel.to_string_lossy();
        Some(normalize_gs_uri(&format!("{}{}", GCS_SCHEME, rel)))
    }
}

fn io_error(what: &str, target: &Path, err: std::io::Error) -> ContractError {
    ContractError::transient(format!("{} {}: {}", what, target.display(), err))
}

impl ObjectStore for MirrorStore {
    fn name(&self) -> &'static str {
        "mirror"
    }

    fn stat(&self, uri: &str) -> Result<Option<ObjectMeta>> {
        let path = self.local_path(uri)?;
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => Ok(Some(ObjectMeta {
                uri: normalize_gs_uri(uri),
                size: Some(meta.len()),
            })),
            // A prefix is not an object
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error("stat", &path, e)),
        }
    }

    fn list(&self, pattern: &str) -> Result<Vec<ObjectMeta>> {
        let local_pattern = self.local_path(pattern)?;
        let local_pattern = local_pattern.to_string_lossy();
        let paths = glob::glob(&local_pattern)
            .map_err(|e| ContractError::config(format!("invalid pattern {}: {}", pattern, e)))?;

        let mut objects = Vec::new();
        for entry in paths {
            let path = match entry {
                Ok(path) => path,
                Err(e) => return Err(ContractError::transient(e.to_string())),
            };
            let Ok(meta) = fs::metadata(&path) else { continue };
            if !meta.is_file() {
                continue;
            }
            if let Some(uri) = self.to_uri(&path) {
                objects.push(ObjectMeta {
                    uri,
                    size: Some(meta.len()),
                });
            }
        }
        objects.sort_by(|a, b| a.uri.cmp(&b.uri));
        Ok(objects)
    }

    fn read(&self, uri: &str) -> Result<Vec<u8>> {
        let path = self.local_path(uri)?;
        fs::read(&path).map_err(|e| io_error("read", &path, e))
    }

    fn upload(&self, local: &Path, dest: &str) -> Result<()> {
        let target = self
            .local_path(dest)
            .map_err(|e| ContractError::upload(dest, e.to_string()))?;
        let upload_err = |e: std::io::Error| ContractError::upload(dest, e.to_string());

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(upload_err)?;
        }
        let tmp = target.with_extension("upload.tmp");
        fs::copy(local, &tmp).map_err(upload_err)?;
        fs::rename(&tmp, &target).map_err(upload_err)?;
        Ok(())
    }
}
