//! Asset location normalization.
//!
//! Maps a declared [`AssetLocation`] onto something the checker can act on
//! and onto the folder the asset is published under.

use std::path::{Component, Path, PathBuf};

use crate::model::AssetLocation;

pub const GCS_SCHEME: &str = "gs://";
const FILE_SCHEME: &str = "file://";

/// Characters that turn a path segment into a pattern
pub fn has_wildcard(segment: &str) -> bool {
    segment.contains(['*', '?', '[', ']'])
}

/// Expand `~`, make absolute, and fold `.`/`..` without touching the disk
pub fn normalize_local_path(raw: &str) -> PathBuf {
    let raw = raw.trim();
    let expanded = match raw.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(rest.trim_start_matches('/')),
            None => PathBuf::from(raw),
        },
        _ => PathBuf::from(raw),
    };

    let absolute = if expanded.is_absolute() {
        expanded
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(&expanded))
            .unwrap_or(expanded)
    };

    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Collapse duplicate slashes and drop the trailing one
pub fn normalize_gs_uri(raw: &str) -> String {
    let value = raw.trim();
    let Some(rest) = value.strip_prefix(GCS_SCHEME) else {
        return value.to_string();
    };
    let parts: Vec<&str> = rest.split('/').filter(|p| !p.is_empty()).collect();
    format!("{}{}", GCS_SCHEME, parts.join("/"))
}

/// Split `gs://bucket/key` into its bucket and key
pub fn split_gs_uri(uri: &str) -> Option<(&str, &str)> {
    let rest = uri.strip_prefix(GCS_SCHEME)?;
    let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
    if bucket.is_empty() {
        return None;
    }
    Some((bucket, key))
}

/// What the checker should look at
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckTarget {
    LocalFile(PathBuf),
    RemoteObject(String),
    LocalGlob(String),
    RemoteGlob(String),
    /// A `scheme://` URI the engine cannot check
    Unsupported { uri: String, scheme: String },
}

impl CheckTarget {
    /// Canonical string form, as compared against scan results
    pub fn display(&self) -> String {
        match self {
            Self::LocalFile(p) => p.display().to_string(),
            Self::RemoteObject(s) | Self::LocalGlob(s) | Self::RemoteGlob(s) => s.clone(),
            Self::Unsupported { uri, .. } => uri.clone(),
        }
    }
}

/// Normalize a declared location into a check target
pub fn resolve(location: &AssetLocation) -> CheckTarget {
    match location {
        AssetLocation::LocalPath(p) => CheckTarget::LocalFile(normalize_local_path(p)),
        AssetLocation::Uri(u) => resolve_uri(u),
        AssetLocation::LocalGlob(g) => {
            CheckTarget::LocalGlob(normalize_local_path(g).display().to_string())
        }
        AssetLocation::GcsGlob(g) => CheckTarget::RemoteGlob(normalize_gs_uri(g)),
    }
}

fn resolve_uri(uri: &str) -> CheckTarget {
    let uri = uri.trim();
    if uri.starts_with(GCS_SCHEME) {
        return CheckTarget::RemoteObject(normalize_gs_uri(uri));
    }
    if let Some(path) = uri.strip_prefix(FILE_SCHEME) {
        return CheckTarget::LocalFile(normalize_local_path(path));
    }
    match uri.split_once("://") {
        Some((scheme, _)) => CheckTarget::Unsupported {
            uri: uri.to_string(),
            scheme: scheme.to_string(),
        },
        None => CheckTarget::LocalFile(normalize_local_path(uri)),
    }
}

/// Folder an asset is grouped under for publishing.
///
/// Objects and files belong to their parent; globs to the segments before
/// the first wildcard segment.
pub fn folder_of(location: &AssetLocation) -> String {
    match resolve(location) {
        CheckTarget::LocalFile(path) => path
            .parent()
            .unwrap_or(Path::new("/"))
            .display()
            .to_string(),
        CheckTarget::RemoteObject(uri) => remote_parent(&uri),
        CheckTarget::Unsupported { uri, .. } => {
            uri.rsplit_once('/').map_or(uri.clone(), |(parent, _)| parent.to_string())
        }
        CheckTarget::LocalGlob(pattern) => {
            let prefix = static_prefix(&pattern);
            if prefix.is_empty() { "/".to_string() } else { prefix }
        }
        CheckTarget::RemoteGlob(pattern) => {
            let prefix = static_prefix(&pattern);
            if prefix.len() > GCS_SCHEME.len() {
                prefix
            } else {
                pattern
            }
        }
    }
}

fn remote_parent(uri: &str) -> String {
    match uri.rfind('/') {
        Some(idx) if idx >= GCS_SCHEME.len() => uri[..idx].to_string(),
        _ => uri.to_string(),
    }
}

/// Path segments before the first wildcard segment, without a trailing slash
pub fn static_prefix(pattern: &str) -> String {
    let mut kept = Vec::new();
    for segment in pattern.split('/') {
        if has_wildcard(segment) {
            break;
        }
        kept.push(segment);
    }
    kept.join("/").trim_end_matches('/').to_string()
}

/// Where a folder's contract document is written
pub fn contract_dest(folder: &str, file_name: &str) -> String {
    format!("{}/{}", folder.trim_end_matches('/'), file_name)
}
