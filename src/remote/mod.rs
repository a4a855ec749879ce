//! Object storage access.
//!
//! The checker and publisher only see the [`ObjectStore`] trait. Production
//! runs shell out to `gsutil` ([`GsutilStore`]); tests and air-gapped runs
//! serve `gs://` from a local directory tree ([`MirrorStore`]).

pub mod gsutil;
pub mod mirror;

use std::path::Path;

use crate::config::EngineSettings;
use crate::error::Result;

pub use gsutil::GsutilStore;
pub use mirror::MirrorStore;

/// Metadata for one stored object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Normalized `gs://bucket/key`
    pub uri: String,
    /// Content length, when the store reported one
    pub size: Option<u64>,
}

/// Minimal object store surface used by the engine.
///
/// Implementations make a single attempt per call; retries belong to the
/// caller. Transient failures are `ContractError::TransientIo`, a store that
/// cannot be used at all is `ContractError::StoreUnavailable`.
pub trait ObjectStore: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Metadata for `uri`, or `None` when no such object exists
    fn stat(&self, uri: &str) -> Result<Option<ObjectMeta>>;

    /// Objects matching a wildcard pattern, sorted by uri. Folder
    /// placeholders are never returned. No match is an empty list.
    fn list(&self, pattern: &str) -> Result<Vec<ObjectMeta>>;

    /// Full contents of an object
    fn read(&self, uri: &str) -> Result<Vec<u8>>;

    /// Copy a local file to `dest`
    fn upload(&self, local: &Path, dest: &str) -> Result<()>;
}

/// The store selected by the engine settings
pub fn store_from_settings(settings: &EngineSettings) -> Box<dyn ObjectStore> {
    match &settings.gcs_mirror {
        Some(root) => {
            tracing::info!("Serving gs:// from mirror {}", root.display());
            Box::new(MirrorStore::new(root.clone()))
        }
        None => Box::new(GsutilStore::new(settings.gsutil.clone(), settings.remote_timeout)),
    }
}
