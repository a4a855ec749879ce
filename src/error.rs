//! Error handling for the run-contract engine
//!
//! Provides centralized error handling with proper error types using thiserror.
//! Only structural failures travel as errors; per-asset problems are folded
//! into asset status values by the checker and never reach this type.

use thiserror::Error;

/// Exit code for a successful invocation.
pub const EXIT_OK: i32 = 0;
/// Exit code for structural failures (bad spec, unknown task, lock denial).
pub const EXIT_ERROR: i32 = 1;
/// Exit code for a strict-mode verification failure.
pub const EXIT_STRICT: i32 = 2;

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum ContractError {
    /// Bad or missing spec, unknown job/task, malformed contract document
    #[error("Configuration error: {0}")]
    Config(String),

    /// Asset declares zero or several location fields
    #[error("Unresolvable location for asset '{asset_id}': {reason}")]
    LocationUnresolvable { asset_id: String, reason: String },

    /// Network or store hiccup; retried by the checker, then downgraded
    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    /// The object store cannot be used at all (CLI missing, access denied)
    #[error("Object store unavailable: {0}")]
    StoreUnavailable(String),

    /// Another writer holds the contract lock past the bounded wait
    #[error("Contract is locked by another writer: {path} (waited {waited_ms} ms)")]
    LockContention { path: String, waited_ms: u64 },

    /// Publishing a contract document failed
    #[error("Upload failed for {dest}: {reason}")]
    UploadFailure { dest: String, reason: String },

    /// Task lifecycle rejected the requested transition
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// IO errors (contract file, lock file, local assets)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, ContractError>;

// Convenient error constructors
impl ContractError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a location error for a specific asset
    pub fn location(asset_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::LocationUnresolvable {
            asset_id: asset_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a transient I/O error
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientIo(msg.into())
    }

    /// Create a store-unavailable error
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::StoreUnavailable(msg.into())
    }

    /// Create an upload error
    pub fn upload(dest: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UploadFailure {
            dest: dest.into(),
            reason: reason.into(),
        }
    }

    /// Whether a retry of the same operation could plausibly succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientIo(_))
    }

    /// Process exit code that calling shell scripts branch on.
    ///
    /// Every error that aborts a subcommand is structural, so this is always
    /// [`EXIT_ERROR`]; strict-mode failures are reported through outcomes,
    /// not errors.
    pub fn exit_code(&self) -> i32 {
        EXIT_ERROR
    }
}
