//! run-contract library
//!
//! A durable, crash-safe record of what a data pipeline run expects to
//! consume and produce, reconciled against what actually exists.

pub mod aggregate;
pub mod checker;
pub mod cli;
pub mod config;
pub mod error;
pub mod integrity;
pub mod lifecycle;
pub mod locator;
pub mod lock;
pub mod model;
pub mod process_guard;
pub mod publish;
pub mod remote;
pub mod retry;
pub mod runner;
pub mod runtime;
pub mod spec;
pub mod store;
pub mod task_state;
pub mod template;
pub mod types;

// Re-export main types for convenience
pub use config::EngineSettings;
pub use error::{ContractError, Result};
pub use lifecycle::{
    CloudRunEnvRequest, CommandReport, Engine, FinalizeRequest, InitRequest, MarkTaskRequest,
    PreflightRequest, RecordProducedRequest,
};
pub use model::{Asset, AssetLocation, Contract, Task};
pub use remote::{GsutilStore, MirrorStore, ObjectStore};
pub use store::ContractStore;
pub use task_state::{TaskState, TaskTransitionError};
pub use types::{AssetStatus, ContractScope, EnvFormat, PipelineOutcome, Role, RunStatus};
