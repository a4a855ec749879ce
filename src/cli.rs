use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::lifecycle::{
    CloudRunEnvRequest, FinalizeRequest, InitRequest, MarkTaskRequest, PreflightRequest,
    RecordProducedRequest,
};
use crate::runtime::JOB_ID_ENV;
use crate::task_state::TaskState;
use crate::types::{parse_bool, ContractScope, EnvFormat, PipelineOutcome};

/// run-contract - durable expected-vs-actual audit of pipeline runs
#[derive(Parser)]
#[command(name = "run-contract")]
#[command(about = "Record what a pipeline run expects, then audit what it actually produced")]
#[command(version)]
pub struct Cli {
    /// Log at debug level (RUST_LOG still takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a run contract from a job spec
    Init(InitArgs),
    /// Check that every input asset exists before processing
    Preflight(PreflightArgs),
    /// Register or update an asset a task produced
    RecordProduced(RecordProducedArgs),
    /// Mark a task as running
    MarkTaskRunning(MarkTaskArgs),
    /// Mark a task as succeeded
    MarkTaskSucceeded(MarkTaskArgs),
    /// Mark a task as failed
    MarkTaskFailed(MarkTaskArgs),
    /// Audit outputs, set the final run status and publish contracts
    Finalize(FinalizeArgs),
    /// Print environment wiring for a Cloud Run job
    CloudRunEnv(CloudRunEnvArgs),
}

fn parse_flag(raw: &str) -> Result<bool, String> {
    parse_bool(raw).ok_or_else(|| format!("expected true/false/yes/no/1/0/on/off, got '{}'", raw))
}

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Job identifier
    #[arg(long, env = JOB_ID_ENV)]
    pub job_id: Option<String>,
    /// Run identifier (default: RUN_CONTRACT_RUN_ID/SDM_RUN_ID/BUILD_ID/CLOUD_RUN_EXECUTION/timestamp)
    #[arg(long)]
    pub run_id: Option<String>,
    /// Path to _run_contract.json (default: <run-dir>/_run_contract.json)
    #[arg(long)]
    pub contract_file: Option<PathBuf>,
    /// Run directory (default: run_contracts/<job>/<run_id>)
    #[arg(long)]
    pub run_dir: Option<PathBuf>,
    /// Human-readable pipeline title
    #[arg(long)]
    pub pipeline_title: Option<String>,
    /// Primary output root (local directory or gs://)
    #[arg(long)]
    pub output_location: Option<String>,
    /// JSON job expectations file
    #[arg(long)]
    pub spec_file: Option<PathBuf>,
    /// Single JSON file with config, inputs, expected_assets, expected_inputs, run_metadata
    #[arg(long)]
    pub init_json_file: Option<PathBuf>,
    /// JSON array of expected output assets
    #[arg(long)]
    pub expected_assets_file: Option<PathBuf>,
    /// JSON array of expected input assets
    #[arg(long)]
    pub expected_inputs_file: Option<PathBuf>,
    /// JSON object stored as the run configuration
    #[arg(long)]
    pub config_json_file: Option<PathBuf>,
    /// JSON object stored as the run input data
    #[arg(long)]
    pub inputs_json_file: Option<PathBuf>,
    /// JSON object stored as run metadata
    #[arg(long)]
    pub run_metadata_json_file: Option<PathBuf>,
    /// JSON object of template variables
    #[arg(long)]
    pub vars_file: Option<PathBuf>,
    /// Template variable KEY=VALUE (repeatable)
    #[arg(long = "var")]
    pub vars: Vec<String>,
    /// Also copy the contract to this directory (gs:// or local)
    #[arg(long)]
    pub upload_gcs_dir: Option<String>,
}

impl From<InitArgs> for InitRequest {
    fn from(args: InitArgs) -> Self {
        Self {
            job_id: args.job_id,
            run_id: args.run_id,
            contract_file: args.contract_file,
            run_dir: args.run_dir,
            pipeline_title: args.pipeline_title,
            output_location: args.output_location,
            spec_file: args.spec_file,
            init_json_file: args.init_json_file,
            expected_assets_file: args.expected_assets_file,
            expected_inputs_file: args.expected_inputs_file,
            config_json_file: args.config_json_file,
            inputs_json_file: args.inputs_json_file,
            run_metadata_json_file: args.run_metadata_json_file,
            vars_file: args.vars_file,
            vars: args.vars,
            upload_gcs_dir: args.upload_gcs_dir,
        }
    }
}

#[derive(Args, Debug)]
pub struct PreflightArgs {
    #[arg(long)]
    pub contract_file: PathBuf,
    /// Exit 2 if any required input is not OK
    #[arg(long)]
    pub strict: bool,
    /// Also copy the contract to this directory (gs:// or local)
    #[arg(long)]
    pub upload_gcs_dir: Option<String>,
}

impl From<PreflightArgs> for PreflightRequest {
    fn from(args: PreflightArgs) -> Self {
        Self {
            contract_file: args.contract_file,
            strict: args.strict,
            upload_gcs_dir: args.upload_gcs_dir,
        }
    }
}

#[derive(Args, Debug)]
pub struct RecordProducedArgs {
    #[arg(long)]
    pub contract_file: PathBuf,
    #[arg(long)]
    pub task_id: String,
    /// Asset id (default: <task>/produced/<hash of location>)
    #[arg(long)]
    pub asset_id: Option<String>,
    /// Asset kind (default: output)
    #[arg(long)]
    pub kind: Option<String>,
    /// true|false (default: keep existing, or true for a new asset)
    #[arg(long, value_parser = parse_flag)]
    pub required: Option<bool>,
    /// Local file path
    #[arg(long)]
    pub local_path: Option<String>,
    /// gs:// or file:// URI
    #[arg(long)]
    pub uri: Option<String>,
    /// Local glob pattern
    #[arg(long)]
    pub local_glob: Option<String>,
    /// gs:// glob pattern
    #[arg(long)]
    pub gcs_glob: Option<String>,
    /// JSON object merged into the asset's extra
    #[arg(long)]
    pub extra_json_file: Option<PathBuf>,
}

impl From<RecordProducedArgs> for RecordProducedRequest {
    fn from(args: RecordProducedArgs) -> Self {
        Self {
            contract_file: args.contract_file,
            task_id: args.task_id,
            asset_id: args.asset_id,
            kind: args.kind,
            required: args.required,
            local_path: args.local_path,
            uri: args.uri,
            local_glob: args.local_glob,
            gcs_glob: args.gcs_glob,
            extra_json_file: args.extra_json_file,
        }
    }
}

#[derive(Args, Debug)]
pub struct MarkTaskArgs {
    #[arg(long)]
    pub contract_file: PathBuf,
    #[arg(long)]
    pub task_id: String,
    /// JSON object recorded as the task error
    #[arg(long)]
    pub error_json_file: Option<PathBuf>,
}

impl MarkTaskArgs {
    pub fn into_request(self, target: TaskState) -> MarkTaskRequest {
        MarkTaskRequest {
            contract_file: self.contract_file,
            task_id: self.task_id,
            target,
            error_json_file: self.error_json_file,
        }
    }
}

#[derive(Args, Debug)]
pub struct FinalizeArgs {
    #[arg(long)]
    pub contract_file: PathBuf,
    /// Outcome reported by the pipeline; FAILED forces a FAILED run
    #[arg(long, value_enum, ignore_case = true)]
    pub status: Option<PipelineOutcome>,
    /// 'folder' writes one contract per asset folder, 'run' one at the output root
    #[arg(long, value_enum, default_value_t = ContractScope::Folder)]
    pub contract_scope: ContractScope,
    /// Directory to scan for unexpected outputs (repeatable)
    #[arg(long = "scan-local-dir")]
    pub scan_local_dirs: Vec<PathBuf>,
    /// gs:// prefix to scan for unexpected outputs (repeatable)
    #[arg(long = "scan-gcs-prefix")]
    pub scan_gcs_prefixes: Vec<String>,
    /// Exit 2 if a required audited asset is unresolved or its folder failed to publish
    #[arg(long)]
    pub strict: bool,
    /// Override the run's output location
    #[arg(long)]
    pub output_location: Option<String>,
    /// JSON object stored under verification.extra
    #[arg(long)]
    pub verification_json_file: Option<PathBuf>,
    /// true|false; false keeps existence checks only
    #[arg(long, value_parser = parse_flag, action = clap::ArgAction::Set, default_value = "true")]
    pub audit_corruption: bool,
}

impl From<FinalizeArgs> for FinalizeRequest {
    fn from(args: FinalizeArgs) -> Self {
        Self {
            contract_file: args.contract_file,
            status: args.status,
            scope: args.contract_scope,
            scan_local_dirs: args.scan_local_dirs,
            scan_gcs_prefixes: args.scan_gcs_prefixes,
            strict: args.strict,
            output_location: args.output_location,
            verification_json_file: args.verification_json_file,
            audit_corruption: args.audit_corruption,
        }
    }
}

#[derive(Args, Debug)]
pub struct CloudRunEnvArgs {
    /// Job identifier
    #[arg(long, env = JOB_ID_ENV)]
    pub job_id: Option<String>,
    /// Spec JSON path; the job must exist in it
    #[arg(long)]
    pub spec_file: Option<PathBuf>,
    /// Run contract base dir inside the container
    #[arg(long)]
    pub run_dir: Option<String>,
    /// Contract JSON path inside the container
    #[arg(long)]
    pub contract_file: Option<String>,
    /// gs:// path for contract uploads
    #[arg(long)]
    pub gcs_run_dir: Option<String>,
    #[arg(long, value_enum, default_value_t = EnvFormat::Dotenv)]
    pub format: EnvFormat,
    /// Write to this file instead of stdout
    #[arg(long)]
    pub output_file: Option<PathBuf>,
}

impl From<CloudRunEnvArgs> for CloudRunEnvRequest {
    fn from(args: CloudRunEnvArgs) -> Self {
        Self {
            job_id: args.job_id,
            spec_file: args.spec_file,
            run_dir: args.run_dir,
            contract_file: args.contract_file,
            gcs_run_dir: args.gcs_run_dir,
            format: args.format,
            output_file: args.output_file,
        }
    }
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}
