//! End-to-end lifecycle tests
//!
//! Every test drives the engine the way the CLI does: init, preflight,
//! record-produced, mark-task, finalize. Object storage is served from a
//! filesystem mirror and the process environment is replaced by an empty
//! lookup so runs are reproducible.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;

use run_contract::checker::CONTRACT_FILE_NAME;
use run_contract::lifecycle::{
    CloudRunEnvRequest, CommandReport, Engine, FinalizeRequest, InitRequest, MarkTaskRequest,
    PreflightRequest, RecordProducedRequest,
};
use run_contract::locator;
use run_contract::publish::group_by_folder;
use run_contract::{
    AssetStatus, Contract, ContractError, ContractScope, ContractStore, EngineSettings, EnvFormat,
    MirrorStore, PipelineOutcome, Role, RunStatus, TaskState,
};

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    dir: TempDir,
    settings: EngineSettings,
    mirror: MirrorStore,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let mirror = MirrorStore::new(dir.path().join("mirror"));
        let settings = EngineSettings {
            check_workers: 4,
            check_retries: 0,
            retry_base: Duration::from_millis(1),
            ..EngineSettings::default()
        };
        Self {
            dir,
            settings,
            mirror,
        }
    }

    fn engine(&self) -> Engine<'_> {
        Engine::new(&self.settings, &self.mirror).with_env(|_: &str| None)
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    fn write_json(&self, rel: &str, value: &Value) -> PathBuf {
        let path = self.path(rel);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(&path, serde_json::to_vec_pretty(value).expect("json")).expect("write");
        path
    }

    fn put_object(&self, uri: &str, bytes: &[u8]) {
        let path = self.mirror.local_path(uri).expect("gs uri");
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, bytes).expect("write object");
    }

    fn put_file(&self, rel: &str, bytes: &[u8]) -> PathBuf {
        let path = self.path(rel);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(&path, bytes).expect("write file");
        path
    }

    fn init(&self, job_id: Option<&str>, spec: Option<PathBuf>) -> PathBuf {
        let req = InitRequest {
            job_id: job_id.map(str::to_string),
            run_id: Some("r1".to_string()),
            run_dir: Some(self.path("run")),
            spec_file: spec,
            ..InitRequest::default()
        };
        let outcome = self.engine().init(&req).expect("init");
        outcome.contract_file
    }

    fn load(&self, contract_file: &Path) -> Contract {
        ContractStore::new(contract_file, self.settings.lock_timeout)
            .load()
            .expect("load contract")
    }
}

fn last_line(report: &dyn CommandReport) -> String {
    report.lines().last().cloned().unwrap_or_default()
}

fn produced(contract_file: &Path, task: &str, asset: &str, local_path: &Path) -> RecordProducedRequest {
    RecordProducedRequest {
        contract_file: contract_file.to_path_buf(),
        task_id: task.to_string(),
        asset_id: Some(asset.to_string()),
        local_path: Some(local_path.display().to_string()),
        ..RecordProducedRequest::default()
    }
}

fn mark(contract_file: &Path, task: &str, target: TaskState) -> MarkTaskRequest {
    MarkTaskRequest {
        contract_file: contract_file.to_path_buf(),
        task_id: task.to_string(),
        target,
        error_json_file: None,
    }
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn test_missing_input_then_produced_output() {
    let h = Harness::new();
    let spec = h.write_json(
        "spec.json",
        &json!({
            "jobs": {
                "train": {
                    "pipeline_title": "Training",
                    "tasks": [{
                        "task_id": "fit",
                        "expected_inputs": [{"asset_id": "features", "uri": "gs://b/features.pt"}],
                        "expected_assets": [{"asset_id": "model", "uri": "gs://b/model.pkl"}]
                    }]
                }
            }
        }),
    );
    let contract_file = h.init(Some("train"), Some(spec));
    assert_eq!(contract_file, h.path("run").join(CONTRACT_FILE_NAME));

    let contract = h.load(&contract_file);
    assert_eq!(contract.revision, 1);
    assert_eq!(contract.status, RunStatus::Started);
    assert_eq!(contract.pipeline_title, "Training");

    let preflight = h
        .engine()
        .preflight(&PreflightRequest {
            contract_file: contract_file.clone(),
            strict: true,
            upload_gcs_dir: None,
        })
        .expect("preflight");
    assert_eq!(preflight.exit_code(), 2);
    assert_eq!(preflight.report.counts.missing_required, 1);
    assert_eq!(preflight.report.missing_required, vec!["features".to_string()]);
    assert!(last_line(&preflight).contains("missing_required=1"));

    h.put_object("gs://b/model.pkl", &[7u8; 1024]);

    let mut req = FinalizeRequest::new(&contract_file);
    req.status = Some(PipelineOutcome::Complete);
    req.strict = true;
    let outcome = h.engine().finalize(&req).expect("finalize");
    assert_eq!(outcome.exit_code(), 0);

    let v = outcome.verification().expect("verification block");
    assert!(v.missing_required_asset_ids.is_empty());
    assert_eq!(v.output_asset_status_counts.get("OK"), Some(&1));
    assert!(outcome.lines().iter().any(|l| l == "output_assets={\"ok\":1}"));

    let stored = h.load(&contract_file);
    let model = stored.tasks["fit"].asset("model").expect("model asset");
    assert_eq!(model.status, AssetStatus::Ok);
    assert_eq!(model.size_bytes, Some(1024));
    assert!(stored.completed_at.is_some());
}

#[test]
fn test_finalize_right_after_init_reports_every_required_asset() {
    let h = Harness::new();
    let spec = h.write_json(
        "spec.json",
        &json!({
            "job_id": "untouched",
            "expected_inputs": [
                {"asset_id": "raw", "uri": "gs://b/in/raw.csv"},
                {"asset_id": "lookup", "uri": "gs://b/in/lookup.csv", "required": false}
            ],
            "expected_assets": [
                {"asset_id": "model", "uri": "gs://b/out/model.pkl"},
                {"asset_id": "report", "local_path": h.path("out/report.html").display().to_string()},
                {"asset_id": "tiles", "gcs_glob": "gs://b/out/tiles/*.tif"}
            ]
        }),
    );
    let contract_file = h.init(None, Some(spec));
    let required = h
        .load(&contract_file)
        .assets()
        .filter(|(_, a)| a.required)
        .count();
    assert_eq!(required, 4);

    let mut req = FinalizeRequest::new(&contract_file);
    req.strict = true;
    let outcome = h.engine().finalize(&req).expect("finalize");
    assert_eq!(outcome.contract.status, RunStatus::Incomplete);
    assert_eq!(outcome.exit_code(), 2);

    let v = outcome.verification().expect("verification block");
    assert_eq!(v.missing_required_asset_ids.len(), required);
    let mut missing = v.missing_required_asset_ids.clone();
    missing.sort();
    assert_eq!(missing, vec!["model", "raw", "report", "tiles"]);
    assert!(outcome
        .lines()
        .iter()
        .any(|l| l.starts_with(&format!("status=INCOMPLETE required_missing={} ", required))));
}

#[test]
fn test_glob_output_with_one_empty_match() {
    let h = Harness::new();
    let spec = h.write_json(
        "spec.json",
        &json!({
            "job_id": "tiles",
            "expected_assets": [{"asset_id": "tiles", "gcs_glob": "gs://b/out/*.tif"}]
        }),
    );
    let contract_file = h.init(None, Some(spec));
    h.put_object("gs://b/out/a.tif", b"0123456789");
    h.put_object("gs://b/out/b.tif", b"0123456789");
    h.put_object("gs://b/out/c.tif", b"");

    let mut req = FinalizeRequest::new(&contract_file);
    req.strict = true;
    let outcome = h.engine().finalize(&req).expect("finalize");
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(outcome.contract.status, RunStatus::Complete);

    let asset = outcome.contract.tasks["tiles"].asset("tiles").expect("tiles asset");
    assert_eq!(asset.status, AssetStatus::Ok);
    assert_eq!(asset.match_count, Some(3));
    assert_eq!(asset.size_bytes, Some(20));
    assert_eq!(asset.error_detail.as_deref(), Some("1 of 3 matches corrupt"));
}

#[test]
fn test_finalize_without_outputs_is_incomplete() {
    let h = Harness::new();
    let contract_file = h.init(Some("adhoc"), None);
    let engine = h.engine();

    let missing = h.path("data/out.csv");
    let recorded = engine
        .record_produced(&produced(&contract_file, "adhoc", "out", &missing))
        .expect("record-produced");
    assert!(recorded.created);
    assert_eq!(recorded.revision, 2);

    let contract = h.load(&contract_file);
    assert_eq!(contract.status, RunStatus::Running);
    assert_eq!(contract.tasks["adhoc"].state, TaskState::Running);

    let mut req = FinalizeRequest::new(&contract_file);
    req.strict = true;
    let outcome = engine.finalize(&req).expect("finalize");
    assert_eq!(outcome.contract.status, RunStatus::Incomplete);
    assert_eq!(outcome.exit_code(), 2);
    let v = outcome.verification().expect("verification block");
    assert_eq!(v.missing_required_asset_ids, vec!["out".to_string()]);
    assert!(last_line(&outcome).contains("output_assets"));
    assert!(outcome
        .lines()
        .iter()
        .any(|l| l.starts_with("status=INCOMPLETE required_missing=1")));

    req.strict = false;
    assert_eq!(engine.finalize(&req).expect("finalize").exit_code(), 0);
}

#[test]
fn test_reported_failure_wins() {
    let h = Harness::new();
    let contract_file = h.init(Some("adhoc"), None);
    let file = h.put_file("data/out.csv", b"a,b\n1,2\n");
    h.engine()
        .record_produced(&produced(&contract_file, "adhoc", "out", &file))
        .expect("record-produced");

    let mut req = FinalizeRequest::new(&contract_file);
    req.status = Some(PipelineOutcome::Failed);
    let outcome = h.engine().finalize(&req).expect("finalize");
    assert_eq!(outcome.contract.status, RunStatus::Failed);
    assert_eq!(outcome.exit_code(), 0);
}

#[test]
fn test_strict_only_fails_on_required_assets() {
    let h = Harness::new();
    let contract_file = h.init(Some("adhoc"), None);
    let engine = h.engine();

    let present = h.put_file("data/present.csv", b"x\n");
    engine
        .record_produced(&produced(&contract_file, "adhoc", "present", &present))
        .expect("record present");
    let mut optional = produced(&contract_file, "adhoc", "optional", &h.path("data/absent.csv"));
    optional.required = Some(false);
    engine.record_produced(&optional).expect("record optional");

    let mut req = FinalizeRequest::new(&contract_file);
    req.strict = true;
    let outcome = engine.finalize(&req).expect("finalize");
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(outcome.contract.status, RunStatus::Complete);
    let v = outcome.verification().expect("verification block");
    assert_eq!(v.output_counts.missing_optional, 1);

    let empty = h.put_file("data/empty.csv", b"");
    engine
        .record_produced(&produced(&contract_file, "adhoc", "empty", &empty))
        .expect("record empty");
    let outcome = engine.finalize(&req).expect("finalize");
    assert_eq!(outcome.exit_code(), 2);
    let v = outcome.verification().expect("verification block");
    assert_eq!(v.corrupt_required_asset_ids, vec!["empty".to_string()]);
}

#[test]
fn test_preflight_is_idempotent() {
    let h = Harness::new();
    let present = h.put_file("inputs/a.parquet", b"PAR1....PAR1");
    let spec = h.write_json(
        "spec.json",
        &json!({
            "job_id": "etl",
            "expected_inputs": [
                {"asset_id": "a", "kind": "parquet", "local_path": present.display().to_string()},
                {"asset_id": "b", "required": false, "uri": "gs://b/missing.csv"}
            ]
        }),
    );
    let contract_file = h.init(None, Some(spec));
    let req = PreflightRequest {
        contract_file: contract_file.clone(),
        strict: true,
        upload_gcs_dir: None,
    };

    let first = h.engine().preflight(&req).expect("first preflight");
    let second = h.engine().preflight(&req).expect("second preflight");
    assert_eq!(first.exit_code(), 0);
    assert_eq!(first.report.counts, second.report.counts);
    assert_eq!(first.listing, second.listing);
    assert_eq!(second.report.counts.ok, 1);
    assert_eq!(second.report.counts.missing_optional, 1);
}

#[test]
fn test_record_produced_moves_asset() {
    let h = Harness::new();
    let contract_file = h.init(Some("adhoc"), None);
    let engine = h.engine();
    let first = h.put_file("data/v1.csv", b"1\n");
    engine
        .record_produced(&produced(&contract_file, "adhoc", "out", &first))
        .expect("record v1");
    engine
        .finalize(&FinalizeRequest::new(&contract_file))
        .expect("finalize");
    assert_eq!(
        h.load(&contract_file).tasks["adhoc"].asset("out").map(|a| a.status),
        Some(AssetStatus::Ok)
    );

    let moved = engine
        .record_produced(&produced(&contract_file, "adhoc", "out", &h.path("data/v2.csv")))
        .expect("record v2");
    assert!(!moved.created);

    let contract = h.load(&contract_file);
    let asset = contract.tasks["adhoc"].asset("out").expect("asset");
    assert_eq!(asset.status, AssetStatus::Pending);
    assert!(asset.size_bytes.is_none());
    assert_eq!(asset.role, Role::Output);
    assert_eq!(contract.tasks["adhoc"].assets.len(), 1);
}

#[test]
fn test_record_produced_default_id_and_unknown_task() {
    let h = Harness::new();
    let contract_file = h.init(Some("adhoc"), None);
    let req = RecordProducedRequest {
        contract_file: contract_file.clone(),
        task_id: "adhoc".to_string(),
        uri: Some("gs://b/run/model.pkl".to_string()),
        ..RecordProducedRequest::default()
    };
    let a = h.engine().record_produced(&req).expect("first");
    let b = h.engine().record_produced(&req).expect("second");
    assert!(a.asset_id.starts_with("adhoc/produced/"));
    assert_eq!(a.asset_id, b.asset_id);
    assert!(a.created && !b.created);

    let mut unknown = req.clone();
    unknown.task_id = "nope".to_string();
    let err = h.engine().record_produced(&unknown).unwrap_err();
    assert!(matches!(err, ContractError::Config(_)));

    let mut two_locations = req;
    two_locations.local_path = Some("/tmp/x".to_string());
    let err = h.engine().record_produced(&two_locations).unwrap_err();
    assert!(matches!(err, ContractError::LocationUnresolvable { .. }));
    assert_eq!(err.exit_code(), 1);
}

#[test]
fn test_task_transitions() {
    let h = Harness::new();
    let contract_file = h.init(Some("adhoc"), None);
    let engine = h.engine();

    let done = engine
        .mark_task(&mark(&contract_file, "adhoc", TaskState::Succeeded))
        .expect("pending to succeeded");
    assert!(done.changed);
    let task = &h.load(&contract_file).tasks["adhoc"];
    assert!(task.started_at.is_some());
    assert!(task.finished_at.is_some());

    let again = engine
        .mark_task(&mark(&contract_file, "adhoc", TaskState::Succeeded))
        .expect("same state");
    assert!(!again.changed);
    assert_eq!(again.exit_code(), 0);

    let err = engine
        .mark_task(&mark(&contract_file, "adhoc", TaskState::Running))
        .unwrap_err();
    assert!(matches!(err, ContractError::InvalidTransition(_)));
    assert_eq!(err.exit_code(), 1);

    let err = engine
        .mark_task(&mark(&contract_file, "missing", TaskState::Running))
        .unwrap_err();
    assert!(matches!(err, ContractError::Config(_)));
}

#[test]
fn test_mark_failed_records_error() {
    let h = Harness::new();
    let contract_file = h.init(Some("adhoc"), None);
    let error = h.write_json("error.json", &json!({"message": "oom", "code": 137}));
    let mut req = mark(&contract_file, "adhoc", TaskState::Failed);
    req.error_json_file = Some(error);
    let outcome = h.engine().mark_task(&req).expect("mark failed");
    assert_eq!(
        outcome.lines(),
        vec!["run_contract mark-task-failed: task=adhoc state=FAILED changed=true".to_string()]
    );

    let task = &h.load(&contract_file).tasks["adhoc"];
    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.error, Some(json!({"message": "oom", "code": 137})));
}

// ============================================================================
// Publishing and scanning
// ============================================================================

fn three_outputs(h: &Harness) -> PathBuf {
    let spec = h.write_json(
        "spec.json",
        &json!({
            "job_id": "split",
            "tasks": [
                {"task_id": "left", "expected_assets": [
                    {"asset_id": "x", "uri": "gs://b/a/x.bin"},
                    {"asset_id": "z", "uri": "gs://b/c/z.bin"}
                ]},
                {"task_id": "right", "expected_assets": [
                    {"asset_id": "y", "uri": "gs://b/a/y.bin", "required": false}
                ]}
            ]
        }),
    );
    let req = InitRequest {
        run_id: Some("r1".to_string()),
        run_dir: Some(h.path("run")),
        spec_file: Some(spec),
        output_location: Some("gs://b".to_string()),
        ..InitRequest::default()
    };
    h.engine().init(&req).expect("init").contract_file
}

#[test]
fn test_folder_contracts_partition_assets() {
    let h = Harness::new();
    let contract_file = three_outputs(&h);
    h.put_object("gs://b/a/x.bin", b"x");
    h.put_object("gs://b/a/y.bin", b"y");
    h.put_object("gs://b/c/z.bin", b"z");

    let outcome = h
        .engine()
        .finalize(&FinalizeRequest::new(&contract_file))
        .expect("finalize");
    let uploads = &outcome.verification().expect("verification").folder_uploads;
    assert_eq!(uploads.len(), 2);
    assert!(uploads.iter().all(|u| u.success));

    let mut seen: Vec<(String, String)> = Vec::new();
    for folder in group_by_folder(&outcome.contract).keys() {
        let dest = locator::contract_dest(folder, CONTRACT_FILE_NAME);
        let bytes = fs::read(h.mirror.local_path(&dest).expect("dest")).expect("published doc");
        let doc: Contract = serde_json::from_slice(&bytes).expect("folder contract");
        let v = doc.verification.as_ref().expect("folder verification");
        assert_eq!(v.folder.as_deref(), Some(folder.as_str()));
        assert_eq!(v.scope, ContractScope::Folder);
        for (task_id, asset) in doc.assets() {
            assert_eq!(&locator::folder_of(&asset.location), folder);
            seen.push((task_id.to_string(), asset.asset_id.clone()));
        }
    }

    let all: HashSet<(String, String)> = outcome
        .contract
        .assets()
        .map(|(t, a)| (t.to_string(), a.asset_id.clone()))
        .collect();
    assert_eq!(seen.len(), all.len());
    assert_eq!(seen.into_iter().collect::<HashSet<_>>(), all);

    let stored = h.load(&contract_file);
    assert_eq!(stored.verification.expect("verification").folder_uploads.len(), 2);

    let leftovers: Vec<_> = fs::read_dir(h.path("run"))
        .expect("run dir")
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn test_run_scope_publishes_once() {
    let h = Harness::new();
    let contract_file = three_outputs(&h);
    let mut req = FinalizeRequest::new(&contract_file);
    req.scope = ContractScope::Run;
    let outcome = h.engine().finalize(&req).expect("finalize");

    let uploads = &outcome.verification().expect("verification").folder_uploads;
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].dest, "gs://b/_run_contract.json");
    assert_eq!(uploads[0].required_asset_count, 2);

    let bytes = fs::read(h.mirror.local_path("gs://b/_run_contract.json").expect("dest"))
        .expect("published doc");
    let doc: Contract = serde_json::from_slice(&bytes).expect("run contract");
    assert_eq!(doc.asset_count(), 3);
}

#[test]
fn test_folder_beside_local_contract_is_not_a_failed_upload() {
    let h = Harness::new();
    let run_dir = h.path("run");
    let req = InitRequest {
        job_id: Some("local".to_string()),
        run_id: Some("r1".to_string()),
        run_dir: Some(run_dir.clone()),
        output_location: Some(run_dir.display().to_string()),
        ..InitRequest::default()
    };
    let contract_file = h.engine().init(&req).expect("init").contract_file;
    let model = h.put_file("run/model.pkl", &[7u8; 1024]);
    h.engine()
        .record_produced(&produced(&contract_file, "local", "model", &model))
        .expect("record-produced");

    let mut req = FinalizeRequest::new(&contract_file);
    req.strict = true;
    let outcome = h.engine().finalize(&req).expect("finalize");
    assert_eq!(outcome.contract.status, RunStatus::Complete);
    assert_eq!(outcome.exit_code(), 0);
    assert!(outcome.lines().iter().any(|l| l.ends_with("failed_uploads=0")));

    let uploads = &outcome.verification().expect("verification").folder_uploads;
    assert_eq!(uploads.len(), 1);
    assert!(uploads[0].success);
    assert!(uploads[0].dest.ends_with("run/_run_contract.json"));

    // Still the full contract, not a folder subset written over it
    let stored = h.load(&contract_file);
    assert_eq!(stored.tasks["local"].asset("model").map(|a| a.status), Some(AssetStatus::Ok));
    let v = stored.verification.expect("verification");
    assert!(v.folder.is_none());
    assert_eq!(v.folder_uploads.len(), 1);
    assert!(v.folder_uploads[0].success);
}

#[test]
fn test_unexpected_local_outputs() {
    let h = Harness::new();
    let contract_file = h.init(Some("adhoc"), None);
    let declared = h.put_file("out/result.csv", b"1\n");
    h.put_file("out/parts/p0.csv", b"1\n");
    let stray = h.put_file("out/stray.log", b"debug\n");

    let engine = h.engine();
    engine
        .record_produced(&produced(&contract_file, "adhoc", "result", &declared))
        .expect("record result");
    let parts = RecordProducedRequest {
        contract_file: contract_file.clone(),
        task_id: "adhoc".to_string(),
        asset_id: Some("parts".to_string()),
        local_glob: Some(format!("{}/*.csv", h.path("out/parts").display())),
        ..RecordProducedRequest::default()
    };
    engine.record_produced(&parts).expect("record parts");

    let mut req = FinalizeRequest::new(&contract_file);
    req.scan_local_dirs = vec![h.path("out")];
    let outcome = engine.finalize(&req).expect("finalize");
    let v = outcome.verification().expect("verification");
    assert_eq!(v.unexpected_outputs, vec![stray.display().to_string()]);
    assert_eq!(v.unexpected_outputs_count, 1);
}

// ============================================================================
// init details and cloud-run-env
// ============================================================================

#[test]
fn test_init_renders_placeholders() {
    let h = Harness::new();
    let spec = h.write_json(
        "spec.json",
        &json!({
            "job_id": "render",
            "default_task_id": "step_${REGION}",
            "expected_assets": [{"asset_id": "out", "local_path": "${RUN_DIR}/out/{region}.csv"}]
        }),
    );
    let req = InitRequest {
        run_id: Some("r 1".to_string()),
        run_dir: Some(h.path("run")),
        spec_file: Some(spec),
        vars: vec!["REGION=eu".to_string(), "region=west".to_string()],
        ..InitRequest::default()
    };
    let outcome = h.engine().init(&req).expect("init");
    assert_eq!(outcome.contract.run_id, "r_1");

    let task = &outcome.contract.tasks["step_eu"];
    let asset = task.asset("out").expect("asset");
    let expected = format!("{}/out/west.csv", h.path("run").display());
    assert_eq!(asset.location.as_str(), expected);
    assert!(asset.expected);
    assert!(outcome.lines().iter().any(|l| l == "tasks=1 assets=1 (inputs=0 outputs=1)"));
}

#[test]
fn test_init_rejects_location_rendered_blank() {
    let h = Harness::new();
    let spec = h.write_json(
        "spec.json",
        &json!({
            "job_id": "blank",
            "expected_assets": [{"asset_id": "out", "local_path": "${OUT}"}]
        }),
    );
    let req = InitRequest {
        run_id: Some("r1".to_string()),
        run_dir: Some(h.path("run")),
        spec_file: Some(spec),
        vars: vec!["OUT=".to_string()],
        ..InitRequest::default()
    };
    let err = h.engine().init(&req).unwrap_err();
    assert!(matches!(err, ContractError::LocationUnresolvable { .. }));
    assert_eq!(err.exit_code(), 1);
    assert!(!h.path("run").join(CONTRACT_FILE_NAME).exists());
}

#[test]
fn test_init_requires_job_id_without_spec() {
    let h = Harness::new();
    let req = InitRequest {
        run_dir: Some(h.path("run")),
        ..InitRequest::default()
    };
    let err = h.engine().init(&req).unwrap_err();
    assert!(matches!(err, ContractError::Config(_)));
    assert!(!h.path("run").join(CONTRACT_FILE_NAME).exists());
}

#[test]
fn test_init_reads_job_id_from_env() {
    let h = Harness::new();
    let engine = Engine::new(&h.settings, &h.mirror).with_env(|key: &str| match key {
        "RUN_CONTRACT_JOB_ID" => Some("from-env".to_string()),
        "BUILD_ID" => Some("build/42".to_string()),
        _ => None,
    });
    let req = InitRequest {
        run_dir: Some(h.path("run")),
        ..InitRequest::default()
    };
    let outcome = engine.init(&req).expect("init");
    assert_eq!(outcome.contract.job_id, "from-env");
    assert_eq!(outcome.contract.run_id, "build_42");
}

#[test]
fn test_cloud_run_env_formats() {
    let h = Harness::new();
    let req = CloudRunEnvRequest {
        job_id: Some("etl".to_string()),
        format: EnvFormat::SetEnvVars,
        ..CloudRunEnvRequest::default()
    };
    let outcome = h.engine().cloud_run_env(&req).expect("cloud-run-env");
    assert!(outcome.rendered.contains("RUN_CONTRACT_JOB_ID=etl"));
    assert!(outcome.rendered.contains("RUN_CONTRACT_RUN_DIR=/tmp/run_contracts/etl"));
    assert!(outcome
        .rendered
        .contains("RUN_CONTRACT_FILE=/tmp/run_contracts/etl/_run_contract.json"));
    assert!(!outcome.rendered.contains("RUN_CONTRACT_GCS_DIR"));

    let out = h.path("env/run.env");
    let req = CloudRunEnvRequest {
        job_id: Some("etl".to_string()),
        gcs_run_dir: Some("gs://b/runs/etl".to_string()),
        output_file: Some(out.clone()),
        ..CloudRunEnvRequest::default()
    };
    let outcome = h.engine().cloud_run_env(&req).expect("cloud-run-env");
    let written = fs::read_to_string(&out).expect("env file");
    assert!(written.ends_with('\n'));
    assert!(written.contains("RUN_CONTRACT_GCS_DIR=gs://b/runs/etl\n"));
    assert_eq!(outcome.lines().len(), 1);
}

#[test]
fn test_cloud_run_env_checks_spec() {
    let h = Harness::new();
    let spec = h.write_json("spec.json", &json!({"jobs": {"etl": {}}}));
    let req = CloudRunEnvRequest {
        job_id: Some("other".to_string()),
        spec_file: Some(spec),
        ..CloudRunEnvRequest::default()
    };
    assert!(matches!(
        h.engine().cloud_run_env(&req).unwrap_err(),
        ContractError::Config(_)
    ));

    let err = h.engine().cloud_run_env(&CloudRunEnvRequest::default()).unwrap_err();
    assert!(matches!(err, ContractError::Config(_)));
}
