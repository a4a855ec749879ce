//! Property-based tests for run-contract
//!
//! Uses proptest for invariants that must hold for any input:
//! - an asset has exactly one location
//! - folder contracts partition the assets of a run
//! - slugs, digests and templates stay well-formed
//! - task lifecycles only move forward

use std::collections::HashSet;

use chrono::Utc;
use indexmap::IndexMap;
use proptest::prelude::*;
use serde_json::{Map, Value};

use run_contract::model::{ContractPaths, SCHEMA_VERSION};
use run_contract::publish::{folder_contract, group_by_folder};
use run_contract::runtime::{safe_slug, short_digest};
use run_contract::task_state::{plan_transition, Transition};
use run_contract::template::TemplateContext;
use run_contract::types::parse_bool;
use run_contract::{Asset, AssetLocation, Contract, ContractError, Role, RunStatus, Task, TaskState};

// =============================================================================
// Locations
// =============================================================================

fn field_strategy() -> impl Strategy<Value = Option<String>> {
    prop_oneof![
        Just(None),
        Just(Some(String::new())),
        Just(Some("   ".to_string())),
        "[a-z]{1,8}(/[a-z]{1,8}){0,3}".prop_map(Some),
    ]
}

fn is_set(field: &Option<String>) -> bool {
    field.as_ref().is_some_and(|s| !s.trim().is_empty())
}

proptest! {
    /// Exactly one non-blank field resolves; anything else is rejected
    #[test]
    fn location_needs_exactly_one_field(
        local in field_strategy(),
        uri in field_strategy(),
        local_glob in field_strategy(),
        gcs_glob in field_strategy(),
    ) {
        let set = [&local, &uri, &local_glob, &gcs_glob].iter().filter(|f| is_set(f)).count();
        let result = AssetLocation::from_fields("a", local, uri, local_glob, gcs_glob);
        if set == 1 {
            prop_assert!(result.is_ok());
        } else {
            let is_location_error = matches!(result, Err(ContractError::LocationUnresolvable { .. }));
            prop_assert!(is_location_error);
        }
    }
}

// =============================================================================
// Folder partition
// =============================================================================

fn contract_with(uris: &[(usize, String)]) -> Contract {
    let now = Utc::now();
    let mut tasks: IndexMap<String, Task> = IndexMap::new();
    for (i, (task_no, uri)) in uris.iter().enumerate() {
        let task_id = format!("t{}", task_no);
        let task = tasks
            .entry(task_id.clone())
            .or_insert_with(|| Task::new(task_id.clone(), now));
        let mut asset = Asset::new(format!("a{}", i), Role::Output, AssetLocation::Uri(uri.clone()), now);
        asset.required = i % 2 == 0;
        task.push_asset(asset).unwrap();
    }
    Contract {
        schema_version: SCHEMA_VERSION,
        revision: 1,
        job_id: "job".to_string(),
        run_id: "r1".to_string(),
        pipeline_title: "job".to_string(),
        output_location: Some("gs://b".to_string()),
        status: RunStatus::Running,
        started_at: now,
        completed_at: None,
        runtime: Map::new(),
        config: Value::Object(Map::new()),
        input_data: Value::Object(Map::new()),
        run_metadata: None,
        tasks,
        preflight: None,
        verification: None,
        paths: ContractPaths::default(),
    }
}

fn assets_strategy() -> impl Strategy<Value = Vec<(usize, String)>> {
    prop::collection::vec(
        (0usize..3, "(a|b|c)(/(x|y)){0,2}/[a-z]{1,4}\\.bin")
            .prop_map(|(task, path)| (task, format!("gs://bucket/{}", path))),
        1..12,
    )
}

proptest! {
    /// Every asset lands in exactly one folder contract
    #[test]
    fn folder_contracts_partition_assets(uris in assets_strategy()) {
        let contract = contract_with(&uris);
        let audited = HashSet::new();

        let mut seen = Vec::new();
        for (folder, keys) in group_by_folder(&contract) {
            let subset = folder_contract(&contract, &folder, &keys, &audited);
            prop_assert_eq!(subset.asset_count(), keys.len());
            for (task_id, asset) in subset.assets() {
                prop_assert_eq!(run_contract::locator::folder_of(&asset.location), folder.clone());
                seen.push((task_id.to_string(), asset.asset_id.clone()));
            }
            prop_assert!(subset.tasks.values().all(|t| !t.assets.is_empty()));
        }

        let unique: HashSet<_> = seen.iter().cloned().collect();
        prop_assert_eq!(unique.len(), seen.len());
        prop_assert_eq!(seen.len(), contract.asset_count());
    }
}

// =============================================================================
// Slugs, digests, templates
// =============================================================================

proptest! {
    /// A slug is non-empty, path-safe and stable under re-slugging
    #[test]
    fn slug_is_path_safe(raw in ".{0,40}") {
        let slug = safe_slug(&raw);
        prop_assert!(!slug.is_empty());
        prop_assert!(slug.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')));
        prop_assert_eq!(safe_slug(&slug), slug.clone());
    }

    /// Digests are lower-case hex of the requested length
    #[test]
    fn digest_has_requested_length(input in ".{0,64}", len in 1usize..=64) {
        let digest = short_digest(&input, len);
        prop_assert_eq!(digest.len(), len);
        prop_assert!(digest.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        prop_assert_eq!(short_digest(&input, len), digest);
    }

    /// Text without placeholder syntax renders unchanged
    #[test]
    fn plain_text_renders_unchanged(text in "[a-zA-Z0-9 /._:-]{0,60}") {
        let mut ctx = TemplateContext::new();
        ctx.insert("RUN_ID", "r1");
        prop_assert_eq!(ctx.render(&text).unwrap(), text);
    }

    /// Known `${VAR}` placeholders are substituted verbatim
    #[test]
    fn known_variables_substitute(
        name in "[A-Z][A-Z0-9_]{0,10}",
        value in "[a-z0-9/._-]{0,20}",
        prefix in "[a-z/]{0,10}",
    ) {
        let mut ctx = TemplateContext::new();
        ctx.insert(name.clone(), value.clone());
        let rendered = ctx.render(&format!("{}${{{}}}", prefix, name)).unwrap();
        prop_assert_eq!(rendered, format!("{}{}", prefix, value));
    }

    /// Boolean spellings are case-insensitive
    #[test]
    fn bool_spellings_ignore_case(
        word in prop::sample::select(vec!["1", "true", "yes", "y", "on", "0", "false", "no", "n", "off"]),
        upper in any::<bool>(),
    ) {
        let expected = matches!(word, "1" | "true" | "yes" | "y" | "on");
        let input = if upper { word.to_ascii_uppercase() } else { word.to_string() };
        prop_assert_eq!(parse_bool(&input), Some(expected));
    }
}

// =============================================================================
// Task lifecycle
// =============================================================================

fn state_strategy() -> impl Strategy<Value = TaskState> {
    prop::sample::select(TaskState::all_states().to_vec())
}

proptest! {
    /// Accepted transitions never move backwards or leave a terminal state
    #[test]
    fn transitions_only_move_forward(from in state_strategy(), to in state_strategy()) {
        match plan_transition(from, to) {
            Ok(Transition::Unchanged) => prop_assert_eq!(from, to),
            Ok(Transition::Entered(states)) => {
                prop_assert!(!from.is_terminal());
                prop_assert_eq!(states.last().copied(), Some(to));
                let mut previous = from;
                for state in states {
                    prop_assert!(state.order() > previous.order());
                    previous = state;
                }
            }
            Err(_) => prop_assert!(from.is_terminal() || to.order() < from.order()),
        }
    }

    /// Applying a sequence of requests keeps a consistent history
    #[test]
    fn task_history_matches_state(targets in prop::collection::vec(state_strategy(), 0..8)) {
        let now = Utc::now();
        let mut task = Task::new("t", now);
        for target in targets {
            let _ = task.transition_to(target, now);
        }
        prop_assert_eq!(task.state_history.last().map(|c| c.state), Some(task.state));
        prop_assert_eq!(task.finished_at.is_some(), task.state.is_terminal());
        let orders: Vec<u8> = task.state_history.iter().map(|c| c.state.order()).collect();
        prop_assert!(orders.windows(2).all(|w| w[0] < w[1]));
    }
}
