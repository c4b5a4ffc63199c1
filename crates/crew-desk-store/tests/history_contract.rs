use std::fs;
use std::path::{Path, PathBuf};

use crew_desk_domain::HistoryCategory;
use crew_desk_store::HistoryLog;
use jsonschema::JSONSchema;
use serde_json::Value;

fn repo_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|err| panic!("failed to canonicalize repo root: {err}"))
}

fn read_json(path: &Path) -> Value {
    let body = fs::read_to_string(path)
        .unwrap_or_else(|err| panic!("failed to read {}: {err}", path.display()));
    serde_json::from_str(&body)
        .unwrap_or_else(|err| panic!("failed to parse {}: {err}", path.display()))
}

fn assert_schema(schema_path: &Path, value: &Value) {
    let schema = read_json(schema_path);
    let compiled = JSONSchema::compile(&schema)
        .unwrap_or_else(|err| panic!("failed to compile {}: {err}", schema_path.display()));
    if let Some(errors) = compiled
        .validate(value)
        .err()
        .map(|iter| iter.map(|err| err.to_string()).collect::<Vec<_>>())
    {
        panic!(
            "schema validation failed for {}:\n{}",
            schema_path.display(),
            errors.join("\n")
        );
    }
}

#[test]
fn persisted_history_document_matches_contract() {
    let dir = std::env::temp_dir().join(format!("crew-desk-contract-{}", ulid::Ulid::new()));
    let path = dir.join("history.json");
    let mut log = HistoryLog::open(&path, 100)
        .unwrap_or_else(|err| panic!("failed to open history log: {err}"));

    log.add(
        HistoryCategory::Documentation,
        vec!["src/main.py".to_string()],
        Some(dir.join("DOCS_main.md")),
        true,
        None,
    )
    .unwrap_or_else(|err| panic!("failed to add record: {err}"));
    log.add(
        HistoryCategory::DailyNews,
        vec!["AI Agents".to_string(), "LLM".to_string()],
        None,
        false,
        Some("stage 'hunt' failed: http transport failure".to_string()),
    )
    .unwrap_or_else(|err| panic!("failed to add record: {err}"));

    let document = read_json(&path);
    let schema = repo_root().join("contracts/history.v1.schema.json");
    assert_schema(&schema, &document);
    assert!(document["categories"]["documentation"][0]
        .get("output_exists")
        .is_none());
}

#[test]
fn empty_history_document_matches_contract() {
    let dir = std::env::temp_dir().join(format!("crew-desk-contract-{}", ulid::Ulid::new()));
    let path = dir.join("history.json");
    let mut log = HistoryLog::open(&path, 100)
        .unwrap_or_else(|err| panic!("failed to open history log: {err}"));
    log.clear(None)
        .unwrap_or_else(|err| panic!("failed to clear history: {err}"));

    let document = read_json(&path);
    let schema = repo_root().join("contracts/history.v1.schema.json");
    assert_schema(&schema, &document);
    assert_eq!(document["categories"]["research"], serde_json::json!([]));
}
