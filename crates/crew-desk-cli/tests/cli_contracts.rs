#![allow(clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use jsonschema::JSONSchema;
use serde_json::Value;

fn repo_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|err| panic!("failed to canonicalize repo root: {err}"))
}

fn workspace(label: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("crew-desk-cli-{label}-{}", ulid::Ulid::new()));
    if let Err(err) = std::fs::create_dir_all(&dir) {
        panic!("failed to create {}: {err}", dir.display());
    }
    let config = "runtime:\n  provider_name: mock\n  model_id: mock-model\noutput_dir: reports\n";
    if let Err(err) = std::fs::write(dir.join("crew-desk.yaml"), config) {
        panic!("failed to write config: {err}");
    }
    dir
}

fn crew_desk(cwd: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(env!("CARGO_BIN_EXE_crew-desk"));
    command.current_dir(cwd).env_remove("RUST_LOG");
    for arg in args {
        command.arg(arg);
    }
    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run crew-desk {:?}: {err}", args),
    }
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn assert_success(output: &Output) {
    assert!(
        output.status.success(),
        "command failed\nstdout={}\nstderr={}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

fn assert_schema(schema_path: &Path, value: &Value) {
    let body = std::fs::read_to_string(schema_path)
        .unwrap_or_else(|err| panic!("failed to read {}: {err}", schema_path.display()));
    let schema: Value = serde_json::from_str(&body)
        .unwrap_or_else(|err| panic!("failed to parse {}: {err}", schema_path.display()));
    let compiled = JSONSchema::compile(&schema)
        .unwrap_or_else(|err| panic!("failed to compile {}: {err}", schema_path.display()));
    if let Some(errors) = compiled
        .validate(value)
        .err()
        .map(|iter| iter.map(|err| err.to_string()).collect::<Vec<_>>())
    {
        panic!("schema validation failed:\n{}", errors.join("\n"));
    }
}

#[test]
fn docs_run_writes_artifact_and_records_history() {
    let cwd = workspace("docs");
    std::fs::create_dir_all(cwd.join("src")).unwrap_or_else(|err| panic!("{err}"));
    std::fs::write(cwd.join("src/tool.py"), "def main():\n    return 1\n")
        .unwrap_or_else(|err| panic!("{err}"));
    std::fs::write(cwd.join("src/.env"), "TOKEN=1\n").unwrap_or_else(|err| panic!("{err}"));

    let output = crew_desk(&cwd, &["docs", "src"]);
    assert_success(&output);
    let summary = stdout_json(&output);
    assert_eq!(summary["category"], "documentation");
    assert_eq!(summary["stages"], serde_json::json!(["analyze", "write"]));

    let artifact = cwd.join("reports/DOCS_tool.md");
    assert!(artifact.exists(), "missing artifact {}", artifact.display());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("[2/2] Technical Documentation Writer completed"));

    let listed = stdout_json(&crew_desk(&cwd, &["history", "list"]));
    let records = listed.as_array().cloned().unwrap_or_default();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["succeeded"], true);
    assert_eq!(records[0]["output_exists"], true);
    assert_eq!(records[0]["id"], summary["history_id"]);

    let raw = std::fs::read_to_string(cwd.join("history.json"))
        .unwrap_or_else(|err| panic!("{err}"));
    let persisted: Value = serde_json::from_str(&raw).unwrap_or_else(|err| panic!("{err}"));
    let schema = repo_root().join("contracts/history.v1.schema.json");
    assert_schema(&schema, &persisted);
}

#[test]
fn unwritable_output_is_recorded_as_failed_run() {
    let cwd = workspace("fail");
    let output = crew_desk(
        &cwd,
        &[
            "research",
            "rust async runtimes",
            "--output",
            "missing-dir/report.md",
        ],
    );
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("recommend"), "stderr={stderr}");

    let listed = crew_desk(&cwd, &["history", "list", "--category", "research"]);
    let listed = stdout_json(&listed);
    assert_eq!(listed[0]["succeeded"], false);
    assert!(listed[0]["error_message"]
        .as_str()
        .is_some_and(|msg| msg.contains("could not write artifact")));

    let stats = stdout_json(&crew_desk(&cwd, &["history", "stats"]));
    assert_eq!(stats["research"]["failed"], 1);
}

#[test]
fn prompt_overrides_round_trip_through_cli() {
    let cwd = workspace("prompts");
    assert_success(&crew_desk(
        &cwd,
        &[
            "prompts",
            "set",
            "research",
            "compare",
            "Always include a table.",
        ],
    ));
    let rejected = crew_desk(&cwd, &["prompts", "set", "research", "nope", "x"]);
    assert!(!rejected.status.success());

    let shown = crew_desk(&cwd, &["prompts", "show", "--section", "research"]);
    let shown = stdout_json(&shown);
    let research = &shown["sections"]["research"];
    assert_eq!(research["compare"], "Always include a table.");
    assert_eq!(research["research"], "");
    let rules = shown["global_rules"].as_str().unwrap_or_default();
    assert!(!rules.is_empty());
}

#[test]
fn docs_without_matching_files_fails_cleanly() {
    let cwd = workspace("empty");
    let output = crew_desk(&cwd, &["docs", "does-not-exist"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("no source files"));
}
