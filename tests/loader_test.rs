//! Workflow source loading integration tests

use std::io::Write;

use weft::{load_workflow, validate, WeftError};

const YAML_SOURCE: &str = r#"
name: ingest
agents:
  - id: fetcher
    type: http
tasks:
  - id: pull
    assignTo: fetcher
  - id: transform
    depends: [pull]
settings:
  maxConcurrency: 2
  failurePolicy: continue
"#;

const JSON_SOURCE: &str = r#"{
  "name": "ingest",
  "agents": [{"id": "fetcher", "type": "http"}],
  "tasks": [
    {"id": "pull", "assignTo": "fetcher"},
    {"id": "transform", "depends": ["pull"]}
  ],
  "settings": {"maxConcurrency": 2, "failurePolicy": "continue"}
}"#;

fn write_file(dir: &tempfile::TempDir, name: &str, content: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_all(content.as_bytes()).unwrap();
    path
}

#[test]
fn json_and_yaml_produce_identical_definitions() {
    let dir = tempfile::tempdir().unwrap();
    let yaml = load_workflow(write_file(&dir, "flow.yaml", YAML_SOURCE)).unwrap();
    let json = load_workflow(write_file(&dir, "flow.json", JSON_SOURCE)).unwrap();

    assert_eq!(yaml.name, json.name);
    assert_eq!(yaml.agents.len(), json.agents.len());
    assert_eq!(yaml.tasks.len(), json.tasks.len());
    assert_eq!(yaml.tasks[1].depends, json.tasks[1].depends);
    assert_eq!(yaml.settings.max_concurrency, json.settings.max_concurrency);
    assert_eq!(yaml.settings.failure_policy, json.settings.failure_policy);
}

#[test]
fn extensionless_files_are_sniffed() {
    let dir = tempfile::tempdir().unwrap();
    let yaml = load_workflow(write_file(&dir, "flow-a", YAML_SOURCE)).unwrap();
    let json = load_workflow(write_file(&dir, "flow-b", JSON_SOURCE)).unwrap();
    assert_eq!(yaml.name, json.name);
}

#[test]
fn loaded_definition_validates() {
    let dir = tempfile::tempdir().unwrap();
    let def = load_workflow(write_file(&dir, "flow.yaml", YAML_SOURCE)).unwrap();
    assert!(validate(&def, true).is_valid());
}

#[test]
fn malformed_input_raises_one_load_error_class() {
    let dir = tempfile::tempdir().unwrap();
    for (name, content) in [
        ("broken.yaml", "name: [oops\ntasks"),
        ("broken.json", "{\"name\": \"x\", "),
        ("broken-noext", "::: not a workflow :::"),
    ] {
        let err = load_workflow(write_file(&dir, name, content)).unwrap_err();
        assert!(
            matches!(err, WeftError::WorkflowLoad { .. }),
            "{} should raise WorkflowLoad, got {:?}",
            name,
            err
        );
    }
}
