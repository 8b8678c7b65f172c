//! Graph validator integration tests

mod common;

use common::parse;
use pretty_assertions::assert_eq;
use weft::validate;

#[test]
fn cycle_rejected_with_exactly_one_error() {
    let def = parse(
        r#"
name: cyclic
tasks:
  - id: A
    depends: [B]
  - id: B
    depends: [A]
"#,
    );
    let result = validate(&def, true);
    assert!(!result.is_valid());
    assert_eq!(result.errors, vec!["Circular dependencies detected".to_string()]);
}

#[test]
fn reference_errors_are_batched_not_short_circuited() {
    let def = parse(
        r#"
name: broken-refs
tasks:
  - id: one
    assignTo: nobody
  - id: two
    depends: [missing]
  - id: three
    condition: undeclared
"#,
    );
    let result = validate(&def, true);
    assert_eq!(result.errors.len(), 3);
}

#[test]
fn valid_workflow_with_everything_passes() {
    let def = parse(
        r#"
name: release-train
version: "2.1"
variables:
  channel: stable
agents:
  - id: ci
    type: shell
conditions:
  - id: is_stable
    expression: channel == "stable"
loops:
  - id: soak
    kind: count
    tasks: [soak-test]
    maxIterations: 3
tasks:
  - id: build
    assignTo: ci
  - id: soak-test
    depends: [build]
  - id: publish
    depends: [soak-test]
    condition: is_stable
    assignTo: ci
    resource: registry
"#,
    );
    let result = validate(&def, true);
    assert!(result.is_valid(), "errors: {:?}", result.errors);
}

#[test]
fn self_dependency_counts_as_a_cycle() {
    let def = parse(
        r#"
name: selfie
tasks:
  - id: a
    depends: [a]
"#,
    );
    let result = validate(&def, true);
    assert!(result
        .errors
        .contains(&"Circular dependencies detected".to_string()));
}

#[test]
fn diamond_graph_is_not_a_cycle() {
    let def = parse(
        r#"
name: diamond
tasks:
  - id: top
  - id: left
    depends: [top]
  - id: right
    depends: [top]
  - id: bottom
    depends: [left, right]
"#,
    );
    assert!(validate(&def, true).is_valid());
}
