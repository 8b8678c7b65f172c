//! Graph Validator
//!
//! Structural validation of a workflow definition: naming, task id
//! uniqueness, reference resolution (depends/assignTo/condition/loop
//! bodies), and optional dependency-cycle detection. Pure function of its
//! input; all errors are collected, never short-circuited.

use rustc_hash::FxHashSet;

use crate::graph::TaskGraph;
use crate::workflow::WorkflowDefinition;

/// Outcome of validating one workflow definition
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Validate a workflow definition.
///
/// When `check_cycles` is set, a dependency cycle contributes exactly one
/// "Circular dependencies detected" error regardless of how many back-edges
/// exist.
pub fn validate(def: &WorkflowDefinition, check_cycles: bool) -> ValidationResult {
    let mut result = ValidationResult::new();

    if def.name.trim().is_empty() {
        result.add_error("Workflow name cannot be empty");
    }
    if def.tasks.is_empty() {
        result.add_error("Workflow must contain at least one task");
    }

    let mut seen: FxHashSet<&str> = FxHashSet::default();
    for task in &def.tasks {
        if !seen.insert(task.id.as_str()) {
            result.add_error(format!("Duplicate task id '{}'", task.id));
        }
    }

    let agent_ids: FxHashSet<&str> = def.agents.iter().map(|a| a.id.as_str()).collect();
    let condition_ids: FxHashSet<&str> = def.conditions.iter().map(|c| c.id.as_str()).collect();
    let task_ids: FxHashSet<&str> = def.tasks.iter().map(|t| t.id.as_str()).collect();

    for task in &def.tasks {
        for dep in &task.depends {
            if !task_ids.contains(dep.as_str()) {
                result.add_error(format!(
                    "Task '{}' depends on unknown task '{}'",
                    task.id, dep
                ));
            }
        }
        if let Some(agent) = &task.assign_to {
            if !agent_ids.contains(agent.as_str()) {
                result.add_error(format!(
                    "Task '{}' references unknown agent '{}'",
                    task.id, agent
                ));
            }
        }
        if let Some(condition) = &task.condition {
            if !condition_ids.contains(condition.as_str()) {
                result.add_error(format!(
                    "Task '{}' references unknown condition '{}'",
                    task.id, condition
                ));
            }
        }
    }

    for lp in &def.loops {
        if lp.max_iterations == 0 {
            result.add_error(format!(
                "Loop '{}' maxIterations must be greater than zero",
                lp.id
            ));
        }
        for body in &lp.tasks {
            if !task_ids.contains(body.as_str()) {
                result.add_error(format!("Loop '{}' references unknown task '{}'", lp.id, body));
            }
        }
        if let Some(condition) = &lp.condition {
            if !condition_ids.contains(condition.as_str()) {
                result.add_error(format!(
                    "Loop '{}' references unknown condition '{}'",
                    lp.id, condition
                ));
            }
        }
    }

    for condition in &def.conditions {
        if condition.language != "expr" {
            result.add_error(format!(
                "Condition '{}' uses unsupported language '{}'",
                condition.id, condition.language
            ));
        }
    }

    if check_cycles && TaskGraph::from_workflow(def).has_cycle() {
        result.add_error("Circular dependencies detected");
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> WorkflowDefinition {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn valid_workflow_passes() {
        let wf = parse(
            r#"
name: pipeline
agents:
  - id: runner
conditions:
  - id: ready
    expression: flag
tasks:
  - id: setup
  - id: execute
    depends: [setup]
    assignTo: runner
    condition: ready
"#,
        );
        let result = validate(&wf, true);
        assert!(result.is_valid(), "unexpected errors: {:?}", result.errors);
    }

    #[test]
    fn empty_name_rejected() {
        let wf = parse("name: \"\"\ntasks:\n  - id: a");
        let result = validate(&wf, false);
        assert!(result.errors.iter().any(|e| e.contains("name")));
    }

    #[test]
    fn empty_task_list_rejected() {
        let wf = parse("name: empty\ntasks: []");
        let result = validate(&wf, false);
        assert!(result
            .errors
            .iter()
            .any(|e| e.contains("at least one task")));
    }

    #[test]
    fn duplicate_task_ids_rejected() {
        let wf = parse("name: dup\ntasks:\n  - id: a\n  - id: a");
        let result = validate(&wf, false);
        assert!(result.errors.iter().any(|e| e.contains("Duplicate task id 'a'")));
    }

    #[test]
    fn unknown_references_all_collected() {
        let wf = parse(
            r#"
name: refs
tasks:
  - id: a
    depends: [ghost]
    assignTo: nobody
    condition: never
"#,
        );
        let result = validate(&wf, false);
        assert_eq!(result.errors.len(), 3, "errors: {:?}", result.errors);
        assert!(result
            .errors
            .iter()
            .any(|e| e == "Task 'a' depends on unknown task 'ghost'"));
        assert!(result
            .errors
            .iter()
            .any(|e| e == "Task 'a' references unknown agent 'nobody'"));
        assert!(result
            .errors
            .iter()
            .any(|e| e == "Task 'a' references unknown condition 'never'"));
    }

    #[test]
    fn cycle_yields_exactly_one_error() {
        let wf = parse(
            r#"
name: cyclic
tasks:
  - id: a
    depends: [b]
  - id: b
    depends: [a]
"#,
        );
        let result = validate(&wf, true);
        let cycle_errors: Vec<_> = result
            .errors
            .iter()
            .filter(|e| e.as_str() == "Circular dependencies detected")
            .collect();
        assert_eq!(cycle_errors.len(), 1);
    }

    #[test]
    fn cycle_check_skipped_when_disabled() {
        let wf = parse(
            r#"
name: cyclic
tasks:
  - id: a
    depends: [b]
  - id: b
    depends: [a]
"#,
        );
        let result = validate(&wf, false);
        assert!(result.is_valid());
    }

    #[test]
    fn loop_invariants_checked() {
        let wf = parse(
            r#"
name: loops
loops:
  - id: bad
    tasks: [a, ghost]
    maxIterations: 0
tasks:
  - id: a
"#,
        );
        let result = validate(&wf, false);
        assert!(result
            .errors
            .iter()
            .any(|e| e.contains("maxIterations must be greater than zero")));
        assert!(result
            .errors
            .iter()
            .any(|e| e == "Loop 'bad' references unknown task 'ghost'"));
    }

    #[test]
    fn unsupported_condition_language_flagged() {
        let wf = parse(
            r#"
name: langs
conditions:
  - id: scripted
    expression: "1 + 1"
    language: javascript
tasks:
  - id: a
"#,
        );
        let result = validate(&wf, false);
        assert!(result
            .errors
            .iter()
            .any(|e| e.contains("unsupported language 'javascript'")));
    }

    #[test]
    fn validation_is_pure() {
        let wf = parse("name: pure\ntasks:\n  - id: a");
        let first = validate(&wf, true);
        let second = validate(&wf, true);
        assert_eq!(first.errors, second.errors);
    }
}
