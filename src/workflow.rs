//! Workflow definition structures
//!
//! A workflow is a named, versioned directed graph of tasks plus variables,
//! agents, conditions, loops, and settings. Definitions are parsed from
//! JSON or YAML (one logical schema, camelCase field names) and are
//! immutable once loaded. Tasks are Arc-wrapped for cheap sharing with the
//! scheduler's worker futures.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Static declaration of a workflow
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    #[serde(default)]
    pub agents: Vec<AgentDefinition>,
    #[serde(default)]
    pub conditions: Vec<ConditionDefinition>,
    #[serde(default)]
    pub loops: Vec<LoopDefinition>,
    #[serde(default)]
    pub tasks: Vec<Arc<TaskDefinition>>,
    #[serde(default)]
    pub settings: WorkflowSettings,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl WorkflowDefinition {
    /// Look up a task by id
    pub fn task(&self, id: &str) -> Option<&Arc<TaskDefinition>> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Look up an agent by id
    pub fn agent(&self, id: &str) -> Option<&AgentDefinition> {
        self.agents.iter().find(|a| a.id == id)
    }

    /// Look up a named condition by id
    pub fn condition(&self, id: &str) -> Option<&ConditionDefinition> {
        self.conditions.iter().find(|c| c.id == id)
    }
}

/// One node in the task DAG
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    pub id: String,
    #[serde(rename = "type", default = "default_task_type")]
    pub task_type: String,
    #[serde(default)]
    pub description: String,
    /// Task ids that must reach a terminal non-blocking state first
    #[serde(default)]
    pub depends: Vec<String>,
    /// Agent role this task is dispatched to
    #[serde(default)]
    pub assign_to: Option<String>,
    /// Named condition gating execution; false means the task is skipped
    #[serde(default)]
    pub condition: Option<String>,
    /// Eligible to run alongside siblings (still counts against the global limit)
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub retries: u32,
    /// Per-task timeout in seconds
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Named shared resource acquired for the duration of the invocation
    #[serde(default)]
    pub resource: Option<String>,
    /// Input templates, resolved against the execution context at dispatch
    #[serde(default)]
    pub input: HashMap<String, String>,
    /// Output fields this task declares
    #[serde(default)]
    pub output: Vec<String>,
}

fn default_task_type() -> String {
    "shell".to_string()
}

impl TaskDefinition {
    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }
}

/// A named executor role
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDefinition {
    pub id: String,
    #[serde(rename = "type", default)]
    pub agent_type: String,
    #[serde(default)]
    pub config: HashMap<String, Value>,
}

/// Named boolean expression
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionDefinition {
    pub id: String,
    pub expression: String,
    #[serde(default = "default_language")]
    pub language: String,
}

fn default_language() -> String {
    "expr".to_string()
}

/// Bounded iteration construct over a set of body tasks
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopDefinition {
    pub id: String,
    #[serde(default)]
    pub kind: LoopKind,
    /// For `while` loops: re-evaluated before each iteration
    #[serde(default)]
    pub condition: Option<String>,
    /// Body task ids, re-enqueued each iteration
    pub tasks: Vec<String>,
    pub max_iterations: u32,
    #[serde(default)]
    pub continue_on_error: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopKind {
    #[default]
    Count,
    While,
}

/// Workflow-level failure policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// One terminal task failure fails the whole execution immediately
    #[default]
    FailFast,
    /// Independent branches keep running; overall status decided at the end
    Continue,
}

/// How failed tasks re-enter the ready queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryPolicy {
    #[default]
    Immediate,
    Exponential,
}

/// Immutable execution settings, enumerated at load time
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSettings {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    /// Workflow-level timeout in seconds
    #[serde(default)]
    pub timeout: Option<u64>,
}

fn default_max_concurrency() -> usize {
    4
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            failure_policy: FailurePolicy::default(),
            retry_policy: RetryPolicy::default(),
            timeout: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL_YAML: &str = r#"
name: deploy
tasks:
  - id: build
  - id: test
    depends: [build]
"#;

    #[test]
    fn deserialize_minimal_yaml() {
        let wf: WorkflowDefinition = serde_yaml::from_str(MINIMAL_YAML).unwrap();
        assert_eq!(wf.name, "deploy");
        assert_eq!(wf.version, "1.0");
        assert_eq!(wf.tasks.len(), 2);
        assert_eq!(wf.tasks[1].depends, vec!["build"]);
        assert_eq!(wf.settings.max_concurrency, 4);
        assert_eq!(wf.settings.failure_policy, FailurePolicy::FailFast);
    }

    #[test]
    fn deserialize_full_task_fields() {
        let wf: WorkflowDefinition = serde_yaml::from_str(
            r#"
name: full
agents:
  - id: worker
    type: shell
conditions:
  - id: on_main
    expression: branch == "main"
tasks:
  - id: release
    type: deploy
    description: push the release
    assignTo: worker
    condition: on_main
    parallel: true
    retries: 2
    timeout: 30
    resource: registry
    input:
      target: ${build.artifact}
    output: [url]
"#,
        )
        .unwrap();

        let task = wf.task("release").unwrap();
        assert_eq!(task.task_type, "deploy");
        assert_eq!(task.assign_to.as_deref(), Some("worker"));
        assert_eq!(task.condition.as_deref(), Some("on_main"));
        assert!(task.parallel);
        assert_eq!(task.retries, 2);
        assert_eq!(task.timeout_duration(), Some(Duration::from_secs(30)));
        assert_eq!(task.resource.as_deref(), Some("registry"));
        assert_eq!(task.input["target"], "${build.artifact}");
        assert_eq!(wf.condition("on_main").unwrap().language, "expr");
    }

    #[test]
    fn deserialize_settings_policies() {
        let wf: WorkflowDefinition = serde_yaml::from_str(
            r#"
name: tuned
tasks:
  - id: only
settings:
  maxConcurrency: 8
  failurePolicy: continue
  retryPolicy: exponential
  timeout: 600
"#,
        )
        .unwrap();
        assert_eq!(wf.settings.max_concurrency, 8);
        assert_eq!(wf.settings.failure_policy, FailurePolicy::Continue);
        assert_eq!(wf.settings.retry_policy, RetryPolicy::Exponential);
        assert_eq!(wf.settings.timeout, Some(600));
    }

    #[test]
    fn deserialize_loop_definition() {
        let wf: WorkflowDefinition = serde_yaml::from_str(
            r#"
name: looping
loops:
  - id: poll
    kind: while
    condition: not_ready
    tasks: [check]
    maxIterations: 5
    continueOnError: true
tasks:
  - id: check
"#,
        )
        .unwrap();
        let lp = &wf.loops[0];
        assert_eq!(lp.kind, LoopKind::While);
        assert_eq!(lp.max_iterations, 5);
        assert!(lp.continue_on_error);
        assert_eq!(lp.tasks, vec!["check"]);
    }

    #[test]
    fn json_and_yaml_share_one_schema() {
        let json = r#"{
            "name": "dual",
            "tasks": [
                {"id": "a"},
                {"id": "b", "depends": ["a"], "assignTo": null}
            ],
            "settings": {"failurePolicy": "fail-fast"}
        }"#;
        let from_json: WorkflowDefinition = serde_json::from_str(json).unwrap();
        let from_yaml: WorkflowDefinition = serde_yaml::from_str(json).unwrap();
        assert_eq!(from_json.name, from_yaml.name);
        assert_eq!(from_json.tasks.len(), from_yaml.tasks.len());
    }
}
