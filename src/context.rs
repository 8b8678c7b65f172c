//! Execution context - variables, task outputs, template resolution
//!
//! Holds workflow variables and per-task outputs during a run, resolves
//! `${identifier}` / `${taskId.field}` placeholders, and evaluates
//! boolean condition expressions. Outputs are namespaced `"taskId.field"`
//! so collisions across tasks are impossible by construction.
//!
//! Single-pass resolution with Cow<str> for zero-alloc when no templates.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::LazyLock;

use dashmap::DashMap;
use parking_lot::RwLock;
use regex::Regex;
use serde_json::Value;
use smallvec::SmallVec;

use crate::error::{Result, WeftError};
use crate::expr;

/// Pre-compiled regex for ${identifier} or ${taskId.field} references
static REF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][\w-]*(?:\.[\w-]+)*)\}").unwrap());

/// Mutable shared state during a workflow run.
///
/// Clone is shallow: all clones share the same variables and outputs.
#[derive(Clone, Default)]
pub struct ExecutionContext {
    variables: Arc<RwLock<HashMap<String, Value>>>,
    /// Outputs keyed "taskId.field"
    outputs: Arc<DashMap<String, Arc<Value>>>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context seeded with workflow variables
    pub fn with_variables(variables: HashMap<String, Value>) -> Self {
        Self {
            variables: Arc::new(RwLock::new(variables)),
            outputs: Arc::new(DashMap::new()),
        }
    }

    pub fn set_variable(&self, name: impl Into<String>, value: Value) {
        self.variables.write().insert(name.into(), value);
    }

    pub fn get_variable(&self, name: &str) -> Option<Value> {
        self.variables.read().get(name).cloned()
    }

    pub fn remove_variable(&self, name: &str) {
        self.variables.write().remove(name);
    }

    /// Store one output field for a task. Re-running a task (retry, loop
    /// iteration) overwrites the previous value.
    pub fn set_output(&self, task_id: &str, field: &str, value: Value) {
        self.outputs
            .insert(format!("{}.{}", task_id, field), Arc::new(value));
    }

    pub fn get_output(&self, task_id: &str, field: &str) -> Option<Arc<Value>> {
        self.outputs
            .get(&format!("{}.{}", task_id, field))
            .map(|r| Arc::clone(r.value()))
    }

    /// Snapshot of the variable map (for the final execution record)
    pub fn variables_snapshot(&self) -> HashMap<String, Value> {
        self.variables.read().clone()
    }

    /// Look up a reference: variables first, then namespaced task outputs.
    fn lookup(&self, reference: &str) -> Option<Value> {
        if let Some(v) = self.variables.read().get(reference) {
            return Some(v.clone());
        }
        self.outputs.get(reference).map(|r| (**r.value()).clone())
    }

    /// Resolve all `${ref}` placeholders in a template.
    ///
    /// Returns Cow::Borrowed when the template has no placeholders.
    /// Unresolved references are an error, never an empty substitution.
    pub fn resolve<'a>(&self, template: &'a str) -> Result<Cow<'a, str>> {
        if !template.contains("${") {
            return Ok(Cow::Borrowed(template));
        }

        let mut result = String::with_capacity(template.len() + 32);
        let mut last_end = 0;
        // Stack-allocated for the common case of 0-1 unresolved refs
        let mut unresolved: SmallVec<[String; 4]> = SmallVec::new();

        for cap in REF_RE.captures_iter(template) {
            let m = cap.get(0).unwrap();
            let reference = &cap[1];

            result.push_str(&template[last_end..m.start()]);

            match self.lookup(reference) {
                Some(value) => match value_to_string(&value) {
                    Some(s) => result.push_str(&s),
                    // Null resolves to nothing usable
                    None => unresolved.push(reference.to_string()),
                },
                None => unresolved.push(reference.to_string()),
            }

            last_end = m.end();
        }

        if !unresolved.is_empty() {
            return Err(WeftError::UnresolvedReference {
                reference: unresolved.join(", "),
            });
        }

        result.push_str(&template[last_end..]);
        Ok(Cow::Owned(result))
    }

    /// Resolve every value of a task's input map
    pub fn resolve_input(&self, input: &HashMap<String, String>) -> Result<HashMap<String, String>> {
        let mut resolved = HashMap::with_capacity(input.len());
        for (key, template) in input {
            resolved.insert(key.clone(), self.resolve(template)?.into_owned());
        }
        Ok(resolved)
    }

    /// Evaluate a boolean condition expression against the current snapshot.
    ///
    /// Only the `expr` language is supported; anything else is a hard
    /// error, as is a non-boolean outcome.
    pub fn evaluate_condition(&self, expression: &str, language: &str) -> Result<bool> {
        if language != "expr" {
            return Err(WeftError::UnsupportedLanguage {
                language: language.to_string(),
            });
        }
        expr::evaluate_str(expression, &|name| self.lookup(name))
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("variables", &self.variables.read().len())
            .field("outputs", &self.outputs.len())
            .finish()
    }
}

/// Convert a JSON value for template substitution. Null yields None:
/// substituting "null" into a command line is a bug, not a value.
fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}
