//! Weft Error Types with Error Codes
//!
//! Error code ranges:
//! - WEFT-000-009: Workflow load errors
//! - WEFT-010-019: Validation errors
//! - WEFT-020-029: Graph errors
//! - WEFT-030-039: Task execution errors
//! - WEFT-040-049: Context/expression errors
//! - WEFT-050-059: Resource coordination errors
//! - WEFT-060-069: Execution lifecycle errors
//! - WEFT-070-079: Engine invariant errors
//! - WEFT-090-099: IO/serde errors

use thiserror::Error;

pub type Result<T> = std::result::Result<T, WeftError>;

/// Trait for errors that provide fix suggestions
pub trait FixSuggestion {
    fn fix_suggestion(&self) -> Option<&str>;
}

/// All error variants are part of the public API.
#[derive(Error, Debug)]
pub enum WeftError {
    // ═══════════════════════════════════════════
    // WORKFLOW LOAD ERRORS (000-009)
    // ═══════════════════════════════════════════
    #[error("[WEFT-001] Failed to load workflow file '{path}': {details}")]
    WorkflowLoad { path: String, details: String },

    #[error("[WEFT-002] Workflow file not found: {path}")]
    WorkflowNotFound { path: String },

    // ═══════════════════════════════════════════
    // VALIDATION ERRORS (010-019)
    // ═══════════════════════════════════════════
    #[error("[WEFT-010] Workflow validation failed: {}", errors.join("; "))]
    Validation { errors: Vec<String> },

    // ═══════════════════════════════════════════
    // GRAPH ERRORS (020-029)
    // ═══════════════════════════════════════════
    #[error("[WEFT-020] Circular dependencies detected")]
    CircularDependencies,

    // ═══════════════════════════════════════════
    // TASK EXECUTION ERRORS (030-039)
    // ═══════════════════════════════════════════
    #[error("[WEFT-030] Task '{task_id}' failed: {reason}")]
    TaskExecution { task_id: String, reason: String },

    #[error("[WEFT-031] Task '{task_id}' timed out after {timeout_ms}ms")]
    TaskTimeout { task_id: String, timeout_ms: u64 },

    #[error("[WEFT-032] Task references unknown agent '{agent_id}'")]
    AgentNotFound { agent_id: String },

    #[error("[WEFT-033] Executor error: {0}")]
    Executor(String),

    // ═══════════════════════════════════════════
    // CONTEXT / EXPRESSION ERRORS (040-049)
    // ═══════════════════════════════════════════
    #[error("[WEFT-040] Unresolved reference '${{{reference}}}'")]
    UnresolvedReference { reference: String },

    #[error("[WEFT-041] Condition error: {reason}")]
    Condition { reason: String },

    #[error("[WEFT-042] Unsupported condition language '{language}'")]
    UnsupportedLanguage { language: String },

    // ═══════════════════════════════════════════
    // RESOURCE COORDINATION ERRORS (050-059)
    // ═══════════════════════════════════════════
    #[error("[WEFT-050] Acquisition of resource '{resource_id}' by '{owner_id}' timed out after {timeout_ms}ms")]
    ResourceTimeout {
        resource_id: String,
        owner_id: String,
        timeout_ms: u64,
    },

    #[error("[WEFT-051] Deadlock detected: '{owner_id}' waiting on resource '{resource_id}'")]
    Deadlock {
        resource_id: String,
        owner_id: String,
    },

    #[error("[WEFT-052] '{owner_id}' does not hold resource '{resource_id}'")]
    NotOwner {
        resource_id: String,
        owner_id: String,
    },

    // ═══════════════════════════════════════════
    // EXECUTION LIFECYCLE ERRORS (060-069)
    // ═══════════════════════════════════════════
    #[error("[WEFT-060] Execution '{execution_id}' not found")]
    ExecutionNotFound { execution_id: String },

    #[error("[WEFT-061] Execution '{execution_id}' is already finished ({status})")]
    ExecutionFinished {
        execution_id: String,
        status: String,
    },

    #[error("[WEFT-062] Execution cancelled")]
    Cancelled,

    // ═══════════════════════════════════════════
    // ENGINE INVARIANT ERRORS (070-079)
    // ═══════════════════════════════════════════
    #[error("[WEFT-070] Engine invariant violated: {reason}")]
    EngineFatal { reason: String },

    // ═══════════════════════════════════════════
    // IO / SERDE ERRORS (090-099)
    // ═══════════════════════════════════════════
    #[error("[WEFT-090] IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("[WEFT-091] JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("[WEFT-092] YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl WeftError {
    /// Get the error code (e.g., "WEFT-001")
    pub fn code(&self) -> &'static str {
        match self {
            Self::WorkflowLoad { .. } => "WEFT-001",
            Self::WorkflowNotFound { .. } => "WEFT-002",
            Self::Validation { .. } => "WEFT-010",
            Self::CircularDependencies => "WEFT-020",
            Self::TaskExecution { .. } => "WEFT-030",
            Self::TaskTimeout { .. } => "WEFT-031",
            Self::AgentNotFound { .. } => "WEFT-032",
            Self::Executor(_) => "WEFT-033",
            Self::UnresolvedReference { .. } => "WEFT-040",
            Self::Condition { .. } => "WEFT-041",
            Self::UnsupportedLanguage { .. } => "WEFT-042",
            Self::ResourceTimeout { .. } => "WEFT-050",
            Self::Deadlock { .. } => "WEFT-051",
            Self::NotOwner { .. } => "WEFT-052",
            Self::ExecutionNotFound { .. } => "WEFT-060",
            Self::ExecutionFinished { .. } => "WEFT-061",
            Self::Cancelled => "WEFT-062",
            Self::EngineFatal { .. } => "WEFT-070",
            Self::Io(_) => "WEFT-090",
            Self::Json(_) => "WEFT-091",
            Self::Yaml(_) => "WEFT-092",
        }
    }

    /// Check if the failure is transient enough to be worth a retry.
    ///
    /// Retry is always the scheduler's decision; the resource coordinator
    /// never retries on its own. Deadlock is deliberately excluded:
    /// re-acquiring immediately would reproduce the cycle.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::TaskExecution { .. }
                | Self::TaskTimeout { .. }
                | Self::Executor(_)
                | Self::ResourceTimeout { .. }
        )
    }
}

impl FixSuggestion for WeftError {
    fn fix_suggestion(&self) -> Option<&str> {
        match self {
            WeftError::WorkflowLoad { .. } => {
                Some("Check the file is valid JSON or YAML with the workflow schema")
            }
            WeftError::WorkflowNotFound { .. } => Some("Check the file path exists"),
            WeftError::Validation { .. } => {
                Some("Fix the reported structural errors and validate again")
            }
            WeftError::CircularDependencies => {
                Some("Remove circular 'depends' references between tasks")
            }
            WeftError::TaskExecution { .. } => Some("Check task input and executor availability"),
            WeftError::TaskTimeout { .. } => Some("Increase the task timeout or split the task"),
            WeftError::AgentNotFound { .. } => {
                Some("Declare the agent in the workflow 'agents:' section")
            }
            WeftError::Executor(_) => Some("Check the external executor is reachable"),
            WeftError::UnresolvedReference { .. } => {
                Some("Reference a declared variable or a completed task output (taskId.field)")
            }
            WeftError::Condition { .. } => {
                Some("Conditions must be comparisons, &&/||/!, or a bare variable")
            }
            WeftError::UnsupportedLanguage { .. } => Some("Use language: expr"),
            WeftError::ResourceTimeout { .. } => {
                Some("Increase the acquisition timeout or reduce resource contention")
            }
            WeftError::Deadlock { .. } => {
                Some("Acquire shared resources in a consistent global order")
            }
            WeftError::NotOwner { .. } => Some("Only the acquiring owner may release a resource"),
            WeftError::ExecutionNotFound { .. } => Some("Check the execution id"),
            WeftError::ExecutionFinished { .. } => {
                Some("Finished executions cannot be cancelled or resumed")
            }
            WeftError::Cancelled => None,
            WeftError::EngineFatal { .. } => None,
            WeftError::Io(_) => Some("Check file path and permissions"),
            WeftError::Json(_) => Some("Check JSON syntax"),
            WeftError::Yaml(_) => Some("Check YAML syntax: indentation and quoting"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_error_code_and_display() {
        let err = WeftError::WorkflowLoad {
            path: "flow.yaml".to_string(),
            details: "unexpected token".to_string(),
        };
        assert_eq!(err.code(), "WEFT-001");
        let msg = err.to_string();
        assert!(msg.contains("Failed to load workflow file"));
        assert!(msg.contains("flow.yaml"));
    }

    #[test]
    fn circular_dependencies_is_a_single_fixed_message() {
        let err = WeftError::CircularDependencies;
        assert_eq!(err.to_string(), "[WEFT-020] Circular dependencies detected");
    }

    #[test]
    fn deadlock_error_names_both_parties() {
        let err = WeftError::Deadlock {
            resource_id: "db".to_string(),
            owner_id: "task_a".to_string(),
        };
        assert_eq!(err.code(), "WEFT-051");
        let msg = err.to_string();
        assert!(msg.contains("db"));
        assert!(msg.contains("task_a"));
    }

    #[test]
    fn recoverable_classification() {
        assert!(WeftError::TaskTimeout {
            task_id: "t".into(),
            timeout_ms: 100,
        }
        .is_recoverable());
        assert!(WeftError::ResourceTimeout {
            resource_id: "r".into(),
            owner_id: "o".into(),
            timeout_ms: 100,
        }
        .is_recoverable());
        // Deadlock retry without backoff would reproduce the cycle
        assert!(!WeftError::Deadlock {
            resource_id: "r".into(),
            owner_id: "o".into(),
        }
        .is_recoverable());
        assert!(!WeftError::CircularDependencies.is_recoverable());
    }

    #[test]
    fn unresolved_reference_display_keeps_placeholder_syntax() {
        let err = WeftError::UnresolvedReference {
            reference: "build.artifact".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "[WEFT-040] Unresolved reference '${build.artifact}'"
        );
    }

    #[test]
    fn fix_suggestions_exist_for_user_errors() {
        let err = WeftError::NotOwner {
            resource_id: "r".into(),
            owner_id: "o".into(),
        };
        assert!(err.fix_suggestion().is_some());
        assert!(WeftError::Cancelled.fix_suggestion().is_none());
    }

    #[test]
    fn io_error_converts() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: WeftError = io_err.into();
        assert_eq!(err.code(), "WEFT-090");
    }
}
