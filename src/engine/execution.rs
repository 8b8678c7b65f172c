//! Runtime execution records
//!
//! `WorkflowExecution` is the structured record of one run; it is owned by
//! the engine's coordinating loop and mutated only there (task bodies
//! report back over channels). Task statuses move forward monotonically;
//! the one sanctioned backward move is a failed attempt re-entering
//! `Pending` under the retry budget, which goes through
//! [`TaskExecutionRecord::reenter_for_retry`] so the invariant stays
//! checkable.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, WeftError};

/// Overall status of a workflow execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Status of one task within an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }

    /// Does this state satisfy a downstream dependency? Skipped
    /// dependencies still satisfy ordering - they do not block.
    pub fn satisfies_dependency(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }

    /// Forward position in the lifecycle (terminal states share one rank)
    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Ready => 1,
            Self::Running => 2,
            Self::Completed | Self::Failed | Self::Skipped | Self::Cancelled => 3,
        }
    }
}

/// Runtime state of one task instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskExecutionRecord {
    pub task_id: String,
    pub status: TaskStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub error: Option<String>,
    pub output: Option<Arc<Value>>,
}

impl TaskExecutionRecord {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Pending,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            error: None,
            output: None,
        }
    }

    /// Move the task forward. Backward or post-terminal transitions are an
    /// engine invariant violation.
    pub fn advance(&mut self, next: TaskStatus) -> Result<()> {
        if self.status.is_terminal() || next.rank() < self.status.rank() {
            return Err(WeftError::EngineFatal {
                reason: format!(
                    "task '{}' cannot move {:?} -> {:?}",
                    self.task_id, self.status, next
                ),
            });
        }
        self.status = next;
        Ok(())
    }

    /// Failed attempt re-entering the queue under the retry budget
    pub fn reenter_for_retry(&mut self) {
        self.retry_count += 1;
        self.status = TaskStatus::Pending;
        self.error = None;
        self.completed_at = None;
    }

    /// Fresh pass for the next loop iteration
    pub fn reset_for_iteration(&mut self) {
        self.status = TaskStatus::Pending;
        self.retry_count = 0;
        self.started_at = None;
        self.completed_at = None;
        self.error = None;
        self.output = None;
    }
}

/// Per-status counters, finalized atomically with the terminal status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub pending: usize,
    pub running: usize,
}

/// Runtime instance of a workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecution {
    pub id: String,
    pub workflow_name: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub progress: Progress,
    pub tasks: Vec<TaskExecutionRecord>,
    pub variables: HashMap<String, Value>,
}

impl WorkflowExecution {
    pub fn new(workflow_name: &str, task_ids: impl IntoIterator<Item = String>) -> Self {
        let tasks: Vec<TaskExecutionRecord> = task_ids
            .into_iter()
            .map(TaskExecutionRecord::new)
            .collect();
        let mut exec = Self {
            id: format!("exec-{}", uuid::Uuid::new_v4()),
            workflow_name: workflow_name.to_string(),
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            progress: Progress::default(),
            tasks,
            variables: HashMap::new(),
        };
        exec.sync_progress();
        exec
    }

    pub fn task(&self, task_id: &str) -> Option<&TaskExecutionRecord> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }

    pub fn task_mut(&mut self, task_id: &str) -> Option<&mut TaskExecutionRecord> {
        self.tasks.iter_mut().find(|t| t.task_id == task_id)
    }

    /// Recompute per-status counters from the task records
    pub fn sync_progress(&mut self) {
        let mut progress = Progress {
            total: self.tasks.len(),
            ..Default::default()
        };
        for task in &self.tasks {
            match task.status {
                TaskStatus::Completed => progress.completed += 1,
                TaskStatus::Failed => progress.failed += 1,
                TaskStatus::Skipped => progress.skipped += 1,
                TaskStatus::Cancelled => progress.cancelled += 1,
                TaskStatus::Running => progress.running += 1,
                TaskStatus::Pending | TaskStatus::Ready => progress.pending += 1,
            }
        }
        self.progress = progress;
    }

    /// Set the terminal status, counters, end timestamp, and duration in
    /// one step. Setting a terminal status twice is an engine invariant
    /// violation.
    pub fn finalize(&mut self, status: ExecutionStatus) -> Result<()> {
        if self.status.is_terminal() {
            return Err(WeftError::EngineFatal {
                reason: format!(
                    "execution '{}' finalized twice ({} -> {})",
                    self.id, self.status, status
                ),
            });
        }
        self.sync_progress();
        let completed_at = Utc::now();
        self.duration_ms = Some(
            (completed_at - self.started_at)
                .num_milliseconds()
                .max(0) as u64,
        );
        self.completed_at = Some(completed_at);
        self.status = status;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_transitions_allowed() {
        let mut rec = TaskExecutionRecord::new("t");
        rec.advance(TaskStatus::Ready).unwrap();
        rec.advance(TaskStatus::Running).unwrap();
        rec.advance(TaskStatus::Completed).unwrap();
        assert_eq!(rec.status, TaskStatus::Completed);
    }

    #[test]
    fn skip_from_pending_allowed() {
        let mut rec = TaskExecutionRecord::new("t");
        rec.advance(TaskStatus::Skipped).unwrap();
        assert!(rec.status.is_terminal());
    }

    #[test]
    fn backward_transition_is_fatal() {
        let mut rec = TaskExecutionRecord::new("t");
        rec.advance(TaskStatus::Running).unwrap();
        let err = rec.advance(TaskStatus::Ready).unwrap_err();
        assert!(matches!(err, WeftError::EngineFatal { .. }));
    }

    #[test]
    fn post_terminal_transition_is_fatal() {
        let mut rec = TaskExecutionRecord::new("t");
        rec.advance(TaskStatus::Skipped).unwrap();
        assert!(rec.advance(TaskStatus::Running).is_err());
    }

    #[test]
    fn retry_reentry_increments_count_and_clears_error() {
        let mut rec = TaskExecutionRecord::new("t");
        rec.advance(TaskStatus::Running).unwrap();
        rec.error = Some("boom".to_string());
        rec.reenter_for_retry();
        assert_eq!(rec.status, TaskStatus::Pending);
        assert_eq!(rec.retry_count, 1);
        assert!(rec.error.is_none());
    }

    #[test]
    fn skipped_satisfies_dependency() {
        assert!(TaskStatus::Skipped.satisfies_dependency());
        assert!(TaskStatus::Completed.satisfies_dependency());
        assert!(!TaskStatus::Failed.satisfies_dependency());
        assert!(!TaskStatus::Cancelled.satisfies_dependency());
    }

    #[test]
    fn progress_counts_by_status() {
        let mut exec =
            WorkflowExecution::new("wf", ["a", "b", "c"].iter().map(|s| s.to_string()));
        exec.task_mut("a").unwrap().status = TaskStatus::Completed;
        exec.task_mut("b").unwrap().status = TaskStatus::Failed;
        exec.sync_progress();
        assert_eq!(exec.progress.total, 3);
        assert_eq!(exec.progress.completed, 1);
        assert_eq!(exec.progress.failed, 1);
        assert_eq!(exec.progress.pending, 1);
    }

    #[test]
    fn finalize_sets_everything_atomically() {
        let mut exec = WorkflowExecution::new("wf", ["a"].iter().map(|s| s.to_string()));
        exec.task_mut("a").unwrap().status = TaskStatus::Completed;
        exec.finalize(ExecutionStatus::Completed).unwrap();

        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert!(exec.completed_at.is_some());
        assert!(exec.duration_ms.is_some());
        assert_eq!(exec.progress.completed, 1);
    }

    #[test]
    fn double_finalize_is_fatal() {
        let mut exec = WorkflowExecution::new("wf", ["a"].iter().map(|s| s.to_string()));
        exec.finalize(ExecutionStatus::Completed).unwrap();
        let err = exec.finalize(ExecutionStatus::Failed).unwrap_err();
        assert!(matches!(err, WeftError::EngineFatal { .. }));
    }

    #[test]
    fn execution_serializes_camel_case() {
        let exec = WorkflowExecution::new("wf", ["a"].iter().map(|s| s.to_string()));
        let json = serde_json::to_value(&exec).unwrap();
        assert!(json.get("workflowName").is_some());
        assert!(json.get("startedAt").is_some());
        assert_eq!(json["tasks"][0]["taskId"], "a");
        assert_eq!(json["status"], "running");
    }
}
