//! EventLog - append-only execution audit trail
//!
//! - Event: envelope with id + timestamp + kind
//! - EventKind: workflow, task, and resource level variants
//! - EventLog: thread-safe, append-only log
//!
//! Timestamps are milliseconds relative to log creation (workflow start).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Single event in the execution log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence ID (for ordering)
    pub id: u64,
    /// Time since workflow start (ms)
    pub timestamp_ms: u64,
    /// Event type and data
    pub kind: EventKind,
}

/// All possible event types.
///
/// Uses Arc<str> for task_id fields to enable zero-cost cloning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    // ═══════════════════════════════════════════
    // WORKFLOW LEVEL
    // ═══════════════════════════════════════════
    WorkflowStarted {
        execution_id: String,
        workflow_name: String,
        task_count: usize,
    },
    WorkflowCompleted {
        execution_id: String,
        total_duration_ms: u64,
    },
    WorkflowFailed {
        execution_id: String,
        error: String,
        failed_task: Option<Arc<str>>,
    },
    WorkflowCancelled {
        execution_id: String,
    },

    // ═══════════════════════════════════════════
    // TASK LEVEL
    // ═══════════════════════════════════════════
    TaskScheduled {
        task_id: Arc<str>,
        dependencies: Vec<Arc<str>>,
    },
    /// Task dispatched with its resolved input
    TaskStarted {
        task_id: Arc<str>,
        inputs: Value,
        attempt: u32,
    },
    TaskCompleted {
        task_id: Arc<str>,
        output: Arc<Value>,
        duration_ms: u64,
    },
    TaskFailed {
        task_id: Arc<str>,
        error: String,
        duration_ms: u64,
    },
    TaskSkipped {
        task_id: Arc<str>,
        condition: String,
    },
    TaskRetried {
        task_id: Arc<str>,
        retry_count: u32,
        backoff_ms: u64,
    },
    TaskCancelled {
        task_id: Arc<str>,
    },

    // ═══════════════════════════════════════════
    // RESOURCE LEVEL
    // ═══════════════════════════════════════════
    ResourceAcquired {
        resource_id: Arc<str>,
        owner_id: Arc<str>,
        waited_ms: u64,
    },
    ResourceReleased {
        resource_id: Arc<str>,
        owner_id: Arc<str>,
    },
    DeadlockDetected {
        resource_id: Arc<str>,
        owner_id: Arc<str>,
    },

    // ═══════════════════════════════════════════
    // LOOP LEVEL
    // ═══════════════════════════════════════════
    LoopIteration {
        loop_id: Arc<str>,
        iteration: u32,
    },
    LoopCompleted {
        loop_id: Arc<str>,
        iterations: u32,
        failures: u32,
    },
}

impl EventKind {
    /// Extract task_id if event is task-related
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::TaskScheduled { task_id, .. }
            | Self::TaskStarted { task_id, .. }
            | Self::TaskCompleted { task_id, .. }
            | Self::TaskFailed { task_id, .. }
            | Self::TaskSkipped { task_id, .. }
            | Self::TaskRetried { task_id, .. }
            | Self::TaskCancelled { task_id } => Some(task_id),
            _ => None,
        }
    }

    /// Check if this is a workflow-level event
    pub fn is_workflow_event(&self) -> bool {
        matches!(
            self,
            Self::WorkflowStarted { .. }
                | Self::WorkflowCompleted { .. }
                | Self::WorkflowFailed { .. }
                | Self::WorkflowCancelled { .. }
        )
    }

    /// Check if this is a resource-coordination event
    pub fn is_resource_event(&self) -> bool {
        matches!(
            self,
            Self::ResourceAcquired { .. }
                | Self::ResourceReleased { .. }
                | Self::DeadlockDetected { .. }
        )
    }
}

/// Thread-safe, append-only event log
#[derive(Clone)]
pub struct EventLog {
    events: Arc<RwLock<Vec<Event>>>,
    start_time: Instant,
    next_id: Arc<AtomicU64>,
}

impl EventLog {
    /// Create a new event log (call at workflow start)
    pub fn new() -> Self {
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
            start_time: Instant::now(),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Emit an event (thread-safe, returns event ID)
    pub fn emit(&self, kind: EventKind) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let event = Event {
            id,
            timestamp_ms: self.start_time.elapsed().as_millis() as u64,
            kind,
        };

        self.events.write().push(event);
        id
    }

    /// Get all events (cloned - use `with_events` for zero-copy access)
    pub fn events(&self) -> Vec<Event> {
        self.events.read().clone()
    }

    /// Zero-copy access to events via callback.
    ///
    /// Holds the read lock for the duration of the callback - keep it short.
    pub fn with_events<T>(&self, f: impl FnOnce(&[Event]) -> T) -> T {
        f(&self.events.read())
    }

    /// Filter events by task ID
    pub fn filter_task(&self, task_id: &str) -> Vec<Event> {
        self.with_events(|events| {
            events
                .iter()
                .filter(|e| e.kind.task_id() == Some(task_id))
                .cloned()
                .collect()
        })
    }

    /// Filter workflow-level events only
    pub fn workflow_events(&self) -> Vec<Event> {
        self.with_events(|events| {
            events
                .iter()
                .filter(|e| e.kind.is_workflow_event())
                .cloned()
                .collect()
        })
    }

    /// Filter resource-coordination events only
    pub fn resource_events(&self) -> Vec<Event> {
        self.with_events(|events| {
            events
                .iter()
                .filter(|e| e.kind.is_resource_event())
                .cloned()
                .collect()
        })
    }

    /// Serialize to JSON for persistence/debugging
    pub fn to_json(&self) -> Value {
        self.with_events(|events| serde_json::to_value(events).unwrap_or(Value::Null))
    }

    /// Number of events
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn workflow_started(task_count: usize) -> EventKind {
        EventKind::WorkflowStarted {
            execution_id: "exec-1".to_string(),
            workflow_name: "test".to_string(),
            task_count,
        }
    }

    #[test]
    fn emit_returns_monotonic_ids() {
        let log = EventLog::new();
        let id1 = log.emit(workflow_started(2));
        let id2 = log.emit(EventKind::TaskScheduled {
            task_id: "t1".into(),
            dependencies: vec![],
        });
        assert_eq!(id1, 0);
        assert_eq!(id2, 1);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn task_id_extraction() {
        let started = EventKind::TaskStarted {
            task_id: "task1".into(),
            inputs: json!({}),
            attempt: 0,
        };
        assert_eq!(started.task_id(), Some("task1"));
        assert_eq!(workflow_started(1).task_id(), None);
        assert_eq!(
            EventKind::ResourceAcquired {
                resource_id: "r".into(),
                owner_id: "o".into(),
                waited_ms: 0,
            }
            .task_id(),
            None
        );
    }

    #[test]
    fn filter_task_returns_only_matching() {
        let log = EventLog::new();
        log.emit(workflow_started(2));
        log.emit(EventKind::TaskStarted {
            task_id: "alpha".into(),
            inputs: json!({}),
            attempt: 0,
        });
        log.emit(EventKind::TaskStarted {
            task_id: "beta".into(),
            inputs: json!({}),
            attempt: 0,
        });
        log.emit(EventKind::TaskCompleted {
            task_id: "alpha".into(),
            output: Arc::new(json!("out")),
            duration_ms: 10,
        });

        assert_eq!(log.filter_task("alpha").len(), 2);
        assert_eq!(log.filter_task("beta").len(), 1);
    }

    #[test]
    fn resource_events_filtered() {
        let log = EventLog::new();
        log.emit(EventKind::ResourceAcquired {
            resource_id: "db".into(),
            owner_id: "t1".into(),
            waited_ms: 5,
        });
        log.emit(EventKind::TaskCancelled { task_id: "t1".into() });
        log.emit(EventKind::ResourceReleased {
            resource_id: "db".into(),
            owner_id: "t1".into(),
        });

        assert_eq!(log.resource_events().len(), 2);
    }

    #[test]
    fn serializes_with_type_tag() {
        let kind = EventKind::TaskSkipped {
            task_id: "gate".into(),
            condition: "flag".to_string(),
        };
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["type"], "task_skipped");
        assert_eq!(json["task_id"], "gate");
    }

    #[test]
    fn clones_share_underlying_log() {
        let log = EventLog::new();
        let cloned = log.clone();
        log.emit(workflow_started(1));
        assert_eq!(cloned.len(), 1);
    }

    #[test]
    fn concurrent_emits_produce_unique_ids() {
        use std::thread;

        let log = EventLog::new();
        let handles: Vec<_> = (0..10)
            .map(|i| {
                let log = log.clone();
                thread::spawn(move || {
                    log.emit(EventKind::TaskScheduled {
                        task_id: Arc::from(format!("task{}", i)),
                        dependencies: vec![],
                    })
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        let mut ids: Vec<u64> = log.events().iter().map(|e| e.id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 10);
    }
}
