//! Shared fixtures for integration tests
#![allow(dead_code)] // Not every test binary uses every fixture

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use weft::{Executor, WeftError, WorkflowDefinition};

/// Parse a workflow definition from inline YAML
pub fn parse(yaml: &str) -> WorkflowDefinition {
    serde_yaml::from_str(yaml).expect("fixture workflow must parse")
}

/// Executor that succeeds after a fixed delay and tracks how many bodies
/// are inside it at once (for concurrency/mutual-exclusion assertions).
pub struct CountingExecutor {
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: AtomicUsize,
}

impl CountingExecutor {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Executor for CountingExecutor {
    async fn execute(
        &self,
        _agent_id: &str,
        _task_type: &str,
        input: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, Value>, WeftError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let outcome = tokio::select! {
            _ = tokio::time::sleep(self.delay) => Ok(input
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect()),
            _ = cancel.cancelled() => Err(WeftError::Cancelled),
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}
