//! Session/Agent registry and the external executor boundary
//!
//! The engine never runs a task body itself: it resolves the task's
//! `assignTo` to a live agent session and forwards the invocation to an
//! [`Executor`] - the external terminal/agent pool. Sessions are spun up
//! lazily per agent id and track per-session stats.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, WeftError};
use crate::workflow::AgentDefinition;

/// Agent id used when a task has no `assignTo`
pub const DEFAULT_AGENT: &str = "default";

/// External executor boundary (terminal/agent pool).
///
/// Implementations must observe the cancellation token: a cancelled
/// execution may abandon the call, and a well-behaved executor stops the
/// underlying work.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        agent_id: &str,
        task_type: &str,
        input: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, Value>>;
}

/// A live session bound to one agent role
#[derive(Debug)]
pub struct AgentSession {
    pub session_id: Uuid,
    pub agent_id: String,
    pub agent_type: String,
    pub created_at: DateTime<Utc>,
    tasks_executed: AtomicU64,
}

impl AgentSession {
    fn new(agent_id: &str, agent_type: &str) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            agent_id: agent_id.to_string(),
            agent_type: agent_type.to_string(),
            created_at: Utc::now(),
            tasks_executed: AtomicU64::new(0),
        }
    }

    pub fn tasks_executed(&self) -> u64 {
        self.tasks_executed.load(Ordering::Relaxed)
    }
}

/// Maps `assignTo` ids to live sessions and forwards invocations to the
/// external executor.
///
/// Clone is shallow; clones share sessions and the executor handle.
#[derive(Clone)]
pub struct AgentRegistry {
    agents: Arc<HashMap<String, AgentDefinition>>,
    sessions: Arc<DashMap<String, Arc<AgentSession>>>,
    executor: Arc<dyn Executor>,
}

impl AgentRegistry {
    pub fn new(agents: &[AgentDefinition], executor: Arc<dyn Executor>) -> Self {
        let agents = agents
            .iter()
            .map(|a| (a.id.clone(), a.clone()))
            .collect::<HashMap<_, _>>();
        Self {
            agents: Arc::new(agents),
            sessions: Arc::new(DashMap::new()),
            executor,
        }
    }

    /// Get or lazily create the session for an agent id
    pub fn session(&self, agent_id: &str) -> Result<Arc<AgentSession>> {
        use dashmap::mapref::entry::Entry;

        // Unknown agents are rejected; validation normally catches this
        // before execution, but the registry is the last line.
        let agent_type = if agent_id == DEFAULT_AGENT {
            self.agents
                .get(agent_id)
                .map(|a| a.agent_type.clone())
                .unwrap_or_default()
        } else {
            self.agents
                .get(agent_id)
                .ok_or_else(|| WeftError::AgentNotFound {
                    agent_id: agent_id.to_string(),
                })?
                .agent_type
                .clone()
        };

        match self.sessions.entry(agent_id.to_string()) {
            Entry::Occupied(e) => Ok(Arc::clone(e.get())),
            Entry::Vacant(e) => {
                let session = Arc::new(AgentSession::new(agent_id, &agent_type));
                debug!(agent_id, session_id = %session.session_id, "agent session created");
                e.insert(Arc::clone(&session));
                Ok(session)
            }
        }
    }

    /// Forward one task invocation to the external executor
    pub async fn invoke(
        &self,
        assign_to: Option<&str>,
        task_type: &str,
        input: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, Value>> {
        let agent_id = assign_to.unwrap_or(DEFAULT_AGENT);
        let session = self.session(agent_id)?;
        session.tasks_executed.fetch_add(1, Ordering::Relaxed);
        self.executor
            .execute(agent_id, task_type, input, cancel)
            .await
    }

    /// Snapshot of live sessions
    pub fn sessions(&self) -> Vec<Arc<AgentSession>> {
        self.sessions.iter().map(|r| Arc::clone(r.value())).collect()
    }
}

// ─────────────────────────────────────────────────────────────
// Mock executor for tests
// ─────────────────────────────────────────────────────────────

/// Scripted behavior for one match key
#[derive(Debug, Clone, Default)]
pub struct MockBehavior {
    /// Output map returned on success
    pub output: HashMap<String, Value>,
    /// Fail this many invocations before succeeding
    pub fail_times: u32,
    /// Never succeed
    pub fail_always: bool,
    /// Simulated work duration
    pub delay_ms: u64,
}

impl MockBehavior {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn output(mut self, field: &str, value: Value) -> Self {
        self.output.insert(field.to_string(), value);
        self
    }

    pub fn fail_times(mut self, n: u32) -> Self {
        self.fail_times = n;
        self
    }

    pub fn fail_always(mut self) -> Self {
        self.fail_always = true;
        self
    }

    pub fn delay_ms(mut self, ms: u64) -> Self {
        self.delay_ms = ms;
        self
    }
}

/// One recorded invocation
#[derive(Debug, Clone)]
pub struct MockCall {
    pub agent_id: String,
    pub task_type: String,
    pub input: HashMap<String, String>,
}

/// Mock executor that returns configurable results without real work.
///
/// Behaviors are matched by the `cmd` input entry when present, then by
/// task type. Unmatched invocations succeed with an empty output map.
#[derive(Default)]
pub struct MockExecutor {
    behaviors: DashMap<String, MockBehavior>,
    attempts: DashMap<String, u32>,
    calls: parking_lot::Mutex<Vec<MockCall>>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the behavior for a match key (`cmd` input value or task type)
    pub fn script(&self, key: &str, behavior: MockBehavior) {
        self.behaviors.insert(key.to_string(), behavior);
    }

    /// All invocations made, in order
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    /// How many invocations matched the given key
    pub fn call_count(&self, key: &str) -> u32 {
        self.attempts.get(key).map(|r| *r.value()).unwrap_or(0)
    }

    fn match_key(task_type: &str, input: &HashMap<String, String>) -> String {
        input
            .get("cmd")
            .cloned()
            .unwrap_or_else(|| task_type.to_string())
    }
}

#[async_trait]
impl Executor for MockExecutor {
    async fn execute(
        &self,
        agent_id: &str,
        task_type: &str,
        input: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, Value>> {
        self.calls.lock().push(MockCall {
            agent_id: agent_id.to_string(),
            task_type: task_type.to_string(),
            input: input.clone(),
        });

        let key = Self::match_key(task_type, input);
        let attempt = {
            let mut entry = self.attempts.entry(key.clone()).or_insert(0);
            *entry += 1;
            *entry
        };

        let behavior = self
            .behaviors
            .get(&key)
            .map(|r| r.value().clone())
            .unwrap_or_default();

        if behavior.delay_ms > 0 {
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_millis(behavior.delay_ms)) => {}
                _ = cancel.cancelled() => return Err(WeftError::Cancelled),
            }
        }

        if behavior.fail_always || attempt <= behavior.fail_times {
            return Err(WeftError::Executor(format!(
                "scripted failure for '{}' (attempt {})",
                key, attempt
            )));
        }

        Ok(behavior.output)
    }
}
