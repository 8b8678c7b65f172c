//! Weft - DAG workflow scheduling engine with resource coordination
//!
//! Weft validates a workflow graph, decides execution order, runs tasks
//! with bounded concurrency and layered failure handling (retries,
//! timeouts, fail-fast vs continue), and arbitrates access to named
//! resources shared between concurrently running tasks - including
//! deadlock detection over the wait-for graph.
//!
//! The actual work is delegated to an external [`Executor`]; persistence
//! is an optional injected [`MemoryStore`] handle.

pub mod agent;
pub mod context;
pub mod engine;
pub mod error;
pub mod event;
pub mod expr;
pub mod graph;
pub mod loader;
pub mod memory;
pub mod resource;
pub mod validate;
pub mod workflow;

pub use agent::{AgentRegistry, Executor, MockBehavior, MockExecutor};
pub use context::ExecutionContext;
pub use engine::{
    Engine, ExecutionFilter, ExecutionStatus, Progress, TaskExecutionRecord, TaskStatus,
    WorkflowExecution,
};
pub use error::{FixSuggestion, Result, WeftError};
pub use event::{Event, EventKind, EventLog};
pub use graph::TaskGraph;
pub use loader::load_workflow;
pub use memory::{InMemoryStore, MemoryStore, SharedStore, StoreEntry, StoreOptions};
pub use resource::{ResourceCoordinator, ResourceLockInfo, DEFAULT_ACQUIRE_TIMEOUT};
pub use validate::{validate, ValidationResult};
pub use workflow::{
    AgentDefinition, ConditionDefinition, FailurePolicy, LoopDefinition, LoopKind, RetryPolicy,
    TaskDefinition, WorkflowDefinition, WorkflowSettings,
};
