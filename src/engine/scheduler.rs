//! Scheduler / Execution Engine
//!
//! One coordinating loop drives graph traversal; task bodies run as
//! `JoinSet` futures, bounded by a semaphore sized to
//! `settings.maxConcurrency`. Bodies never touch the execution record:
//! they report back as messages and the coordinator applies every
//! mutation. Suspension points (resource acquisition, the executor call,
//! retry backoff timers) all observe the per-execution cancellation token.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::agent::{AgentRegistry, Executor};
use crate::context::ExecutionContext;
use crate::error::{Result, WeftError};
use crate::event::{Event, EventKind, EventLog};
use crate::graph::TaskGraph;
use crate::memory::{SharedStore, StoreOptions};
use crate::resource::{ResourceCoordinator, DEFAULT_ACQUIRE_TIMEOUT};
use crate::validate::validate;
use crate::workflow::{FailurePolicy, LoopKind, TaskDefinition, WorkflowDefinition};

use super::execution::{ExecutionStatus, TaskStatus, WorkflowExecution};
use super::retry::backoff;

/// Namespace used when persisting finished executions to the memory store
const EXECUTIONS_NAMESPACE: &str = "executions";

/// Filter for [`Engine::list_executions`]
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub workflow_name: Option<String>,
    pub status: Option<ExecutionStatus>,
}

#[derive(Clone)]
struct ExecutionHandle {
    record: Arc<Mutex<WorkflowExecution>>,
    cancel: CancellationToken,
    event_log: EventLog,
}

/// Workflow scheduling/execution engine.
///
/// The executor and the optional memory store are injected at
/// construction; the engine owns no process-wide state.
pub struct Engine {
    executor: Arc<dyn Executor>,
    store: Option<SharedStore>,
    executions: Arc<DashMap<String, ExecutionHandle>>,
}

impl Engine {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            executor,
            store: None,
            executions: Arc::new(DashMap::new()),
        }
    }

    /// Attach a memory store for cross-run execution history
    pub fn with_store(mut self, store: SharedStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Execute a workflow definition to completion.
    ///
    /// Task-level failures never escape as errors - a failed run still
    /// returns its complete `WorkflowExecution` record. Only structurally
    /// invalid input (validation errors) or an internal invariant
    /// violation raises.
    #[instrument(skip(self, def), fields(workflow = %def.name))]
    pub async fn execute(&self, def: WorkflowDefinition) -> Result<WorkflowExecution> {
        let validation = validate(&def, true);
        if !validation.is_valid() {
            return Err(WeftError::Validation {
                errors: validation.errors,
            });
        }

        let def = Arc::new(def);
        let record = Arc::new(Mutex::new(WorkflowExecution::new(
            &def.name,
            def.tasks.iter().map(|t| t.id.clone()),
        )));
        let execution_id = record.lock().id.clone();
        let cancel = CancellationToken::new();
        let event_log = EventLog::new();

        self.executions.insert(
            execution_id.clone(),
            ExecutionHandle {
                record: Arc::clone(&record),
                cancel: cancel.clone(),
                event_log: event_log.clone(),
            },
        );

        info!(%execution_id, tasks = def.tasks.len(), "starting workflow execution");
        let run = Run::new(
            Arc::clone(&def),
            Arc::clone(&record),
            Arc::clone(&self.executor),
            event_log.clone(),
            cancel,
        );

        if let Err(fatal) = run.drive().await {
            // Invariant violations force the execution to failed and
            // surface; they are never swallowed.
            let mut rec = record.lock();
            if !rec.status.is_terminal() {
                let _ = rec.finalize(ExecutionStatus::Failed);
            }
            return Err(fatal);
        }

        let snapshot = record.lock().clone();
        self.persist(&snapshot).await;
        Ok(snapshot)
    }

    /// Cancel a running execution. In-flight tasks are signalled to abort
    /// cooperatively; not-yet-started tasks are marked cancelled.
    pub fn cancel(&self, execution_id: &str) -> Result<()> {
        let handle = self
            .executions
            .get(execution_id)
            .ok_or_else(|| WeftError::ExecutionNotFound {
                execution_id: execution_id.to_string(),
            })?;
        let status = handle.record.lock().status;
        if status.is_terminal() {
            return Err(WeftError::ExecutionFinished {
                execution_id: execution_id.to_string(),
                status: status.to_string(),
            });
        }
        info!(execution_id, "cancelling execution");
        handle.cancel.cancel();
        Ok(())
    }

    /// Snapshot of one execution (live counters recomputed)
    pub fn execution(&self, execution_id: &str) -> Option<WorkflowExecution> {
        self.executions.get(execution_id).map(|h| {
            let mut snapshot = h.record.lock().clone();
            snapshot.sync_progress();
            snapshot
        })
    }

    /// Snapshots of all known executions matching the filter
    pub fn list_executions(&self, filter: &ExecutionFilter) -> Vec<WorkflowExecution> {
        self.executions
            .iter()
            .map(|h| {
                let mut snapshot = h.value().record.lock().clone();
                snapshot.sync_progress();
                snapshot
            })
            .filter(|e| {
                filter
                    .workflow_name
                    .as_ref()
                    .is_none_or(|name| &e.workflow_name == name)
                    && filter.status.is_none_or(|s| e.status == s)
            })
            .collect()
    }

    /// Event trail of one execution
    pub fn events(&self, execution_id: &str) -> Option<Vec<Event>> {
        self.executions
            .get(execution_id)
            .map(|h| h.event_log.events())
    }

    async fn persist(&self, execution: &WorkflowExecution) {
        let Some(store) = &self.store else { return };
        let value = match serde_json::to_value(execution) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "failed to serialize execution for persistence");
                return;
            }
        };
        if let Err(e) = store
            .store(
                &execution.id,
                value,
                &StoreOptions::namespace(EXECUTIONS_NAMESPACE),
            )
            .await
        {
            // History is best-effort; scheduling must not depend on it
            warn!(error = %e, execution_id = %execution.id, "failed to persist execution");
        }
    }
}

// ─────────────────────────────────────────────────────────────
// Per-run coordinator
// ─────────────────────────────────────────────────────────────

enum WorkerMsg {
    Body {
        index: usize,
        duration_ms: u64,
        result: Result<HashMap<String, Value>>,
    },
    RetryReady {
        index: usize,
    },
}

struct LoopRuntime {
    /// 1-based count of passes started
    iteration: u32,
    /// Iterations that ended with at least one failed body task
    failed_iterations: u32,
    done: bool,
}

struct Run {
    def: Arc<WorkflowDefinition>,
    graph: TaskGraph,
    ctx: ExecutionContext,
    record: Arc<Mutex<WorkflowExecution>>,
    registry: AgentRegistry,
    coordinator: ResourceCoordinator,
    event_log: EventLog,
    cancel: CancellationToken,
    semaphore: Arc<Semaphore>,
    task_index: FxHashMap<String, usize>,
    /// task id -> index into `loops` (a task belongs to at most one loop)
    loop_of: FxHashMap<String, usize>,
    loops: Vec<LoopRuntime>,
    /// Tasks parked on a backoff timer; excluded from dispatch
    retry_pending: FxHashSet<usize>,
    failed_fast: bool,
    timed_out: bool,
}

impl Run {
    fn new(
        def: Arc<WorkflowDefinition>,
        record: Arc<Mutex<WorkflowExecution>>,
        executor: Arc<dyn Executor>,
        event_log: EventLog,
        cancel: CancellationToken,
    ) -> Self {
        let graph = TaskGraph::from_workflow(&def);
        let ctx = ExecutionContext::with_variables(def.variables.clone());
        let registry = AgentRegistry::new(&def.agents, executor);
        let coordinator = ResourceCoordinator::with_event_log(event_log.clone());
        let semaphore = Arc::new(Semaphore::new(def.settings.max_concurrency.max(1)));

        let task_index = def
            .tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.clone(), i))
            .collect();
        let mut loop_of = FxHashMap::default();
        let mut loops = Vec::with_capacity(def.loops.len());
        for (li, lp) in def.loops.iter().enumerate() {
            for body in &lp.tasks {
                loop_of.insert(body.clone(), li);
            }
            loops.push(LoopRuntime {
                iteration: 1,
                failed_iterations: 0,
                done: false,
            });
        }

        Self {
            def,
            graph,
            ctx,
            record,
            registry,
            coordinator,
            event_log,
            cancel,
            semaphore,
            task_index,
            loop_of,
            loops,
            retry_pending: FxHashSet::default(),
            failed_fast: false,
            timed_out: false,
        }
    }

    #[instrument(skip(self), fields(workflow = %self.def.name))]
    async fn drive(mut self) -> Result<()> {
        let execution_id = self.record.lock().id.clone();
        self.event_log.emit(EventKind::WorkflowStarted {
            execution_id: execution_id.clone(),
            workflow_name: self.def.name.clone(),
            task_count: self.def.tasks.len(),
        });

        self.init_loops()?;

        let deadline = self
            .def
            .settings
            .timeout
            .map(|secs| Instant::now() + Duration::from_secs(secs));
        let mut join_set: JoinSet<WorkerMsg> = JoinSet::new();

        loop {
            if self.cancel.is_cancelled() {
                self.drain_cancelled(&mut join_set).await?;
                break;
            }

            if !self.failed_fast {
                let ready = self.collect_ready()?;
                for index in ready {
                    // Readiness marking may itself have tripped fail-fast
                    if self.failed_fast {
                        break;
                    }
                    match Arc::clone(&self.semaphore).try_acquire_owned() {
                        Ok(permit) => self.dispatch(index, permit, &mut join_set)?,
                        Err(_) => break, // concurrency limit reached
                    }
                }
            }

            if join_set.is_empty() {
                // Nothing running and nothing dispatchable: the graph is
                // exhausted (dependents of failed ancestors stay pending).
                break;
            }

            let joined = match deadline {
                Some(d) => {
                    match tokio::time::timeout_at(d.into(), join_set.join_next()).await {
                        Ok(joined) => joined,
                        Err(_elapsed) => {
                            warn!(%execution_id, "workflow timeout elapsed");
                            self.timed_out = true;
                            self.cancel.cancel();
                            continue;
                        }
                    }
                }
                None => join_set.join_next().await,
            };

            match joined {
                Some(Ok(msg)) => self.process(msg, &mut join_set)?,
                Some(Err(join_err)) => {
                    return Err(WeftError::EngineFatal {
                        reason: format!("task body panicked: {}", join_err),
                    });
                }
                None => unreachable!("join_set checked non-empty"),
            }
        }

        self.finalize(&execution_id)
    }

    /// Initialize loop variables; while-loops whose condition is false at
    /// the start skip their bodies without running them.
    fn init_loops(&mut self) -> Result<()> {
        for li in 0..self.def.loops.len() {
            let lp = &self.def.loops[li];
            self.ctx
                .set_variable(format!("{}.iteration", lp.id), Value::from(0u32));

            if lp.kind == LoopKind::While {
                match self.eval_loop_condition(li) {
                    Ok(true) => {}
                    Ok(false) => {
                        let lp = &self.def.loops[li];
                        let body_ids = lp.tasks.clone();
                        let loop_id: Arc<str> = Arc::from(lp.id.as_str());
                        let condition = lp.condition.clone().unwrap_or_default();
                        let mut rec = self.record.lock();
                        for body in &body_ids {
                            if let Some(task) = rec.task_mut(body) {
                                task.advance(TaskStatus::Skipped)?;
                                task.completed_at = Some(Utc::now());
                                self.event_log.emit(EventKind::TaskSkipped {
                                    task_id: Arc::from(body.as_str()),
                                    condition: condition.clone(),
                                });
                            }
                        }
                        rec.sync_progress();
                        drop(rec);
                        self.loops[li].done = true;
                        self.event_log.emit(EventKind::LoopCompleted {
                            loop_id,
                            iterations: 0,
                            failures: 0,
                        });
                    }
                    Err(e) => self.fail_workflow_level(&format!(
                        "loop '{}' condition failed: {}",
                        self.def.loops[li].id, e
                    )),
                }
            }
        }
        Ok(())
    }

    fn eval_loop_condition(&self, li: usize) -> Result<bool> {
        let lp = &self.def.loops[li];
        let Some(condition_id) = &lp.condition else {
            // A while-loop without a condition degenerates to count
            return Ok(true);
        };
        let cond = self
            .def
            .condition(condition_id)
            .ok_or_else(|| WeftError::Condition {
                reason: format!("unknown condition '{}'", condition_id),
            })?;
        self.ctx.evaluate_condition(&cond.expression, &cond.language)
    }

    /// A workflow-level fault (not attributable to one task): stop
    /// scheduling and let finalize mark the run failed.
    fn fail_workflow_level(&mut self, error: &str) {
        warn!(error, "workflow-level failure");
        let execution_id = self.record.lock().id.clone();
        self.event_log.emit(EventKind::WorkflowFailed {
            execution_id,
            error: error.to_string(),
            failed_task: None,
        });
        self.failed_fast = true;
    }

    /// Find pending tasks whose dependencies are satisfied: condition
    /// true -> dispatch candidate, condition false -> Skipped, condition
    /// error -> Failed (a task-level failure, not a scheduler crash).
    /// Candidates stay `Pending` until a concurrency slot is actually
    /// available, so a fail-fast abort leaves them untouched.
    fn collect_ready(&mut self) -> Result<Vec<usize>> {
        let mut ready = Vec::new();
        let mut terminal_now: Vec<usize> = Vec::new();
        {
            let mut rec = self.record.lock();
            for (index, task) in self.def.tasks.iter().enumerate() {
                if rec.tasks[index].status != TaskStatus::Pending
                    || self.retry_pending.contains(&index)
                    || !self.deps_satisfied(task, &rec)
                {
                    continue;
                }

                match self.check_condition(task) {
                    Ok(None) => ready.push(index),
                    Ok(Some(condition_id)) => {
                        rec.tasks[index].advance(TaskStatus::Skipped)?;
                        rec.tasks[index].completed_at = Some(Utc::now());
                        self.event_log.emit(EventKind::TaskSkipped {
                            task_id: Arc::from(task.id.as_str()),
                            condition: condition_id,
                        });
                        terminal_now.push(index);
                    }
                    Err(e) => {
                        rec.tasks[index].error = Some(e.to_string());
                        rec.tasks[index].advance(TaskStatus::Failed)?;
                        rec.tasks[index].completed_at = Some(Utc::now());
                        self.event_log.emit(EventKind::TaskFailed {
                            task_id: Arc::from(task.id.as_str()),
                            error: e.to_string(),
                            duration_ms: 0,
                        });
                        terminal_now.push(index);
                    }
                }
            }
            rec.sync_progress();
        }
        for index in terminal_now {
            self.handle_terminal(index)?;
        }
        Ok(ready)
    }

    /// Every dependency is terminal and non-blocking, and any loop the
    /// dependency belongs to has finished (unless the dependent is a body
    /// of the same loop).
    fn deps_satisfied(&self, task: &TaskDefinition, rec: &WorkflowExecution) -> bool {
        let own_loop = self.loop_of.get(&task.id);
        self.graph.dependencies(&task.id).iter().all(|dep| {
            let Some(&dep_index) = self.task_index.get(dep.as_ref()) else {
                return false;
            };
            if !rec.tasks[dep_index].status.satisfies_dependency() {
                return false;
            }
            match self.loop_of.get(dep.as_ref()) {
                Some(dep_loop) if Some(dep_loop) != own_loop => self.loops[*dep_loop].done,
                _ => true,
            }
        })
    }

    /// None = run it; Some(condition_id) = condition evaluated false
    fn check_condition(&self, task: &TaskDefinition) -> Result<Option<String>> {
        let Some(condition_id) = &task.condition else {
            return Ok(None);
        };
        let cond = self
            .def
            .condition(condition_id)
            .ok_or_else(|| WeftError::Condition {
                reason: format!("unknown condition '{}'", condition_id),
            })?;
        if self.ctx.evaluate_condition(&cond.expression, &cond.language)? {
            Ok(None)
        } else {
            Ok(Some(condition_id.clone()))
        }
    }

    fn dispatch(
        &mut self,
        index: usize,
        permit: OwnedSemaphorePermit,
        join_set: &mut JoinSet<WorkerMsg>,
    ) -> Result<()> {
        let task = Arc::clone(&self.def.tasks[index]);
        let attempt = {
            let mut rec = self.record.lock();
            rec.tasks[index].advance(TaskStatus::Ready)?;
            rec.tasks[index].advance(TaskStatus::Running)?;
            if rec.tasks[index].started_at.is_none() {
                rec.tasks[index].started_at = Some(Utc::now());
            }
            rec.sync_progress();
            rec.tasks[index].retry_count
        };

        self.event_log.emit(EventKind::TaskScheduled {
            task_id: Arc::from(task.id.as_str()),
            dependencies: self.graph.dependencies(&task.id).to_vec(),
        });
        debug!(task_id = %task.id, attempt, "dispatching task");

        let ctx = self.ctx.clone();
        let registry = self.registry.clone();
        let coordinator = self.coordinator.clone();
        let event_log = self.event_log.clone();
        let cancel = self.cancel.clone();

        join_set.spawn(async move {
            let started = Instant::now();
            let result =
                run_body(&task, ctx, registry, coordinator, event_log, cancel, attempt).await;
            drop(permit);
            WorkerMsg::Body {
                index,
                duration_ms: started.elapsed().as_millis() as u64,
                result,
            }
        });
        Ok(())
    }

    fn process(&mut self, msg: WorkerMsg, join_set: &mut JoinSet<WorkerMsg>) -> Result<()> {
        match msg {
            WorkerMsg::RetryReady { index } => {
                self.retry_pending.remove(&index);
                Ok(())
            }
            WorkerMsg::Body {
                index,
                duration_ms,
                result,
            } => self.process_body(index, duration_ms, result, join_set),
        }
    }

    fn process_body(
        &mut self,
        index: usize,
        duration_ms: u64,
        result: Result<HashMap<String, Value>>,
        join_set: &mut JoinSet<WorkerMsg>,
    ) -> Result<()> {
        let task = Arc::clone(&self.def.tasks[index]);
        let task_id: Arc<str> = Arc::from(task.id.as_str());

        match result {
            Ok(output) => {
                for (field, value) in &output {
                    self.ctx.set_output(&task.id, field, value.clone());
                }
                let output_value: Arc<Value> =
                    Arc::new(Value::Object(output.into_iter().collect()));
                let mut rec = self.record.lock();
                rec.tasks[index].output = Some(Arc::clone(&output_value));
                rec.tasks[index].advance(TaskStatus::Completed)?;
                rec.tasks[index].completed_at = Some(Utc::now());
                rec.sync_progress();
                drop(rec);
                self.event_log.emit(EventKind::TaskCompleted {
                    task_id,
                    output: output_value,
                    duration_ms,
                });
                self.handle_terminal(index)
            }
            Err(WeftError::Cancelled) => {
                let mut rec = self.record.lock();
                rec.tasks[index].advance(TaskStatus::Cancelled)?;
                rec.tasks[index].completed_at = Some(Utc::now());
                rec.sync_progress();
                drop(rec);
                self.event_log.emit(EventKind::TaskCancelled { task_id });
                self.handle_terminal(index)
            }
            Err(error) => {
                let retries_left = {
                    let rec = self.record.lock();
                    rec.tasks[index].retry_count < task.retries
                };
                if retries_left && !self.cancel.is_cancelled() {
                    self.schedule_retry(index, &error, join_set)
                } else {
                    let mut rec = self.record.lock();
                    rec.tasks[index].error = Some(error.to_string());
                    rec.tasks[index].advance(TaskStatus::Failed)?;
                    rec.tasks[index].completed_at = Some(Utc::now());
                    rec.sync_progress();
                    drop(rec);
                    self.event_log.emit(EventKind::TaskFailed {
                        task_id,
                        error: error.to_string(),
                        duration_ms,
                    });
                    self.handle_terminal(index)
                }
            }
        }
    }

    fn schedule_retry(
        &mut self,
        index: usize,
        error: &WeftError,
        join_set: &mut JoinSet<WorkerMsg>,
    ) -> Result<()> {
        let task = &self.def.tasks[index];
        let retry_count = {
            let mut rec = self.record.lock();
            rec.tasks[index].reenter_for_retry();
            rec.sync_progress();
            rec.tasks[index].retry_count
        };
        let delay = backoff(self.def.settings.retry_policy, retry_count);
        debug!(task_id = %task.id, retry_count, backoff_ms = delay.as_millis() as u64,
               error = %error, "retrying task");
        self.event_log.emit(EventKind::TaskRetried {
            task_id: Arc::from(task.id.as_str()),
            retry_count,
            backoff_ms: delay.as_millis() as u64,
        });
        if !delay.is_zero() {
            // Park the task until the backoff timer fires; the timer keeps
            // the join set non-empty so the run cannot finish early.
            self.retry_pending.insert(index);
            join_set.spawn(async move {
                tokio::time::sleep(delay).await;
                WorkerMsg::RetryReady { index }
            });
        }
        Ok(())
    }

    /// Post-terminal bookkeeping: loop advancement and failure policy
    fn handle_terminal(&mut self, index: usize) -> Result<()> {
        let task_id = self.def.tasks[index].id.clone();
        if let Some(&li) = self.loop_of.get(&task_id) {
            if !self.loops[li].done {
                return self.advance_loop(li);
            }
        }
        let failed = self.record.lock().tasks[index].status == TaskStatus::Failed;
        if failed {
            self.apply_failure_policy(&task_id);
        }
        Ok(())
    }

    fn apply_failure_policy(&mut self, task_id: &str) {
        match self.def.settings.failure_policy {
            FailurePolicy::FailFast => {
                if !self.failed_fast {
                    warn!(task_id, "fail-fast: aborting workflow scheduling");
                    let execution_id = self.record.lock().id.clone();
                    self.event_log.emit(EventKind::WorkflowFailed {
                        execution_id,
                        error: format!("task '{}' failed", task_id),
                        failed_task: Some(Arc::from(task_id)),
                    });
                    self.failed_fast = true;
                }
            }
            FailurePolicy::Continue => {
                debug!(task_id, "task failed; continuing independent branches");
            }
        }
    }

    /// Called when a body task of loop `li` reached a terminal state. If
    /// the whole iteration is terminal, decide: next pass, or done.
    fn advance_loop(&mut self, li: usize) -> Result<()> {
        let lp = &self.def.loops[li];
        let loop_id: Arc<str> = Arc::from(lp.id.as_str());
        let body_ids = lp.tasks.clone();

        let (all_terminal, any_failed) = {
            let rec = self.record.lock();
            let statuses: Vec<TaskStatus> = body_ids
                .iter()
                .filter_map(|id| rec.task(id).map(|t| t.status))
                .collect();
            (
                statuses.iter().all(|s| s.is_terminal()),
                statuses.iter().any(|s| *s == TaskStatus::Failed),
            )
        };
        if !all_terminal {
            return Ok(());
        }

        if any_failed {
            self.loops[li].failed_iterations += 1;
        }

        let lp = &self.def.loops[li];
        // A cancelled run never starts another pass
        let aborted = (any_failed && !lp.continue_on_error) || self.cancel.is_cancelled();
        let exhausted = self.loops[li].iteration >= lp.max_iterations;
        let continue_while = if lp.kind == LoopKind::While && !aborted && !exhausted {
            match self.eval_loop_condition(li) {
                Ok(keep_going) => keep_going,
                Err(e) => {
                    self.fail_workflow_level(&format!(
                        "loop '{}' condition failed: {}",
                        self.def.loops[li].id, e
                    ));
                    false
                }
            }
        } else {
            true
        };

        if aborted || exhausted || !continue_while {
            self.loops[li].done = true;
            self.event_log.emit(EventKind::LoopCompleted {
                loop_id,
                iterations: self.loops[li].iteration,
                failures: self.loops[li].failed_iterations,
            });
            // Bodies left failed by the final iteration escalate normally
            let failed_bodies: Vec<String> = {
                let rec = self.record.lock();
                body_ids
                    .iter()
                    .filter(|id| {
                        rec.task(id)
                            .is_some_and(|t| t.status == TaskStatus::Failed)
                    })
                    .cloned()
                    .collect()
            };
            for id in failed_bodies {
                self.apply_failure_policy(&id);
            }
            return Ok(());
        }

        // Next pass: bump the iteration, expose the 0-based index, and
        // reset the bodies to pending.
        self.loops[li].iteration += 1;
        let iteration = self.loops[li].iteration;
        let lp = &self.def.loops[li];
        self.ctx
            .set_variable(format!("{}.iteration", lp.id), Value::from(iteration - 1));
        self.event_log.emit(EventKind::LoopIteration {
            loop_id,
            iteration: iteration - 1,
        });
        let mut rec = self.record.lock();
        for id in &body_ids {
            if let Some(task) = rec.task_mut(id) {
                task.reset_for_iteration();
            }
        }
        rec.sync_progress();
        Ok(())
    }

    /// Cancellation: mark not-yet-started tasks cancelled, then drain
    /// in-flight bodies (they observe the token at their suspension
    /// points and report their true outcome).
    async fn drain_cancelled(&mut self, join_set: &mut JoinSet<WorkerMsg>) -> Result<()> {
        {
            let mut rec = self.record.lock();
            for index in 0..rec.tasks.len() {
                let status = rec.tasks[index].status;
                if matches!(status, TaskStatus::Pending | TaskStatus::Ready) {
                    rec.tasks[index].advance(TaskStatus::Cancelled)?;
                    rec.tasks[index].completed_at = Some(Utc::now());
                    self.event_log.emit(EventKind::TaskCancelled {
                        task_id: Arc::from(rec.tasks[index].task_id.as_str()),
                    });
                }
            }
            rec.sync_progress();
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(WorkerMsg::RetryReady { .. }) => {}
                Ok(WorkerMsg::Body {
                    index,
                    duration_ms,
                    result,
                }) => {
                    // No retries once cancellation is in progress; the
                    // normal path handles Cancelled/Completed/Failed.
                    self.process_body(index, duration_ms, result, join_set)?;
                }
                Err(join_err) => {
                    return Err(WeftError::EngineFatal {
                        reason: format!("task body panicked during cancellation: {}", join_err),
                    });
                }
            }
        }
        Ok(())
    }

    fn finalize(self, execution_id: &str) -> Result<()> {
        let status = {
            let rec = self.record.lock();
            let any_failed = rec
                .tasks
                .iter()
                .any(|t| t.status == TaskStatus::Failed);
            if self.timed_out {
                ExecutionStatus::Failed
            } else if self.cancel.is_cancelled() {
                ExecutionStatus::Cancelled
            } else if self.failed_fast || any_failed {
                ExecutionStatus::Failed
            } else {
                ExecutionStatus::Completed
            }
        };

        {
            let mut rec = self.record.lock();
            rec.variables = self.ctx.variables_snapshot();
            rec.finalize(status)?;
        }

        let total_duration_ms = self.record.lock().duration_ms.unwrap_or(0);
        match status {
            ExecutionStatus::Completed => {
                info!(execution_id, total_duration_ms, "workflow completed");
                self.event_log.emit(EventKind::WorkflowCompleted {
                    execution_id: execution_id.to_string(),
                    total_duration_ms,
                });
            }
            ExecutionStatus::Cancelled => {
                info!(execution_id, "workflow cancelled");
                self.event_log.emit(EventKind::WorkflowCancelled {
                    execution_id: execution_id.to_string(),
                });
            }
            ExecutionStatus::Failed => {
                let error = if self.timed_out {
                    "workflow timeout elapsed".to_string()
                } else {
                    "one or more tasks failed".to_string()
                };
                info!(execution_id, %error, "workflow failed");
                self.event_log.emit(EventKind::WorkflowFailed {
                    execution_id: execution_id.to_string(),
                    error,
                    failed_task: None,
                });
            }
            ExecutionStatus::Running => unreachable!("finalize always picks a terminal status"),
        }
        Ok(())
    }
}

/// One task body: resolve input, acquire the declared resource, invoke
/// the external executor (racing the per-task timeout), and release the
/// resource on every exit path.
async fn run_body(
    task: &TaskDefinition,
    ctx: ExecutionContext,
    registry: AgentRegistry,
    coordinator: ResourceCoordinator,
    event_log: EventLog,
    cancel: CancellationToken,
    attempt: u32,
) -> Result<HashMap<String, Value>> {
    let body_start = Instant::now();

    let input = ctx.resolve_input(&task.input)?;
    event_log.emit(EventKind::TaskStarted {
        task_id: Arc::from(task.id.as_str()),
        inputs: serde_json::to_value(&input).unwrap_or(Value::Null),
        attempt,
    });

    if let Some(resource) = &task.resource {
        let acquire_timeout = task.timeout_duration().unwrap_or(DEFAULT_ACQUIRE_TIMEOUT);
        coordinator
            .acquire_with_cancel(resource, &task.id, acquire_timeout, &cancel)
            .await?;
    }

    let invoke = registry.invoke(task.assign_to.as_deref(), &task.task_type, &input, &cancel);
    let result = match task.timeout_duration() {
        Some(total) => {
            // The budget covers acquisition too; whatever the lock wait
            // consumed is gone.
            let remaining = total.saturating_sub(body_start.elapsed());
            match tokio::time::timeout(remaining, invoke).await {
                Ok(r) => r,
                Err(_elapsed) => Err(WeftError::TaskTimeout {
                    task_id: task.id.clone(),
                    timeout_ms: total.as_millis() as u64,
                }),
            }
        }
        None => invoke.await,
    };

    if let Some(resource) = &task.resource {
        if let Err(e) = coordinator.release(resource, &task.id) {
            warn!(task_id = %task.id, %resource, error = %e, "failed to release resource");
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{MockBehavior, MockExecutor};

    fn engine_with(executor: MockExecutor) -> (Engine, Arc<MockExecutor>) {
        let executor = Arc::new(executor);
        (
            Engine::new(Arc::clone(&executor) as Arc<dyn Executor>),
            executor,
        )
    }

    fn parse(yaml: &str) -> WorkflowDefinition {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[tokio::test]
    async fn invalid_workflow_rejected_before_running() {
        let (engine, _) = engine_with(MockExecutor::new());
        let def = parse("name: bad\ntasks:\n  - id: a\n    depends: [ghost]");
        let err = engine.execute(def).await.unwrap_err();
        assert!(matches!(err, WeftError::Validation { .. }));
    }

    #[tokio::test]
    async fn single_task_completes() {
        let (engine, executor) = engine_with(MockExecutor::new());
        executor.script("only", MockBehavior::ok().output("done", Value::from(true)));
        let def = parse(
            "name: single\ntasks:\n  - id: only\n    input:\n      cmd: only",
        );

        let exec = engine.execute(def).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(exec.progress.completed, 1);
        let task = exec.task("only").unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.started_at.is_some());
        assert!(task.completed_at.is_some());
    }

    #[tokio::test]
    async fn cancel_of_unknown_execution_errors() {
        let (engine, _) = engine_with(MockExecutor::new());
        let err = engine.cancel("exec-nope").unwrap_err();
        assert!(matches!(err, WeftError::ExecutionNotFound { .. }));
    }

    #[tokio::test]
    async fn cancel_of_finished_execution_errors() {
        let (engine, _) = engine_with(MockExecutor::new());
        let def = parse("name: quick\ntasks:\n  - id: a");
        let exec = engine.execute(def).await.unwrap();
        let err = engine.cancel(&exec.id).unwrap_err();
        assert!(matches!(err, WeftError::ExecutionFinished { .. }));
    }

    #[tokio::test]
    async fn list_executions_filters_by_name_and_status() {
        let (engine, _) = engine_with(MockExecutor::new());
        engine
            .execute(parse("name: first\ntasks:\n  - id: a"))
            .await
            .unwrap();
        engine
            .execute(parse("name: second\ntasks:\n  - id: a"))
            .await
            .unwrap();

        let all = engine.list_executions(&ExecutionFilter::default());
        assert_eq!(all.len(), 2);

        let named = engine.list_executions(&ExecutionFilter {
            workflow_name: Some("first".to_string()),
            status: None,
        });
        assert_eq!(named.len(), 1);
        assert_eq!(named[0].workflow_name, "first");

        let completed = engine.list_executions(&ExecutionFilter {
            workflow_name: None,
            status: Some(ExecutionStatus::Completed),
        });
        assert_eq!(completed.len(), 2);
    }

    #[tokio::test]
    async fn events_are_recorded_per_execution() {
        let (engine, _) = engine_with(MockExecutor::new());
        let exec = engine
            .execute(parse("name: traced\ntasks:\n  - id: a"))
            .await
            .unwrap();

        let events = engine.events(&exec.id).unwrap();
        assert!(matches!(
            events.first().map(|e| &e.kind),
            Some(EventKind::WorkflowStarted { .. })
        ));
        assert!(matches!(
            events.last().map(|e| &e.kind),
            Some(EventKind::WorkflowCompleted { .. })
        ));
    }
}
