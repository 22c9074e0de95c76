//! The graph iterator: readiness computation, bounded concurrent dispatch,
//! result recording, and successor expansion.
//!
//! A single logical control loop owns the run. It seeds the queue from the
//! graph's entry nodes, moves ready tasks into a [`JoinSet`] bounded by the
//! parallelism cap, and as each plugin call completes records the result,
//! publishes observability events, and expands successors — including loop
//! re-entries under fresh contexts. Input gathering, successor computation,
//! and state updates are synchronous; dispatched plugin calls are the only
//! suspension points.
//!
//! # Ordering guarantees
//!
//! - For any non-loop edge `u → v`, `u`'s result is fully recorded before
//!   `v` is observed as ready in the same context.
//! - Loop iteration `k+1` of an edge dispatches strictly after iteration
//!   `k` completes along at least one path.
//! - Sibling tasks in the same ready batch have no defined ordering.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::instrument;

use crate::event_bus::{Event, EventEmitter};
use crate::graphs::ExecutionGraph;
use crate::persistence::{LoggingSink, NodeResultRecord};
use crate::plugins::NodeOutput;
use crate::state::{ErrorRecord, ExecutionState, NodeRunRecord};
use crate::types::{ContextKey, ExecutionStatus, LoopStack};

use super::dispatch::{self, DispatchEnv, DispatchError};
use super::successors::expand_successors;

/// One unit of schedulable work: a node under a loop-stack context.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Task {
    pub node_id: String,
    pub stack: LoopStack,
}

impl Task {
    #[must_use]
    pub fn root(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            stack: LoopStack::root(),
        }
    }

    #[must_use]
    pub fn key(&self) -> ContextKey {
        self.stack.context_key(&self.node_id)
    }
}

/// Readiness of a queued task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Readiness {
    /// Every gating predecessor completed; dispatch now.
    Ready,
    /// Some predecessor is still queued or running.
    Pending,
    /// A gating predecessor failed; this task can never run.
    Unreachable,
}

/// Cooperative cancellation handle. Cloneable; cancelling stops new
/// dispatches while in-flight tasks run to completion.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Wall-clock and dispatch-count bounds for one run.
#[derive(Clone, Copy, Debug, Default)]
pub struct RunLimits {
    pub max_execution_time: Option<Duration>,
    pub max_executions: Option<u32>,
}

/// Observability callbacks, invoked with results already recorded in state
/// so handlers can publish durable updates atomically with respect to it.
#[derive(Clone, Default)]
pub struct ExecutionCallbacks {
    pub on_node_start: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    pub on_node_complete: Option<Arc<dyn Fn(&NodeRunRecord) + Send + Sync>>,
    pub on_node_error: Option<Arc<dyn Fn(&ErrorRecord) + Send + Sync>>,
}

impl ExecutionCallbacks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn on_start(mut self, handler: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_node_start = Some(Arc::new(handler));
        self
    }

    #[must_use]
    pub fn on_complete(mut self, handler: impl Fn(&NodeRunRecord) + Send + Sync + 'static) -> Self {
        self.on_node_complete = Some(Arc::new(handler));
        self
    }

    #[must_use]
    pub fn on_error(mut self, handler: impl Fn(&ErrorRecord) + Send + Sync + 'static) -> Self {
        self.on_node_error = Some(Arc::new(handler));
        self
    }
}

impl std::fmt::Debug for ExecutionCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionCallbacks")
            .field("on_node_start", &self.on_node_start.is_some())
            .field("on_node_complete", &self.on_node_complete.is_some())
            .field("on_node_error", &self.on_node_error.is_some())
            .finish()
    }
}

/// Run-level terminal error (timeout, budget, cancellation).
#[derive(Clone, Debug)]
pub struct RunError {
    pub kind: &'static str,
    pub message: String,
}

/// What the scheduler hands back to the engine.
#[derive(Clone, Debug)]
pub struct SchedulerOutcome {
    pub status: ExecutionStatus,
    pub run_error: Option<RunError>,
    pub dispatches: u32,
}

struct TaskCompletion {
    task: Task,
    started_at: DateTime<Utc>,
    completed_at: DateTime<Utc>,
    input_value: Value,
    result: Result<NodeOutput, DispatchError>,
}

/// The control loop. One instance drives one `execute()` call.
#[derive(Clone, Copy, Debug)]
pub struct Scheduler {
    parallelism: usize,
}

impl Scheduler {
    /// A scheduler dispatching at most `parallelism` plugin calls at once.
    #[must_use]
    pub fn new(parallelism: usize) -> Self {
        Self {
            parallelism: parallelism.max(1),
        }
    }

    #[must_use]
    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Drive the run to completion: seed entries, dispatch ready tasks,
    /// record results, expand successors, and stop when both the queue and
    /// the in-flight set are empty.
    #[instrument(skip_all, fields(routine = %env.meta.routine_id))]
    pub async fn run(
        &self,
        env: Arc<DispatchEnv>,
        state: &mut ExecutionState,
        sink: &LoggingSink,
        emitter: Arc<dyn EventEmitter>,
        callbacks: &ExecutionCallbacks,
        limits: RunLimits,
        cancel: CancelToken,
    ) -> SchedulerOutcome {
        let membership = env.graph.loop_membership();
        let deadline = limits
            .max_execution_time
            .map(|timeout| tokio::time::Instant::now() + timeout);

        let mut queue: VecDeque<Task> = VecDeque::new();
        let mut queued: FxHashSet<ContextKey> = FxHashSet::default();
        let mut in_flight: JoinSet<TaskCompletion> = JoinSet::new();
        let mut dispatches: u32 = 0;
        let mut terminal: Option<RunError> = None;

        for entry in env.graph.entry_nodes() {
            let task = Task::root(entry);
            queued.insert(task.key());
            queue.push_back(task);
        }

        loop {
            if terminal.is_none() {
                if cancel.is_cancelled() {
                    terminal = Some(RunError {
                        kind: "CANCELLED",
                        message: "execution cancelled".into(),
                    });
                    let _ = emitter.emit(Event::diagnostic(
                        "scheduler",
                        "cancellation requested; no further dispatches",
                    ));
                } else if deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
                    terminal = Some(RunError {
                        kind: "TIMEOUT",
                        message: format!(
                            "exceeded maxExecutionTime of {:?}",
                            limits.max_execution_time.unwrap_or_default()
                        ),
                    });
                    let _ = emitter.emit(Event::diagnostic("scheduler", "execution timed out"));
                }
            }

            if terminal.is_none() {
                self.dispatch_ready(
                    &env,
                    state,
                    &membership,
                    &mut queue,
                    &mut queued,
                    &mut in_flight,
                    &mut dispatches,
                    &mut terminal,
                    &emitter,
                    callbacks,
                    sink,
                    limits,
                )
                .await;
            }

            if !in_flight.is_empty() {
                let joined = if let (None, Some(until)) = (&terminal, deadline) {
                    match tokio::time::timeout_at(until, in_flight.join_next()).await {
                        Ok(joined) => joined,
                        Err(_) => continue, // deadline hit; top of loop records it
                    }
                } else {
                    in_flight.join_next().await
                };

                match joined {
                    Some(Ok(completion)) => {
                        self.handle_completion(
                            &env, state, sink, &emitter, callbacks, &mut queue, &mut queued,
                            completion, terminal.is_some(),
                        )
                        .await;
                    }
                    Some(Err(join_error)) => {
                        tracing::error!(error = %join_error, "plugin task aborted");
                        let _ = emitter.emit(Event::diagnostic(
                            "scheduler",
                            format!("plugin task aborted: {join_error}"),
                        ));
                    }
                    None => {}
                }
                continue;
            }

            if queue.is_empty() {
                break;
            }

            // Nothing running and nothing dispatchable: the remaining tasks
            // are unreachable (joins behind an untaken branch, descendants
            // of failures) or the run is winding down after a terminal
            // error. Drop them and finish.
            let dropped: Vec<String> = queue.iter().map(|t| t.key().to_string()).collect();
            tracing::debug!(?dropped, "dropping unreachable queued tasks");
            let _ = emitter.emit(Event::diagnostic(
                "scheduler",
                format!("dropping {} unreachable queued task(s)", dropped.len()),
            ));
            queue.clear();
            queued.clear();
            break;
        }

        let status = match &terminal {
            Some(error) if error.kind == "CANCELLED" => ExecutionStatus::Cancelled,
            Some(_) => ExecutionStatus::Failed,
            None if state.has_errors() => ExecutionStatus::Failed,
            None => ExecutionStatus::Completed,
        };

        SchedulerOutcome {
            status,
            run_error: terminal,
            dispatches,
        }
    }

    /// Move every currently-ready task from the queue into the join set,
    /// respecting the parallelism cap and the dispatch budget.
    #[allow(clippy::too_many_arguments)]
    async fn dispatch_ready(
        &self,
        env: &Arc<DispatchEnv>,
        state: &mut ExecutionState,
        membership: &FxHashMap<String, FxHashSet<String>>,
        queue: &mut VecDeque<Task>,
        queued: &mut FxHashSet<ContextKey>,
        in_flight: &mut JoinSet<TaskCompletion>,
        dispatches: &mut u32,
        terminal: &mut Option<RunError>,
        emitter: &Arc<dyn EventEmitter>,
        callbacks: &ExecutionCallbacks,
        sink: &LoggingSink,
        limits: RunLimits,
    ) {
        let mut index = 0;
        while index < queue.len() {
            if in_flight.len() >= self.parallelism {
                break;
            }
            let Some(task) = queue.get(index).cloned() else {
                break;
            };
            let key = task.key();

            if state.is_executed(&key) || state.is_running(&key) || state.has_error(&key) {
                queue.remove(index);
                queued.remove(&key);
                continue;
            }

            match readiness(&env.graph, state, membership, &task) {
                Readiness::Pending => {
                    index += 1;
                }
                Readiness::Unreachable => {
                    tracing::debug!(%key, "task unreachable; dropped");
                    queue.remove(index);
                    queued.remove(&key);
                }
                Readiness::Ready => {
                    if let Some(budget) = limits.max_executions
                        && *dispatches >= budget
                    {
                        *terminal = Some(RunError {
                            kind: "BUDGET_EXCEEDED",
                            message: format!("exceeded maxExecutions of {budget}"),
                        });
                        let _ = emitter.emit(Event::diagnostic(
                            "scheduler",
                            "dispatch budget exhausted",
                        ));
                        return;
                    }
                    queue.remove(index);
                    queued.remove(&key);
                    *dispatches += 1;
                    self.dispatch(env, state, task, in_flight, emitter, callbacks, sink)
                        .await;
                }
            }
        }
    }

    /// Dispatch one ready task: prepare synchronously, then spawn the
    /// plugin call. Preparation failures fail the task without a spawn.
    async fn dispatch(
        &self,
        env: &Arc<DispatchEnv>,
        state: &mut ExecutionState,
        task: Task,
        in_flight: &mut JoinSet<TaskCompletion>,
        emitter: &Arc<dyn EventEmitter>,
        callbacks: &ExecutionCallbacks,
        sink: &LoggingSink,
    ) {
        let key = task.key();
        let Some(node) = env.graph.node(&task.node_id).cloned() else {
            tracing::error!(node = %task.node_id, "task references a node missing from the graph");
            return;
        };

        state.mark_running(key.clone());
        let _ = emitter.emit(Event::node_started(&task.node_id, &key));
        if let Some(handler) = &callbacks.on_node_start {
            handler(&task.node_id);
        }

        let started_at = Utc::now();
        match dispatch::prepare(env, state, &task, &node) {
            Ok(call) => {
                let input_value = call.inputs.to_value();
                let env = Arc::clone(env);
                in_flight.spawn(async move {
                    let result = dispatch::execute_prepared(call, env).await;
                    TaskCompletion {
                        task,
                        started_at,
                        completed_at: Utc::now(),
                        input_value,
                        result,
                    }
                });
            }
            Err(error) => {
                self.record_failure(
                    state, sink, emitter, callbacks, &env.workflow_id, &task, started_at,
                    Utc::now(), None, &error,
                )
                .await;
            }
        }
    }

    /// Process one finished plugin call: record, publish, expand.
    #[allow(clippy::too_many_arguments)]
    async fn handle_completion(
        &self,
        env: &Arc<DispatchEnv>,
        state: &mut ExecutionState,
        sink: &LoggingSink,
        emitter: &Arc<dyn EventEmitter>,
        callbacks: &ExecutionCallbacks,
        queue: &mut VecDeque<Task>,
        queued: &mut FxHashSet<ContextKey>,
        completion: TaskCompletion,
        winding_down: bool,
    ) {
        let TaskCompletion {
            task,
            started_at,
            completed_at,
            input_value,
            result,
        } = completion;
        let key = task.key();

        match result {
            Ok(output) => {
                let run_index = state.add_node_result(
                    &task.node_id,
                    key.clone(),
                    output.clone(),
                    started_at,
                    completed_at,
                );
                let _ = emitter.emit(Event::node_succeeded(&task.node_id, &key, run_index));
                if let Some(handler) = &callbacks.on_node_complete
                    && let Some(record) = state
                        .node_runs()
                        .get(&task.node_id)
                        .and_then(|runs| runs.last())
                {
                    handler(record);
                }
                sink.store_node_result(NodeResultRecord {
                    workflow_id: env.workflow_id.clone(),
                    node_id: task.node_id.clone(),
                    status: "succeeded".into(),
                    input: Some(input_value),
                    output: Some(output.to_value()),
                    error: None,
                    started_at,
                    completed_at,
                })
                .await;

                if winding_down {
                    return;
                }
                match expand_successors(&env.graph, state, &task, &output) {
                    Ok(tasks) => {
                        for successor in tasks {
                            let successor_key = successor.key();
                            if queued.contains(&successor_key)
                                || state.is_executed(&successor_key)
                                || state.is_running(&successor_key)
                                || state.has_error(&successor_key)
                            {
                                continue;
                            }
                            queued.insert(successor_key);
                            queue.push_back(successor);
                        }
                    }
                    Err(error) => {
                        // The node itself succeeded; routing its output did
                        // not. The task's descendants never enqueue.
                        self.record_failure(
                            state,
                            sink,
                            emitter,
                            callbacks,
                            &env.workflow_id,
                            &task,
                            started_at,
                            completed_at,
                            None,
                            &error,
                        )
                        .await;
                    }
                }
            }
            Err(error) => {
                self.record_failure(
                    state,
                    sink,
                    emitter,
                    callbacks,
                    &env.workflow_id,
                    &task,
                    started_at,
                    completed_at,
                    Some(input_value),
                    &error,
                )
                .await;
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_failure(
        &self,
        state: &mut ExecutionState,
        sink: &LoggingSink,
        emitter: &Arc<dyn EventEmitter>,
        callbacks: &ExecutionCallbacks,
        workflow_id: &str,
        task: &Task,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        input_value: Option<Value>,
        error: &DispatchError,
    ) {
        let key = task.key();
        let record = ErrorRecord {
            context_key: key.clone(),
            node_id: task.node_id.clone(),
            kind: error.kind_tag().to_string(),
            message: error.to_string(),
            stack: error.stack().map(str::to_string),
            when: completed_at,
        };
        state.record_error(record.clone());

        let _ = emitter.emit(Event::node_failed(&task.node_id, &key, record.message.clone()));
        if let Some(handler) = &callbacks.on_node_error {
            handler(&record);
        }
        sink.store_node_result(NodeResultRecord {
            workflow_id: workflow_id.to_string(),
            node_id: task.node_id.clone(),
            status: "failed".into(),
            input: input_value,
            output: None,
            error: Some(record.message.clone()),
            started_at,
            completed_at,
        })
        .await;
    }
}

/// Compute a task's readiness from its incoming non-loop edges.
///
/// For each gating edge the required context is the deepest prefix of the
/// task's stack whose loop body contains the source — sources inside the
/// current loop must complete in the *current* iteration, while sources
/// above it satisfy readiness from an enclosing scope. Disabled sources
/// never gate.
#[must_use]
pub fn readiness(
    graph: &ExecutionGraph,
    state: &ExecutionState,
    membership: &FxHashMap<String, FxHashSet<String>>,
    task: &Task,
) -> Readiness {
    for edge in graph.edges_into(&task.node_id) {
        if edge.is_loop() {
            continue;
        }
        let source = edge.source_node_id.as_str();
        if graph.node(source).is_none_or(|node| !node.enabled) {
            continue;
        }
        let required = required_key(&task.stack, source, membership);
        if state.is_executed(&required) {
            continue;
        }
        if state.has_error(&required) || state.error_in_scope(source, &task.stack) {
            return Readiness::Unreachable;
        }
        return Readiness::Pending;
    }
    Readiness::Ready
}

/// The context key under which `source` must have completed for a task
/// running under `stack`.
fn required_key(
    stack: &LoopStack,
    source: &str,
    membership: &FxHashMap<String, FxHashSet<String>>,
) -> ContextKey {
    let frames = stack.frames();
    for end in (0..frames.len()).rev() {
        let frame = &frames[end];
        if membership
            .get(&frame.edge_id)
            .is_some_and(|members| members.contains(source))
        {
            let prefix = LoopStack::from(frames[..=end].to_vec());
            return prefix.context_key(source);
        }
    }
    LoopStack::root().context_key(source)
}
