//! The engine: routine submission, per-run wiring, and the terminal report.
//!
//! [`RoutineEngine`] owns the long-lived collaborators — plugin registry,
//! credential loader, persistence sink, event bus — and `execute()` owns
//! everything per-run: validation, graph construction, execution state, and
//! the scheduler. There is no engine-wide mutable state; two concurrent
//! `execute()` calls share nothing but the injected collaborators.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::credentials::{CredentialLoader, NoCredentials};
use crate::event_bus::{Event, EventBus, StdOutSink};
use crate::expressions::ExecutionMeta;
use crate::graphs::ExecutionGraph;
use crate::persistence::{ExecutionRecord, LoggingSink, NullSink, PersistenceSink, StatusUpdate};
use crate::plugins::PluginRegistry;
use crate::routine::Routine;
use crate::schedulers::{
    CancelToken, DispatchEnv, ExecutionCallbacks, RunLimits, Scheduler,
};
use crate::state::{ExecutionState, NodeRunRecord, PathEntry};
use crate::types::ExecutionStatus;
use crate::utils::id_generator::IdGenerator;
use crate::validation::{validate_routine, validate_with_registry, ValidationReport};

/// Event-bus settings for engine-built buses.
#[derive(Clone, Debug)]
pub struct EventBusConfig {
    pub buffer_capacity: usize,
    /// Attach the default stdout sink.
    pub stdout_sink: bool,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 1024,
            stdout_sink: true,
        }
    }
}

impl EventBusConfig {
    #[must_use]
    pub fn build_event_bus(&self) -> EventBus {
        let sinks: Vec<Box<dyn crate::event_bus::EventSink>> = if self.stdout_sink {
            vec![Box::new(StdOutSink::default())]
        } else {
            Vec::new()
        };
        EventBus::with_capacity(sinks, self.buffer_capacity)
    }
}

/// Engine-level configuration, resolved once at construction.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// In-flight plugin-call cap. Overridable per run.
    pub parallelism: usize,
    pub event_bus: EventBusConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        dotenvy::dotenv().ok();
        let parallelism = std::env::var("KIANAX_MAX_PARALLEL")
            .ok()
            .and_then(|raw| raw.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            });
        Self {
            parallelism,
            event_bus: EventBusConfig::default(),
        }
    }
}

/// Per-run options.
#[derive(Clone, Debug, Default)]
pub struct ExecutionOptions {
    /// Wall-clock bound; exceeding it aborts with `TIMEOUT`.
    pub max_execution_time: Option<Duration>,
    /// Total plugin-dispatch bound across all iterations; exceeding it
    /// aborts with `BUDGET_EXCEEDED`.
    pub max_executions: Option<u32>,
    /// Override of the engine's parallelism cap for this run.
    pub parallelism: Option<usize>,
    /// Log a run summary at `info` when done.
    pub verbose: bool,
    /// Cooperative cancellation; keep a clone and call `cancel()`.
    pub cancel: CancelToken,
    /// Recorded on the persistence sink's execution row.
    pub trigger_type: Option<String>,
    pub user_id: Option<String>,
}

/// One entry of the terminal error list.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionError {
    /// Taxonomy tag, e.g. `PLUGIN_EXECUTION_FAILED` or `TIMEOUT`.
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_key: Option<String>,
}

/// What `execute()` returns.
#[derive(Clone, Debug)]
pub struct ExecutionReport {
    pub status: ExecutionStatus,
    pub execution_id: String,
    /// Node id → completed runs, in run order.
    pub node_results: FxHashMap<String, Vec<NodeRunRecord>>,
    /// `(nodeId, runIndex)` in completion order.
    pub execution_path: Vec<PathEntry>,
    pub errors: Vec<ExecutionError>,
}

impl ExecutionReport {
    /// Node ids of the execution path, in order. Convenience for tests and
    /// dashboards.
    #[must_use]
    pub fn path_node_ids(&self) -> Vec<&str> {
        self.execution_path
            .iter()
            .map(|entry| entry.node_id.as_str())
            .collect()
    }

    /// Latest output of a node, if it ran.
    #[must_use]
    pub fn latest_output(&self, node_id: &str) -> Option<&crate::plugins::NodeOutput> {
        self.node_results
            .get(node_id)?
            .last()
            .map(|record| &record.output)
    }
}

/// Errors from routine submission.
#[derive(Debug, Error, Diagnostic)]
pub enum EngineError {
    /// The validator found structural or expression errors; nothing was
    /// dispatched and no sink events were emitted.
    #[error("routine rejected: {}", report.summarize_errors())]
    #[diagnostic(
        code(kianax::engine::rejected),
        help("Fix the reported validation errors and resubmit.")
    )]
    Rejected { report: ValidationReport },
}

/// The routine execution engine.
pub struct RoutineEngine {
    plugins: Arc<PluginRegistry>,
    credential_loader: Arc<dyn CredentialLoader>,
    sink: Arc<dyn PersistenceSink>,
    event_bus: Arc<EventBus>,
    config: EngineConfig,
    ids: IdGenerator,
}

impl RoutineEngine {
    /// Engine over a plugin registry, with defaults everywhere else: no
    /// credentials, no persistence, stdout events.
    #[must_use]
    pub fn new(plugins: PluginRegistry) -> Self {
        let config = EngineConfig::default();
        let event_bus = Arc::new(config.event_bus.build_event_bus());
        Self {
            plugins: Arc::new(plugins),
            credential_loader: Arc::new(NoCredentials),
            sink: Arc::new(NullSink),
            event_bus,
            config,
            ids: IdGenerator::new(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.event_bus = Arc::new(config.event_bus.build_event_bus());
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_credential_loader(mut self, loader: Arc<dyn CredentialLoader>) -> Self {
        self.credential_loader = loader;
        self
    }

    #[must_use]
    pub fn with_persistence_sink(mut self, sink: Arc<dyn PersistenceSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Replace the event bus, e.g. with channel or memory sinks.
    #[must_use]
    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Arc::new(bus);
        self
    }

    #[must_use]
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Registry-aware pre-flight validation.
    #[must_use]
    pub fn validate(&self, routine: &Routine) -> ValidationReport {
        validate_with_registry(routine, &self.plugins)
    }

    /// Execute a routine with no callbacks.
    pub async fn execute(
        &self,
        routine: &Routine,
        options: ExecutionOptions,
    ) -> Result<ExecutionReport, EngineError> {
        self.execute_with_callbacks(routine, ExecutionCallbacks::default(), options)
            .await
    }

    /// Execute a routine, invoking `callbacks` as node state transitions
    /// are recorded.
    pub async fn execute_with_callbacks(
        &self,
        routine: &Routine,
        callbacks: ExecutionCallbacks,
        options: ExecutionOptions,
    ) -> Result<ExecutionReport, EngineError> {
        let report = validate_routine(routine);
        if !report.valid {
            return Err(EngineError::Rejected { report });
        }

        let graph = Arc::new(ExecutionGraph::from_routine(routine));
        let execution_id = self.ids.generate_execution_id();
        let workflow_id = self.ids.generate_workflow_id();
        let routine_id = routine
            .id
            .clone()
            .unwrap_or_else(|| routine.name.clone());
        let meta = ExecutionMeta {
            execution_id: execution_id.clone(),
            routine_id: routine_id.clone(),
            started_at: Utc::now(),
        };

        self.event_bus.listen_for_events();
        let emitter = self.event_bus.emitter();
        let _ = emitter.emit(Event::execution_started(&execution_id, &routine_id));

        let sink = LoggingSink::new(Arc::clone(&self.sink));
        sink.create_execution(ExecutionRecord {
            routine_id: routine_id.clone(),
            user_id: options.user_id.clone(),
            workflow_id: workflow_id.clone(),
            run_id: execution_id.clone(),
            trigger_type: options
                .trigger_type
                .clone()
                .unwrap_or_else(|| "manual".into()),
            trigger_data: routine.trigger_data.clone(),
        })
        .await;

        let env = Arc::new(DispatchEnv {
            graph: Arc::clone(&graph),
            plugins: Arc::clone(&self.plugins),
            credentials: Arc::clone(&self.credential_loader),
            meta,
            workflow_id: workflow_id.clone(),
            user_id: options.user_id.clone(),
        });

        let scheduler = Scheduler::new(options.parallelism.unwrap_or(self.config.parallelism));
        let limits = RunLimits {
            max_execution_time: options.max_execution_time,
            max_executions: options.max_executions,
        };

        let mut state = ExecutionState::new();
        let outcome = scheduler
            .run(
                Arc::clone(&env),
                &mut state,
                &sink,
                Arc::clone(&emitter),
                &callbacks,
                limits,
                options.cancel.clone(),
            )
            .await;

        let mut errors: Vec<ExecutionError> = state
            .errors()
            .map(|record| ExecutionError {
                kind: record.kind.clone(),
                message: record.message.clone(),
                node_id: Some(record.node_id.clone()),
                context_key: Some(record.context_key.to_string()),
            })
            .collect();
        errors.sort_by(|a, b| a.context_key.cmp(&b.context_key));
        if let Some(run_error) = &outcome.run_error {
            errors.push(ExecutionError {
                kind: run_error.kind.to_string(),
                message: run_error.message.clone(),
                node_id: None,
                context_key: None,
            });
        }

        let path_summary: Vec<String> = state
            .execution_path()
            .iter()
            .map(|entry| format!("{}:{}", entry.node_id, entry.run_index))
            .collect();
        sink.update_status(StatusUpdate {
            workflow_id,
            status: outcome.status,
            execution_path: Some(path_summary),
            error: errors.first().map(|e| format!("{}: {}", e.kind, e.message)),
            completed_at: Some(Utc::now()),
        })
        .await;
        let _ = emitter.emit(Event::execution_finished(
            &execution_id,
            &routine_id,
            outcome.status,
        ));

        if options.verbose {
            tracing::info!(
                execution = %execution_id,
                status = %outcome.status,
                dispatches = outcome.dispatches,
                path_len = state.execution_path().len(),
                errors = errors.len(),
                "execution finished"
            );
        }

        Ok(ExecutionReport {
            status: outcome.status,
            execution_id,
            node_results: state.node_runs().clone(),
            execution_path: state.execution_path().to_vec(),
            errors,
        })
    }

    /// Close the event bus and drain its listener, guaranteeing every sink
    /// saw every published event. Call once when done with the engine.
    pub async fn shutdown(&self) {
        self.event_bus.shutdown().await;
    }
}

impl std::fmt::Debug for RoutineEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutineEngine")
            .field("plugins", &self.plugins.len())
            .field("parallelism", &self.config.parallelism)
            .finish()
    }
}
