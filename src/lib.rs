//! # Kianax Engine: Routine Execution for Plugin Workflows
//!
//! The engine accepts a user-defined computation graph (a routine) and
//! drives it to completion: validating structure up front, dispatching
//! nodes to plugins as their dependencies complete, honoring conditional
//! branches and loop back-edges, resolving `{{ … }}` expressions against
//! upstream outputs, and publishing per-node state so external observers
//! can render progress in real time.
//!
//! ## Core Concepts
//!
//! - **Routine**: a user-authored graph of plugin invocations with
//!   connections, variables, and trigger data
//! - **Plugin**: an async unit of work with declared input/output ports
//! - **Scheduler**: dependency-respecting concurrent dispatch, with loop
//!   iterations keyed by explicit context stacks
//! - **Expressions**: path-based substitution over variables, upstream
//!   outputs, trigger data, and execution metadata
//! - **Event bus**: broadcast of execution lifecycle events to pluggable
//!   sinks
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use kianax_engine::engine::{ExecutionOptions, RoutineEngine};
//! use kianax_engine::plugins::PluginRegistry;
//! use kianax_engine::routine::{Routine, RoutineNode};
//!
//! # async fn example(my_plugin: Arc<dyn kianax_engine::plugins::Plugin>) -> Result<(), Box<dyn std::error::Error>> {
//! let registry = PluginRegistry::new().with_plugin(my_plugin);
//! let engine = RoutineEngine::new(registry);
//!
//! let routine = Routine {
//!     id: Some("r-1".into()),
//!     name: "hello".into(),
//!     nodes: vec![RoutineNode::new("n1", "my-plugin")],
//!     connections: vec![],
//!     trigger_data: None,
//!     variables: vec![],
//! };
//!
//! let report = engine.execute(&routine, ExecutionOptions::default()).await?;
//! println!("finished: {} ({} nodes)", report.status, report.execution_path.len());
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Guide
//!
//! - [`routine`] - Routine definition model (nodes, connections, variables)
//! - [`validation`] - Structural and expression validation
//! - [`graphs`] - Immutable indexed view of a validated routine
//! - [`expressions`] - `{{ source.path }}` parsing and substitution
//! - [`state`] - The per-run mutable record
//! - [`inputs`] - Input gathering from upstream outputs
//! - [`plugins`] - Plugin trait, port schemas, registry
//! - [`credentials`] - Credential loader interface
//! - [`persistence`] - Persistence sink interface
//! - [`schedulers`] - The control loop, dispatch glue, successor expansion
//! - [`engine`] - Routine submission and terminal reports
//! - [`event_bus`] - Execution event broadcasting and sinks
//! - [`telemetry`] - Event formatting and tracing setup

pub mod credentials;
pub mod engine;
pub mod event_bus;
pub mod expressions;
pub mod graphs;
pub mod inputs;
pub mod persistence;
pub mod plugins;
pub mod routine;
pub mod schedulers;
pub mod state;
pub mod telemetry;
pub mod types;
pub mod utils;
pub mod validation;
