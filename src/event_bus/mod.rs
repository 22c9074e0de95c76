//! Event bus: fan-out of execution lifecycle events to pluggable sinks.
//!
//! The engine publishes every observable transition — execution started,
//! node started/succeeded/failed, execution finished — through a
//! broadcast-based [`EventHub`]. An [`EventBus`] attaches sinks (stdout,
//! memory, JSON lines, flume channels) and runs the listener that fans
//! events out to them; consumers wanting a raw stream subscribe for an
//! [`EventStream`].

pub mod bus;
pub mod emitter;
pub mod event;
pub mod hub;
pub mod sink;

pub use bus::EventBus;
pub use emitter::{EmitterError, EventEmitter, NullEmitter};
pub use event::{DiagnosticEvent, Event, ExecutionEvent, ExecutionPhase, NodePhase, NodeRunEvent};
pub use hub::{EventHub, EventHubMetrics, EventStream, HubEmitter};
pub use sink::{ChannelSink, EventSink, JsonLinesSink, MemorySink, StdOutSink};
