//! The event bus: sinks plus the listener task that feeds them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use super::emitter::EventEmitter;
use super::hub::{EventHub, EventStream, HubEmitter};
use super::sink::{EventSink, StdOutSink};

const DEFAULT_BUFFER_CAPACITY: usize = 1024;

/// Central broadcasting point for execution events.
///
/// The engine emits through [`EventBus::emitter`]; the bus's listener task
/// fans each event out to every attached sink. Each `execute()` owns its
/// bus (or is handed one), so embedders get per-run event isolation for
/// free — one channel sink per web client, one memory sink per test.
pub struct EventBus {
    sinks: Arc<Mutex<Vec<Box<dyn EventSink>>>>,
    hub: Arc<EventHub>,
    listener: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_sink(StdOutSink::default())
    }
}

impl EventBus {
    pub fn with_sink<T>(sink: T) -> Self
    where
        T: EventSink + 'static,
    {
        Self::with_sinks(vec![Box::new(sink)])
    }

    pub fn with_sinks(sinks: Vec<Box<dyn EventSink>>) -> Self {
        Self::with_capacity(sinks, DEFAULT_BUFFER_CAPACITY)
    }

    pub fn with_capacity(sinks: Vec<Box<dyn EventSink>>, buffer_capacity: usize) -> Self {
        Self {
            sinks: Arc::new(Mutex::new(sinks)),
            hub: EventHub::new(buffer_capacity),
            listener: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    /// A bus with no sinks at all. Events are still observable via
    /// [`subscribe`](Self::subscribe).
    pub fn sinkless() -> Self {
        Self::with_sinks(Vec::new())
    }

    /// Cloneable emitter handle for producers.
    pub fn emitter(&self) -> Arc<dyn EventEmitter> {
        Arc::new(self.hub.emitter())
    }

    /// Typed emitter when the concrete type is wanted.
    pub fn hub_emitter(&self) -> HubEmitter {
        self.hub.emitter()
    }

    /// Subscribe to the raw event stream.
    pub fn subscribe(&self) -> EventStream {
        self.hub.subscribe()
    }

    /// Hub metrics (capacity, dropped events).
    pub fn metrics(&self) -> super::hub::EventHubMetrics {
        self.hub.metrics()
    }

    /// Start the listener task that fans events out to the sinks. Idempotent.
    pub fn listen_for_events(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut stream = self.hub.subscribe();
        let sinks = Arc::clone(&self.sinks);
        let handle = tokio::spawn(async move {
            loop {
                match stream.recv().await {
                    Ok(event) => {
                        let mut sinks = sinks.lock();
                        for sink in sinks.iter_mut() {
                            if let Err(err) = sink.handle(&event) {
                                tracing::warn!(
                                    sink = %sink.name(),
                                    error = %err,
                                    "event sink failed; continuing"
                                );
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *self.listener.lock() = Some(handle);
    }

    /// Close the hub and wait for the listener to drain buffered events.
    /// After shutdown every sink has seen every event that was published.
    pub async fn shutdown(&self) {
        self.hub.close();
        let handle = self.listener.lock().take();
        if let Some(handle) = handle
            && let Err(err) = handle.await
        {
            tracing::warn!(error = %err, "event bus listener ended abnormally");
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("started", &self.started.load(Ordering::SeqCst))
            .field("metrics", &self.hub.metrics())
            .finish()
    }
}
