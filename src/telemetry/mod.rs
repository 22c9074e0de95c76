//! Telemetry: event formatting for sinks and tracing initialization.

use tracing_error::ErrorLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::event_bus::Event;
use crate::state::ErrorRecord;

pub const CONTEXT_COLOR: &str = "\x1b[32m"; // green
pub const LINE_COLOR: &str = "\x1b[35m"; // magenta
pub const RESET_COLOR: &str = "\x1b[0m";

/// Rendered output for a telemetry item that sinks can write verbatim.
#[derive(Clone, Debug, Default)]
pub struct EventRender {
    pub context: Option<String>,
    pub lines: Vec<String>,
}

impl EventRender {
    pub fn join_lines(&self) -> String {
        self.lines.join("")
    }
}

/// Renders events and error records for human consumption.
pub trait TelemetryFormatter: Send + Sync {
    fn render_event(&self, event: &Event) -> EventRender;
    fn render_errors(&self, errors: &[ErrorRecord]) -> Vec<EventRender>;
}

/// Single-line colored formatter, the stdout default.
pub struct PlainFormatter;

impl TelemetryFormatter for PlainFormatter {
    fn render_event(&self, event: &Event) -> EventRender {
        let line = format!("{LINE_COLOR}{event}{RESET_COLOR}\n");
        EventRender {
            context: Some(event.scope_label().to_string()),
            lines: vec![line],
        }
    }

    fn render_errors(&self, errors: &[ErrorRecord]) -> Vec<EventRender> {
        errors
            .iter()
            .enumerate()
            .map(|(i, record)| {
                let mut lines = Vec::new();
                let scope = format!("{CONTEXT_COLOR}{}{RESET_COLOR}", record.context_key);
                lines.push(format!("[{}] {} | {}\n", i, record.when, scope));
                lines.push(format!(
                    "{LINE_COLOR}  {}: {}{RESET_COLOR}\n",
                    record.kind, record.message
                ));
                if let Some(stack) = &record.stack {
                    lines.push(format!("{LINE_COLOR}  stack: {stack}{RESET_COLOR}\n"));
                }
                EventRender {
                    context: Some(record.context_key.to_string()),
                    lines,
                }
            })
            .collect()
    }
}

/// Human-readable rendering of recorded errors, for terminal summaries.
pub fn pretty_print_errors(errors: &[ErrorRecord]) -> String {
    let renders = PlainFormatter.render_errors(errors);
    let mut out = String::new();
    for (idx, render) in renders.into_iter().enumerate() {
        if idx > 0 {
            out.push('\n');
        }
        for line in render.lines {
            out.push_str(&line);
        }
    }
    out
}

/// Install the global tracing subscriber: `RUST_LOG`-driven filtering, fmt
/// output, and span traces on errors. Safe to call once per process;
/// subsequent calls are ignored.
pub fn init() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(ErrorLayer::default())
        .try_init();
}
