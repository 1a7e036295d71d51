//! Tracing layer for the worker process.
//!
//! The worker's stderr is reserved for fatal errors and its stdout carries
//! frames, so log events are shipped as comment lines on stdout instead.
//! Events are queued on a [`LogSink`] that `run_worker` connects to the
//! frame writer for the duration of an invocation; while nothing is
//! connected they are dropped.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

/// Events from the codec itself are skipped so that writing a comment never
/// produces another one.
const SKIPPED_TARGET_PREFIX: &str = "podlet::bridge";

/// Switchable destination for formatted log lines.
#[derive(Debug, Clone, Default)]
pub struct LogSink {
    tx: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, tx: mpsc::UnboundedSender<String>) {
        if let Ok(mut slot) = self.tx.lock() {
            *slot = Some(tx);
        }
    }

    /// Drop the sender so the receiving side sees the channel close.
    pub fn disconnect(&self) {
        if let Ok(mut slot) = self.tx.lock() {
            slot.take();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.tx.lock().map(|slot| slot.is_some()).unwrap_or(false)
    }

    fn send(&self, line: String) {
        if let Ok(slot) = self.tx.lock()
            && let Some(tx) = slot.as_ref()
        {
            let _ = tx.send(line);
        }
    }
}

pub struct WorkerTracingLayer {
    sink: LogSink,
}

impl WorkerTracingLayer {
    pub fn new(sink: LogSink) -> Self {
        Self { sink }
    }

    fn level_to_string(level: &Level) -> &'static str {
        match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        }
    }
}

impl<S> Layer<S> for WorkerTracingLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let target = metadata.target();
        if target.starts_with(SKIPPED_TARGET_PREFIX) {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let level = Self::level_to_string(metadata.level());
        self.sink.send(format_line(level, target, &visitor.message, &visitor.fields));
    }
}

fn format_line(level: &str, target: &str, message: &str, fields: &[(String, String)]) -> String {
    let mut line = format!("[{level}] {target}: {message}");
    for (name, value) in fields {
        line.push_str(&format!(" {name}={value}"));
    }
    line
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<(String, String)>,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        let rendered = format!("{:?}", value);
        if field.name() == "message" {
            self.message = rendered;
        } else {
            self.fields.push((field.name().to_string(), rendered));
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push((field.name().to_string(), value.to_string()));
        }
    }
}
