//! Tracing layer that forwards formatted log lines to a [`LogSink`].
//!
//! Lines emitted while an OpenTelemetry span is current end with its
//! `trace_id` and `span_id`, so sink output can be joined with traces.

use std::fmt::Write;

use opentelemetry::trace::TraceContextExt;
use tracing::field::{Field, Visit};
use tracing_subscriber::layer::{Context, Layer};

use crate::config::LogSink;

const MAX_LEN: usize = 32_000;

/// Builds a single line from an event: "[LEVEL] target: message key=value ..."
struct LineVisitor {
    buf: String,
}

impl LineVisitor {
    fn new() -> Self {
        Self {
            buf: String::with_capacity(256),
        }
    }

    fn separate(&mut self) {
        if !self.buf.is_empty() {
            self.buf.push(' ');
        }
    }
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.separate();
        if field.name() == "message" {
            self.buf.push_str(value);
        } else {
            write!(self.buf, "{}={:?}", field.name(), value).ok();
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.separate();
        if field.name() == "message" {
            write!(self.buf, "{:?}", value).ok();
        } else {
            write!(self.buf, "{}={:?}", field.name(), value).ok();
        }
    }
}

fn truncate(line: String) -> String {
    if line.len() <= MAX_LEN {
        return line;
    }
    let total = line.chars().count();
    let head: String = line.chars().take(MAX_LEN).collect();
    format!("{}… ({} chars)", head, total)
}

/// Layer that hands every event to `sink` when present. The sink must not block.
pub(crate) fn sink_layer(sink: Option<LogSink>) -> SinkLayer {
    SinkLayer { sink }
}

#[derive(Clone)]
pub(crate) struct SinkLayer {
    sink: Option<LogSink>,
}

impl<S> Layer<S> for SinkLayer
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let Some(sink) = &self.sink else {
            return;
        };

        let metadata = event.metadata();
        let mut visitor = LineVisitor::new();
        event.record(&mut visitor);

        let cx = opentelemetry::Context::current();
        let span_context = cx.span().span_context().clone();
        if span_context.is_valid() {
            visitor.separate();
            write!(
                visitor.buf,
                "trace_id={} span_id={}",
                span_context.trace_id(),
                span_context.span_id()
            )
            .ok();
        }

        let line = if visitor.buf.is_empty() {
            format!("[{}] {}", metadata.level(), metadata.target())
        } else {
            format!("[{}] {}: {}", metadata.level(), metadata.target(), visitor.buf)
        };
        sink(truncate(line));
    }
}
