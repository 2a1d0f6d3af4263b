//! Span side channel for transaction operations.
//!
//! Every traced operation opens a span named `CloudSpanner.<Type>.<method>` and may record
//! events on it. The default [`LogTracer`] forwards spans to [`tracing`]; [`InMemoryTracer`]
//! keeps finished spans around so they can be inspected.

use std::fmt::Debug;
use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SpanStatus {
    Unset,
    Ok,
    Error(String),
}

pub trait Tracer: Debug + Send + Sync {
    fn start_span(&self, name: &str, attributes: &[(&str, String)]) -> Box<dyn TraceSpan>;
}

pub trait TraceSpan: Send {
    fn add_event(&mut self, name: &str, attributes: &[(&str, String)]);
    fn set_error(&mut self, message: &str);
    fn end(self: Box<Self>);
}

/// An open span; ends when dropped if not ended explicitly.
pub(crate) struct Span(Option<Box<dyn TraceSpan>>);

impl Span {
    pub(crate) fn start(tracer: &dyn Tracer, name: &str, attributes: &[(&str, String)]) -> Self {
        Span(Some(tracer.start_span(name, attributes)))
    }

    pub(crate) fn add_event(&mut self, name: &str) {
        self.add_event_with(name, &[]);
    }

    pub(crate) fn add_event_with(&mut self, name: &str, attributes: &[(&str, String)]) {
        if let Some(span) = self.0.as_mut() {
            span.add_event(name, attributes);
        }
    }

    pub(crate) fn set_error(&mut self, error: &crate::Error) {
        if let Some(span) = self.0.as_mut() {
            span.set_error(&error.message());
        }
    }

    pub(crate) fn end(mut self) {
        if let Some(span) = self.0.take() {
            span.end();
        }
    }
}

impl Drop for Span {
    fn drop(&mut self) {
        if let Some(span) = self.0.take() {
            span.end();
        }
    }
}

/// Forwards spans and their events to the `tracing` ecosystem.
#[derive(Clone, Debug, Default)]
pub struct LogTracer;

struct LogSpan {
    name: String,
    span: tracing::Span,
}

impl Tracer for LogTracer {
    fn start_span(&self, name: &str, attributes: &[(&str, String)]) -> Box<dyn TraceSpan> {
        let span = tracing::debug_span!(
            "spanner",
            otel.name = name,
            otel.status_code = tracing::field::Empty,
            otel.status_message = tracing::field::Empty,
        );
        for (key, value) in attributes {
            tracing::trace!(parent: &span, attribute = *key, value = %value);
        }
        Box::new(LogSpan {
            name: name.to_string(),
            span,
        })
    }
}

impl TraceSpan for LogSpan {
    fn add_event(&mut self, name: &str, _attributes: &[(&str, String)]) {
        tracing::debug!(parent: &self.span, span = %self.name, "{}", name);
    }

    fn set_error(&mut self, message: &str) {
        self.span.record("otel.status_code", &"ERROR");
        self.span.record("otel.status_message", &message);
    }

    fn end(self: Box<Self>) {}
}

/// A span recorded by [`InMemoryTracer`].
#[derive(Clone, Debug, PartialEq)]
pub struct FinishedSpan {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub events: Vec<String>,
    pub status: SpanStatus,
}

/// Records finished spans in memory.
#[derive(Clone, Debug, Default)]
pub struct InMemoryTracer {
    finished: Arc<Mutex<Vec<FinishedSpan>>>,
}

impl InMemoryTracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finished_spans(&self) -> Vec<FinishedSpan> {
        self.finished.lock().clone()
    }

    pub fn span_names(&self) -> Vec<String> {
        self.finished.lock().iter().map(|s| s.name.clone()).collect()
    }

    pub fn find(&self, name: &str) -> Option<FinishedSpan> {
        self.finished.lock().iter().find(|s| s.name == name).cloned()
    }

    pub fn reset(&self) {
        self.finished.lock().clear();
    }
}

struct InMemorySpan {
    span: FinishedSpan,
    sink: Arc<Mutex<Vec<FinishedSpan>>>,
}

impl Tracer for InMemoryTracer {
    fn start_span(&self, name: &str, attributes: &[(&str, String)]) -> Box<dyn TraceSpan> {
        Box::new(InMemorySpan {
            span: FinishedSpan {
                name: name.to_string(),
                attributes: attributes
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.clone()))
                    .collect(),
                events: Vec::new(),
                status: SpanStatus::Unset,
            },
            sink: self.finished.clone(),
        })
    }
}

impl TraceSpan for InMemorySpan {
    fn add_event(&mut self, name: &str, _attributes: &[(&str, String)]) {
        self.span.events.push(name.to_string());
    }

    fn set_error(&mut self, message: &str) {
        self.span.status = SpanStatus::Error(message.to_string());
    }

    fn end(self: Box<Self>) {
        self.sink.lock().push(self.span);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_span_ends_once_on_drop() {
        let tracer = InMemoryTracer::new();
        {
            let mut span = Span::start(&tracer, "CloudSpanner.Test.op", &[]);
            span.add_event("first");
        }
        let span = Span::start(&tracer, "CloudSpanner.Test.other", &[]);
        span.end();

        let spans = tracer.finished_spans();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].events, vec!["first"]);
        assert_eq!(spans[0].status, SpanStatus::Unset);
    }
}
