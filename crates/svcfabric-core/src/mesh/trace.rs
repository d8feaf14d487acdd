//! Trace/span tree (spec.md §3.2, §4.2.4).
//!
//! Every `call` opens exactly one span; retries are logged as events
//! within that span rather than as child spans. Grounded on the teacher's
//! `otel` module's span-shape conventions, replacing the OpenTelemetry SDK
//! wiring with an in-process store so the fabric has no external
//! collector dependency.

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime};

use dashmap::DashMap;
use uuid::Uuid;

/// Terminal status of a completed span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanStatus {
    Ok,
    Error,
    Timeout,
}

/// One log line recorded against a span.
#[derive(Debug, Clone)]
pub struct LogLine {
    pub at: SystemTime,
    pub message: String,
}

/// A single unit of work within a [`Trace`] (spec.md §3.2).
#[derive(Debug, Clone)]
pub struct Span {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub operation: String,
    pub start: SystemTime,
    pub end: Option<SystemTime>,
    pub tags: HashMap<String, String>,
    pub logs: Vec<LogLine>,
    pub status: Option<SpanStatus>,
}

impl Span {
    fn new(trace_id: String, operation: impl Into<String>, parent_span_id: Option<String>) -> Self {
        Self {
            trace_id,
            span_id: Uuid::new_v4().to_string(),
            parent_span_id,
            operation: operation.into(),
            start: SystemTime::now(),
            end: None,
            tags: HashMap::new(),
            logs: Vec::new(),
            status: None,
        }
    }

    pub fn log(&mut self, message: impl Into<String>) {
        self.logs.push(LogLine {
            at: SystemTime::now(),
            message: message.into(),
        });
    }

    pub fn tag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.tags.insert(key.into(), value.into());
    }

    pub fn finish(&mut self, status: SpanStatus) {
        self.end = Some(SystemTime::now());
        self.status = Some(status);
    }
}

/// In-process trace store, pruning completed traces after one hour
/// (spec.md §4.2.4).
#[derive(Default)]
pub struct TraceStore {
    spans: DashMap<String, Span>,
    inserted_at: DashMap<String, Instant>,
}

const PRUNE_AFTER: Duration = Duration::from_secs(3600);

impl TraceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a span; reuses `trace_id` if provided, otherwise mints one.
    pub fn begin(&self, trace_id: Option<String>, operation: impl Into<String>, parent_span_id: Option<String>) -> Span {
        let trace_id = trace_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        Span::new(trace_id, operation, parent_span_id)
    }

    pub fn finish(&self, span: Span) {
        let key = span.span_id.clone();
        self.inserted_at.insert(key.clone(), Instant::now());
        self.spans.insert(key, span);
    }

    pub fn get(&self, span_id: &str) -> Option<Span> {
        self.spans.get(span_id).map(|s| s.clone())
    }

    /// Drop spans recorded over an hour ago.
    pub fn prune(&self) {
        let expired: Vec<String> = self
            .inserted_at
            .iter()
            .filter(|entry| entry.value().elapsed() > PRUNE_AFTER)
            .map(|entry| entry.key().clone())
            .collect();
        for id in expired {
            self.spans.remove(&id);
            self.inserted_at.remove(&id);
        }
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_reuses_trace_id_and_mints_span_id() {
        let store = TraceStore::new();
        let span = store.begin(Some("trace-1".to_string()), "call", None);
        assert_eq!(span.trace_id, "trace-1");
        assert!(!span.span_id.is_empty());
    }

    #[test]
    fn finish_sets_status_and_end() {
        let store = TraceStore::new();
        let mut span = store.begin(None, "call", None);
        span.finish(SpanStatus::Ok);
        assert_eq!(span.status, Some(SpanStatus::Ok));
        assert!(span.end.is_some());
        store.finish(span);
        assert_eq!(store.len(), 1);
    }
}
