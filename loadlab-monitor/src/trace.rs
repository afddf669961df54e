//! Trace reconstruction.
//!
//! Turns the unordered bag of events the backend reports for one request into
//! a total order (wall timestamp, then event id), per-event deltas, and the
//! failure/retry subsequences. Pure and stateless: the same input always yields
//! the same [`ReconstructedTrace`], whatever order the events arrived in.
//!
//! Duplicate deliveries (same id, same timestamp) are kept as distinct entries;
//! callers rely on the backend to keep event ids unique within a trace.

use loadlab_common::{TraceEvent, TraceResponse};
use std::cmp::Ordering;
use tracing::debug;

/// How an event reads on the timeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventClass {
    Failure,
    Retry,
    Success,
    Informational,
}

impl EventClass {
    /// Case-sensitive substring rules, first match wins:
    /// failure, then retry, then success.
    pub fn classify(event_type: &str) -> Self {
        if event_type.contains("failed") || event_type.contains("error") {
            EventClass::Failure
        } else if event_type.contains("retry") {
            EventClass::Retry
        } else if event_type.contains("completed") || event_type.contains("success") {
            EventClass::Success
        } else {
            EventClass::Informational
        }
    }
}

/// Canonical timeline for one request
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReconstructedTrace {
    /// Ascending by wall timestamp, ties broken by event id
    pub ordered_events: Vec<TraceEvent>,
    /// `delta[i] = ts[i] - ts[i-1]` in milliseconds, `delta[0] = 0`
    pub per_event_delta_ms: Vec<f64>,
    /// Parallel to `ordered_events`
    pub classes: Vec<EventClass>,
    pub failure_points: Vec<TraceEvent>,
    pub retry_attempts: Vec<TraceEvent>,
    pub event_count: usize,
}

impl ReconstructedTrace {
    pub fn is_empty(&self) -> bool {
        self.event_count == 0
    }

    /// Milliseconds between the first and last event, 0 with fewer than two
    pub fn span_ms(&self) -> f64 {
        match (self.ordered_events.first(), self.ordered_events.last()) {
            (Some(first), Some(last)) => millis_between(first, last),
            _ => 0.0,
        }
    }

    /// Events paired with their class and delta, in timeline order
    pub fn timeline(&self) -> impl Iterator<Item = (&TraceEvent, EventClass, f64)> + '_ {
        self.ordered_events
            .iter()
            .zip(self.classes.iter().copied())
            .zip(self.per_event_delta_ms.iter().copied())
            .map(|((event, class), delta)| (event, class, delta))
    }
}

fn canonical_order(a: &TraceEvent, b: &TraceEvent) -> Ordering {
    a.timestamp_wall
        .cmp(&b.timestamp_wall)
        .then_with(|| a.event_id.cmp(&b.event_id))
}

fn millis_between(earlier: &TraceEvent, later: &TraceEvent) -> f64 {
    let delta = later.timestamp_wall - earlier.timestamp_wall;
    match delta.num_microseconds() {
        Some(micros) => micros as f64 / 1000.0,
        None => delta.num_milliseconds() as f64,
    }
}

/// Order, classify and aggregate a request's events
pub fn reconstruct(events: &[TraceEvent]) -> ReconstructedTrace {
    let mut ordered_events = events.to_vec();
    // Stable sort, so exact duplicates keep a deterministic relative order
    ordered_events.sort_by(canonical_order);

    let per_event_delta_ms: Vec<f64> = ordered_events
        .iter()
        .enumerate()
        .map(|(i, event)| match i {
            0 => 0.0,
            _ => millis_between(&ordered_events[i - 1], event),
        })
        .collect();

    let classes: Vec<EventClass> = ordered_events
        .iter()
        .map(|event| EventClass::classify(&event.event_type))
        .collect();

    let pick = |wanted: EventClass| -> Vec<TraceEvent> {
        ordered_events
            .iter()
            .zip(&classes)
            .filter(|(_, class)| **class == wanted)
            .map(|(event, _)| event.clone())
            .collect()
    };
    let failure_points = pick(EventClass::Failure);
    let retry_attempts = pick(EventClass::Retry);

    ReconstructedTrace {
        event_count: ordered_events.len(),
        ordered_events,
        per_event_delta_ms,
        classes,
        failure_points,
        retry_attempts,
    }
}

/// Server-computed aggregates, kept for comparison only
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ServerHints {
    pub event_count: usize,
    pub failure_points: usize,
    pub retry_attempts: usize,
}

/// Display model for one fetched trace
#[derive(Debug, Clone, PartialEq)]
pub struct TraceView {
    pub request_id: String,
    pub trace_id: String,
    /// Taken verbatim from the trace record, never derived from events
    pub total_latency_ms: Option<f64>,
    pub status_code: Option<u16>,
    pub reconstructed: ReconstructedTrace,
    pub server_hints: ServerHints,
}

impl TraceView {
    pub fn from_response(response: TraceResponse) -> Self {
        let server_hints = ServerHints {
            event_count: response.event_count,
            failure_points: response.failure_points.len(),
            retry_attempts: response.retry_attempts.len(),
        };

        let trace = response.trace;
        let reconstructed = reconstruct(&trace.events);

        if server_hints.failure_points != reconstructed.failure_points.len()
            || server_hints.retry_attempts != reconstructed.retry_attempts.len()
            || server_hints.event_count != reconstructed.event_count
        {
            debug!(
                request_id = %trace.request_id,
                server_events = server_hints.event_count,
                client_events = reconstructed.event_count,
                server_failures = server_hints.failure_points,
                client_failures = reconstructed.failure_points.len(),
                server_retries = server_hints.retry_attempts,
                client_retries = reconstructed.retry_attempts.len(),
                "Server trace aggregates differ from client reconstruction"
            );
        }

        Self {
            request_id: trace.request_id,
            trace_id: trace.trace_id,
            total_latency_ms: trace.total_latency_ms,
            status_code: trace.status_code,
            reconstructed,
            server_hints,
        }
    }
}
