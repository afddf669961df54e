//! Local stand-in for the LoadLab backend.
//!
//! Simulates request traffic, keeps rolling metrics and traces in memory, and
//! serves the same REST and push endpoints the monitor consumes.

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{Duration as ChronoDuration, Utc};
use loadlab_common::{
    MetricsSample, RequestStatusSummary, RequestTrace, TimelineEntry, TraceEvent, TraceResponse,
    TraceTimeline, WireFrame, FRAME_HEARTBEAT, FRAME_METRICS, FRAME_PONG, FRAME_REQUEST_UPDATE,
};
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use loadlab_monitor::MonitorConfig;

const METRICS_HISTORY: usize = 100;
const REQUEST_HISTORY: usize = 500;
const TRACE_HISTORY: usize = 500;
/// Pushed frames between heartbeats
const HEARTBEAT_EVERY: u64 = 5;

#[derive(Default)]
struct MockStore {
    metrics: VecDeque<MetricsSample>,
    requests: VecDeque<RequestStatusSummary>,
    traces: HashMap<String, RequestTrace>,
    trace_order: VecDeque<String>,
}

impl MockStore {
    fn record(&mut self, summary: RequestStatusSummary, trace: RequestTrace) {
        self.requests.push_front(summary);
        self.requests.truncate(REQUEST_HISTORY);

        self.trace_order.push_back(trace.request_id.clone());
        self.traces.insert(trace.request_id.clone(), trace);
        while self.trace_order.len() > TRACE_HISTORY {
            if let Some(evicted) = self.trace_order.pop_front() {
                self.traces.remove(&evicted);
            }
        }
    }

    /// Aggregate over the last window of simulated requests
    fn sample(&mut self, window: usize, period: Duration) -> MetricsSample {
        let recent: Vec<&RequestStatusSummary> = self.requests.iter().take(window).collect();

        let mut latencies: Vec<f64> = recent.iter().map(|r| r.latency_ms).collect();
        latencies.sort_by(|a, b| a.total_cmp(b));
        let percentile = |p: f64| -> f64 {
            if latencies.is_empty() {
                return 0.0;
            }
            let idx = ((latencies.len() as f64 * p).ceil() as usize).saturating_sub(1);
            latencies[idx.min(latencies.len() - 1)]
        };

        let errors = recent.iter().filter(|r| r.status_code >= 500).count();
        let error_rate = if recent.is_empty() {
            0.0
        } else {
            errors as f64 / recent.len() as f64 * 100.0
        };

        let sample = MetricsSample {
            timestamp: Utc::now().timestamp_micros() as f64 / 1_000_000.0,
            request_rate: 1.0 / period.as_secs_f64().max(0.001),
            error_rate,
            retry_count: recent.iter().map(|r| u64::from(r.retry_count)).sum(),
            p95_latency_ms: percentile(0.95),
            p99_latency_ms: percentile(0.99),
            active_requests: Some(0),
        };

        self.metrics.push_back(sample.clone());
        while self.metrics.len() > METRICS_HISTORY {
            self.metrics.pop_front();
        }
        sample
    }
}

#[derive(Clone)]
struct MockState {
    store: Arc<RwLock<MockStore>>,
    frames: broadcast::Sender<String>,
}

/// Simulated backend server
pub struct MockBackend {
    config: MonitorConfig,
    state: MockState,
}

impl MockBackend {
    pub fn new(config: MonitorConfig) -> Self {
        let (frames, _) = broadcast::channel(256);
        Self {
            config,
            state: MockState {
                store: Arc::new(RwLock::new(MockStore::default())),
                frames,
            },
        }
    }

    fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/metrics/json", get(metrics_json))
            .route("/requests/recent", get(recent_requests))
            .route("/v1/trace/:request_id", get(get_trace))
            .route("/v1/trace/:request_id/timeline", get(get_trace_timeline))
            .route("/health", get(|| async { Json(json!({"status": "healthy"})) }))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Start the simulator and serve until the process exits
    pub async fn run(&self) -> Result<()> {
        let listen_addr = self.config.mock.listen_addr;
        let listener = tokio::net::TcpListener::bind(listen_addr)
            .await
            .with_context(|| format!("Failed to bind {}", listen_addr))?;

        info!(
            listen_addr = %listen_addr,
            frame_interval_ms = self.config.mock.frame_interval_ms,
            failure_rate = self.config.mock.failure_rate,
            "Mock backend started"
        );

        tokio::spawn(simulate(
            self.state.clone(),
            self.config.mock.frame_interval(),
            self.config.mock.failure_rate,
        ));

        axum::serve(listener, self.router())
            .await
            .context("Mock backend server error")
    }
}

/// Generate one request per period and publish the resulting frames
async fn simulate(state: MockState, period: Duration, failure_rate: f64) {
    let mut ticker = tokio::time::interval(period);
    let mut pushed: u64 = 0;

    loop {
        ticker.tick().await;

        let (summary, trace) = simulate_request(failure_rate);
        let sample = {
            let mut store = state.store.write().await;
            store.record(summary.clone(), trace);
            store.sample(20, period)
        };

        // No receivers just means no socket is connected
        for frame in [
            WireFrame::new(FRAME_REQUEST_UPDATE, json!(summary)),
            WireFrame::new(FRAME_METRICS, json!(sample)),
        ] {
            if let Ok(text) = serde_json::to_string(&frame) {
                let _ = state.frames.send(text);
            }
        }

        pushed += 1;
        if pushed % HEARTBEAT_EVERY == 0 {
            let heartbeat = json!({"type": FRAME_HEARTBEAT, "timestamp": Utc::now().timestamp_millis()});
            let _ = state.frames.send(heartbeat.to_string());
        }
    }
}

fn simulate_request(failure_rate: f64) -> (RequestStatusSummary, RequestTrace) {
    let mut rng = rand::thread_rng();
    let request_id = Uuid::new_v4().to_string();
    let start = Utc::now();

    let mut offset_ms = 0i64;
    let mut events = Vec::new();
    let mut push_event = |event_type: &str, step_ms: i64, metadata: Value| {
        offset_ms += step_ms;
        let metadata = match metadata {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        events.push(TraceEvent {
            event_id: Uuid::new_v4().to_string(),
            request_id: request_id.clone(),
            timestamp_wall: start + ChronoDuration::milliseconds(offset_ms),
            event_type: event_type.to_string(),
            metadata,
            timestamp_monotonic: None,
        });
    };

    push_event("request_received", 0, json!({"endpoint": "/v1/requests"}));
    push_event("validation_success", rng.gen_range(1..4), json!({}));
    push_event("db_call_started", rng.gen_range(1..5), json!({"operation": "insert"}));

    let failed = rng.gen_bool(failure_rate.clamp(0.0, 1.0));
    let mut retries = 0u32;
    if failed {
        push_event("db_call_failed", rng.gen_range(10..60), json!({"error": "connection reset"}));
        retries = rng.gen_range(1..=3);
        for attempt in 1..=retries {
            push_event("retry_attempted", rng.gen_range(20..80), json!({"attempt": attempt}));
        }
        push_event("db_call_failed", rng.gen_range(10..60), json!({"error": "retries exhausted"}));
    } else {
        push_event("db_call_completed", rng.gen_range(5..40), json!({}));
    }

    let status_code: u16 = if failed { 503 } else { 200 };
    push_event("response_sent", rng.gen_range(1..3), json!({"status_code": status_code}));

    let latency_ms = offset_ms as f64;
    let end = start + ChronoDuration::milliseconds(offset_ms);

    let summary = RequestStatusSummary {
        request_id: request_id.clone(),
        status_code,
        latency_ms,
        retry_count: retries,
        timestamp: end,
        method: "POST".to_string(),
        endpoint: "/v1/requests".to_string(),
    };

    let trace = RequestTrace {
        trace_id: Uuid::new_v4().to_string(),
        request_id,
        original_request_id: None,
        start_time: Some(start),
        end_time: Some(end),
        total_latency_ms: Some(latency_ms),
        status_code: Some(status_code),
        events,
        request_metadata: Map::new(),
    };

    (summary, trace)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<MockState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: MockState) {
    let mut frames = state.frames.subscribe();
    info!("Push client connected");

    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Ok(text) => {
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped = skipped, "Push client lagging, frames skipped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    debug!(bytes = text.len(), "Client message");
                    let pong = json!({"type": FRAME_PONG, "data": "connected"});
                    if socket.send(Message::Text(pong.to_string())).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "Push client socket error");
                    break;
                }
            },
        }
    }

    info!("Push client disconnected");
}

async fn metrics_json(State(state): State<MockState>) -> Json<Vec<MetricsSample>> {
    let store = state.store.read().await;
    Json(store.metrics.iter().cloned().collect())
}

#[derive(Debug, Deserialize)]
struct RecentQuery {
    limit: Option<usize>,
}

async fn recent_requests(
    State(state): State<MockState>,
    Query(query): Query<RecentQuery>,
) -> Json<Vec<RequestStatusSummary>> {
    let limit = query.limit.unwrap_or(50);
    let store = state.store.read().await;
    Json(store.requests.iter().take(limit).cloned().collect())
}

fn not_found(request_id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"detail": format!("Trace not found for request_id: {}", request_id)})),
    )
        .into_response()
}

async fn get_trace(State(state): State<MockState>, Path(request_id): Path<String>) -> Response {
    let store = state.store.read().await;
    let Some(trace) = store.traces.get(&request_id) else {
        return not_found(&request_id);
    };

    let failure_points = trace
        .events
        .iter()
        .filter(|e| e.event_type == "db_call_failed" || e.event_type == "validation_failed")
        .cloned()
        .collect();
    let retry_attempts = trace
        .events
        .iter()
        .filter(|e| e.event_type == "retry_attempted")
        .cloned()
        .collect();

    Json(TraceResponse {
        trace: trace.clone(),
        event_count: trace.events.len(),
        failure_points,
        retry_attempts,
    })
    .into_response()
}

async fn get_trace_timeline(
    State(state): State<MockState>,
    Path(request_id): Path<String>,
) -> Response {
    let store = state.store.read().await;
    let Some(trace) = store.traces.get(&request_id) else {
        return not_found(&request_id);
    };

    let timeline: Vec<TimelineEntry> = trace
        .events
        .iter()
        .map(|e| TimelineEntry {
            timestamp: e.timestamp_wall,
            event_type: e.event_type.clone(),
            metadata: e.metadata.clone(),
        })
        .collect();

    Json(TraceTimeline {
        request_id,
        total_events: timeline.len(),
        total_latency_ms: trace.total_latency_ms,
        status_code: trace.status_code,
        timeline,
    })
    .into_response()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mock_backend=info,tower_http=info".into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    let config = match MonitorConfig::from_file("config/default") {
        Ok(config) => config,
        Err(e) => {
            warn!("Failed to load config file: {}, using defaults", e);
            MonitorConfig::default()
        }
    };

    MockBackend::new(config).run().await
}
