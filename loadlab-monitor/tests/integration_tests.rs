//! Integration tests for the LoadLab live monitor
//!
//! These tests exercise components together:
//! - Push channel dispatch into the live feed
//! - Trace fetch and reconstruction against an HTTP backend
//! - Backend client error mapping
//! - Polling reconciliation end-to-end
//! - WebSocket transport against a real socket

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::Path;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::timeout;

use loadlab_monitor::config::{BackendConfig, ChannelConfig, FeedConfig, PollingConfig};
use loadlab_monitor::{
    BackendClient, ConnectionState, ConnectionStatus, InboundMessage, LiveChannel,
    LiveFeedAggregator, MemoryTransport, MessageKind, MonitorError, PollingReconciler,
    SnapshotSource, Transport, WebSocketTransport,
};

/// Serve `app` on an ephemeral port and return its address
async fn spawn_server(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn backend_for(addr: SocketAddr) -> BackendConfig {
    BackendConfig {
        base_url: format!("http://{}", addr),
        request_timeout_seconds: 5,
        ..BackendConfig::default()
    }
}

fn metrics_frame(rate: f64) -> String {
    json!({
        "type": "metrics",
        "data": {
            "timestamp": 1714557600.0,
            "request_rate": rate,
            "error_rate": 1.5,
            "retry_count": 2,
            "p95_latency": 120.0,
            "p99_latency": 250.0
        }
    })
    .to_string()
}

fn request_update_frame(id: &str) -> String {
    json!({
        "type": "request_update",
        "data": {
            "request_id": id,
            "status": 200,
            "latency_ms": 42.0,
            "retry_count": 0,
            "timestamp": "2024-05-01T10:00:00.123456",
            "method": "POST",
            "endpoint": "/v1/requests"
        }
    })
    .to_string()
}

#[cfg(test)]
mod channel_dispatch_tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_dispatch_by_tag_in_arrival_order() {
        let transport = Arc::new(MemoryTransport::new());
        let remote = transport.push_connection();
        let channel = LiveChannel::new(
            ChannelConfig::default(),
            Arc::clone(&transport) as Arc<dyn Transport>,
        );

        let mut metrics = channel.subscribe(MessageKind::Metrics).await;
        let mut updates = channel.subscribe(MessageKind::RequestUpdate).await;

        channel.open().await;
        let mut status = channel.watch_status();
        timeout(Duration::from_secs(5), status.wait_for(|s| s.is_connected()))
            .await
            .unwrap()
            .unwrap();

        remote.frame(metrics_frame(10.0));
        remote.frame(request_update_frame("req-1"));
        remote.frame(metrics_frame(20.0));

        let mut rates = Vec::new();
        for _ in 0..2 {
            let delivery = timeout(Duration::from_secs(5), metrics.recv())
                .await
                .unwrap()
                .unwrap();
            match delivery.message {
                InboundMessage::Metrics(sample) => rates.push(sample.request_rate),
                other => panic!("unexpected message: {:?}", other),
            }
        }
        assert_eq!(rates, vec![10.0, 20.0]);

        let delivery = timeout(Duration::from_secs(5), updates.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(delivery.message, InboundMessage::RequestUpdate(ref u) if u.request_id == "req-1"));

        // Exactly one request update and nothing more on the metrics stream
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(updates.try_recv().is_none());
        assert!(metrics.try_recv().is_none());

        channel.close().await;
    }

    #[tokio::test]
    async fn test_dispatch_feeds_aggregator() {
        let transport = Arc::new(MemoryTransport::new());
        let remote = transport.push_connection();
        let channel = LiveChannel::new(
            ChannelConfig::default(),
            Arc::clone(&transport) as Arc<dyn Transport>,
        );
        let feed = LiveFeedAggregator::shared(&FeedConfig::default());

        let mut subscription = channel.subscribe(MessageKind::RequestUpdate).await;
        let consumer_feed = Arc::clone(&feed);
        let consumer = tokio::spawn(async move {
            let mut ingested = 0;
            while let Some(delivery) = subscription.recv().await {
                consumer_feed.write().await.ingest(&delivery.message);
                ingested += 1;
                if ingested == 3 {
                    break;
                }
            }
        });

        channel.open().await;
        for id in ["req-1", "req-2", "req-3"] {
            remote.frame(request_update_frame(id));
        }

        timeout(Duration::from_secs(5), consumer).await.unwrap().unwrap();

        let ids: Vec<String> = feed.read().await.requests().into_iter().map(|r| r.request_id).collect();
        assert_eq!(ids, vec!["req-3", "req-2", "req-1"]);
    }

    #[tokio::test]
    async fn test_remote_close_schedules_reopen() {
        let transport = Arc::new(MemoryTransport::new());
        let first = transport.push_connection();
        let _second = transport.push_connection();
        let channel = LiveChannel::new(
            ChannelConfig {
                reconnect_interval_ms: 20,
                max_reconnect_attempts: 5,
            },
            Arc::clone(&transport) as Arc<dyn Transport>,
        );

        channel.open().await;
        let mut status = channel.watch_status();
        timeout(Duration::from_secs(5), status.wait_for(|s| s.is_connected()))
            .await
            .unwrap()
            .unwrap();

        first.close();
        timeout(Duration::from_secs(5), async {
            while transport.connect_attempts() < 2 || !channel.status().is_connected() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(channel.status().reconnect_attempt, 0);
        channel.close().await;
    }
}

#[cfg(test)]
mod trace_fetch_tests {
    use super::*;

    async fn trace_handler(Path(request_id): Path<String>) -> Response {
        if request_id != "req-42" {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"detail": format!("Trace not found for request_id: {}", request_id)})),
            )
                .into_response();
        }

        // Naive timestamps, as the backend emits them; "b" is at T
        Json(json!({
            "trace": {
                "trace_id": "trace-42",
                "request_id": "req-42",
                "start_time": "2024-05-01T10:00:00",
                "end_time": "2024-05-01T10:00:00.010000",
                "total_latency_ms": 15.0,
                "status_code": 200,
                "events": [
                    {"event_id": "b", "request_id": "req-42", "timestamp_wall": "2024-05-01T10:00:00", "event_type": "db_call_started", "metadata": {}},
                    {"event_id": "a", "request_id": "req-42", "timestamp_wall": "2024-05-01T09:59:59.995000", "event_type": "request_received", "metadata": {}},
                    {"event_id": "c", "request_id": "req-42", "timestamp_wall": "2024-05-01T10:00:00.010000", "event_type": "request_completed", "metadata": {}},
                    {"event_id": "broken", "timestamp_wall": "not a time"}
                ],
                "request_metadata": {}
            },
            "event_count": 3,
            "failure_points": [],
            "retry_attempts": []
        }))
        .into_response()
    }

    async fn timeline_handler(Path(request_id): Path<String>) -> Json<serde_json::Value> {
        Json(json!({
            "request_id": request_id,
            "total_events": 1,
            "total_latency_ms": 15.0,
            "status_code": 200,
            "timeline": [
                {"timestamp": "2024-05-01T10:00:00", "event_type": "request_received", "metadata": {}}
            ]
        }))
    }

    fn trace_app() -> Router {
        Router::new()
            .route("/v1/trace/:request_id", get(trace_handler))
            .route("/v1/trace/:request_id/timeline", get(timeline_handler))
            .route(
                "/metrics/json",
                get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
            )
    }

    #[tokio::test]
    async fn test_trace_is_reconstructed_client_side() {
        let addr = spawn_server(trace_app()).await;
        let client = BackendClient::new(backend_for(addr)).unwrap();

        let view = client.fetch_trace_view("req-42").await.unwrap();

        let ids: Vec<&str> = view
            .reconstructed
            .ordered_events
            .iter()
            .map(|e| e.event_id.as_str())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(view.reconstructed.per_event_delta_ms, vec![0.0, 5.0, 10.0]);
        assert_eq!(view.reconstructed.event_count, 3);
        assert!(view.reconstructed.failure_points.is_empty());
        assert_eq!(view.total_latency_ms, Some(15.0));
        assert_eq!(view.status_code, Some(200));
    }

    #[tokio::test]
    async fn test_timeline_endpoint() {
        let addr = spawn_server(trace_app()).await;
        let client = BackendClient::new(backend_for(addr)).unwrap();

        let timeline = client.fetch_trace_timeline("req-42").await.unwrap();
        assert_eq!(timeline.request_id, "req-42");
        assert_eq!(timeline.total_events, 1);
        assert_eq!(timeline.timeline[0].event_type, "request_received");
    }

    #[tokio::test]
    async fn test_reserved_characters_in_request_id_reach_the_route() {
        let addr = spawn_server(trace_app()).await;
        let client = BackendClient::new(backend_for(addr)).unwrap();

        let timeline = client.fetch_trace_timeline("batch/7?retry#2").await.unwrap();
        assert_eq!(timeline.request_id, "batch/7?retry#2");
    }

    #[tokio::test]
    async fn test_missing_trace_is_not_retryable() {
        let addr = spawn_server(trace_app()).await;
        let client = BackendClient::new(backend_for(addr)).unwrap();

        let err = client.fetch_trace("unknown").await.unwrap_err();
        assert!(matches!(err, MonitorError::Http { status: 404, .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_server_error_is_retryable() {
        let addr = spawn_server(trace_app()).await;
        let client = BackendClient::new(backend_for(addr)).unwrap();

        let err = client.fetch_metrics().await.unwrap_err();
        assert!(matches!(err, MonitorError::Http { status: 500, ref body } if body == "boom"));
        assert!(err.is_retryable());
    }
}

#[cfg(test)]
mod reconciliation_tests {
    use super::*;

    fn snapshot_app() -> Router {
        Router::new()
            .route(
                "/metrics/json",
                get(|| async {
                    Json(json!([
                        {"timestamp": 1.0, "request_rate": 5.0, "error_rate": 0.0, "retry_count": 0, "p95_latency": 10.0, "p99_latency": 20.0},
                        {"timestamp": 2.0, "request_rate": 6.0, "error_rate": 0.0, "retry_count": 1, "p95_latency": 11.0, "p99_latency": 21.0}
                    ]))
                }),
            )
            .route(
                "/requests/recent",
                get(|| async {
                    Json(json!([
                        {"request_id": "newest", "status": 200, "latency_ms": 12.0, "retry_count": 0, "timestamp": "2024-05-01T10:00:02", "method": "GET", "endpoint": "/a"},
                        {"request_id": "older", "status": 503, "latency_ms": 80.0, "retry_count": 2, "timestamp": "2024-05-01T10:00:01", "method": "POST", "endpoint": "/b"}
                    ]))
                }),
            )
    }

    fn disconnected() -> ConnectionStatus {
        ConnectionStatus {
            state: ConnectionState::Disconnected,
            last_update: chrono::Utc::now(),
            last_error: None,
            reconnect_attempt: 0,
        }
    }

    #[tokio::test]
    async fn test_snapshot_fetch_replaces_feed() {
        let addr = spawn_server(snapshot_app()).await;
        let client = BackendClient::new(backend_for(addr)).unwrap();

        let snapshot = client.fetch_snapshot().await.unwrap();
        assert_eq!(snapshot.metrics.len(), 2);
        assert_eq!(snapshot.requests[0].request_id, "newest");
    }

    #[tokio::test]
    async fn test_polling_reconciler_applies_backend_snapshot() {
        let addr = spawn_server(snapshot_app()).await;
        let client = BackendClient::new(backend_for(addr)).unwrap();
        let feed = LiveFeedAggregator::shared(&FeedConfig::default());
        feed.write().await.ingest(&InboundMessage::Metrics(
            serde_json::from_value(json!({"timestamp": 0.5, "request_rate": 1.0, "error_rate": 0.0, "retry_count": 0, "p95_latency": 5.0, "p99_latency": 9.0})).unwrap(),
        ));

        let (_status_tx, status_rx) = watch::channel(disconnected());
        let reconciler = PollingReconciler::start(
            PollingConfig {
                enabled: true,
                interval_ms: 50,
            },
            status_rx,
            Arc::new(client) as Arc<dyn SnapshotSource>,
            Arc::clone(&feed),
        );

        let mut status = reconciler.watch_status();
        timeout(Duration::from_secs(5), status.wait_for(|s| s.last_applied_seq > 0))
            .await
            .unwrap()
            .unwrap();
        reconciler.stop();

        let feed = feed.read().await;
        let timestamps: Vec<f64> = feed.metrics().iter().map(|m| m.timestamp).collect();
        assert_eq!(timestamps, vec![1.0, 2.0]);
        assert_eq!(feed.requests()[0].request_id, "newest");
        assert_eq!(feed.requests()[1].retry_count, 2);
    }

    #[tokio::test]
    async fn test_unreachable_backend_surfaces_error() {
        let client = BackendClient::new(BackendConfig {
            base_url: "http://127.0.0.1:1".to_string(),
            request_timeout_seconds: 2,
            ..BackendConfig::default()
        })
        .unwrap();
        let feed = LiveFeedAggregator::shared(&FeedConfig::default());

        let (_status_tx, status_rx) = watch::channel(disconnected());
        let reconciler = PollingReconciler::start(
            PollingConfig {
                enabled: true,
                interval_ms: 60_000,
            },
            status_rx,
            Arc::new(client) as Arc<dyn SnapshotSource>,
            Arc::clone(&feed),
        );

        assert!(reconciler.refresh_now());
        let mut status = reconciler.watch_status();
        let status = timeout(Duration::from_secs(10), status.wait_for(|s| s.last_error.is_some()))
            .await
            .unwrap()
            .unwrap()
            .clone();

        assert!(status.last_error.unwrap().is_retryable());
        assert_eq!(feed.read().await.snapshot_seq(), 0);
    }
}

#[cfg(test)]
mod websocket_tests {
    use super::*;

    async fn ws_handler(ws: WebSocketUpgrade) -> Response {
        ws.on_upgrade(push_frames)
    }

    async fn push_frames(mut socket: WebSocket) {
        let frames = [
            r#"{"type":"heartbeat","timestamp":1.0}"#.to_string(),
            "not json".to_string(),
            metrics_frame(33.0),
        ];
        for frame in frames {
            if socket.send(Message::Text(frame)).await.is_err() {
                return;
            }
        }

        // Answer client messages like the backend does
        while let Some(Ok(Message::Text(_))) = socket.recv().await {
            let pong = json!({"type": "pong", "data": "connected"}).to_string();
            if socket.send(Message::Text(pong)).await.is_err() {
                return;
            }
        }
    }

    #[tokio::test]
    async fn test_websocket_channel_delivers_metrics() {
        let addr = spawn_server(Router::new().route("/ws", get(ws_handler))).await;
        let backend = backend_for(addr);

        let transport = Arc::new(WebSocketTransport::new(backend.ws_url()));
        let channel = LiveChannel::new(ChannelConfig::default(), transport as Arc<dyn Transport>);
        let mut metrics = channel.subscribe(MessageKind::Metrics).await;

        channel.open().await;

        let delivery = timeout(Duration::from_secs(5), metrics.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(delivery.message, InboundMessage::Metrics(ref m) if m.request_rate == 33.0));
        assert!(delivery.status.is_connected());

        assert!(channel.send(&json!({"type": "ping"})).await);

        channel.close().await;
        assert_eq!(channel.state(), ConnectionState::Disconnected);
    }
}
