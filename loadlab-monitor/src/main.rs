use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use loadlab_monitor::channel::MAX_ATTEMPTS_REACHED;
use loadlab_monitor::config::LoggingConfig;
use loadlab_monitor::{
    reconstruct, BackendClient, ConnectionState, EventClass, InboundMessage, LiveChannel,
    LiveFeedAggregator, MessageKind, MonitorConfig, PollingReconciler, SharedFeed, SnapshotSource,
    Subscription, Transport, WebSocketTransport,
};

const SUMMARY_INTERVAL: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // Configuration first: it decides the log format
    let loaded = MonitorConfig::from_file("config/default");
    let config = loaded.as_ref().cloned().unwrap_or_default();

    init_tracing(&config.logging);

    info!("Starting LoadLab Live Monitor v{}", env!("CARGO_PKG_VERSION"));
    match &loaded {
        Ok(_) => info!("Configuration loaded from config/default.toml"),
        Err(e) => warn!("Failed to load config file: {}, using defaults", e),
    }

    if config.metrics.enabled {
        start_metrics_exporter(&config)?;
    }

    let client = BackendClient::new(config.backend.clone()).context("Failed to create backend client")?;

    // `loadlab-monitor trace <request_id>` prints one reconstructed trace and exits
    let args: Vec<String> = std::env::args().collect();
    if let [_, command, request_id] = args.as_slice() {
        if command == "trace" {
            return print_trace(&client, request_id).await;
        }
    }

    let feed = LiveFeedAggregator::shared(&config.feed);
    let transport: Arc<dyn Transport> = Arc::new(WebSocketTransport::new(config.backend.ws_url()));
    let channel = LiveChannel::new(config.channel.clone(), transport);

    info!(
        ws_url = %config.backend.ws_url(),
        base_url = %config.backend.base(),
        "Push channel configured"
    );

    spawn_feed_consumer(channel.subscribe(MessageKind::Metrics).await, Arc::clone(&feed));
    spawn_feed_consumer(channel.subscribe(MessageKind::RequestUpdate).await, Arc::clone(&feed));
    spawn_trace_logger(channel.subscribe(MessageKind::TraceUpdate).await);

    channel.open().await;
    spawn_reopen_on_hangup(channel.clone())?;

    let reconciler = if config.polling.enabled {
        let source: Arc<dyn SnapshotSource> = Arc::new(client.clone());
        Some(PollingReconciler::start(
            config.polling.clone(),
            channel.watch_status(),
            source,
            Arc::clone(&feed),
        ))
    } else {
        info!("Polling fallback disabled");
        None
    };

    let mut summary = tokio::time::interval(SUMMARY_INTERVAL);
    let mut exhausted_reported = false;

    loop {
        tokio::select! {
            _ = summary.tick() => {
                let status = channel.status();
                let feed = feed.read().await;
                info!(
                    state = ?status.state,
                    reconnect_attempt = status.reconnect_attempt,
                    last_update = %status.last_update,
                    metrics = feed.metrics_len(),
                    requests = feed.requests_len(),
                    snapshot_seq = feed.snapshot_seq(),
                    "Live view"
                );

                if let Some(latest) = feed.latest_metrics() {
                    info!(
                        request_rate = latest.request_rate,
                        error_rate = latest.error_rate,
                        p95_latency_ms = latest.p95_latency_ms,
                        p99_latency_ms = latest.p99_latency_ms,
                        "Latest metrics"
                    );
                }

                let exhausted = status.state == ConnectionState::Disconnected
                    && status.last_error.as_deref() == Some(MAX_ATTEMPTS_REACHED);
                if exhausted && !exhausted_reported {
                    error!(
                        pid = std::process::id(),
                        "Push channel gave up reconnecting; send SIGHUP to reopen it"
                    );
                }
                exhausted_reported = exhausted;

                if let Some(reconciler) = &reconciler {
                    if let Some(e) = reconciler.status().last_error {
                        warn!(error = %e, retryable = e.is_retryable(), "Last snapshot refresh failed");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
        }
    }

    if let Some(reconciler) = &reconciler {
        reconciler.stop();
    }
    channel.close().await;

    info!("LoadLab Live Monitor stopped");
    Ok(())
}

/// SIGHUP reopens the push channel, including after the reconnect budget ran out
#[cfg(unix)]
fn spawn_reopen_on_hangup(channel: LiveChannel) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            info!(state = ?channel.state(), "SIGHUP received, reopening push channel");
            channel.open().await;
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn spawn_reopen_on_hangup(_channel: LiveChannel) -> Result<()> {
    debug!("No SIGHUP on this platform, manual reopen unavailable");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| logging.level.clone().into());

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn start_metrics_exporter(config: &MonitorConfig) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(config.metrics.listen_addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    describe_gauge!("loadlab_channel_connected", "1 while the push channel is connected");
    describe_counter!("loadlab_frames_received_total", "Raw frames received on the push channel");
    describe_counter!("loadlab_frames_dropped_total", "Frames dropped before dispatch");
    describe_counter!("loadlab_reconnect_attempts_total", "Automatic reopen attempts scheduled");
    describe_counter!("loadlab_snapshot_fetches_total", "Snapshot fetches started");
    describe_counter!("loadlab_snapshots_applied_total", "Snapshots written to the feed");
    describe_counter!("loadlab_snapshots_discarded_total", "Stale snapshots discarded");
    describe_counter!("loadlab_fetch_failures_total", "Failed backend fetches");
    describe_counter!("loadlab_feed_rejected_total", "Non-conforming feed entries ignored");

    info!(metrics_addr = %config.metrics.listen_addr, "Prometheus metrics exporter started");
    Ok(())
}

fn spawn_feed_consumer(mut subscription: Subscription, feed: SharedFeed) {
    tokio::spawn(async move {
        while let Some(delivery) = subscription.recv().await {
            feed.write().await.ingest(&delivery.message);
        }
        debug!(tag = subscription.kind().tag(), "Feed consumer finished");
    });
}

fn spawn_trace_logger(mut subscription: Subscription) {
    tokio::spawn(async move {
        while let Some(delivery) = subscription.recv().await {
            if let InboundMessage::TraceUpdate(trace) = delivery.message {
                let reconstructed = reconstruct(&trace.events);
                info!(
                    request_id = %trace.request_id,
                    events = reconstructed.event_count,
                    failures = reconstructed.failure_points.len(),
                    retries = reconstructed.retry_attempts.len(),
                    span_ms = reconstructed.span_ms(),
                    "Trace update"
                );
            }
        }
    });
}

async fn print_trace(client: &BackendClient, request_id: &str) -> Result<()> {
    let view = client
        .fetch_trace_view(request_id)
        .await
        .with_context(|| format!("Failed to fetch trace {}", request_id))?;

    info!(
        request_id = %view.request_id,
        trace_id = %view.trace_id,
        status_code = ?view.status_code,
        total_latency_ms = ?view.total_latency_ms,
        events = view.reconstructed.event_count,
        "Trace"
    );

    for (event, class, delta_ms) in view.reconstructed.timeline() {
        let marker = match class {
            EventClass::Failure => "FAIL",
            EventClass::Retry => "RETRY",
            EventClass::Success => "OK",
            EventClass::Informational => "-",
        };
        println!(
            "{}  +{:>8.2}ms  {:<5}  {}",
            event.timestamp_wall.format("%H:%M:%S%.3f"),
            delta_ms,
            marker,
            event.event_type
        );
    }

    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use loadlab_monitor::config::ChannelConfig;
    use loadlab_monitor::MemoryTransport;

    #[tokio::test]
    async fn test_hangup_reopens_exhausted_channel() {
        let transport = Arc::new(MemoryTransport::new());
        let channel = LiveChannel::new(
            ChannelConfig {
                reconnect_interval_ms: 5,
                max_reconnect_attempts: 2,
            },
            Arc::clone(&transport) as Arc<dyn Transport>,
        );

        let mut status = channel.watch_status();
        channel.open().await;
        tokio::time::timeout(
            Duration::from_secs(5),
            status.wait_for(|s| s.last_error.as_deref() == Some(MAX_ATTEMPTS_REACHED)),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(transport.connect_attempts(), 3);

        let _remote = transport.push_connection();
        spawn_reopen_on_hangup(channel.clone()).unwrap();
        let sent = std::process::Command::new("kill")
            .args(["-HUP", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(sent.success());

        tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| s.is_connected()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(transport.connect_attempts(), 4);
        assert_eq!(channel.state(), ConnectionState::Connected);
    }
}
