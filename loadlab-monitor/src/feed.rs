use loadlab_common::{MetricsSample, RequestStatusSummary};
use metrics::counter;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::channel::InboundMessage;
use crate::config::FeedConfig;

/// Feed shared between the dispatch consumer and the reconciler
pub type SharedFeed = Arc<RwLock<LiveFeedAggregator>>;

/// Authoritative state fetched by the reconciler
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    /// Oldest first, as the backend returns them
    pub metrics: Vec<MetricsSample>,
    /// Newest first, as the backend returns them
    pub requests: Vec<RequestStatusSummary>,
}

/// Bounded retention for the two live streams.
///
/// Metrics are appended and evicted from the front (oldest out); request
/// updates are prepended and evicted from the back, so `requests()` is always
/// newest first.
#[derive(Debug, Clone)]
pub struct LiveFeedAggregator {
    metrics: VecDeque<MetricsSample>,
    requests: VecDeque<RequestStatusSummary>,
    metrics_capacity: usize,
    request_capacity: usize,
    /// Sequence of the last snapshot applied, 0 before the first
    snapshot_seq: u64,
}

impl Default for LiveFeedAggregator {
    fn default() -> Self {
        Self::new(&FeedConfig::default())
    }
}

impl LiveFeedAggregator {
    pub fn new(config: &FeedConfig) -> Self {
        Self {
            metrics: VecDeque::with_capacity(config.metrics_capacity),
            requests: VecDeque::with_capacity(config.request_capacity),
            metrics_capacity: config.metrics_capacity.max(1),
            request_capacity: config.request_capacity.max(1),
            snapshot_seq: 0,
        }
    }

    pub fn shared(config: &FeedConfig) -> SharedFeed {
        Arc::new(RwLock::new(Self::new(config)))
    }

    /// Append a metrics sample; returns false if it was rejected
    pub fn push_metrics(&mut self, sample: MetricsSample) -> bool {
        if !metrics_conform(&sample) {
            counter!("loadlab_feed_rejected_total", 1, "stream" => "metrics");
            warn!(timestamp = sample.timestamp, "Ignoring non-conforming metrics sample");
            return false;
        }

        self.metrics.push_back(sample);
        while self.metrics.len() > self.metrics_capacity {
            self.metrics.pop_front();
        }
        true
    }

    /// Prepend a request status update; returns false if it was rejected
    pub fn push_request_update(&mut self, summary: RequestStatusSummary) -> bool {
        if !request_conforms(&summary) {
            counter!("loadlab_feed_rejected_total", 1, "stream" => "requests");
            warn!(request_id = %summary.request_id, "Ignoring non-conforming request update");
            return false;
        }

        self.requests.push_front(summary);
        while self.requests.len() > self.request_capacity {
            self.requests.pop_back();
        }
        true
    }

    /// Route a dispatched channel message to its stream
    pub fn ingest(&mut self, message: &InboundMessage) -> bool {
        match message {
            InboundMessage::Metrics(sample) => self.push_metrics(sample.clone()),
            InboundMessage::RequestUpdate(summary) => self.push_request_update(summary.clone()),
            InboundMessage::TraceUpdate(trace) => {
                debug!(request_id = %trace.request_id, "Trace update is not retained by the feed");
                false
            }
        }
    }

    /// Replace both streams wholesale if `seq` is newer than the last applied
    /// snapshot. Stale snapshots are discarded and `false` is returned.
    pub fn apply_snapshot(&mut self, seq: u64, snapshot: Snapshot) -> bool {
        if seq <= self.snapshot_seq {
            counter!("loadlab_snapshots_discarded_total", 1);
            debug!(seq = seq, applied = self.snapshot_seq, "Discarding stale snapshot");
            return false;
        }

        let received = snapshot.metrics.len() + snapshot.requests.len();

        let mut metrics: VecDeque<MetricsSample> =
            snapshot.metrics.into_iter().filter(metrics_conform).collect();
        let mut requests: VecDeque<RequestStatusSummary> =
            snapshot.requests.into_iter().filter(request_conforms).collect();

        let rejected = received - metrics.len() - requests.len();
        if rejected > 0 {
            warn!(seq = seq, rejected = rejected, "Snapshot contained non-conforming entries");
        }

        while metrics.len() > self.metrics_capacity {
            metrics.pop_front();
        }
        requests.truncate(self.request_capacity);

        self.metrics = metrics;
        self.requests = requests;
        self.snapshot_seq = seq;
        counter!("loadlab_snapshots_applied_total", 1);
        true
    }

    /// Metrics, oldest first
    pub fn metrics(&self) -> Vec<MetricsSample> {
        self.metrics.iter().cloned().collect()
    }

    /// Request updates, newest first
    pub fn requests(&self) -> Vec<RequestStatusSummary> {
        self.requests.iter().cloned().collect()
    }

    pub fn latest_metrics(&self) -> Option<MetricsSample> {
        self.metrics.back().cloned()
    }

    pub fn metrics_len(&self) -> usize {
        self.metrics.len()
    }

    pub fn requests_len(&self) -> usize {
        self.requests.len()
    }

    pub fn snapshot_seq(&self) -> u64 {
        self.snapshot_seq
    }
}

fn non_negative(value: f64) -> bool {
    value.is_finite() && value >= 0.0
}

fn metrics_conform(sample: &MetricsSample) -> bool {
    [
        sample.timestamp,
        sample.request_rate,
        sample.error_rate,
        sample.p95_latency_ms,
        sample.p99_latency_ms,
    ]
    .into_iter()
    .all(non_negative)
}

fn request_conforms(summary: &RequestStatusSummary) -> bool {
    !summary.request_id.trim().is_empty()
        && !summary.method.trim().is_empty()
        && non_negative(summary.latency_ms)
}
