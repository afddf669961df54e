use async_trait::async_trait;
use loadlab_common::{MetricsSample, RequestStatusSummary, TraceResponse, TraceTimeline};
use metrics::counter;
use reqwest::{Client, Url};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::config::BackendConfig;
use crate::error::{MonitorError, Result};
use crate::feed::Snapshot;
use crate::reconciler::SnapshotSource;
use crate::trace::TraceView;

/// REST client for the backend's snapshot and trace endpoints.
///
/// Constructed explicitly and handed to whoever needs it; cloning shares the
/// underlying connection pool.
#[derive(Debug, Clone)]
pub struct BackendClient {
    config: BackendConfig,
    http_client: Client,
}

impl BackendClient {
    /// Create a new backend client
    pub fn new(config: BackendConfig) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| MonitorError::Config(format!("Failed to build HTTP client: {}", e)))?;

        info!(base_url = %config.base(), "Backend client configured");

        Ok(Self {
            config,
            http_client,
        })
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Base URL extended with `segments`, each percent-encoded as a single segment
    fn url(&self, segments: &[&str]) -> Result<Url> {
        let base = self.config.base();
        let mut url = Url::parse(base)
            .map_err(|e| MonitorError::Config(format!("Invalid backend URL {}: {}", base, e)))?;
        url.path_segments_mut()
            .map_err(|_| MonitorError::Config(format!("Backend URL {} cannot carry a path", base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn trace_url(&self, request_id: &str, suffix: Option<&str>) -> Result<Url> {
        let id = request_id.trim();
        // Dot segments would be dropped from the path and hit another endpoint
        if id.is_empty() || id == "." || id == ".." {
            return Err(MonitorError::InvalidState(format!(
                "invalid request id {:?}",
                request_id
            )));
        }

        let mut segments = vec!["v1", "trace", request_id];
        segments.extend(suffix);
        self.url(&segments)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        debug!(url = %url, "Fetching");

        let response = self.http_client.get(url.clone()).send().await.map_err(|e| {
            counter!("loadlab_fetch_failures_total", 1, "kind" => "network");
            MonitorError::from(e)
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            counter!("loadlab_fetch_failures_total", 1, "kind" => "http");
            warn!(url = %url, status = %status, "Backend returned error status");
            return Err(MonitorError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| {
            counter!("loadlab_fetch_failures_total", 1, "kind" => "decode");
            MonitorError::Decode(format!("{}: {}", url.path(), e))
        })
    }

    /// Rolling metrics, oldest first
    pub async fn fetch_metrics(&self) -> Result<Vec<MetricsSample>> {
        self.get_json(self.url(&["metrics", "json"])?).await
    }

    /// Most recent request summaries, newest first
    pub async fn fetch_recent_requests(&self, limit: usize) -> Result<Vec<RequestStatusSummary>> {
        let mut url = self.url(&["requests", "recent"])?;
        url.query_pairs_mut().append_pair("limit", &limit.to_string());
        self.get_json(url).await
    }

    /// Full trace for one request
    pub async fn fetch_trace(&self, request_id: &str) -> Result<TraceResponse> {
        self.get_json(self.trace_url(request_id, None)?).await
    }

    /// Fetch a trace and rebuild its timeline client-side
    pub async fn fetch_trace_view(&self, request_id: &str) -> Result<TraceView> {
        let response = self.fetch_trace(request_id).await?;
        Ok(TraceView::from_response(response))
    }

    /// Simplified server-side timeline
    pub async fn fetch_trace_timeline(&self, request_id: &str) -> Result<TraceTimeline> {
        self.get_json(self.trace_url(request_id, Some("timeline"))?).await
    }
}

#[async_trait]
impl SnapshotSource for BackendClient {
    async fn fetch_snapshot(&self) -> Result<Snapshot> {
        let (metrics, requests) = tokio::try_join!(
            self.fetch_metrics(),
            self.fetch_recent_requests(self.config.recent_requests_limit)
        )?;

        Ok(Snapshot { metrics, requests })
    }
}
