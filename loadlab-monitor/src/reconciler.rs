//! Polling fallback for when the push channel is down.
//!
//! A fixed-period timer checks the channel's published state; on every tick
//! that finds it anything but `Connected`, a full snapshot fetch is started
//! and, if it is still the newest when it lands, replaces the feed wholesale.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::channel::{ConnectionState, ConnectionStatus};
use crate::config::PollingConfig;
use crate::error::{MonitorError, Result};
use crate::feed::{SharedFeed, Snapshot};

/// Where authoritative snapshots come from
#[async_trait]
pub trait SnapshotSource: Send + Sync + 'static {
    async fn fetch_snapshot(&self) -> Result<Snapshot>;
}

/// Outcome of the most recent refreshes
#[derive(Debug, Clone, Default)]
pub struct ReconcileStatus {
    /// Sequence of the last snapshot written to the feed, 0 before the first
    pub last_applied_seq: u64,
    /// Highest sequence whose fetch has finished, successfully or not
    pub last_settled_seq: u64,
    pub last_refresh: Option<DateTime<Utc>>,
    /// Outcome of the newest finished fetch; older fetches landing late never touch it
    pub last_error: Option<MonitorError>,
}

impl ReconcileStatus {
    /// Record a finished fetch; returns false if a newer one already settled
    fn settle(&mut self, seq: u64, error: Option<MonitorError>) -> bool {
        if seq <= self.last_settled_seq {
            return false;
        }
        self.last_settled_seq = seq;
        self.last_error = error;
        true
    }
}

struct Shared {
    source: Arc<dyn SnapshotSource>,
    feed: SharedFeed,
    next_seq: AtomicU64,
    status: watch::Sender<ReconcileStatus>,
}

impl Shared {
    async fn refresh(&self, seq: u64, reason: &'static str) {
        debug!(seq = seq, reason = reason, "Fetching snapshot");
        counter!("loadlab_snapshot_fetches_total", 1, "reason" => reason);

        match self.source.fetch_snapshot().await {
            Ok(snapshot) => {
                let metrics = snapshot.metrics.len();
                let requests = snapshot.requests.len();
                if !self.feed.write().await.apply_snapshot(seq, snapshot) {
                    return;
                }

                self.status.send_modify(|status| {
                    status.last_applied_seq = status.last_applied_seq.max(seq);
                    status.last_refresh = Some(Utc::now());
                    status.settle(seq, None);
                });
                info!(
                    seq = seq,
                    metrics = metrics,
                    requests = requests,
                    "Snapshot applied"
                );
            }
            Err(e) => {
                warn!(
                    seq = seq,
                    error = %e,
                    retryable = e.is_retryable(),
                    "Snapshot fetch failed"
                );
                let recorded = self.status.send_if_modified(|status| status.settle(seq, Some(e)));
                if !recorded {
                    debug!(seq = seq, "Newer fetch already settled, error not recorded");
                }
            }
        }
    }
}

/// Timer-driven snapshot refresh, active only while the channel is down.
///
/// The timer and every in-flight fetch are cancelled by [`stop`](Self::stop)
/// or by dropping the reconciler.
pub struct PollingReconciler {
    status: watch::Receiver<ReconcileStatus>,
    refresh_tx: mpsc::UnboundedSender<()>,
    timer: JoinHandle<()>,
}

impl std::fmt::Debug for PollingReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingReconciler")
            .field("status", &*self.status.borrow())
            .field("stopped", &self.timer.is_finished())
            .finish()
    }
}

impl PollingReconciler {
    /// Spawn the timer. The first tick fires one full interval after start.
    pub fn start(
        config: PollingConfig,
        channel_status: watch::Receiver<ConnectionStatus>,
        source: Arc<dyn SnapshotSource>,
        feed: SharedFeed,
    ) -> Self {
        let (status_tx, status) = watch::channel(ReconcileStatus::default());
        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            source,
            feed,
            next_seq: AtomicU64::new(0),
            status: status_tx,
        });

        info!(interval_ms = config.interval_ms, "Polling reconciler started");
        let timer = tokio::spawn(run(config, channel_status, shared, refresh_rx));

        Self {
            status,
            refresh_tx,
            timer,
        }
    }

    /// Fetch now regardless of channel state
    pub fn refresh_now(&self) -> bool {
        self.refresh_tx.send(()).is_ok()
    }

    pub fn status(&self) -> ReconcileStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ReconcileStatus> {
        self.status.clone()
    }

    /// Cancel the timer and any fetch still in flight
    pub fn stop(&self) {
        if !self.timer.is_finished() {
            self.timer.abort();
            info!("Polling reconciler stopped");
        }
    }
}

impl Drop for PollingReconciler {
    fn drop(&mut self) {
        self.timer.abort();
    }
}

async fn run(
    config: PollingConfig,
    channel_status: watch::Receiver<ConnectionStatus>,
    shared: Arc<Shared>,
    mut refresh_rx: mpsc::UnboundedReceiver<()>,
) {
    let period = config.interval();
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // Owned here so aborting the timer also aborts its fetches
    let mut fetches = JoinSet::new();

    loop {
        let reason = tokio::select! {
            _ = ticker.tick() => {
                let state = channel_status.borrow().state;
                if state == ConnectionState::Connected {
                    debug!("Channel connected, skipping poll");
                    continue;
                }
                debug!(state = ?state, "Channel not connected, polling");
                "poll"
            }
            Some(()) = refresh_rx.recv() => "manual",
            Some(joined) = fetches.join_next(), if !fetches.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        warn!(error = %e, "Snapshot fetch task panicked");
                    }
                }
                continue;
            }
        };

        let seq = shared.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let task_shared = Arc::clone(&shared);
        fetches.spawn(async move { task_shared.refresh(seq, reason).await });
    }
}
