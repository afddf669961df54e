//! Live push channel with bounded automatic recovery.
//!
//! One supervisor task per [`LiveChannel::open`] owns the current connection:
//! it connects, pumps inbound frames into subscriber queues in wire order, and
//! on close either sleeps the flat reconnect interval and tries again or, once
//! the budget is spent, parks the channel in `Disconnected` until the caller
//! opens it again.

use chrono::{DateTime, Utc};
use loadlab_common::{
    MetricsSample, RequestStatusSummary, RequestTrace, WireFrame, FRAME_METRICS,
    FRAME_REQUEST_UPDATE, FRAME_TRACE_UPDATE,
};
use metrics::{counter, gauge};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ChannelConfig;
use crate::error::Result;
use crate::transport::{Transport, TransportEvent};

/// Error recorded when the automatic reopen budget is exhausted
pub const MAX_ATTEMPTS_REACHED: &str = "max reconnection attempts reached";

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    ErrorBackoff,
}

/// Snapshot of the channel's connection state
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Last open or accepted frame
    pub last_update: DateTime<Utc>,
    pub last_error: Option<String>,
    /// Automatic reopen attempts since the last successful open
    pub reconnect_attempt: u32,
}

impl ConnectionStatus {
    fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            last_update: Utc::now(),
            last_error: None,
            reconnect_attempt: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

/// Subscription key: the tag of a data frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Metrics,
    RequestUpdate,
    TraceUpdate,
}

impl MessageKind {
    pub fn tag(&self) -> &'static str {
        match self {
            MessageKind::Metrics => FRAME_METRICS,
            MessageKind::RequestUpdate => FRAME_REQUEST_UPDATE,
            MessageKind::TraceUpdate => FRAME_TRACE_UPDATE,
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            FRAME_METRICS => Some(MessageKind::Metrics),
            FRAME_REQUEST_UPDATE => Some(MessageKind::RequestUpdate),
            FRAME_TRACE_UPDATE => Some(MessageKind::TraceUpdate),
            _ => None,
        }
    }
}

/// A decoded data frame
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Metrics(MetricsSample),
    RequestUpdate(RequestStatusSummary),
    TraceUpdate(RequestTrace),
}

impl InboundMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            InboundMessage::Metrics(_) => MessageKind::Metrics,
            InboundMessage::RequestUpdate(_) => MessageKind::RequestUpdate,
            InboundMessage::TraceUpdate(_) => MessageKind::TraceUpdate,
        }
    }
}

/// Result of decoding one raw frame
#[derive(Debug)]
enum Decoded {
    Data(InboundMessage),
    /// Valid frame with a non-data tag (heartbeat, pong)
    Control(String),
}

fn decode_frame(raw: &str) -> Result<Decoded> {
    let frame: WireFrame = serde_json::from_str(raw)?;

    let Some(kind) = MessageKind::from_tag(&frame.kind) else {
        return Ok(Decoded::Control(frame.kind));
    };

    let message = match kind {
        MessageKind::Metrics => InboundMessage::Metrics(serde_json::from_value(frame.data)?),
        MessageKind::RequestUpdate => {
            InboundMessage::RequestUpdate(serde_json::from_value(frame.data)?)
        }
        MessageKind::TraceUpdate => InboundMessage::TraceUpdate(serde_json::from_value(frame.data)?),
    };

    Ok(Decoded::Data(message))
}

/// One dispatched message plus the channel state it was dispatched under
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: InboundMessage,
    pub status: ConnectionStatus,
}

pub type SubscriptionId = u64;

/// Receiving end of a subscription; dropping it unsubscribes
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    kind: MessageKind,
    receiver: mpsc::UnboundedReceiver<Delivery>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Next delivery, in wire order; `None` once unsubscribed
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }

    /// Next delivery if one is already queued
    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.receiver.try_recv().ok()
    }
}

type SubscriberMap = HashMap<MessageKind, Vec<(SubscriptionId, mpsc::UnboundedSender<Delivery>)>>;

struct Inner {
    config: ChannelConfig,
    transport: Arc<dyn Transport>,
    status: watch::Sender<ConnectionStatus>,
    subscribers: Mutex<SubscriberMap>,
    next_subscription: AtomicU64,
    /// Sender of the live connection, present only while connected
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    /// Bumped by every open/close; supervisors from older generations are inert
    generation: AtomicU64,
}

/// Push channel handle; clones share the same connection
#[derive(Clone)]
pub struct LiveChannel {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for LiveChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveChannel")
            .field("config", &self.inner.config)
            .field("status", &*self.inner.status.borrow())
            .finish()
    }
}

impl LiveChannel {
    /// Create a channel in `Disconnected`; nothing connects until `open()`
    pub fn new(config: ChannelConfig, transport: Arc<dyn Transport>) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::new());

        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                status,
                subscribers: Mutex::new(HashMap::new()),
                next_subscription: AtomicU64::new(1),
                outbound: Mutex::new(None),
                supervisor: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Current connection status
    pub fn status(&self) -> ConnectionStatus {
        self.inner.status.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.status.borrow().state
    }

    /// Read-only feed of status changes
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    /// Start connecting. No-op while `Connecting` or `Connected`; from
    /// `ErrorBackoff` the pending reopen is replaced by an immediate attempt.
    pub async fn open(&self) {
        let mut supervisor = self.inner.supervisor.lock().await;

        let state = self.state();
        if matches!(state, ConnectionState::Connecting | ConnectionState::Connected) {
            debug!(state = ?state, "open() ignored, channel already active");
            return;
        }

        if let Some(previous) = supervisor.take() {
            previous.abort();
        }
        self.inner.outbound.lock().await.take();

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.status.send_modify(|status| {
            status.state = ConnectionState::Connecting;
        });

        info!(generation = generation, "Opening push channel");
        let inner = Arc::clone(&self.inner);
        *supervisor = Some(tokio::spawn(inner.supervise(generation)));
    }

    /// Cancel any scheduled reopen, release the connection and go `Disconnected`.
    /// Idempotent.
    pub async fn close(&self) {
        let mut supervisor = self.inner.supervisor.lock().await;
        self.inner.generation.fetch_add(1, Ordering::SeqCst);

        if let Some(handle) = supervisor.take() {
            handle.abort();
        }
        self.inner.outbound.lock().await.take();

        self.inner.status.send_if_modified(|status| {
            if status.state == ConnectionState::Disconnected {
                return false;
            }
            status.state = ConnectionState::Disconnected;
            true
        });
        gauge!("loadlab_channel_connected", 0.0);
        debug!("Push channel closed");
    }

    /// Serialize and transmit if connected; otherwise drop silently.
    /// Returns whether the frame was handed to the transport.
    pub async fn send<T: Serialize>(&self, message: &T) -> bool {
        if !self.inner.status.borrow().is_connected() {
            debug!("send() dropped, channel not connected");
            return false;
        }

        let payload = match serde_json::to_string(message) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to serialize outbound message");
                return false;
            }
        };

        match self.inner.outbound.lock().await.as_ref() {
            Some(outbound) => outbound.send(payload).is_ok(),
            None => false,
        }
    }

    /// Register for messages with the given tag
    pub async fn subscribe(&self, kind: MessageKind) -> Subscription {
        let id = self.inner.next_subscription.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();

        self.inner
            .subscribers
            .lock()
            .await
            .entry(kind)
            .or_default()
            .push((id, tx));

        debug!(subscription = id, tag = kind.tag(), "Subscriber registered");
        Subscription {
            id,
            kind,
            receiver: rx,
        }
    }

    /// Remove a subscription; returns false if it was already gone
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.inner.subscribers.lock().await;
        let mut removed = false;
        for list in subscribers.values_mut() {
            let before = list.len();
            list.retain(|(sub_id, _)| *sub_id != id);
            removed |= list.len() != before;
        }
        removed
    }

    /// Subscribers currently registered for a tag
    pub async fn subscriber_count(&self, kind: MessageKind) -> usize {
        self.inner
            .subscribers
            .lock()
            .await
            .get(&kind)
            .map_or(0, |list| list.len())
    }
}

impl Inner {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Apply `f` to the status if this supervisor is still the live one
    fn update<R>(
        &self,
        generation: u64,
        f: impl FnOnce(&mut ConnectionStatus) -> R,
    ) -> Option<R> {
        if !self.is_current(generation) {
            return None;
        }
        let mut result = None;
        self.status.send_modify(|status| result = Some(f(status)));
        result
    }

    async fn supervise(self: Arc<Self>, generation: u64) {
        loop {
            if self
                .update(generation, |status| status.state = ConnectionState::Connecting)
                .is_none()
            {
                return;
            }

            match self.transport.connect().await {
                Ok(connection) => {
                    if !self.on_open(generation, connection.outbound).await {
                        return;
                    }
                    self.pump(generation, connection.inbound).await;
                }
                Err(e) => {
                    warn!(error = %e, "Push channel connect failed");
                    self.on_transport_error(generation, e.to_string());
                }
            }

            match self.on_close(generation).await {
                Some(delay) => tokio::time::sleep(delay).await,
                None => return,
            }
        }
    }

    async fn on_open(&self, generation: u64, outbound: mpsc::UnboundedSender<String>) -> bool {
        let mut slot = self.outbound.lock().await;
        let opened = self.update(generation, |status| {
            status.state = ConnectionState::Connected;
            status.reconnect_attempt = 0;
            status.last_error = None;
            status.last_update = Utc::now();
        });
        if opened.is_none() {
            return false;
        }
        *slot = Some(outbound);

        gauge!("loadlab_channel_connected", 1.0);
        info!(generation = generation, "Push channel connected");
        true
    }

    async fn pump(&self, generation: u64, mut inbound: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = inbound.recv().await {
            match event {
                TransportEvent::Frame(raw) => self.on_message(generation, &raw).await,
                TransportEvent::Error(reason) => self.on_transport_error(generation, reason),
                TransportEvent::Closed => break,
            }
        }
    }

    async fn on_message(&self, generation: u64, raw: &str) {
        counter!("loadlab_frames_received_total", 1);

        match decode_frame(raw) {
            Ok(Decoded::Data(message)) => {
                let stamped = self.update(generation, |status| {
                    status.last_update = Utc::now();
                    status.clone()
                });
                if let Some(status) = stamped {
                    self.dispatch(message, status).await;
                }
            }
            Ok(Decoded::Control(tag)) => {
                self.update(generation, |status| status.last_update = Utc::now());
                debug!(tag = %tag, "Control frame received");
            }
            Err(e) => {
                counter!("loadlab_frames_dropped_total", 1, "reason" => "malformed");
                warn!(error = %e, bytes = raw.len(), "Dropping malformed frame");
            }
        }
    }

    async fn dispatch(&self, message: InboundMessage, status: ConnectionStatus) {
        let kind = message.kind();
        let mut subscribers = self.subscribers.lock().await;

        let Some(list) = subscribers.get_mut(&kind) else {
            debug!(tag = kind.tag(), "No subscribers for frame");
            return;
        };

        list.retain(|(id, tx)| {
            let delivery = Delivery {
                message: message.clone(),
                status: status.clone(),
            };
            if tx.send(delivery).is_err() {
                debug!(subscription = *id, "Pruning closed subscription");
                return false;
            }
            true
        });
    }

    /// Record a fault; the close path alone decides on reconnecting
    fn on_transport_error(&self, generation: u64, reason: String) {
        warn!(error = %reason, "Push transport error");
        self.update(generation, |status| status.last_error = Some(reason));
    }

    /// Returns the delay before the next attempt, or `None` when giving up
    async fn on_close(&self, generation: u64) -> Option<std::time::Duration> {
        self.outbound.lock().await.take();
        gauge!("loadlab_channel_connected", 0.0);

        self.update(generation, |status| status.state = ConnectionState::Disconnected)?;

        let budget = self.config.max_reconnect_attempts;
        let attempt = self.update(generation, |status| {
            if status.reconnect_attempt < budget {
                status.reconnect_attempt += 1;
                status.state = ConnectionState::ErrorBackoff;
                Some(status.reconnect_attempt)
            } else {
                status.last_error = Some(MAX_ATTEMPTS_REACHED.to_string());
                None
            }
        })?;

        match attempt {
            Some(attempt) => {
                counter!("loadlab_reconnect_attempts_total", 1);
                info!(
                    attempt = attempt,
                    max_attempts = budget,
                    delay_ms = self.config.reconnect_interval_ms,
                    "Push channel closed, scheduling reopen"
                );
                Some(self.config.reconnect_interval())
            }
            None => {
                warn!(
                    max_attempts = budget,
                    "Push channel closed, reconnect budget exhausted"
                );
                None
            }
        }
    }
}
