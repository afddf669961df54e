//! Push transport seam.
//!
//! [`LiveChannel`](crate::channel::LiveChannel) never touches a socket
//! directly: it asks a [`Transport`] for a [`Connection`], a pair of queues
//! carrying outbound text frames and inbound [`TransportEvent`]s. The
//! production implementation is [`WebSocketTransport`]; [`MemoryTransport`]
//! hands out in-process connections whose far end is driven by the caller.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::error::{MonitorError, Result};

/// What the underlying connection reports to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// One text frame, undecoded
    Frame(String),
    /// Transport fault; a `Closed` follows if the connection is lost
    Error(String),
    /// Connection is gone
    Closed,
}

/// A live connection as seen by the channel
#[derive(Debug)]
pub struct Connection {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Far end of a [`Connection`]: feeds inbound events and observes what was sent
#[derive(Debug)]
pub struct RemoteEnd {
    pub events: mpsc::UnboundedSender<TransportEvent>,
    pub sent: mpsc::UnboundedReceiver<String>,
}

impl Connection {
    /// Create a connected pair of queues
    pub fn pair() -> (Connection, RemoteEnd) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (
            Connection {
                outbound: out_tx,
                inbound: in_rx,
            },
            RemoteEnd {
                events: in_tx,
                sent: out_rx,
            },
        )
    }
}

impl RemoteEnd {
    /// Deliver a raw text frame
    pub fn frame(&self, raw: impl Into<String>) -> bool {
        self.events.send(TransportEvent::Frame(raw.into())).is_ok()
    }

    /// Report a transport fault without closing
    pub fn error(&self, reason: impl Into<String>) -> bool {
        self.events.send(TransportEvent::Error(reason.into())).is_ok()
    }

    /// Close the connection from the remote side
    pub fn close(&self) -> bool {
        self.events.send(TransportEvent::Closed).is_ok()
    }
}

/// Opens push connections
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self) -> Result<Connection>;
}

/// WebSocket transport backed by tokio-tungstenite
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url: String,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self) -> Result<Connection> {
        debug!(url = %self.url, "Opening WebSocket");

        let (ws_stream, response) = connect_async(self.url.as_str()).await?;

        info!(url = %self.url, status = %response.status(), "WebSocket connected");

        let (mut write, mut read) = ws_stream.split();
        let (connection, remote) = Connection::pair();
        let RemoteEnd {
            events: in_tx,
            sent: mut out_rx,
        } = remote;
        let url = self.url.clone();

        // Bridge task: lives until the socket closes or the channel drops its end
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    outgoing = out_rx.recv() => match outgoing {
                        Some(text) => {
                            if let Err(e) = write.send(Message::Text(text)).await {
                                let _ = in_tx.send(TransportEvent::Error(e.to_string()));
                                break;
                            }
                        }
                        None => {
                            debug!(url = %url, "Channel released connection, closing socket");
                            let _ = write.send(Message::Close(None)).await;
                            return;
                        }
                    },
                    incoming = read.next() => match incoming {
                        Some(Ok(Message::Text(text))) => {
                            if in_tx.send(TransportEvent::Frame(text)).is_err() {
                                let _ = write.send(Message::Close(None)).await;
                                return;
                            }
                        }
                        Some(Ok(Message::Binary(bytes))) => {
                            let text = String::from_utf8_lossy(&bytes).into_owned();
                            if in_tx.send(TransportEvent::Frame(text)).is_err() {
                                let _ = write.send(Message::Close(None)).await;
                                return;
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            debug!(url = %url, frame = ?frame, "WebSocket closed by peer");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(url = %url, error = %e, "WebSocket read failed");
                            let _ = in_tx.send(TransportEvent::Error(e.to_string()));
                            break;
                        }
                        None => break,
                    },
                    _ = in_tx.closed() => {
                        let _ = write.send(Message::Close(None)).await;
                        return;
                    }
                }
            }

            let _ = in_tx.send(TransportEvent::Closed);
        });

        Ok(connection)
    }
}

/// In-process transport with a scripted sequence of connect outcomes.
///
/// Each `connect()` consumes the next queued outcome; an empty queue fails.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    pending: Mutex<VecDeque<std::result::Result<Connection, String>>>,
    attempts: AtomicU32,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful connect and return the far end of that connection
    pub fn push_connection(&self) -> RemoteEnd {
        let (connection, remote) = Connection::pair();
        self.lock_pending().push_back(Ok(connection));
        remote
    }

    /// Queue a failed connect
    pub fn push_failure(&self, reason: impl Into<String>) {
        self.lock_pending().push_back(Err(reason.into()));
    }

    /// Number of `connect()` calls so far
    pub fn connect_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    fn lock_pending(
        &self,
    ) -> std::sync::MutexGuard<'_, VecDeque<std::result::Result<Connection, String>>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<Connection> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        match self.lock_pending().pop_front() {
            Some(Ok(connection)) => Ok(connection),
            Some(Err(reason)) => Err(MonitorError::Transport(reason)),
            None => Err(MonitorError::Transport("connection refused".to_string())),
        }
    }
}
