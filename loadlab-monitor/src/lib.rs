//! LoadLab Live Monitor Library
//!
//! Live push channel with bounded recovery, polling fallback, bounded live
//! feeds and client-side trace reconstruction for the LoadLab control panel.

pub mod api;
pub mod channel;
pub mod config;
pub mod error;
pub mod feed;
pub mod reconciler;
pub mod trace;
pub mod transport;

// Re-export commonly used types
pub use api::BackendClient;
pub use channel::{
    ConnectionState, ConnectionStatus, Delivery, InboundMessage, LiveChannel, MessageKind,
    Subscription,
};
pub use config::MonitorConfig;
pub use error::{MonitorError, Result};
pub use feed::{LiveFeedAggregator, SharedFeed, Snapshot};
pub use reconciler::{PollingReconciler, ReconcileStatus, SnapshotSource};
pub use trace::{reconstruct, EventClass, ReconstructedTrace, TraceView};
pub use transport::{MemoryTransport, Transport, WebSocketTransport};
