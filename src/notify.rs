//! Notification types and transports.
//!
//! Notifications are wake-up signals, not a delivery mechanism: every
//! consumer re-checks store state after waking. The bundled transports are
//! an in-process fan-out for single-node deployments and tests, and a
//! Postgres LISTEN-based bridge for multi-node deployments.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;

/// Logical notification streams. Filters for subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyType {
    /// Work may be claimable. Wakes blocked `get` callers.
    WorkReady,
    /// Addressed work was completed and deleted.
    WorkComplete,
    /// An out-of-band chunk for addressed work is ready for download.
    ChunkReady,
    /// A queue permit was heartbeated.
    PermitExtended,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationKind {
    WorkReady,
    WorkComplete { address: String },
    ChunkReady { address: String },
    PermitExtended { permit: u64 },
}

impl NotificationKind {
    pub fn notify_type(&self) -> NotifyType {
        match self {
            NotificationKind::WorkReady => NotifyType::WorkReady,
            NotificationKind::WorkComplete { .. } => NotifyType::WorkComplete,
            NotificationKind::ChunkReady { .. } => NotifyType::ChunkReady,
            NotificationKind::PermitExtended { .. } => NotifyType::PermitExtended,
        }
    }
}

/// A typed event delivered over a transport. The guid exists for log
/// correlation across process boundaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub guid: Uuid,
    pub kind: NotificationKind,
}

impl Notification {
    pub fn new(kind: NotificationKind) -> Self {
        Self {
            guid: Uuid::new_v4(),
            kind,
        }
    }

    pub fn work_ready() -> Self {
        Self::new(NotificationKind::WorkReady)
    }

    pub fn work_complete(address: impl Into<String>) -> Self {
        Self::new(NotificationKind::WorkComplete {
            address: address.into(),
        })
    }

    pub fn chunk_ready(address: impl Into<String>) -> Self {
        Self::new(NotificationKind::ChunkReady {
            address: address.into(),
        })
    }

    pub fn permit_extended(permit: u64) -> Self {
        Self::new(NotificationKind::PermitExtended { permit })
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// The cross-process notification seam the queue and maintenance tasks
/// consume. Subscriptions are typed streams; `notify` is fire-and-forget.
pub trait Transport: Send + Sync {
    fn subscribe(&self, kind: NotifyType) -> mpsc::Receiver<Notification>;
    fn notify(&self, n: Notification);
}

// ---------------------------------------------------------------------------
// Local transport
// ---------------------------------------------------------------------------

struct LocalSink {
    kind: NotifyType,
    tx: mpsc::Sender<Notification>,
}

/// In-process transport for single-node deployments. Subscribers get
/// bounded channels; sends never block and drop when a subscriber lags,
/// since every consumer re-checks the store after waking.
#[derive(Clone)]
pub struct LocalTransport {
    inner: Arc<LocalInner>,
}

struct LocalInner {
    sinks: std::sync::Mutex<Vec<LocalSink>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(LocalInner {
                sinks: std::sync::Mutex::new(Vec::new()),
            }),
        }
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for LocalTransport {
    fn subscribe(&self, kind: NotifyType) -> mpsc::Receiver<Notification> {
        let (tx, rx) = mpsc::channel(16);
        self.inner
            .sinks
            .lock()
            .expect("local transport lock poisoned")
            .push(LocalSink { kind, tx });
        rx
    }

    fn notify(&self, n: Notification) {
        let kind = n.kind.notify_type();
        let mut sinks = self
            .inner
            .sinks
            .lock()
            .expect("local transport lock poisoned");
        // Dropped receivers are pruned as a side effect of delivery.
        sinks.retain(|s| {
            if s.tx.is_closed() {
                return false;
            }
            if s.kind == kind {
                let _ = s.tx.try_send(n.clone());
            }
            true
        });
    }
}

// ---------------------------------------------------------------------------
// Postgres transport
// ---------------------------------------------------------------------------

/// Bridges a Postgres LISTEN channel into typed local subscriptions. The
/// store emits `pg_notify` on the same channel at commit time, so every
/// node sees the events regardless of which node wrote them.
pub struct PgTransport {
    local: LocalTransport,
    channel: String,
}

impl PgTransport {
    /// Connect a listener and start forwarding payloads. The forwarding
    /// task runs until the stop signal fires or the connection is lost.
    pub async fn connect(
        pool: &sqlx::PgPool,
        channel: impl Into<String>,
        mut stop: watch::Receiver<bool>,
    ) -> Result<Self> {
        let channel = channel.into();
        let mut listener = sqlx::postgres::PgListener::connect_with(pool).await?;
        listener.listen(&channel).await?;

        let local = LocalTransport::new();
        let fwd = local.clone();
        let chan = channel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.changed() => return,
                    msg = listener.recv() => match msg {
                        Ok(msg) => match serde_json::from_str::<Notification>(msg.payload()) {
                            Ok(n) => fwd.notify(n),
                            Err(e) => warn!(channel = %chan, error = %e, "discarding undecodable notification"),
                        },
                        Err(e) => {
                            debug!(channel = %chan, error = %e, "notification listener disconnected");
                            return;
                        }
                    },
                }
            }
        });

        Ok(Self { local, channel })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl Transport for PgTransport {
    fn subscribe(&self, kind: NotifyType) -> mpsc::Receiver<Notification> {
        self.local.subscribe(kind)
    }

    /// Local-only delivery. Cross-node publication happens through the
    /// store's `pg_notify` calls, which loop back through the listener.
    fn notify(&self, n: Notification) {
        self.local.notify(n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_transport_delivers_by_type() {
        let t = LocalTransport::new();
        let mut ready = t.subscribe(NotifyType::WorkReady);
        let mut complete = t.subscribe(NotifyType::WorkComplete);

        t.notify(Notification::work_ready());
        t.notify(Notification::work_complete("abc"));

        let n = ready.recv().await.unwrap();
        assert!(matches!(n.kind, NotificationKind::WorkReady));
        let n = complete.recv().await.unwrap();
        match n.kind {
            NotificationKind::WorkComplete { address } => assert_eq!(address, "abc"),
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropped_subscriber_is_pruned() {
        let t = LocalTransport::new();
        let rx = t.subscribe(NotifyType::WorkReady);
        drop(rx);
        // Deliver twice; the second pass must not see the dead sink.
        t.notify(Notification::work_ready());
        t.notify(Notification::work_ready());
    }
}
