//! The priority queue: push, addressed push, the blocking claim protocol,
//! lease heartbeats, and addressed-work polling.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::fanout::Fanout;
use crate::model::{GroupId, Permit, QueueWork, Work, WorkError};
use crate::notify::{Notification, NotificationKind, NotifyType};
use crate::store::QueueStore;
use crate::telemetry::{
    CarrierFactory, JobLifecycleWrapper, NoopCarrierFactory, NoopLifecycle, metrics,
};

// ---------------------------------------------------------------------------
// Supported types
// ---------------------------------------------------------------------------

enum Enabled {
    Always(bool),
    Conditional(Box<dyn Fn() -> bool + Send + Sync>),
}

/// The set of work types an agent is currently willing to claim. Types are
/// disabled during shutdown so the claim loop drains instead of growing.
/// Conditional entries answer gating questions like "am I the leader
/// right now" at claim time.
#[derive(Default)]
pub struct SupportedTypes {
    types: RwLock<std::collections::HashMap<u64, Enabled>>,
}

impl SupportedTypes {
    pub fn new() -> Self {
        Self::default()
    }

    /// The currently enabled type tags. Conditional entries are evaluated
    /// on each call.
    pub fn enabled(&self) -> Vec<u64> {
        let types = self.types.read().expect("supported types lock poisoned");
        let mut results: Vec<u64> = types
            .iter()
            .filter(|(_, enabled)| match enabled {
                Enabled::Always(on) => *on,
                Enabled::Conditional(cond) => cond(),
            })
            .map(|(t, _)| *t)
            .collect();
        results.sort_unstable();
        results
    }

    pub fn set_enabled(&self, work_type: u64, enabled: bool) {
        self.types
            .write()
            .expect("supported types lock poisoned")
            .insert(work_type, Enabled::Always(enabled));
    }

    pub fn set_enabled_conditional(
        &self,
        work_type: u64,
        enabled: impl Fn() -> bool + Send + Sync + 'static,
    ) {
        self.types
            .write()
            .expect("supported types lock poisoned")
            .insert(work_type, Enabled::Conditional(Box::new(enabled)));
    }

    pub fn disable_all(&self) {
        let mut types = self.types.write().expect("supported types lock poisoned");
        for enabled in types.values_mut() {
            *enabled = Enabled::Always(false);
        }
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Decides whether a chunk-ready notification belongs to an address being
/// polled. Out-of-band chunked delivery tags notifications with its own
/// addressing scheme, so the mapping is pluggable.
pub trait ChunkMatcher: Send + Sync {
    fn matches(&self, n: &Notification, address: &str) -> bool;
}

/// Matches on the notification's own address field.
pub struct AddressChunkMatcher;

impl ChunkMatcher for AddressChunkMatcher {
    fn matches(&self, n: &Notification, address: &str) -> bool {
        matches!(&n.kind, NotificationKind::ChunkReady { address: a } if a == address)
    }
}

/// The queue operations exposed to producers, the agent, and the group
/// machinery.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Push new work. Lower priority numbers are claimed first.
    async fn push(&self, priority: u64, group: Option<GroupId>, work: &dyn Work) -> Result<()>;

    /// Push uniquely addressed work. An address can be reused, but only
    /// one occurrence may be live at any time; a collision fails with
    /// `Error::DuplicateAddress`.
    async fn addressed_push(
        &self,
        priority: u64,
        group: Option<GroupId>,
        address: &str,
        work: &dyn Work,
    ) -> Result<()>;

    /// Claim the next admissible item, blocking until one exists. While
    /// blocked the call wakes on work-ready events, on a new admission
    /// ceiling arriving over `ceiling`, or on the stop signal (which
    /// returns `Error::Stopped`).
    async fn get(
        &self,
        max_priority: u64,
        ceiling: &mut mpsc::Receiver<u64>,
        types: &SupportedTypes,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<QueueWork>;

    /// Heartbeat a claimed item's lease.
    async fn extend(&self, permit: Permit) -> Result<()>;

    /// Delete completed work and its permit.
    async fn delete(&self, permit: Permit) -> Result<()>;

    /// Read-only enumeration filtered by a caller predicate.
    async fn peek(
        &self,
        filter: &(dyn for<'a> Fn(&'a QueueWork) -> Result<bool> + Send + Sync),
        types: &[u64],
    ) -> Result<Vec<QueueWork>>;

    /// Record (or with `None`, clear) the failure for an address.
    async fn record_failure(&self, address: &str, failure: Option<WorkError>) -> Result<()>;

    /// Is a live item holding this address?
    async fn is_address_in_queue(&self, address: &str) -> Result<bool>;

    /// Watch an address until its work is done. The receiver yields one
    /// terminal message: `Ok(())` on success (or when chunked delivery
    /// begins), `Err(Error::WorkFailed)` when a failure was recorded, or
    /// the store error that ended polling.
    fn poll_address(&self, address: &str) -> mpsc::Receiver<Result<()>>;

    fn name(&self) -> &str;
}

pub struct PersistentQueueConfig {
    pub name: String,
    pub store: Arc<dyn QueueStore>,
    /// Upstream notification streams, usually transport subscriptions.
    pub work_ready: mpsc::Receiver<Notification>,
    pub work_complete: mpsc::Receiver<Notification>,
    pub chunks: mpsc::Receiver<Notification>,
    pub stop: watch::Receiver<bool>,
    /// Fallback poll cadence for `poll_address`. Defaults to 5s.
    pub address_poll_interval: Option<Duration>,
    pub carrier_factory: Option<Arc<dyn CarrierFactory>>,
    pub wrapper: Option<Arc<dyn JobLifecycleWrapper>>,
    pub chunk_matcher: Option<Arc<dyn ChunkMatcher>>,
}

/// A named queue over a persistent store, with an internal fan-out that
/// always drains the upstream notification streams.
pub struct PersistentQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    name: String,
    store: Arc<dyn QueueStore>,
    fanout: Fanout,
    address_poll_interval: Duration,
    carrier_factory: Arc<dyn CarrierFactory>,
    wrapper: Arc<dyn JobLifecycleWrapper>,
    chunk_matcher: Arc<dyn ChunkMatcher>,
}

impl PersistentQueue {
    pub fn new(cfg: PersistentQueueConfig) -> Self {
        let fanout = Fanout::spawn(cfg.work_ready, cfg.work_complete, cfg.chunks, cfg.stop);
        Self {
            inner: Arc::new(QueueInner {
                name: cfg.name,
                store: cfg.store,
                fanout,
                address_poll_interval: cfg
                    .address_poll_interval
                    .unwrap_or(Duration::from_secs(5)),
                carrier_factory: cfg
                    .carrier_factory
                    .unwrap_or_else(|| Arc::new(NoopCarrierFactory)),
                wrapper: cfg.wrapper.unwrap_or_else(|| Arc::new(NoopLifecycle)),
                chunk_matcher: cfg
                    .chunk_matcher
                    .unwrap_or_else(|| Arc::new(AddressChunkMatcher)),
            }),
        }
    }

    async fn measure_dequeue(&self, work: Option<&QueueWork>, result: &Result<()>) {
        if let Some(work) = work {
            metrics::work_claimed().add(
                1,
                &[
                    KeyValue::new("queue", self.inner.name.clone()),
                    KeyValue::new("work_type", work.work_type as i64),
                ],
            );
        }
        self.inner
            .wrapper
            .dequeue(&self.inner.name, work, result)
            .await;
    }
}

#[async_trait]
impl Queue for PersistentQueue {
    async fn push(&self, priority: u64, group: Option<GroupId>, work: &dyn Work) -> Result<()> {
        let payload = work.encode()?;
        let carrier = self.inner.carrier_factory.carrier(
            "queue-push",
            &self.inner.name,
            "",
            priority,
            work.work_type(),
            group,
        );
        let result = self
            .inner
            .store
            .push(
                &self.inner.name,
                group,
                priority,
                work.work_type(),
                &payload,
                &carrier,
            )
            .await;
        metrics::work_pushed().add(
            1,
            &[
                KeyValue::new("queue", self.inner.name.clone()),
                KeyValue::new("result", if result.is_ok() { "ok" } else { "error" }),
            ],
        );
        self.inner
            .wrapper
            .enqueue(&self.inner.name, work.work_type(), &result)
            .await;
        result
    }

    async fn addressed_push(
        &self,
        priority: u64,
        group: Option<GroupId>,
        address: &str,
        work: &dyn Work,
    ) -> Result<()> {
        let payload = work.encode()?;
        let carrier = self.inner.carrier_factory.carrier(
            "addressed-queue-push",
            &self.inner.name,
            address,
            priority,
            work.work_type(),
            group,
        );
        let result = self
            .inner
            .store
            .push_addressed(
                &self.inner.name,
                group,
                priority,
                work.work_type(),
                address,
                &payload,
                &carrier,
            )
            .await;
        let label = match &result {
            Ok(()) => "ok",
            Err(Error::DuplicateAddress) => "duplicate",
            Err(_) => "error",
        };
        metrics::work_pushed().add(
            1,
            &[
                KeyValue::new("queue", self.inner.name.clone()),
                KeyValue::new("result", label),
            ],
        );
        self.inner
            .wrapper
            .enqueue(&self.inner.name, work.work_type(), &result)
            .await;
        result
    }

    async fn get(
        &self,
        max_priority: u64,
        ceiling: &mut mpsc::Receiver<u64>,
        types: &SupportedTypes,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<QueueWork> {
        let mut max_priority = max_priority;

        // Fast path: claim without waiting for a wake-up if work is
        // already there.
        match self
            .inner
            .store
            .pop(&self.inner.name, max_priority, &types.enabled())
            .await
        {
            Ok(Some(work)) => {
                self.measure_dequeue(Some(&work), &Ok(())).await;
                return Ok(work);
            }
            Ok(None) => {}
            Err(e) => {
                self.measure_dequeue(None, &Err(Error::Store(e.to_string())))
                    .await;
                return Err(e);
            }
        }

        loop {
            // Subscribe before blocking so a push landing between the
            // failed pop and the select is not missed.
            {
                let mut ready = self.inner.fanout.subscribe_one(NotifyType::WorkReady, |_| true);
                tokio::select! {
                    _ = stop.wait_for(|s| *s) => return Err(Error::Stopped),
                    Some(priority) = ceiling.recv() => {
                        if priority != max_priority {
                            debug!(from = max_priority, to = priority, "admission ceiling changed");
                            max_priority = priority;
                        }
                    }
                    Some(n) = ready.rx.recv() => {
                        trace!(guid = %n.guid, "woken by work-ready notification");
                    }
                }
            }

            match self
                .inner
                .store
                .pop(&self.inner.name, max_priority, &types.enabled())
                .await
            {
                Ok(Some(work)) => {
                    self.measure_dequeue(Some(&work), &Ok(())).await;
                    return Ok(work);
                }
                Ok(None) => {}
                Err(e) => {
                    self.measure_dequeue(None, &Err(Error::Store(e.to_string())))
                        .await;
                    return Err(e);
                }
            }
        }
    }

    async fn extend(&self, permit: Permit) -> Result<()> {
        self.inner.store.notify_extend(permit).await
    }

    async fn delete(&self, permit: Permit) -> Result<()> {
        self.inner.store.delete(permit).await
    }

    async fn peek(
        &self,
        filter: &(dyn for<'a> Fn(&'a QueueWork) -> Result<bool> + Send + Sync),
        types: &[u64],
    ) -> Result<Vec<QueueWork>> {
        let work = self.inner.store.peek(types).await?;
        let mut results = Vec::new();
        for w in work {
            if filter(&w)? {
                results.push(w);
            }
        }
        Ok(results)
    }

    async fn record_failure(&self, address: &str, failure: Option<WorkError>) -> Result<()> {
        self.inner.store.record_address_failure(address, failure).await
    }

    async fn is_address_in_queue(&self, address: &str) -> Result<bool> {
        self.inner.store.address_in_progress(address).await
    }

    fn poll_address(&self, address: &str) -> mpsc::Receiver<Result<()>> {
        let (tx, rx) = mpsc::channel(1);
        let inner = self.inner.clone();
        let address = address.to_string();

        tokio::spawn(async move {
            // Whether the last wake-up came from the fallback ticker
            // rather than a notification.
            let mut ticked = false;
            loop {
                match inner.store.address_complete(&address).await {
                    Err(e) if e.is_locked() => {
                        // Transient; wait and re-check like any other miss.
                        trace!(%address, "address poll hit a lock error");
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                    Ok((done, failure)) => {
                        if done {
                            debug!(%address, "queue work completed");
                            if ticked {
                                metrics::notification_misses().add(
                                    1,
                                    &[KeyValue::new("queue", inner.name.clone())],
                                );
                            }
                            let msg = match failure {
                                Some(we) => Err(Error::WorkFailed(we)),
                                None => Ok(()),
                            };
                            let _ = tx.send(msg).await;
                            return;
                        }
                    }
                }

                // Wait for a completion event targeting this address, a
                // chunk event, or the fallback tick.
                let addr = address.clone();
                let mut completed = inner.fanout.subscribe_one(NotifyType::WorkComplete, move |n| {
                    matches!(&n.kind, NotificationKind::WorkComplete { address } if *address == addr)
                });
                let addr = address.clone();
                let matcher = inner.chunk_matcher.clone();
                let mut chunk = inner
                    .fanout
                    .subscribe_one(NotifyType::ChunkReady, move |n| matcher.matches(n, &addr));

                let chunk_ready = tokio::select! {
                    Some(_) = completed.rx.recv() => {
                        debug!(%address, "notified of work completion");
                        ticked = false;
                        false
                    }
                    Some(_) = chunk.rx.recv() => {
                        debug!(%address, "notified of chunk availability");
                        ticked = false;
                        true
                    }
                    _ = tokio::time::sleep(inner.address_poll_interval) => {
                        ticked = true;
                        false
                    }
                };

                // Chunked delivery starting means the caller can begin
                // reading; stop polling immediately.
                if chunk_ready {
                    let _ = tx.send(Ok(())).await;
                    return;
                }
            }
        });

        rx
    }

    fn name(&self) -> &str {
        &self.inner.name
    }
}
