//! Maintenance tasks: the permit monitor and the permit sweeper.
//!
//! Together they expire leases whose owning agent has died. The monitor
//! is a long-lived task recording heartbeat notifications; the sweeper is
//! a periodic pass that deletes permits the monitor reports stale,
//! reopening their work items.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

use crate::model::Permit;
use crate::notify::{NotificationKind, NotifyType, Transport};
use crate::store::QueueStore;

struct PermitCheck {
    permit: u64,
    created: DateTime<Utc>,
    max_age: Duration,
    respond: oneshot::Sender<bool>,
}

pub struct PermitMonitorConfig {
    pub queue_name: String,
    pub store: Arc<dyn QueueStore>,
    /// Heartbeats older than this are dropped from the map.
    pub sweep_age: Duration,
}

/// Tracks permit heartbeats and answers staleness checks. Answers only
/// while `run` is active; checks made before boot or after shutdown
/// report "stale" rather than guessing.
pub struct PermitMonitor {
    queue_name: String,
    store: Arc<dyn QueueStore>,
    sweep_age: Duration,
    checks: Mutex<Option<mpsc::Sender<PermitCheck>>>,
}

impl PermitMonitor {
    pub fn new(cfg: PermitMonitorConfig) -> Self {
        Self {
            queue_name: cfg.queue_name,
            store: cfg.store,
            sweep_age: cfg.sweep_age,
            checks: Mutex::new(None),
        }
    }

    /// Run until the stop signal fires. Subscribes to permit-extension
    /// events and seeds the heartbeat map from the store, so permits
    /// claimed before boot get a fresh grace period instead of an
    /// immediate expiry.
    pub async fn run(&self, transport: &dyn Transport, mut stop: watch::Receiver<bool>) {
        let mut extensions = transport.subscribe(NotifyType::PermitExtended);

        let (check_tx, mut check_rx) = mpsc::channel::<PermitCheck>(16);
        *self.checks.lock().expect("monitor lock poisoned") = Some(check_tx);

        let mut heartbeats: HashMap<u64, DateTime<Utc>> = HashMap::new();
        self.refresh_heartbeats(&mut heartbeats).await;
        let started = Utc::now();

        let mut sweep = tokio::time::interval(Duration::from_secs(60));
        sweep.tick().await; // discard the immediate tick

        loop {
            tokio::select! {
                _ = stop.changed() => break,
                Some(n) = extensions.recv() => {
                    if let NotificationKind::PermitExtended { permit } = n.kind {
                        heartbeats.insert(permit, Utc::now());
                    }
                }
                Some(check) = check_rx.recv() => {
                    let alive = Self::alive(&heartbeats, started, &check);
                    let _ = check.respond.send(alive);
                }
                _ = sweep.tick() => {
                    let horizon = Utc::now() - self.sweep_age;
                    heartbeats.retain(|_, seen| *seen > horizon);
                }
            }
        }

        *self.checks.lock().expect("monitor lock poisoned") = None;
    }

    fn alive(heartbeats: &HashMap<u64, DateTime<Utc>>, started: DateTime<Utc>, check: &PermitCheck) -> bool {
        let horizon = Utc::now()
            - chrono::Duration::from_std(check.max_age).unwrap_or(chrono::Duration::zero());
        if heartbeats.get(&check.permit).is_some_and(|seen| *seen > horizon) {
            return true;
        }
        // Grace periods: a freshly created permit may not have heartbeated
        // yet, and a freshly booted monitor has not seen anyone's
        // heartbeats.
        check.created > horizon || started > horizon
    }

    async fn refresh_heartbeats(&self, heartbeats: &mut HashMap<u64, DateTime<Utc>>) {
        match self.store.permits(&self.queue_name).await {
            Ok(permits) => {
                for permit in permits {
                    heartbeats.entry(permit.id.0).or_insert_with(Utc::now);
                }
            }
            Err(e) => {
                debug!(error = %e, "permit monitor failed to refresh heartbeat map");
            }
        }
    }

    /// Is the permit still alive? `false` means the sweeper may expire it.
    pub async fn check(&self, permit: u64, created: DateTime<Utc>, max_age: Duration) -> bool {
        let sender = self.checks.lock().expect("monitor lock poisoned").clone();
        let Some(sender) = sender else {
            return false;
        };

        let (respond, response) = oneshot::channel();
        if sender
            .send(PermitCheck {
                permit,
                created,
                max_age,
                respond,
            })
            .await
            .is_err()
        {
            return false;
        }
        response.await.unwrap_or(false)
    }
}

pub struct PermitSweeperConfig {
    pub queue_name: String,
    pub store: Arc<dyn QueueStore>,
    pub monitor: Arc<PermitMonitor>,
    /// Expire permits with no heartbeat for this long.
    pub sweep_for: Duration,
}

/// One sweep pass over the queue's permits. Schedule it with whatever
/// periodic runner the embedding application uses.
pub struct PermitSweeper {
    queue_name: String,
    store: Arc<dyn QueueStore>,
    monitor: Arc<PermitMonitor>,
    sweep_for: Duration,
}

impl PermitSweeper {
    pub fn new(cfg: PermitSweeperConfig) -> Self {
        Self {
            queue_name: cfg.queue_name,
            store: cfg.store,
            monitor: cfg.monitor,
            sweep_for: cfg.sweep_for,
        }
    }

    pub async fn run(&self) {
        let permits = match self.store.permits(&self.queue_name).await {
            Ok(permits) => permits,
            Err(e) => {
                debug!(error = %e, "error listing permits while sweeping");
                return;
            }
        };

        for permit in permits {
            if self
                .monitor
                .check(permit.id.0, permit.created_at, self.sweep_for)
                .await
            {
                continue;
            }
            debug!(permit = permit.id.0, "sweeping expired queue permit");
            if let Err(e) = self.store.permit_delete(Permit(permit.id.0)).await {
                debug!(permit = permit.id.0, error = %e, "error removing expired permit");
                return;
            }
        }
    }
}
