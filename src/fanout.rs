//! Internal notification fan-out owned by the queue.
//!
//! The queue must never stop draining its three upstream streams: a
//! blocked upstream can deadlock a single-node deployment where the
//! completing job and the waiting claimer share a process. This dispatcher
//! always consumes work-ready, work-complete, and chunk-ready events,
//! delivering to currently-registered sinks and discarding the rest.
//!
//! Sinks are capacity-1 bounded channels: the only contract is "wake
//! someone up if anyone is listening", not delivery.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::trace;

use crate::notify::{Notification, NotifyType};

/// Predicate deciding whether a one-shot subscription matches an event.
pub type Matcher = Box<dyn Fn(&Notification) -> bool + Send>;

/// Deliveries to completion/chunk sinks give the receiver this long to
/// pick the event up before discarding it.
const SEND_TIMEOUT: Duration = Duration::from_millis(300);

enum Command {
    Subscribe(Sink),
    Unsubscribe(u64),
}

struct Sink {
    id: u64,
    kind: NotifyType,
    /// One-shot predicate. When it matches, the event is delivered once
    /// and the sink retires itself.
    one: Option<Matcher>,
    /// Set once a one-shot sink has delivered; filtered after dispatch.
    used: bool,
    tx: mpsc::Sender<Notification>,
}

/// Handle to the dispatcher task. Cheap to clone.
#[derive(Clone)]
pub struct Fanout {
    cmds: mpsc::UnboundedSender<Command>,
    next_id: Arc<AtomicU64>,
}

/// A registered sink. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    pub rx: mpsc::Receiver<Notification>,
    cmds: mpsc::UnboundedSender<Command>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.cmds.send(Command::Unsubscribe(self.id));
    }
}

impl Fanout {
    /// Start the dispatcher over the three upstream streams. Runs until
    /// the stop signal fires or every upstream closes.
    pub fn spawn(
        mut work_ready: mpsc::Receiver<Notification>,
        mut work_complete: mpsc::Receiver<Notification>,
        mut chunks: mpsc::Receiver<Notification>,
        mut stop: watch::Receiver<bool>,
    ) -> Self {
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut sinks: Vec<Sink> = Vec::new();
            loop {
                tokio::select! {
                    _ = stop.changed() => return,
                    Some(cmd) = cmd_rx.recv() => match cmd {
                        Command::Subscribe(sink) => sinks.push(sink),
                        Command::Unsubscribe(id) => sinks.retain(|s| s.id != id),
                    },
                    Some(n) = work_ready.recv() => {
                        deliver(&mut sinks, NotifyType::WorkReady, n, None).await;
                    }
                    Some(n) = work_complete.recv() => {
                        deliver(&mut sinks, NotifyType::WorkComplete, n, Some(SEND_TIMEOUT)).await;
                    }
                    Some(n) = chunks.recv() => {
                        deliver(&mut sinks, NotifyType::ChunkReady, n, Some(SEND_TIMEOUT)).await;
                    }
                    else => return,
                }
            }
        });

        Self {
            cmds: cmd_tx,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Register a sink that receives exactly one event matching the
    /// predicate, then retires. Dropping the subscription cancels it if no
    /// event ever matches.
    pub fn subscribe_one(
        &self,
        kind: NotifyType,
        matcher: impl Fn(&Notification) -> bool + Send + 'static,
    ) -> Subscription {
        self.subscribe_inner(kind, Some(Box::new(matcher)))
    }

    /// Register a persistent sink for every event of the given type.
    pub fn subscribe(&self, kind: NotifyType) -> Subscription {
        self.subscribe_inner(kind, None)
    }

    fn subscribe_inner(&self, kind: NotifyType, one: Option<Matcher>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(1);
        let _ = self.cmds.send(Command::Subscribe(Sink {
            id,
            kind,
            one,
            used: false,
            tx,
        }));
        Subscription {
            id,
            rx,
            cmds: self.cmds.clone(),
        }
    }
}

async fn deliver(sinks: &mut Vec<Sink>, kind: NotifyType, n: Notification, timeout: Option<Duration>) {
    let mut retired = false;
    for sink in sinks.iter_mut() {
        if sink.kind != kind || sink.used {
            continue;
        }
        match &sink.one {
            Some(matcher) => {
                if matcher(&n) {
                    send(&sink.tx, n.clone(), timeout).await;
                    sink.used = true;
                    retired = true;
                }
            }
            None => send(&sink.tx, n.clone(), timeout).await,
        }
    }
    if retired {
        sinks.retain(|s| !s.used);
    }
    trace!(?kind, guid = %n.guid, "fanout delivered");
}

async fn send(tx: &mpsc::Sender<Notification>, n: Notification, timeout: Option<Duration>) {
    match timeout {
        Some(t) => {
            let _ = tokio::time::timeout(t, tx.send(n)).await;
        }
        None => {
            // Capacity-1 sink: buffers one wake-up even if the receiver is
            // between polls. Drop instead of blocking the dispatch loop.
            let _ = tx.try_send(n);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NotificationKind;

    fn harness() -> (
        Fanout,
        mpsc::Sender<Notification>,
        mpsc::Sender<Notification>,
        watch::Sender<bool>,
    ) {
        let (ready_tx, ready_rx) = mpsc::channel(4);
        let (complete_tx, complete_rx) = mpsc::channel(4);
        let (_chunk_tx, chunk_rx) = mpsc::channel(4);
        let (stop_tx, stop_rx) = watch::channel(false);
        let fanout = Fanout::spawn(ready_rx, complete_rx, chunk_rx, stop_rx);
        (fanout, ready_tx, complete_tx, stop_tx)
    }

    #[tokio::test]
    async fn one_shot_delivers_once_and_retires() {
        let (fanout, ready_tx, _c, _stop) = harness();

        let mut sub = fanout.subscribe_one(NotifyType::WorkReady, |_| true);
        ready_tx.send(Notification::work_ready()).await.unwrap();

        assert!(sub.rx.recv().await.is_some());

        // Second event: sink retired, channel eventually closes or stays
        // empty. Either way no second delivery arrives.
        ready_tx.send(Notification::work_ready()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sub.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn one_shot_filters_on_predicate() {
        let (fanout, _r, complete_tx, _stop) = harness();

        let mut sub = fanout.subscribe_one(NotifyType::WorkComplete, |n| {
            matches!(&n.kind, NotificationKind::WorkComplete { address } if address == "abc")
        });

        complete_tx
            .send(Notification::work_complete("other"))
            .await
            .unwrap();
        complete_tx
            .send(Notification::work_complete("abc"))
            .await
            .unwrap();

        let n = sub.rx.recv().await.unwrap();
        match n.kind {
            NotificationKind::WorkComplete { address } => assert_eq!(address, "abc"),
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[tokio::test]
    async fn events_without_subscribers_are_discarded() {
        let (fanout, ready_tx, _c, _stop) = harness();

        // No sinks registered; the dispatcher must keep draining.
        for _ in 0..8 {
            ready_tx.send(Notification::work_ready()).await.unwrap();
        }

        // A late subscriber still works.
        let mut sub = fanout.subscribe_one(NotifyType::WorkReady, |_| true);
        ready_tx.send(Notification::work_ready()).await.unwrap();
        assert!(sub.rx.recv().await.is_some());
    }
}
