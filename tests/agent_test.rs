//! End-to-end tests for the agent: claim, run, record, delete, notify.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use quarry::agent::{Agent, AgentConfig, Notify};
use quarry::concurrency::ConcurrencyEnforcer;
use quarry::error::{Error, Result};
use quarry::model::{WorkError, WorkType};
use quarry::notify::{LocalTransport, NotifyType, Transport};
use quarry::queue::{PersistentQueue, PersistentQueueConfig, Queue, SupportedTypes};
use quarry::runner::{RecursableWork, RunnerRegistry, WorkRunner};
use quarry::store::MemoryStore;
use tokio::sync::watch;

const TYPE_TEST: u64 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct FakeJob {
    tag: String,
}

impl FakeJob {
    fn new(tag: &str) -> Self {
        Self { tag: tag.into() }
    }
}

impl WorkType for FakeJob {
    fn work_type(&self) -> u64 {
        TYPE_TEST
    }
}

/// Decodes jobs and reports each tag over a channel. Tags starting with
/// "fail" return a typed failure.
struct TestRunner {
    ran: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl WorkRunner for TestRunner {
    async fn run(&self, work: RecursableWork) -> Result<()> {
        let job: FakeJob = serde_json::from_slice(&work.payload)?;
        let _ = self.ran.send(job.tag.clone());
        if job.tag.starts_with("fail") {
            return Err(Error::WorkFailed(WorkError::new(404, "no such archive")));
        }
        Ok(())
    }
}

struct Harness {
    transport: LocalTransport,
    queue: Arc<PersistentQueue>,
    types: Arc<SupportedTypes>,
    agent: Arc<Agent>,
    ran: mpsc::UnboundedReceiver<String>,
    stop_tx: watch::Sender<bool>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn harness_with(limit: i64, registry_hook: impl FnOnce(&RunnerRegistry)) -> Harness {
    init_tracing();
    let transport = LocalTransport::new();
    let store = Arc::new(MemoryStore::new(transport.clone()));
    let (stop_tx, stop_rx) = watch::channel(false);

    let queue = Arc::new(PersistentQueue::new(PersistentQueueConfig {
        name: "test".into(),
        store,
        work_ready: transport.subscribe(NotifyType::WorkReady),
        work_complete: transport.subscribe(NotifyType::WorkComplete),
        chunks: transport.subscribe(NotifyType::ChunkReady),
        stop: stop_rx,
        address_poll_interval: Some(Duration::from_millis(100)),
        carrier_factory: None,
        wrapper: None,
        chunk_matcher: None,
    }));

    let types = Arc::new(SupportedTypes::new());
    let registry = Arc::new(RunnerRegistry::new(types.clone()));

    let (ran_tx, ran_rx) = mpsc::unbounded_channel();
    registry.add(TYPE_TEST, Arc::new(TestRunner { ran: ran_tx }));
    registry_hook(&registry);

    let enforcer = Arc::new(ConcurrencyEnforcer::new(
        &HashMap::from([(0u64, limit)]),
        &HashMap::new(),
        &[0],
    ));

    let agent = Agent::new(AgentConfig {
        runner: registry,
        queue: queue.clone(),
        enforcer,
        types: types.clone(),
        notifications: transport.subscribe(NotifyType::WorkComplete),
        wrapper: None,
        extend_interval: Some(Duration::from_millis(50)),
    });

    Harness {
        transport,
        queue,
        types,
        agent,
        ran: ran_rx,
        stop_tx,
    }
}

fn harness(limit: i64) -> Harness {
    harness_with(limit, |_| {})
}

fn notify_fn(transport: &LocalTransport) -> Notify {
    let transport = transport.clone();
    Arc::new(move |n| transport.notify(n))
}

#[tokio::test]
async fn agent_runs_addressed_work_and_poll_observes_success() {
    let mut h = harness(2);
    tokio::spawn(h.agent.clone().run(notify_fn(&h.transport)));

    h.queue
        .addressed_push(0, None, "abc", &FakeJob::new("ok"))
        .await
        .unwrap();

    let tag = tokio::time::timeout(Duration::from_secs(5), h.ran.recv())
        .await
        .expect("runner should execute")
        .unwrap();
    assert_eq!(tag, "ok");

    let mut poll = h.queue.poll_address("abc");
    let result = tokio::time::timeout(Duration::from_secs(5), poll.recv())
        .await
        .expect("poll should resolve")
        .expect("poll should yield a terminal message");
    assert!(result.is_ok());

    h.agent.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn failed_addressed_work_reports_the_typed_error() {
    let mut h = harness(2);
    tokio::spawn(h.agent.clone().run(notify_fn(&h.transport)));

    h.queue
        .addressed_push(0, None, "doomed", &FakeJob::new("fail-hard"))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), h.ran.recv())
        .await
        .expect("runner should execute")
        .unwrap();

    let mut poll = h.queue.poll_address("doomed");
    let result = tokio::time::timeout(Duration::from_secs(5), poll.recv())
        .await
        .expect("poll should resolve")
        .expect("poll should yield a terminal message");
    match result {
        Err(Error::WorkFailed(we)) => assert_eq!(we.code, 404),
        other => panic!("expected WorkFailed, got {other:?}"),
    }

    h.agent.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn agent_drains_all_pushed_work() {
    let mut h = harness(1);
    tokio::spawn(h.agent.clone().run(notify_fn(&h.transport)));

    for i in 0..5 {
        h.queue
            .push(0, None, &FakeJob::new(&format!("job-{i}")))
            .await
            .unwrap();
    }

    let mut seen = Vec::new();
    for _ in 0..5 {
        let tag = tokio::time::timeout(Duration::from_secs(5), h.ran.recv())
            .await
            .expect("runner should execute all jobs")
            .unwrap();
        seen.push(tag);
    }
    seen.sort();
    assert_eq!(seen, ["job-0", "job-1", "job-2", "job-3", "job-4"]);

    h.agent.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn stop_disables_all_work_types() {
    let h = harness(1);
    tokio::spawn(h.agent.clone().run(notify_fn(&h.transport)));
    tokio::time::sleep(Duration::from_millis(50)).await;

    h.agent.stop(Duration::from_secs(5)).await.unwrap();
    assert!(h.types.enabled().is_empty());
    drop(h.stop_tx);
}

/// Enters the recursion region and reports the agent's running-job count
/// from inside and after it.
struct RecursingRunner {
    agent: Arc<OnceLock<Arc<Agent>>>,
    counts: mpsc::UnboundedSender<(i64, i64, i64)>,
}

#[async_trait]
impl WorkRunner for RecursingRunner {
    async fn run(&self, work: RecursableWork) -> Result<()> {
        let agent = self.agent.get().expect("agent must be wired").clone();
        let scope = work.scope.expect_recursion();
        let recurser = scope.recurser().expect("agent work must carry a recurser");

        let before = agent.running_jobs();
        let inside_agent = agent.clone();
        let during = recurser
            .recurse(async move { inside_agent.running_jobs() })
            .await;
        let after = agent.running_jobs();

        let _ = self.counts.send((before, during, after));
        Ok(())
    }
}

#[tokio::test]
async fn recursion_releases_and_restores_the_concurrency_slot() {
    const TYPE_RECURSE: u64 = 3;

    #[derive(Serialize, Deserialize)]
    struct RecurseJob;
    impl WorkType for RecurseJob {
        fn work_type(&self) -> u64 {
            TYPE_RECURSE
        }
    }

    let agent_cell: Arc<OnceLock<Arc<Agent>>> = Arc::new(OnceLock::new());
    let (counts_tx, mut counts_rx) = mpsc::unbounded_channel();

    let h = harness_with(1, |registry| {
        registry.add(
            TYPE_RECURSE,
            Arc::new(RecursingRunner {
                agent: agent_cell.clone(),
                counts: counts_tx,
            }),
        );
    });
    agent_cell.set(h.agent.clone()).ok();

    tokio::spawn(h.agent.clone().run(notify_fn(&h.transport)));

    h.queue.push(0, None, &RecurseJob).await.unwrap();

    let (before, during, after) = tokio::time::timeout(Duration::from_secs(5), counts_rx.recv())
        .await
        .expect("recursing job should run")
        .unwrap();

    // Entering the region returns exactly one slot; leaving restores it.
    assert_eq!(before, 1);
    assert_eq!(during, 0);
    assert_eq!(after, 1);

    h.agent.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn recursing_job_does_not_starve_a_single_slot_agent() {
    const TYPE_BLOCKING: u64 = 4;

    #[derive(Serialize, Deserialize)]
    struct BlockingJob;
    impl WorkType for BlockingJob {
        fn work_type(&self) -> u64 {
            TYPE_BLOCKING
        }
    }

    /// Holds its recursion region open until an ordinary job completes,
    /// which can only happen if the region really released the slot.
    struct BlockingRunner {
        queue: Arc<dyn Queue>,
        unblocked: mpsc::UnboundedSender<()>,
    }

    #[async_trait]
    impl WorkRunner for BlockingRunner {
        async fn run(&self, work: RecursableWork) -> Result<()> {
            let scope = work.scope.expect_recursion();
            let recurser = scope.recurser().expect("agent work must carry a recurser");
            let queue = self.queue.clone();
            recurser
                .recurse(async move {
                    queue
                        .addressed_push(0, None, "nested", &FakeJob::new("nested"))
                        .await?;
                    let mut poll = queue.poll_address("nested");
                    poll.recv().await.unwrap_or(Ok(()))
                })
                .await?;
            let _ = self.unblocked.send(());
            Ok(())
        }
    }

    let transport = LocalTransport::new();
    let store = Arc::new(MemoryStore::new(transport.clone()));
    let (_stop_tx, stop_rx) = watch::channel(false);

    let queue: Arc<PersistentQueue> = Arc::new(PersistentQueue::new(PersistentQueueConfig {
        name: "test".into(),
        store,
        work_ready: transport.subscribe(NotifyType::WorkReady),
        work_complete: transport.subscribe(NotifyType::WorkComplete),
        chunks: transport.subscribe(NotifyType::ChunkReady),
        stop: stop_rx,
        address_poll_interval: Some(Duration::from_millis(100)),
        carrier_factory: None,
        wrapper: None,
        chunk_matcher: None,
    }));

    let types = Arc::new(SupportedTypes::new());
    let registry = Arc::new(RunnerRegistry::new(types.clone()));

    let (ran_tx, _ran_rx) = mpsc::unbounded_channel();
    registry.add(TYPE_TEST, Arc::new(TestRunner { ran: ran_tx }));

    let (unblocked_tx, mut unblocked_rx) = mpsc::unbounded_channel();
    registry.add(
        TYPE_BLOCKING,
        Arc::new(BlockingRunner {
            queue: queue.clone(),
            unblocked: unblocked_tx,
        }),
    );

    let enforcer = Arc::new(ConcurrencyEnforcer::new(
        &HashMap::from([(0u64, 1i64)]),
        &HashMap::new(),
        &[0],
    ));

    let agent = Agent::new(AgentConfig {
        runner: registry,
        queue: queue.clone(),
        enforcer,
        types,
        notifications: transport.subscribe(NotifyType::WorkComplete),
        wrapper: None,
        extend_interval: Some(Duration::from_millis(50)),
    });

    tokio::spawn(agent.clone().run(notify_fn(&transport)));

    // One slot total. The blocking job takes it, then waits inside its
    // recursion region for the nested job: a deadlock unless the region
    // released the slot.
    queue.push(0, None, &BlockingJob).await.unwrap();

    tokio::time::timeout(Duration::from_secs(10), unblocked_rx.recv())
        .await
        .expect("nested work should complete without deadlocking")
        .unwrap();

    agent.stop(Duration::from_secs(5)).await.unwrap();
}
