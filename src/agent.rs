//! The scheduler. Claims admissible work, runs it on per-job tasks,
//! heartbeats leases, and supports deadlock-safe recursive re-entry into
//! the queue from inside running jobs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tracing::{Instrument, debug, trace};

use crate::concurrency::ConcurrencyEnforcer;
use crate::error::{Error, Result};
use crate::model::{QueueWork, WorkError};
use crate::notify::Notification;
use crate::queue::{Queue, SupportedTypes};
use crate::runner::{ExecScope, RecursableWork, WorkRunner};
use crate::sync::WaitGroup;
use crate::telemetry::{self, JobLifecycleWrapper, NoopLifecycle, metrics};

/// Publishes a notification, usually through the composition root's
/// transport. Called after addressed work has been deleted.
pub type Notify = Arc<dyn Fn(Notification) + Send + Sync>;

pub struct AgentConfig {
    pub runner: Arc<dyn WorkRunner>,
    pub queue: Arc<dyn Queue>,
    pub enforcer: Arc<ConcurrencyEnforcer>,
    pub types: Arc<SupportedTypes>,
    /// External notification stream. The agent only drains and discards
    /// it while blocked on capacity, so completions in a single-process
    /// deployment are not starved.
    pub notifications: mpsc::Receiver<Notification>,
    pub wrapper: Option<Arc<dyn JobLifecycleWrapper>>,
    /// Lease heartbeat cadence. Defaults to 5s.
    pub extend_interval: Option<Duration>,
}

struct CoreState {
    running_jobs: i64,
    /// Permit -> the job's may-recurse marker. Lets `stop` distinguish
    /// jobs worth waiting on from ordinary completions.
    running_work: HashMap<u64, Arc<AtomicBool>>,
}

pub(crate) struct AgentCore {
    state: Mutex<CoreState>,
    job_done: mpsc::Sender<i64>,
    recursing: WaitGroup,
    running: WaitGroup,
}

/// The recurse capability handed to jobs through their [`ExecScope`].
///
/// A job that needs to call back into the queue (directly, or through
/// anything that blocks on queue completion) runs that call inside
/// `recurse`. Entering the region returns the job's concurrency slot to
/// the scheduler so the nested work can be admitted; leaving restores it.
/// Without this, jobs waiting on each other exhaust every slot and the
/// queue deadlocks.
#[derive(Clone)]
pub struct Recurser {
    core: Arc<AgentCore>,
}

impl Recurser {
    pub async fn recurse<T>(&self, fut: impl Future<Output = T> + Send) -> T {
        self.core.recursing.add();

        let running = {
            let mut state = self.core.state.lock().expect("agent state lock poisoned");
            state.running_jobs -= 1;
            trace!(
                running_jobs = state.running_jobs,
                "recursion released a concurrency slot"
            );
            state.running_jobs
        };
        // Best-effort wake-up for a blocked Wait; nothing listening is fine.
        let _ = self.core.job_done.try_send(running);

        let out = fut.await;

        {
            let mut state = self.core.state.lock().expect("agent state lock poisoned");
            state.running_jobs += 1;
        }
        self.core.recursing.done();
        out
    }
}

pub struct Agent {
    runner: Arc<dyn WorkRunner>,
    queue: Arc<dyn Queue>,
    enforcer: Arc<ConcurrencyEnforcer>,
    types: Arc<SupportedTypes>,
    wrapper: Arc<dyn JobLifecycleWrapper>,
    extend: Duration,

    core: Arc<AgentCore>,

    msgs: AsyncMutex<mpsc::Receiver<Notification>>,
    job_done_rx: AsyncMutex<mpsc::Receiver<i64>>,
    ceiling_tx: mpsc::Sender<u64>,
    ceiling_rx: AsyncMutex<mpsc::Receiver<u64>>,

    stop_tx: watch::Sender<bool>,
    done_tx: watch::Sender<bool>,
}

impl Agent {
    pub fn new(cfg: AgentConfig) -> Arc<Self> {
        // Capacity-1 wake-up channels: senders drop when nobody listens.
        let (job_done_tx, job_done_rx) = mpsc::channel(1);
        let (ceiling_tx, ceiling_rx) = mpsc::channel(1);
        let (stop_tx, _) = watch::channel(false);
        let (done_tx, _) = watch::channel(false);

        Arc::new(Self {
            runner: cfg.runner,
            queue: cfg.queue,
            enforcer: cfg.enforcer,
            types: cfg.types,
            wrapper: cfg.wrapper.unwrap_or_else(|| Arc::new(NoopLifecycle)),
            extend: cfg.extend_interval.unwrap_or(Duration::from_secs(5)),
            core: Arc::new(AgentCore {
                state: Mutex::new(CoreState {
                    running_jobs: 0,
                    running_work: HashMap::new(),
                }),
                job_done: job_done_tx,
                recursing: WaitGroup::new(),
                running: WaitGroup::new(),
            }),
            msgs: AsyncMutex::new(cfg.notifications),
            job_done_rx: AsyncMutex::new(job_done_rx),
            ceiling_tx,
            ceiling_rx: AsyncMutex::new(ceiling_rx),
            stop_tx,
            done_tx,
        })
    }

    /// The number of jobs currently holding a concurrency slot.
    pub fn running_jobs(&self) -> i64 {
        self.core
            .state
            .lock()
            .expect("agent state lock poisoned")
            .running_jobs
    }

    /// Block until the enforcer reports capacity, returning the admission
    /// ceiling. Re-checks on every job-done signal. Drains the external
    /// notification stream the whole time.
    async fn wait(&self, mut running: i64, job_done: &mut mpsc::Receiver<i64>) -> u64 {
        let mut msgs = self.msgs.lock().await;
        loop {
            let (capacity, priority) = self.enforcer.check(running);
            if capacity {
                return priority;
            }
            trace!("concurrency limit reached; waiting for a job to complete");
            tokio::select! {
                Some(_) = msgs.recv() => {
                    // Discard. Only the queue's own fan-out consumes these
                    // for real; the agent must just keep them flowing.
                }
                Some(n) = job_done.recv() => {
                    trace!(running_jobs = n, "job completed; re-checking capacity");
                    running = n;
                }
            }
        }
    }

    /// The main claim loop. Runs until `stop` completes the shutdown
    /// handshake.
    pub async fn run(self: Arc<Self>, notify: Notify) {
        let mut job_done_rx = self.job_done_rx.lock().await;
        let mut ceiling_rx = self.ceiling_rx.lock().await;
        let mut stop_rx = self.stop_tx.subscribe();

        let mut retry: u32 = 0;
        loop {
            let running = self.running_jobs();
            let max_priority = self.wait(running, &mut job_done_rx).await;

            let work = match self
                .queue
                .get(max_priority, &mut ceiling_rx, &self.types, &mut stop_rx)
                .await
            {
                Ok(work) => work,
                Err(e) if e.is_locked() => {
                    // Let competing claimers through, then retry.
                    trace!(error = %e, "lock contention during claim");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
                Err(Error::Stopped) => break,
                Err(e) => {
                    debug!(error = %e, "claim failed; backing off before retry");
                    let exp = 2u64.pow(retry.min(10)).min(1000);
                    tokio::time::sleep(Duration::from_millis(exp * 100)).await;
                    retry += 1;
                    continue;
                }
            };
            retry = 0;

            trace!(
                max_priority,
                work_type = work.work_type,
                address = work.address.as_deref().unwrap_or(""),
                permit = work.permit.0,
                "claimed a job"
            );

            let may_recurse = Arc::new(AtomicBool::new(false));
            let scope = ExecScope::new(
                Some(Recurser {
                    core: self.core.clone(),
                }),
                may_recurse.clone(),
            );

            {
                let mut state = self.core.state.lock().expect("agent state lock poisoned");
                state.running_jobs += 1;
                state.running_work.insert(work.permit.0, may_recurse);
            }

            // Join accounting happens before the spawn so `stop` cannot
            // miss a job that is about to start.
            self.core.running.add();
            let agent = self.clone();
            let notify = notify.clone();
            tokio::spawn(async move {
                agent.run_job(work, scope, notify).await;
            });
        }

        let _ = self.done_tx.send(true);
    }

    async fn run_job(&self, work: QueueWork, scope: ExecScope, notify: Notify) {
        let span = telemetry::start_job_span(self.queue.name(), work.work_type, work.permit.0);
        self.wrapper.job_started(&work).await;
        let started = Instant::now();

        // Heartbeat the lease for as long as the job runs.
        let extender = {
            let queue = self.queue.clone();
            let permit = work.permit;
            let every = self.extend;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(every);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await; // immediate first tick
                loop {
                    ticker.tick().await;
                    trace!(permit = permit.0, "extending job lease");
                    if let Err(e) = queue.extend(permit).await {
                        debug!(permit = permit.0, error = %e, "error extending job lease");
                    }
                }
            })
        };

        let result = self
            .runner
            .run(RecursableWork {
                payload: work.payload.clone(),
                work_type: work.work_type,
                scope,
            })
            .instrument(span)
            .await;

        if let Err(e) = &result {
            debug!(
                work_type = work.work_type,
                address = work.address.as_deref().unwrap_or(""),
                error = %e,
                "job returned error"
            );
        }

        // For addressed work, record the outcome. A success clears any
        // failure left by an earlier run of the same address.
        if let Some(address) = &work.address {
            let failure = result.as_ref().err().map(WorkError::from_error);
            if let Err(e) = self.queue.record_failure(address, failure).await {
                debug!(%address, error = %e, "failed recording addressed work result");
            }
        }

        extender.abort();
        metrics::job_duration_ms().record(
            started.elapsed().as_millis() as f64,
            &[
                KeyValue::new("queue", self.queue.name().to_string()),
                KeyValue::new("work_type", work.work_type as i64),
            ],
        );

        let running = {
            let mut state = self.core.state.lock().expect("agent state lock poisoned");
            state.running_jobs -= 1;
            state.running_work.remove(&work.permit.0);
            state.running_jobs
        };
        let _ = self.core.job_done.try_send(running);

        if let Err(e) = self.queue.delete(work.permit).await {
            debug!(permit = work.permit.0, error = %e, "queue delete failed");
        }

        // Completion must be announced only after the row is gone, so a
        // woken poller observes the address as done.
        if let Some(address) = &work.address {
            notify(Notification::work_complete(address.clone()));
            trace!(%address, "notified of addressed work completion");
        }

        let (capacity, priority) = self.enforcer.check(running);
        if capacity {
            // Wake the claim loop if it is blocked on a narrower ceiling.
            let _ = self.ceiling_tx.try_send(priority);
        }

        self.wrapper.job_finished(&work, &result).await;
        self.core.running.done();
    }

    fn has_jobs_expecting_recursion(&self) -> bool {
        self.core
            .state
            .lock()
            .expect("agent state lock poisoned")
            .running_work
            .values()
            .any(|flag| flag.load(Ordering::SeqCst))
    }

    /// Poll until no running job is marked may-recurse, bounded by the
    /// timeout. Gives marked jobs a chance to enter and leave their
    /// recursion regions before shutdown proceeds.
    async fn wait_for_declared_recursion(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut ticker = tokio::time::interval(Duration::from_millis(100));
        loop {
            tokio::select! {
                _ = &mut deadline => return false,
                _ = ticker.tick() => {
                    if !self.has_jobs_expecting_recursion() {
                        return true;
                    }
                }
            }
        }
    }

    /// Graceful shutdown: wait (bounded) for may-recurse jobs, wait for
    /// in-flight recursions, stop accepting all work types, wait for
    /// running jobs, then stop the claim loop. Never force-kills a job.
    ///
    /// On `Error::StopTimeout` the caller may hard-kill; note that if the
    /// running-jobs wait was reached, work-type disablement has already
    /// happened as a side effect.
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        let sequence = async {
            self.wait_for_declared_recursion(timeout).await;
            self.core.recursing.wait().await;
            self.types.disable_all();
            self.core.running.wait().await;
            let _ = self.stop_tx.send(true);
            let mut done = self.done_tx.subscribe();
            let _ = done.wait_for(|d| *d).await;
        };

        match tokio::time::timeout(timeout, sequence).await {
            Ok(()) => Ok(()),
            Err(_) => Err(Error::StopTimeout),
        }
    }
}
