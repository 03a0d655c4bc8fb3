//! The group lifecycle state machine, expressed as a work runner over
//! control jobs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use tracing::debug;

use crate::error::{Error, Result};
use crate::group::job::{EndRunnerRegistry, GroupFlag, GroupJob, GroupJobRegistry};
use crate::group::provider::GroupProvider;
use crate::queue::Queue;
use crate::runner::{OptionalRecurser, RecursableWork, WorkRunner};
use crate::sync::WaitGroup;

pub struct GroupRunnerConfig {
    pub queue: Arc<dyn Queue>,
    pub provider: Arc<dyn GroupProvider>,
    pub jobs: Arc<GroupJobRegistry>,
    pub end_runners: Arc<EndRunnerRegistry>,
    /// Panic instead of warning when a control job runs without a
    /// recursion-capable scope. Useful in tests.
    pub fatal_recurse_check: bool,
}

/// Handles group control jobs. START blocks polling the store for the
/// group to drain, so the whole dispatch runs inside the agent's
/// recursion-safe region.
pub struct GroupRunner {
    queue: Arc<dyn Queue>,
    provider: Arc<dyn GroupProvider>,
    jobs: Arc<GroupJobRegistry>,
    end_runners: Arc<EndRunnerRegistry>,
    recurser: OptionalRecurser,
    in_flight: WaitGroup,
}

impl GroupRunner {
    pub fn new(cfg: GroupRunnerConfig) -> Self {
        Self {
            queue: cfg.queue,
            provider: cfg.provider,
            jobs: cfg.jobs,
            end_runners: cfg.end_runners,
            recurser: OptionalRecurser::new(cfg.fatal_recurse_check),
            in_flight: WaitGroup::new(),
        }
    }

    async fn dispatch(&self, job: &dyn GroupJob) -> Result<()> {
        match job.flag() {
            GroupFlag::Start => {
                if let Err(e) = self.provider.is_ready(job).await {
                    debug!(group = job.name(), error = %e, "error waiting for group start");
                    return Err(e);
                }

                self.provider.begin(job).await?;

                let cancelled = match self.provider.is_complete(job).await {
                    Ok(cancelled) => cancelled,
                    Err(e) => {
                        debug!(group = job.name(), error = %e, "group completion poll failed");
                        return Err(e);
                    }
                };

                if cancelled {
                    debug!(group = job.name(), "group cancelled; pushing abort work");
                    let abort = job.abort_job();
                    let work: &dyn crate::model::Work = abort.as_ref();
                    return self.queue.push(0, None, work).await;
                }

                debug!(group = job.name(), "group completed; pushing end work");
                let end = job.end_job();
                let work: &dyn crate::model::Work = end.as_ref();
                self.queue.push(0, None, work).await
            }

            GroupFlag::Cancel => {
                self.provider.cancel(job).await?;
                self.provider.clear(job).await
            }

            GroupFlag::End => {
                debug!(group = job.name(), "running group end work");
                let runner = self.end_runners.get(job.end_work_type())?;
                runner.run(job.end_work_payload()).await
            }

            GroupFlag::Abort => {
                let result = self.provider.abort(job).await;
                if let Err(e) = &result {
                    debug!(group = job.name(), error = %e, "error aborting group");
                }
                result
            }
        }
    }

    /// A START failure must never leave a group half-claimed: cancel it,
    /// clear its remaining work, then let the failure hook record the
    /// original error. A hook error takes precedence in the result.
    async fn run_group(&self, job: &dyn GroupJob) -> Result<()> {
        let Err(orig) = self.dispatch(job).await else {
            return Ok(());
        };
        debug!(group = job.name(), error = %orig, "group run failure");

        self.provider.cancel(job).await?;
        self.provider.clear(job).await?;
        self.provider.fail(job, &orig).await?;
        Err(orig)
    }
}

#[async_trait]
impl WorkRunner for GroupRunner {
    async fn run(&self, work: RecursableWork) -> Result<()> {
        self.in_flight.add();

        let result = match self.jobs.decode(work.work_type, &work.payload) {
            Err(e) => Err(e),
            Ok(job) => {
                let scope = work.scope.expect_recursion();
                self.recurser
                    .optionally_recurse(&scope, self.run_group(job.as_ref()))
                    .await
            }
        };

        self.in_flight.done();
        result
    }

    /// Keep the runner alive until every active group has finished its
    /// current lifecycle step.
    async fn stop(&self, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, self.in_flight.wait())
            .await
            .map_err(|_| Error::GroupStopTimeout)
    }
}
