//! Links the group runner to a store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{Error, Result};
use crate::group::job::GroupJob;
use crate::store::GroupStore;

/// The hooks the group runner drives a group through. `is_ready`, `abort`
/// and `fail` default to no-ops; applications override them to gate group
/// start, finalize cancellations, and record failures.
#[async_trait]
pub trait GroupProvider: Send + Sync {
    /// Returns once it is time to start the group's work.
    async fn is_ready(&self, _job: &dyn GroupJob) -> Result<()> {
        Ok(())
    }

    /// Mark the group started, making its members claimable.
    async fn begin(&self, job: &dyn GroupJob) -> Result<()>;

    /// Block until the group has drained. Returns whether it was
    /// cancelled along the way.
    async fn is_complete(&self, job: &dyn GroupJob) -> Result<bool>;

    /// Mark the group cancelled.
    async fn cancel(&self, job: &dyn GroupJob) -> Result<()>;

    /// Finalization after a cancellation was processed.
    async fn abort(&self, _job: &dyn GroupJob) -> Result<()> {
        Ok(())
    }

    /// Delete the group's remaining queued work.
    async fn clear(&self, job: &dyn GroupJob) -> Result<()>;

    /// Record a group failure. The runner calls this after cancel/clear
    /// when START processing fails.
    async fn fail(&self, _job: &dyn GroupJob, _err: &Error) -> Result<()> {
        Ok(())
    }
}

/// Store-backed provider polling for completion at a fixed interval.
pub struct DefaultGroupProvider {
    store: Arc<dyn GroupStore>,
    poll_interval: Duration,
}

impl DefaultGroupProvider {
    pub fn new(store: Arc<dyn GroupStore>) -> Self {
        Self {
            store,
            poll_interval: Duration::from_secs(2),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[async_trait]
impl GroupProvider for DefaultGroupProvider {
    async fn begin(&self, job: &dyn GroupJob) -> Result<()> {
        self.store.group_start(job.group_id()).await
    }

    async fn is_complete(&self, job: &dyn GroupJob) -> Result<bool> {
        loop {
            match self.store.group_complete(job.group_id()).await {
                Err(e) if e.is_locked() => {
                    debug!(group = %job.group_id(), error = %e, "group poll lock error; retrying");
                }
                Err(e) => return Err(e),
                Ok((true, cancelled)) => return Ok(cancelled),
                Ok((false, _)) => {}
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn cancel(&self, job: &dyn GroupJob) -> Result<()> {
        self.store.group_cancel(job.group_id()).await
    }

    async fn clear(&self, job: &dyn GroupJob) -> Result<()> {
        self.store.group_clear(job.group_id()).await
    }
}
