//! Tracing hooks and metric instruments.
//!
//! The queue and agent invoke these at enqueue/dequeue/start/finish. Both
//! seams default to no-ops so tracing stays strictly optional.

pub mod metrics;

use async_trait::async_trait;
use tracing::Span;

use crate::error::Result;
use crate::model::{GroupId, QueueWork};

/// Produces the opaque carrier bytes persisted with each work item, used
/// to propagate trace context across the enqueue/dequeue boundary.
pub trait CarrierFactory: Send + Sync {
    fn carrier(
        &self,
        operation: &str,
        queue: &str,
        address: &str,
        priority: u64,
        work_type: u64,
        group: Option<GroupId>,
    ) -> Vec<u8>;
}

/// Observes the job lifecycle. Failures here are logged and ignored; the
/// wrappers must never affect work execution.
#[async_trait]
pub trait JobLifecycleWrapper: Send + Sync {
    async fn enqueue(&self, queue: &str, work_type: u64, result: &Result<()>);
    async fn dequeue(&self, queue: &str, work: Option<&QueueWork>, result: &Result<()>);
    async fn job_started(&self, work: &QueueWork);
    async fn job_finished(&self, work: &QueueWork, result: &Result<()>);
}

/// The absent-tracing default.
pub struct NoopLifecycle;

#[async_trait]
impl JobLifecycleWrapper for NoopLifecycle {
    async fn enqueue(&self, _queue: &str, _work_type: u64, _result: &Result<()>) {}
    async fn dequeue(&self, _queue: &str, _work: Option<&QueueWork>, _result: &Result<()>) {}
    async fn job_started(&self, _work: &QueueWork) {}
    async fn job_finished(&self, _work: &QueueWork, _result: &Result<()>) {}
}

/// The absent-tracing default: empty carriers.
pub struct NoopCarrierFactory;

impl CarrierFactory for NoopCarrierFactory {
    fn carrier(
        &self,
        _operation: &str,
        _queue: &str,
        _address: &str,
        _priority: u64,
        _work_type: u64,
        _group: Option<GroupId>,
    ) -> Vec<u8> {
        Vec::new()
    }
}

/// Start a span for a claimed job's execution.
pub fn start_job_span(queue: &str, work_type: u64, permit: u64) -> Span {
    tracing::info_span!(
        "queue.job",
        "queue.name" = queue,
        "queue.work_type" = work_type,
        "queue.permit" = permit,
    )
}
