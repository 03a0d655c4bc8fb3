//! Group-of-work support: treat a set of queued items as a unit with
//! collective completion and exactly-once finalization.
//!
//! Usage: create a group row, wrap its START job in a [`GroupQueue`], push
//! every member item, then call `start()`. Do not start before the last
//! member is pushed; the group completes when it drains, and an early
//! start can observe an empty group.

pub mod job;
pub mod provider;
pub mod runner;

pub use job::{
    DefaultGroupJob, EndRunnerRegistry, GroupEndRunner, GroupFlag, GroupJob, GroupJobRegistry,
};
pub use provider::{DefaultGroupProvider, GroupProvider};
pub use runner::{GroupRunner, GroupRunnerConfig};

use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::error::Result;
use crate::model::Work;
use crate::queue::Queue;

/// Builds [`GroupQueue`] handles over a base queue (member items) and a
/// group queue (control jobs). The two are usually the same queue.
pub struct GroupQueueFactory {
    base: Arc<dyn Queue>,
    group: Arc<dyn Queue>,
}

impl GroupQueueFactory {
    pub fn new(base: Arc<dyn Queue>, group: Arc<dyn Queue>) -> Self {
        Self { base, group }
    }

    /// Wrap a group's control job in a queue-facing handle.
    pub fn group_queue(&self, job: Box<dyn GroupJob>) -> GroupQueue {
        GroupQueue {
            base: self.base.clone(),
            group: self.group.clone(),
            job: Mutex::new(job),
        }
    }
}

/// A single group's view of the queue.
pub struct GroupQueue {
    base: Arc<dyn Queue>,
    group: Arc<dyn Queue>,
    job: Mutex<Box<dyn GroupJob>>,
}

impl GroupQueue {
    /// Push a member item under the group id.
    pub async fn push(&self, priority: u64, work: &dyn Work) -> Result<()> {
        let group_id = self
            .job
            .lock()
            .expect("group job lock poisoned")
            .group_id();
        self.base.push(priority, Some(group_id), work).await
    }

    /// Stash the finalizer payload on the control job. Must happen before
    /// `start`.
    pub fn set_end_work<W: Serialize>(&self, work: &W, end_work_type: u8) -> Result<()> {
        let payload = serde_json::to_vec(work)?;
        self.job
            .lock()
            .expect("group job lock poisoned")
            .set_end_work(end_work_type, payload);
        Ok(())
    }

    /// Submit the START control job. Call only after every member item
    /// has been pushed.
    pub async fn start(&self) -> Result<()> {
        let job = self
            .job
            .lock()
            .expect("group job lock poisoned")
            .clone_job();
        let work: &dyn Work = job.as_ref();
        self.group.push(0, None, work).await
    }

    /// A snapshot of the control job.
    pub fn group(&self) -> Box<dyn GroupJob> {
        self.job
            .lock()
            .expect("group job lock poisoned")
            .clone_job()
    }

    pub fn base_queue_name(&self) -> String {
        self.base.name().to_string()
    }
}
