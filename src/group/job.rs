//! Group control jobs and their registries.
//!
//! A group's lifecycle is driven by re-submitting control items into the
//! base queue. The flag field selects the lifecycle step; the payload is
//! decoded through an explicit per-type registry, so applications can
//! carry their own fields on control jobs without any reflection.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{GroupId, GroupRecord, Work, WorkType};

/// Lifecycle step encoded in a control job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GroupFlag {
    /// Begin the group: mark it started and watch it drain.
    Start,
    /// Finalize a successfully drained group.
    End,
    /// Cancel an in-progress group.
    Cancel,
    /// Finalize a cancelled group.
    Abort,
}

/// A control job driving one group's lifecycle.
pub trait GroupJob: Work {
    fn group_id(&self) -> GroupId;
    fn name(&self) -> &str;
    fn flag(&self) -> GroupFlag;

    /// Tag selecting the registered end runner.
    fn end_work_type(&self) -> u8;
    /// Payload handed to the end runner.
    fn end_work_payload(&self) -> &[u8];
    fn set_end_work(&mut self, end_work_type: u8, payload: Vec<u8>);

    /// Derived control jobs for the next lifecycle step.
    fn end_job(&self) -> Box<dyn GroupJob>;
    fn abort_job(&self) -> Box<dyn GroupJob>;
    fn cancel_job(&self) -> Box<dyn GroupJob>;

    fn clone_job(&self) -> Box<dyn GroupJob>;
}

/// The stock control job. Applications with extra per-group state
/// register their own [`GroupJob`] type instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultGroupJob {
    work_type: u64,
    group_id: GroupId,
    name: String,
    flag: GroupFlag,
    end_work_type: u8,
    end_work: Vec<u8>,
}

impl DefaultGroupJob {
    /// A START job for a freshly created group.
    pub fn start(work_type: u64, group: &GroupRecord) -> Self {
        Self {
            work_type,
            group_id: group.id,
            name: group.name.clone(),
            flag: GroupFlag::Start,
            end_work_type: 0,
            end_work: Vec::new(),
        }
    }

    fn with_flag(&self, flag: GroupFlag) -> Box<dyn GroupJob> {
        let mut job = self.clone();
        job.flag = flag;
        Box::new(job)
    }
}

impl WorkType for DefaultGroupJob {
    fn work_type(&self) -> u64 {
        self.work_type
    }
}

impl GroupJob for DefaultGroupJob {
    fn group_id(&self) -> GroupId {
        self.group_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn flag(&self) -> GroupFlag {
        self.flag
    }

    fn end_work_type(&self) -> u8 {
        self.end_work_type
    }

    fn end_work_payload(&self) -> &[u8] {
        &self.end_work
    }

    fn set_end_work(&mut self, end_work_type: u8, payload: Vec<u8>) {
        self.end_work_type = end_work_type;
        self.end_work = payload;
    }

    fn end_job(&self) -> Box<dyn GroupJob> {
        self.with_flag(GroupFlag::End)
    }

    fn abort_job(&self) -> Box<dyn GroupJob> {
        self.with_flag(GroupFlag::Abort)
    }

    fn cancel_job(&self) -> Box<dyn GroupJob> {
        self.with_flag(GroupFlag::Cancel)
    }

    fn clone_job(&self) -> Box<dyn GroupJob> {
        Box::new(self.clone())
    }
}

// ---------------------------------------------------------------------------
// Registries
// ---------------------------------------------------------------------------

type Decoder = Arc<dyn Fn(&[u8]) -> Result<Box<dyn GroupJob>> + Send + Sync>;

/// Work-type tag -> control-job deserializer. Owned by the composition
/// root; registration at startup.
#[derive(Default)]
pub struct GroupJobRegistry {
    decoders: RwLock<HashMap<u64, Decoder>>,
}

impl GroupJobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        work_type: u64,
        decoder: impl Fn(&[u8]) -> Result<Box<dyn GroupJob>> + Send + Sync + 'static,
    ) {
        self.decoders
            .write()
            .expect("group job registry lock poisoned")
            .insert(work_type, Arc::new(decoder));
    }

    /// Register the stock [`DefaultGroupJob`] for a work type.
    pub fn register_default(&self, work_type: u64) {
        self.register(work_type, |payload| {
            let job: DefaultGroupJob = serde_json::from_slice(payload)?;
            Ok(Box::new(job))
        });
    }

    pub fn decode(&self, work_type: u64, payload: &[u8]) -> Result<Box<dyn GroupJob>> {
        let decoder = self
            .decoders
            .read()
            .expect("group job registry lock poisoned")
            .get(&work_type)
            .cloned()
            .ok_or(Error::InvalidWorkType(work_type))?;
        decoder(payload)
    }
}

/// Finalizes a completed group with the payload stored by `set_end_work`.
#[async_trait]
pub trait GroupEndRunner: Send + Sync {
    async fn run(&self, payload: &[u8]) -> Result<()>;
}

/// End-work tag -> finalizer.
#[derive(Default)]
pub struct EndRunnerRegistry {
    runners: RwLock<HashMap<u8, Arc<dyn GroupEndRunner>>>,
}

impl EndRunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, end_work_type: u8, runner: Arc<dyn GroupEndRunner>) {
        self.runners
            .write()
            .expect("end runner registry lock poisoned")
            .insert(end_work_type, runner);
    }

    pub fn get(&self, end_work_type: u8) -> Result<Arc<dyn GroupEndRunner>> {
        self.runners
            .read()
            .expect("end runner registry lock poisoned")
            .get(&end_work_type)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("end runner for type {end_work_type}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> GroupRecord {
        GroupRecord {
            id: GroupId(3),
            name: "sync-demo".into(),
            started: false,
            cancelled: false,
        }
    }

    #[test]
    fn control_job_round_trips_through_registry() {
        let registry = GroupJobRegistry::new();
        registry.register_default(9);

        let mut job = DefaultGroupJob::start(9, &record());
        job.set_end_work(2, b"{\"n\":1}".to_vec());

        let payload = job.encode().unwrap();
        let decoded = registry.decode(9, &payload).unwrap();

        assert_eq!(decoded.group_id(), GroupId(3));
        assert_eq!(decoded.flag(), GroupFlag::Start);
        assert_eq!(decoded.end_work_type(), 2);
        assert_eq!(decoded.end_work_payload(), b"{\"n\":1}");
    }

    #[test]
    fn derived_jobs_change_only_the_flag() {
        let job = DefaultGroupJob::start(9, &record());
        assert_eq!(job.end_job().flag(), GroupFlag::End);
        assert_eq!(job.abort_job().flag(), GroupFlag::Abort);
        assert_eq!(job.cancel_job().flag(), GroupFlag::Cancel);
        assert_eq!(job.end_job().group_id(), job.group_id());
    }

    #[test]
    fn unregistered_type_fails_decode() {
        let registry = GroupJobRegistry::new();
        let err = registry.decode(1, b"{}").err().unwrap();
        assert!(matches!(err, Error::InvalidWorkType(1)));
    }
}
