//! Work execution seam: the runner trait, the execution scope handed to
//! every job, and the work-type registry that routes claimed work.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::warn;

use crate::agent::Recurser;
use crate::error::{Error, Result};
use crate::queue::SupportedTypes;

/// Executes one unit of claimed work. Implementations are registered per
/// work type. `stop` exists for runners that must drain internal state on
/// shutdown; most leave the default no-op.
#[async_trait]
pub trait WorkRunner: Send + Sync {
    async fn run(&self, work: RecursableWork) -> Result<()>;

    async fn stop(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }
}

/// A claimed payload plus the execution scope that makes recursive queue
/// access safe.
pub struct RecursableWork {
    pub payload: Vec<u8>,
    pub work_type: u64,
    pub scope: ExecScope,
}

/// The scope a job executes in. Carries the agent's recurse capability and
/// an explicit may-recurse marker the agent's shutdown logic reads.
#[derive(Clone)]
pub struct ExecScope {
    recurser: Option<Recurser>,
    may_recurse: Arc<AtomicBool>,
}

impl ExecScope {
    pub(crate) fn new(recurser: Option<Recurser>, may_recurse: Arc<AtomicBool>) -> Self {
        Self {
            recurser,
            may_recurse,
        }
    }

    /// A scope with no recurse capability, for running work outside an
    /// agent (tests, direct invocation).
    pub fn detached() -> Self {
        Self {
            recurser: None,
            may_recurse: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Declare that this job may re-enter the queue. Stop waits a bounded
    /// time for marked jobs before giving up on them.
    pub fn expect_recursion(&self) -> ExecScope {
        self.may_recurse.store(true, Ordering::SeqCst);
        self.clone()
    }

    pub fn expects_recursion(&self) -> bool {
        self.may_recurse.load(Ordering::SeqCst)
    }

    pub fn recurser(&self) -> Option<&Recurser> {
        self.recurser.as_ref()
    }
}

/// Runs a future inside the scope's recursion-safe region when one is
/// available, inline otherwise. Whenever a runner needs to call back into
/// the queue (or anything that blocks on the queue, like a cache fill),
/// the call belongs inside `optionally_recurse`; otherwise the job keeps
/// its concurrency slot while waiting and can deadlock the whole queue.
pub struct OptionalRecurser {
    fatal_recurse_check: bool,
}

impl OptionalRecurser {
    pub fn new(fatal_recurse_check: bool) -> Self {
        Self {
            fatal_recurse_check,
        }
    }

    pub async fn optionally_recurse<T>(
        &self,
        scope: &ExecScope,
        fut: impl Future<Output = T> + Send,
    ) -> T {
        match scope.recurser() {
            Some(recurser) => {
                if !scope.expects_recursion() {
                    let msg = "work attempted recursion without being marked for recursion";
                    if self.fatal_recurse_check {
                        panic!("{msg}");
                    }
                    warn!("{msg}");
                }
                recurser.recurse(fut).await
            }
            None => fut.await,
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

enum Registration {
    Always(Arc<dyn WorkRunner>),
    Conditional(Arc<dyn WorkRunner>),
}

impl Registration {
    fn runner(&self) -> &Arc<dyn WorkRunner> {
        match self {
            Registration::Always(r) | Registration::Conditional(r) => r,
        }
    }
}

/// Routes claimed work to the runner registered for its type tag, and
/// keeps the supported-types set in sync with registration. Owned by the
/// composition root; registration happens at startup.
pub struct RunnerRegistry {
    runners: RwLock<HashMap<u64, Registration>>,
    types: Arc<SupportedTypes>,
}

impl RunnerRegistry {
    pub fn new(types: Arc<SupportedTypes>) -> Self {
        Self {
            runners: RwLock::new(HashMap::new()),
            types,
        }
    }

    /// Register a runner and enable its work type.
    pub fn add(&self, work_type: u64, runner: Arc<dyn WorkRunner>) {
        self.runners
            .write()
            .expect("registry lock poisoned")
            .insert(work_type, Registration::Always(runner));
        self.types.set_enabled(work_type, true);
    }

    /// Register a runner whose work type is enabled only while the
    /// condition holds (leader-gated maintenance work, for example).
    pub fn add_conditional(
        &self,
        work_type: u64,
        enabled: impl Fn() -> bool + Send + Sync + 'static,
        runner: Arc<dyn WorkRunner>,
    ) {
        self.runners
            .write()
            .expect("registry lock poisoned")
            .insert(work_type, Registration::Conditional(runner));
        self.types.set_enabled_conditional(work_type, enabled);
    }

    fn runner_for(&self, work_type: u64) -> Result<Arc<dyn WorkRunner>> {
        self.runners
            .read()
            .expect("registry lock poisoned")
            .get(&work_type)
            .map(|r| r.runner().clone())
            .ok_or(Error::InvalidWorkType(work_type))
    }
}

#[async_trait]
impl WorkRunner for RunnerRegistry {
    /// Dispatch by type tag. Enablement is not re-checked here; the claim
    /// query already filtered on it.
    async fn run(&self, work: RecursableWork) -> Result<()> {
        let runner = self.runner_for(work.work_type)?;
        runner.run(work).await
    }

    /// Stop every registered runner concurrently, disabling each type as
    /// its runner finishes so no new work of that type is claimed.
    async fn stop(&self, timeout: Duration) -> Result<()> {
        let runners: Vec<(u64, Arc<dyn WorkRunner>)> = {
            let map = self.runners.read().expect("registry lock poisoned");
            map.iter().map(|(t, r)| (*t, r.runner().clone())).collect()
        };

        let stops = runners.into_iter().map(|(work_type, runner)| {
            let types = self.types.clone();
            async move {
                if let Err(e) = runner.stop(timeout).await {
                    warn!(work_type, error = %e, "error stopping runner");
                }
                types.set_enabled(work_type, false);
            }
        });
        join_all(stops).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingRunner {
        seen: std::sync::Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl WorkRunner for RecordingRunner {
        async fn run(&self, work: RecursableWork) -> Result<()> {
            self.seen.lock().unwrap().push(work.work_type);
            Ok(())
        }
    }

    #[tokio::test]
    async fn dispatch_routes_by_type_tag() {
        let types = Arc::new(SupportedTypes::new());
        let registry = RunnerRegistry::new(types.clone());
        let runner = Arc::new(RecordingRunner {
            seen: std::sync::Mutex::new(Vec::new()),
        });
        registry.add(7, runner.clone());

        registry
            .run(RecursableWork {
                payload: b"{}".to_vec(),
                work_type: 7,
                scope: ExecScope::detached(),
            })
            .await
            .unwrap();

        assert_eq!(*runner.seen.lock().unwrap(), vec![7]);
        assert_eq!(types.enabled(), vec![7]);
    }

    #[tokio::test]
    async fn unknown_type_is_an_error() {
        let registry = RunnerRegistry::new(Arc::new(SupportedTypes::new()));
        let err = registry
            .run(RecursableWork {
                payload: Vec::new(),
                work_type: 42,
                scope: ExecScope::detached(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidWorkType(42)));
    }

    #[tokio::test]
    async fn stop_disables_stopped_types() {
        let types = Arc::new(SupportedTypes::new());
        let registry = RunnerRegistry::new(types.clone());
        registry.add(
            1,
            Arc::new(RecordingRunner {
                seen: std::sync::Mutex::new(Vec::new()),
            }),
        );

        registry.stop(Duration::from_secs(1)).await.unwrap();
        assert!(types.enabled().is_empty());
    }

    #[tokio::test]
    async fn optionally_recurse_runs_inline_without_recurser() {
        let recurser = OptionalRecurser::new(false);
        let out = recurser
            .optionally_recurse(&ExecScope::detached(), async { 5 })
            .await;
        assert_eq!(out, 5);
    }
}
