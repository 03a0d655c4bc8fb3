//! Small synchronization helpers shared by the agent and group runner.

use std::sync::Mutex;

use tokio::sync::Notify;

/// Counts in-flight tasks and lets a stopper await the count reaching
/// zero. `add` before spawning, `done` when the task finishes.
#[derive(Default)]
pub(crate) struct WaitGroup {
    count: Mutex<usize>,
    zero: Notify,
}

impl WaitGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self) {
        let mut count = self.count.lock().expect("waitgroup lock poisoned");
        *count += 1;
    }

    pub fn done(&self) {
        let mut count = self.count.lock().expect("waitgroup lock poisoned");
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.zero.notify_waiters();
        }
    }

    pub async fn wait(&self) {
        loop {
            // Register interest before re-checking the count so a `done`
            // racing with this check cannot be missed.
            let notified = self.zero.notified();
            if *self.count.lock().expect("waitgroup lock poisoned") == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_returns_immediately_at_zero() {
        let wg = WaitGroup::new();
        tokio::time::timeout(Duration::from_secs(1), wg.wait())
            .await
            .expect("wait should not block at zero");
    }

    #[tokio::test]
    async fn wait_blocks_until_done() {
        let wg = Arc::new(WaitGroup::new());
        wg.add();
        wg.add();

        let waiter = {
            let wg = wg.clone();
            tokio::spawn(async move { wg.wait().await })
        };

        wg.done();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        wg.done();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait should finish")
            .unwrap();
    }
}
