//! Named, cancellable timer tasks.
//!
//! Debounce, stability, settle and periodic timers are all tokio tasks owned
//! by a [`TaskScheduler`]. Scheduling a task under a name that is already in
//! use aborts the previous task, so a component never has two live timers for
//! the same purpose. Dropping the scheduler aborts everything it owns.
//!
//! Because the tasks sleep on tokio's clock, tests can run them under
//! `#[tokio::test(start_paused = true)]` and control time explicitly.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

/// Owner of named background tasks.
#[derive(Debug, Default)]
pub struct TaskScheduler {
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TaskScheduler {
    /// Create an empty scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `fut` once after `delay`, replacing any task called `name`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule_after<F>(&self, name: &str, delay: Duration, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fut.await;
        });
        if let Some(previous) = self.tasks().insert(name.to_string(), handle) {
            debug!(task = name, "replacing scheduled task");
            previous.abort();
        }
    }

    /// Run `tick` every `period`, replacing any task called `name`.
    ///
    /// The first run happens one full period after scheduling. The loop ends
    /// when `tick` resolves to `false`.
    pub fn schedule_every<F, Fut>(&self, name: &str, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if !tick().await {
                    break;
                }
            }
        });
        if let Some(previous) = self.tasks().insert(name.to_string(), handle) {
            previous.abort();
        }
    }

    /// Cancel the task called `name`.
    ///
    /// Returns `true` if a task was still pending.
    pub fn cancel(&self, name: &str) -> bool {
        self.tasks().remove(name).is_some_and(|handle| {
            let live = !handle.is_finished();
            handle.abort();
            live
        })
    }

    /// Whether a task called `name` exists and has not finished.
    #[must_use]
    pub fn is_scheduled(&self, name: &str) -> bool {
        self.tasks()
            .get(name)
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Abort every task.
    pub fn shutdown(&self) {
        for (name, handle) in self.tasks().drain() {
            debug!(task = %name, "aborting scheduled task");
            handle.abort();
        }
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        for handle in self.tasks().values() {
            handle.abort();
        }
    }
}
