//! Periodic background jobs.

use futures::future::BoxFuture;
use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub type JobFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// A callback run every `interval`. `(id, scope)` identifies the job: one
/// engine per project registers the same id under its own scope.
#[derive(Clone)]
pub struct ScheduledJob {
    pub id: String,
    pub interval: Duration,
    pub scope: String,
    pub run: JobFn,
}

impl fmt::Debug for ScheduledJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledJob")
            .field("id", &self.id)
            .field("interval", &self.interval)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

pub trait Scheduler: Send + Sync {
    /// Start running `job`, replacing any job registered with the same id and scope.
    fn register(&self, job: ScheduledJob);

    /// Stop a job. Returns false if nothing was registered under that id and scope.
    fn cancel(&self, id: &str, scope: &str) -> bool;
}

/// [`Scheduler`] backed by one tokio interval task per job.
///
/// The first run happens one interval after registration. Runs of the same job
/// never overlap; a slow run delays the next tick. All jobs are aborted when
/// the scheduler is dropped. Must be used from within a tokio runtime.
#[derive(Default)]
pub struct IntervalScheduler {
    tasks: Mutex<HashMap<(String, String), JoinHandle<()>>>,
}

impl IntervalScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }
}

impl Scheduler for IntervalScheduler {
    fn register(&self, job: ScheduledJob) {
        let ScheduledJob {
            id,
            interval,
            scope,
            run,
        } = job;
        debug!("Scheduling job {} ({}) every {:?}", id, scope, interval);

        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                run().await;
            }
        });

        if let Some(previous) = self.tasks.lock().insert((id, scope), handle) {
            previous.abort();
        }
    }

    fn cancel(&self, id: &str, scope: &str) -> bool {
        match self.tasks.lock().remove(&(id.to_string(), scope.to_string())) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

impl Drop for IntervalScheduler {
    fn drop(&mut self) {
        for (_, handle) in self.tasks.lock().drain() {
            handle.abort();
        }
    }
}
