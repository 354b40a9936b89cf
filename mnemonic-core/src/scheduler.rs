//! Cancellable periodic background jobs.
//!
//! Every job runs on its own task and listens to a shared shutdown signal.
//! A tick that is already running finishes before the job exits.

use futures::future::join_all;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Name and period of a background job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodicJob {
    pub name: &'static str,
    pub period: Duration,
}

impl PeriodicJob {
    pub fn new(name: &'static str, period: Duration) -> Self {
        Self { name, period }
    }
}

/// Owner of the engine's periodic tasks.
pub struct Scheduler {
    shutdown_tx: watch::Sender<bool>,
    jobs: Mutex<Vec<(PeriodicJob, JoinHandle<()>)>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            jobs: Mutex::new(Vec::new()),
        }
    }

    /// Run `tick` every `job.period`, first after one full period.
    ///
    /// Returns `false` if the scheduler is already shut down.
    pub fn spawn<F, Fut>(&self, job: PeriodicJob, mut tick: F) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.is_shut_down() {
            return false;
        }
        let Ok(mut jobs) = self.jobs.lock() else {
            warn!(job = job.name, "Scheduler state poisoned, job not started");
            return false;
        };

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let period = job.period.max(Duration::from_millis(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // interval fires immediately once
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        debug!(job = job.name, "Running periodic job");
                        tick().await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!(job = job.name, "Periodic job stopped");
        });

        jobs.push((job, handle));
        true
    }

    pub fn job_count(&self) -> usize {
        self.jobs.lock().map(|jobs| jobs.len()).unwrap_or(0)
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Signal every job to stop and wait for them. Returns how many stopped.
    pub async fn shutdown(&self) -> usize {
        self.shutdown_tx.send_replace(true);

        let jobs: Vec<_> = match self.jobs.lock() {
            Ok(mut jobs) => jobs.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        let count = jobs.len();

        let (names, handles): (Vec<_>, Vec<_>) = jobs.into_iter().unzip();
        for (job, result) in names.iter().zip(join_all(handles).await) {
            if let Err(e) = result {
                warn!(job = job.name, error = %e, "Periodic job ended abnormally");
            }
        }
        if count > 0 {
            info!(jobs = count, "Background jobs stopped");
        }
        count
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}
