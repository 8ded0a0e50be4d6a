//! # Fixed-Delay Scheduling
//!
//! Each periodic task is a [`ScheduledJob`]: one tokio task that waits
//! `initial_delay`, then alternates between running the job and sleeping
//! `fixed_delay`. The delay is measured from the end of one run to the start
//! of the next, so a job never overlaps itself. Run errors are logged and
//! the loop carries on.
//!
//! The loop stops when the shutdown channel flips to `true` (or its sender
//! is dropped). A run in progress finishes first.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::dispatcher::Dispatcher;
use crate::error::PublisherError;
use crate::watchdog::Watchdog;

#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self) -> Result<(), PublisherError>;
}

#[async_trait]
impl Job for Dispatcher {
    fn name(&self) -> &'static str {
        "dispatcher"
    }

    async fn run(&self) -> Result<(), PublisherError> {
        self.run_once().await?;
        Ok(())
    }
}

#[async_trait]
impl Job for Watchdog {
    fn name(&self) -> &'static str {
        "watchdog"
    }

    async fn run(&self) -> Result<(), PublisherError> {
        self.run_once().await?;
        Ok(())
    }
}

pub struct ScheduledJob {
    job: Arc<dyn Job>,
    initial_delay: Duration,
    fixed_delay: Duration,
}

impl ScheduledJob {
    pub fn new(job: Arc<dyn Job>, initial_delay: Duration, fixed_delay: Duration) -> Self {
        Self {
            job,
            initial_delay,
            fixed_delay,
        }
    }

    /// Spawn the loop.
    pub fn start(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let name = self.job.name();
            tracing::info!(
                job = name,
                initial_delay = ?self.initial_delay,
                fixed_delay = ?self.fixed_delay,
                "scheduled job started"
            );

            let mut delay = self.initial_delay;
            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                }

                let started = Instant::now();
                if let Err(e) = self.job.run().await {
                    tracing::error!(job = name, error = %e, "scheduled run failed");
                }
                metrics::histogram!("cms_job_duration_seconds", "job" => name)
                    .record(started.elapsed().as_secs_f64());
                delay = self.fixed_delay;
            }

            tracing::info!(job = name, "scheduled job stopped");
        })
    }
}
