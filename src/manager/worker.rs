//! Long-lived queue consumer.
//!
//! Leases jobs up to the configured crawl concurrency, renews each job's
//! lock while its driver runs, and settles the queue row from the driver's
//! outcome. Orphan reconciliation runs alongside on its own cadence.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::orphans::spawn_reconciler;
use super::{driver, WorkerContext};
use crate::queue::QueueJob;

/// Idle delay between queue polls when no job is waiting.
const POLL_IDLE: Duration = Duration::from_secs(1);

/// Backoff after a queue error before polling again.
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// The worker process's job consumer.
pub struct Worker {
    ctx: WorkerContext,
}

impl Worker {
    #[must_use]
    pub fn new(ctx: WorkerContext) -> Self {
        Self { ctx }
    }

    /// Consume jobs until the shutdown token fires. In-flight crawls are
    /// not interrupted by shutdown; their cancellation is the DB's job.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let settings = Arc::clone(&self.ctx.settings);

        let reconciler = spawn_reconciler(self.ctx.clone(), shutdown.clone());

        let slots = Arc::new(Semaphore::new(settings.worker_crawl_concurrency.max(1)));
        log::info!(
            "Worker started: {} concurrent crawl slot(s)",
            settings.worker_crawl_concurrency.max(1)
        );

        loop {
            let permit = tokio::select! {
                permit = slots.clone().acquire_owned() => {
                    permit.context("worker semaphore closed")?
                }
                () = shutdown.cancelled() => break,
            };

            let job = tokio::select! {
                job = self.lease_loop() => job,
                () = shutdown.cancelled() => break,
            };

            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let job_id = job.id.clone();

                let renewal = spawn_lock_renewal(ctx.clone(), job_id.clone());
                let result = driver::process_job(&ctx, &job_id).await;
                renewal.abort();

                match result {
                    Ok(()) => {
                        if let Err(e) = ctx.queue.complete(&job_id).await {
                            log::warn!("Failed to complete queue job {job_id}: {e:#}");
                        }
                    }
                    Err(err) => {
                        log::error!("Crawl job {job_id} failed: {err:#}");
                        if let Err(e) = ctx.queue.fail(&job_id).await {
                            log::warn!("Failed to fail queue job {job_id}: {e:#}");
                        }
                    }
                }
            });
        }

        reconciler.abort();
        log::info!("Worker stopped");
        Ok(())
    }

    /// Poll the queue until a job leases.
    async fn lease_loop(&self) -> QueueJob {
        loop {
            match self
                .ctx
                .queue
                .lease_next(self.ctx.settings.worker_lock_duration)
                .await
            {
                Ok(Some(job)) => {
                    log::info!("Leased crawl job {} (attempt {})", job.id, job.attempts_made);
                    return job;
                }
                Ok(None) => tokio::time::sleep(POLL_IDLE).await,
                Err(e) => {
                    log::warn!("Queue lease failed: {e:#}");
                    tokio::time::sleep(POLL_ERROR_BACKOFF).await;
                }
            }
        }
    }
}

/// Renew the queue lock on the stalled-check cadence while a job runs.
fn spawn_lock_renewal(ctx: WorkerContext, job_id: String) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let interval = ctx
            .settings
            .worker_stalled_interval
            .min(ctx.settings.worker_lock_duration / 2)
            .max(Duration::from_secs(1));
        loop {
            tokio::time::sleep(interval).await;
            if let Err(e) = ctx
                .queue
                .renew_lock(&job_id, ctx.settings.worker_lock_duration)
                .await
            {
                log::warn!("Failed to renew lock for job {job_id}: {e:#}");
            }
        }
    })
}
