//! Orphan reconciliation.
//!
//! A crawl row can claim to be active while its queue job is gone (worker
//! died between DB write and queue write, or the queue lost the row). The
//! reconciler runs at startup and on an interval, re-enqueueing recoverable
//! orphans and failing the rest.

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use tokio_util::sync::CancellationToken;

use super::{publish_and_store_log, WorkerContext};
use crate::executor::{CrawlStateFile, StateLoad};
use crate::store::{CrawlStatus, LogLevel};

/// One reconciliation sweep. Returns the number of crawls touched.
pub async fn reconcile_orphans(ctx: &WorkerContext) -> Result<usize> {
    let grace = ChronoDuration::from_std(ctx.settings.orphan_grace)
        .unwrap_or_else(|_| ChronoDuration::minutes(5));
    let cutoff = Utc::now() - grace;

    let candidates = ctx.db.active_crawls_created_before(cutoff).await?;
    let mut touched = 0usize;

    for crawl in candidates {
        match ctx.queue.get_state(&crawl.id).await? {
            // Queue job vanished: re-enqueue under the same id so an
            // on-disk state file (if this node still has it) resumes.
            None => {
                let recovered = match CrawlStateFile::load(&ctx.storage.temp_dir_path(&crawl.id))
                    .await
                {
                    StateLoad::Loaded(state) => Some((state.succeeded.len(), state.failed.len())),
                    _ => None,
                };
                let detail = match recovered {
                    Some((ok, bad)) => {
                        format!(" (recovered state: {ok} succeeded, {bad} failed)")
                    }
                    None => String::new(),
                };

                ctx.queue.add(&crawl.id).await?;
                publish_and_store_log(
                    ctx,
                    &crawl.id,
                    LogLevel::Warn,
                    format!(
                        "Re-enqueued orphaned crawl stuck in {} since {}{detail}",
                        crawl.status, crawl.created_at
                    ),
                    None,
                )
                .await;
                touched += 1;
            }

            // The queue still owns it; leave it alone.
            Some(state) if state.is_active() => {}

            // Queue finished but the crawl row never landed terminal.
            Some(state) => {
                let message = format!(
                    "queue job ended in state {} but the crawl was left {}",
                    state.as_str(),
                    crawl.status
                );
                ctx.db
                    .mark_terminal(&crawl.id, CrawlStatus::Failed, Some(&message))
                    .await?;
                publish_and_store_log(
                    ctx,
                    &crawl.id,
                    LogLevel::Warn,
                    format!("Marked orphaned crawl failed: {message}"),
                    None,
                )
                .await;
                ctx.bus.close(&crawl.id);
                touched += 1;
            }
        }
    }

    Ok(touched)
}

/// Run reconciliation now and then on the configured interval until the
/// shutdown token fires.
pub fn spawn_reconciler(ctx: WorkerContext, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match reconcile_orphans(&ctx).await {
                Ok(0) => log::debug!("Orphan reconciliation: nothing to do"),
                Ok(n) => log::info!("Orphan reconciliation touched {n} crawl(s)"),
                Err(e) => log::warn!("Orphan reconciliation failed: {e:#}"),
            }

            tokio::select! {
                () = shutdown.cancelled() => return,
                () = tokio::time::sleep(ctx.settings.orphan_reconcile_interval) => {}
            }
        }
    })
}
