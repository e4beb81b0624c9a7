//! Per-job driver: takes one leased queue job through the crawl state
//! machine to a terminal status.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::archive::{archive_key, build_zip, prune_old_archives, upload_archive};
use super::{publish_and_store_log, WorkerContext};
use crate::assets::AssetDownloader;
use crate::browser::BrowserSession;
use crate::config::{merge_blocklists, SiteConfig};
use crate::error::{JobError, JobResult};
use crate::events::{CrawlEvent, ProgressSnapshot};
use crate::executor::{CrawlExecutor, CrawlHooks, CrawlOutcome, CrawlStateFile, ProgressUpdate, StateLoad};
use crate::processor::PageProcessor;
use crate::store::{CrawlStatus, LogLevel, Site};

/// Why the crawl-phase token fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AbortReason {
    TimedOut,
    Cancelled,
}

/// Drive one leased job to a terminal crawl status. The returned error (if
/// any) is re-raised to the queue.
pub async fn process_job(ctx: &WorkerContext, crawl_id: &str) -> JobResult<()> {
    // Step 1: load the rows; fast-fail when either is missing.
    let crawl = ctx
        .db
        .get_crawl(crawl_id)
        .await
        .map_err(JobError::Other)?
        .ok_or_else(|| JobError::Unrecoverable(format!("unknown crawl {crawl_id}")))?;

    let site = match ctx.db.get_site(&crawl.site_id).await.map_err(JobError::Other)? {
        Some(site) => site,
        None => {
            let message = format!("unknown site {}", crawl.site_id);
            fail_crawl(ctx, crawl_id, &message).await;
            return Err(JobError::Unrecoverable(message));
        }
    };

    let driver = JobDriver {
        ctx: ctx.clone(),
        crawl_id: crawl_id.to_string(),
        site,
    };

    let result = driver.run().await;
    driver.finish(result).await
}

struct JobDriver {
    ctx: WorkerContext,
    crawl_id: String,
    site: Site,
}

/// Everything the terminal branches need from a finished crawl phase.
struct CrawlPhase {
    temp_dir: PathBuf,
    outcome: CrawlOutcome,
}

impl JobDriver {
    async fn run(&self) -> Result<CrawlPhase, (JobError, Option<PathBuf>)> {
        let ctx = &self.ctx;
        let crawl_id = &self.crawl_id;
        let settings = &ctx.settings;

        // Step 2: running, preserving started_at across manual retries.
        ctx.db
            .mark_running(crawl_id)
            .await
            .map_err(|e| (JobError::Other(e), None))?;
        self.log(
            LogLevel::Info,
            format!("Crawl job started for site \"{}\"", self.site.name),
            None,
        )
        .await;

        // Step 3: merged blocklist + concurrency clamp.
        let global_blocklist = ctx
            .db
            .global_blocklist()
            .await
            .map_err(|e| (JobError::Other(e), None))?;
        let merged = merge_blocklists(&global_blocklist, &self.site.download_blocklist);

        let (site_config, clamped) =
            SiteConfig::resolve(&self.site, merged, settings.max_site_concurrency)
                .map_err(|e| (JobError::Other(e), None))?;
        if clamped {
            self.log(
                LogLevel::Warn,
                format!(
                    "Site concurrency {} exceeds the worker cap, clamped to {}",
                    self.site.concurrency, settings.max_site_concurrency
                ),
                None,
            )
            .await;
        }

        // Step 4: temp dir + resume decision.
        let temp_dir = ctx
            .storage
            .make_temp_dir(crawl_id)
            .await
            .map_err(|e| (JobError::Other(anyhow!("{e}")), None))?;

        let had_progress = {
            let row = ctx.db.get_crawl(crawl_id).await.ok().flatten();
            row.map(|c| c.succeeded_pages > 0 || c.failed_pages > 0)
                .unwrap_or(false)
        };
        let resume = match CrawlStateFile::load(&temp_dir).await {
            StateLoad::Loaded(state) if !state.is_empty() => {
                self.log(
                    LogLevel::Info,
                    format!(
                        "Resuming crawl: {} succeeded and {} failed pages recorded; previously succeeded pages will be skipped",
                        state.succeeded.len(),
                        state.failed.len()
                    ),
                    None,
                )
                .await;
                true
            }
            StateLoad::Loaded(_) => {
                self.log(LogLevel::Info, "Starting fresh crawl".to_string(), None)
                    .await;
                false
            }
            StateLoad::Missing => {
                if had_progress {
                    self.log(
                        LogLevel::Warn,
                        "Expected crawl state from a previous attempt but none was found; starting fresh"
                            .to_string(),
                        None,
                    )
                    .await;
                } else {
                    self.log(LogLevel::Info, "Starting fresh crawl".to_string(), None)
                        .await;
                }
                false
            }
            StateLoad::Invalid => {
                self.log(
                    LogLevel::Warn,
                    "Crawl state file has an invalid format; starting fresh".to_string(),
                    None,
                )
                .await;
                false
            }
        };

        // Steps 5–6: executor with publish/persist hooks, status watcher,
        // and the crawl-phase-only overall timeout.
        let cancel = CancellationToken::new();
        let reason: Arc<Mutex<Option<AbortReason>>> = Arc::new(Mutex::new(None));
        let deadline = Instant::now() + settings.crawl_max_duration;
        let watcher = spawn_status_watcher(
            ctx.clone(),
            crawl_id.clone(),
            deadline,
            cancel.clone(),
            Arc::clone(&reason),
        );

        let client = AssetDownloader::build_client().map_err(|e| (JobError::Other(e), None))?;
        let assets = Arc::new(AssetDownloader::new(
            client.clone(),
            temp_dir.clone(),
            site_config.blocklist.clone(),
        ));
        let browser = Arc::new(BrowserSession::new(
            std::env::temp_dir().join(format!("sitevault-browser-{crawl_id}")),
        ));
        let processor = Arc::new(PageProcessor::new(
            client.clone(),
            temp_dir.clone(),
            assets,
            Arc::clone(&browser),
            site_config.remove_badge,
            site_config.sitemap_only,
            cancel.clone(),
        ));

        let hooks = Arc::new(DriverHooks {
            ctx: ctx.clone(),
            crawl_id: crawl_id.clone(),
            persist_interval: settings.progress_persist_interval,
            last_persist: Mutex::new(Instant::now() - settings.progress_persist_interval),
        });

        let executor = CrawlExecutor::new(
            site_config,
            temp_dir.clone(),
            processor,
            hooks.clone(),
            cancel.clone(),
            client,
            resume,
            settings.page_max_retries,
            settings.page_retry_delay,
        );

        let crawl_result = executor.run().await;

        // The crawl phase is over: the timeout must not bite uploads.
        watcher.abort();
        browser.shutdown().await;

        let outcome = match crawl_result {
            Ok(outcome) => outcome,
            Err(e) => return Err((JobError::Other(e), Some(temp_dir))),
        };

        if cancel.is_cancelled() {
            let why = (*reason.lock()).unwrap_or(AbortReason::Cancelled);
            let err = match why {
                AbortReason::TimedOut => JobError::TimedOut,
                AbortReason::Cancelled => JobError::Cancelled,
            };
            return Err((err, Some(temp_dir)));
        }

        Ok(CrawlPhase { temp_dir, outcome })
    }

    /// Map the crawl-phase result onto the terminal branches.
    async fn finish(&self, result: Result<CrawlPhase, (JobError, Option<PathBuf>)>) -> JobResult<()> {
        let ctx = &self.ctx;
        let crawl_id = &self.crawl_id;

        let terminal = match result {
            // Steps 7–8: upload, complete, prune.
            Ok(phase) => {
                let counters = ProgressSnapshot {
                    total: phase.outcome.total,
                    succeeded: phase.outcome.succeeded,
                    failed: phase.outcome.failed,
                };
                match self
                    .upload_and_finish(&phase.temp_dir, counters, CrawlStatus::Completed, None)
                    .await
                {
                    Ok(()) => {
                        let _ = ctx.storage.remove_temp_dir(crawl_id).await;
                        Ok(())
                    }
                    Err(e) => {
                        self.mark_failed(&format!("archive upload failed: {e:#}")).await;
                        let _ = ctx.storage.remove_temp_dir(crawl_id).await;
                        Err(JobError::Other(e))
                    }
                }
            }

            // Step 9: timeout. Try to save what we have.
            Err((JobError::TimedOut, Some(temp_dir))) => {
                self.log(
                    LogLevel::Warn,
                    "Crawl exceeded maximum duration; uploading partial results".to_string(),
                    None,
                )
                .await;
                let counters = self.latest_counters().await;
                match self
                    .upload_and_finish(
                        &temp_dir,
                        counters,
                        CrawlStatus::TimedOut,
                        Some("Crawl exceeded maximum duration"),
                    )
                    .await
                {
                    Ok(()) => {
                        self.log(
                            LogLevel::Warn,
                            "Partial results saved (timed out)".to_string(),
                            None,
                        )
                        .await;
                        let _ = ctx.storage.remove_temp_dir(crawl_id).await;
                        Ok(())
                    }
                    Err(e) => {
                        self.mark_failed(&format!(
                            "partial archive upload failed after timeout: {e:#}"
                        ))
                        .await;
                        let _ = ctx.storage.remove_temp_dir(crawl_id).await;
                        Err(JobError::TimedOut)
                    }
                }
            }

            // Step 10: cancelled. Unwind quietly, keep nothing.
            Err((JobError::Cancelled, _)) => {
                if let Err(e) = ctx.db.mark_terminal(crawl_id, CrawlStatus::Cancelled, None).await {
                    log::warn!("Failed to persist cancelled status: {e:#}");
                }
                self.log(LogLevel::Warn, "Crawl cancelled".to_string(), None).await;
                let _ = ctx.storage.remove_temp_dir(crawl_id).await;
                Ok(())
            }

            // Step 11: everything else fails the job and re-raises.
            Err((err, temp_dir)) => {
                self.mark_failed(&format!("{err:#}")).await;

                // Keep the temp dir only when the queue will retry; with
                // attempts=1 that is the exception, not the rule.
                let retry_remaining = match ctx.queue.get_job(crawl_id).await {
                    Ok(Some(job)) => job.attempts_made < job.max_attempts,
                    _ => false,
                };
                if !retry_remaining {
                    if temp_dir.is_some() {
                        let _ = ctx.storage.remove_temp_dir(crawl_id).await;
                    }
                } else {
                    log::info!("Keeping temp dir of crawl {crawl_id} for a retry attempt");
                }
                Err(err)
            }
        };

        // Subscribers watching this crawl observe channel closure and end
        // their streams.
        ctx.bus.close(crawl_id);
        terminal
    }

    /// Steps 7/9 shared body: uploading → archive → terminal-with-archive →
    /// prune.
    async fn upload_and_finish(
        &self,
        temp_dir: &std::path::Path,
        counters: ProgressSnapshot,
        status: CrawlStatus,
        error_message: Option<&str>,
    ) -> anyhow::Result<()> {
        let ctx = &self.ctx;
        let crawl_id = &self.crawl_id;

        ctx.db.mark_uploading(crawl_id).await?;

        let (zip_path, zip_size) = build_zip(temp_dir).await?;
        let key = archive_key(crawl_id);

        let upload = upload_archive(
            &ctx.db,
            &ctx.bus,
            &ctx.storage,
            crawl_id,
            &zip_path,
            zip_size,
            counters.clone(),
        );
        let uploaded = tokio::time::timeout(ctx.settings.archive_upload_timeout, upload)
            .await
            .map_err(|_| anyhow!("archive upload timed out"))??;

        ctx.db
            .finish_with_archive(
                crawl_id,
                status,
                &key,
                uploaded,
                counters.total,
                counters.succeeded,
                counters.failed,
                error_message,
            )
            .await?;

        if status == CrawlStatus::Completed {
            self.log(
                LogLevel::Info,
                format!(
                    "Crawl completed: {}/{} pages archived, {} bytes uploaded to {key}",
                    counters.succeeded, counters.total, uploaded
                ),
                None,
            )
            .await;
        }

        if let Err(e) = prune_old_archives(&ctx.db, &ctx.storage, &self.site).await {
            log::warn!("Archive retention pruning failed: {e:#}");
        }
        Ok(())
    }

    async fn latest_counters(&self) -> ProgressSnapshot {
        match self.ctx.db.get_crawl(&self.crawl_id).await {
            Ok(Some(crawl)) => ProgressSnapshot {
                total: crawl.total_pages.max(0) as u64,
                succeeded: crawl.succeeded_pages.max(0) as u64,
                failed: crawl.failed_pages.max(0) as u64,
            },
            _ => ProgressSnapshot::default(),
        }
    }

    async fn mark_failed(&self, message: &str) {
        if let Err(e) = self
            .ctx
            .db
            .mark_terminal(&self.crawl_id, CrawlStatus::Failed, Some(message))
            .await
        {
            log::warn!("Failed to persist failed status: {e:#}");
        }
        self.log(LogLevel::Error, format!("Crawl failed: {message}"), None)
            .await;
    }

    /// Publish a log event and persist it (debug is neither published nor
    /// stored by the driver).
    async fn log(&self, level: LogLevel, message: String, url: Option<String>) {
        publish_and_store_log(&self.ctx, &self.crawl_id, level, message, url).await;
    }
}

/// Mark a crawl failed before a driver even exists (missing site row).
async fn fail_crawl(ctx: &WorkerContext, crawl_id: &str, message: &str) {
    if let Err(e) = ctx
        .db
        .mark_terminal(crawl_id, CrawlStatus::Failed, Some(message))
        .await
    {
        log::warn!("Failed to persist failed status: {e:#}");
    }
    publish_and_store_log(
        ctx,
        crawl_id,
        LogLevel::Error,
        format!("Crawl failed: {message}"),
        None,
    )
    .await;
    ctx.bus.close(crawl_id);
}

/// Poll the crawl row on the status-check cadence and fire the token on
/// external cancellation, row deletion, or the crawl-phase deadline.
fn spawn_status_watcher(
    ctx: WorkerContext,
    crawl_id: String,
    deadline: Instant,
    cancel: CancellationToken,
    reason: Arc<Mutex<Option<AbortReason>>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let interval = ctx.settings.status_check_interval;
        loop {
            let now = Instant::now();
            if now >= deadline {
                reason.lock().get_or_insert(AbortReason::TimedOut);
                cancel.cancel();
                return;
            }

            let sleep_for = interval.min(deadline - now);
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(sleep_for) => {}
            }

            match ctx.db.get_crawl(&crawl_id).await {
                Ok(Some(crawl)) => {
                    if crawl.status == CrawlStatus::Cancelled {
                        reason.lock().get_or_insert(AbortReason::Cancelled);
                        cancel.cancel();
                        return;
                    }
                }
                Ok(None) => {
                    // Row deleted out from under us: treat as cancellation.
                    reason.lock().get_or_insert(AbortReason::Cancelled);
                    cancel.cancel();
                    return;
                }
                Err(e) => {
                    log::warn!("Status check failed for crawl {crawl_id}: {e:#}");
                }
            }
        }
    })
}

/// Executor hooks: publish events, persist throttled progress.
struct DriverHooks {
    ctx: WorkerContext,
    crawl_id: String,
    persist_interval: Duration,
    last_persist: Mutex<Instant>,
}

#[async_trait]
impl CrawlHooks for DriverHooks {
    async fn on_progress(&self, update: ProgressUpdate) {
        let snapshot = ProgressSnapshot {
            total: update.total,
            succeeded: update.succeeded,
            failed: update.failed,
        };

        self.ctx.bus.publish(
            &self.crawl_id,
            CrawlEvent::progress(&snapshot, update.current_url.clone()),
        );

        // Counter writes are throttled; the final tick (no current_url)
        // always persists.
        let is_final = update.current_url.is_none();
        let should_persist = {
            let mut last = self.last_persist.lock();
            if is_final || last.elapsed() >= self.persist_interval {
                *last = Instant::now();
                true
            } else {
                false
            }
        };
        if should_persist {
            if let Err(e) = self
                .ctx
                .db
                .update_progress(&self.crawl_id, update.total, update.succeeded, update.failed)
                .await
            {
                log::warn!("Failed to persist crawl progress: {e:#}");
            }
        }
    }

    async fn on_log(&self, level: LogLevel, message: String, url: Option<String>) {
        publish_and_store_log(&self.ctx, &self.crawl_id, level, message, url).await;
    }
}
