//! Bounded-concurrency crawl loop.
//!
//! The frontier, seen-set and counters live on the loop itself; only the
//! page processor and the cancellation token are shared with the spawned
//! page tasks. Discovery, state-file writes and progress ticks all happen
//! serialized between task completions, which keeps event ordering stable
//! without extra locking.

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::hooks::{CrawlHooks, ProgressUpdate};
use super::links::discover_links;
use super::seed::seed_from_sitemaps;
use super::state::{CrawlStateFile, StateLoad};
use crate::config::SiteConfig;
use crate::processor::{PageProcessor, ProcessedPage};
use crate::store::LogLevel;
use crate::util::{is_crawlable_url, normalize_page_url};

/// Where a frontier URL came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoverySource {
    Seed,
    Sitemap,
    Link,
}

#[derive(Debug)]
struct FrontierEntry {
    url: Url,
    #[allow(dead_code)]
    source: DiscoverySource,
    retries: u32,
}

/// Final counters for one executor run.
#[derive(Debug, Clone, Copy)]
pub struct CrawlOutcome {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub duration: Duration,
}

/// One crawl's executor. Construct per job and call [`CrawlExecutor::run`].
pub struct CrawlExecutor {
    site: SiteConfig,
    output_dir: PathBuf,
    processor: Arc<PageProcessor>,
    hooks: Arc<dyn CrawlHooks>,
    cancel: CancellationToken,
    seed_client: Client,
    resume: bool,
    page_max_retries: u32,
    page_retry_delay: Duration,
}

struct PageTaskResult {
    url: Url,
    attempts: u32,
    outcome: Result<ProcessedPage, String>,
}

impl CrawlExecutor {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        site: SiteConfig,
        output_dir: PathBuf,
        processor: Arc<PageProcessor>,
        hooks: Arc<dyn CrawlHooks>,
        cancel: CancellationToken,
        seed_client: Client,
        resume: bool,
        page_max_retries: u32,
        page_retry_delay: Duration,
    ) -> Self {
        Self {
            site,
            output_dir,
            processor,
            hooks,
            cancel,
            seed_client,
            resume,
            page_max_retries,
            page_retry_delay,
        }
    }

    /// Run the crawl to completion, cancellation, or the page cap.
    pub async fn run(&self) -> Result<CrawlOutcome> {
        let start = Instant::now();
        let base = self.site.base_url.clone();

        self.hooks
            .on_log(LogLevel::Info, format!("Starting crawl of {base}"), None)
            .await;

        // Loop-local crawl state; tasks only share the processor and token.
        let mut frontier: VecDeque<FrontierEntry> = VecDeque::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut done: HashSet<String> = HashSet::new();
        let mut state = CrawlStateFile::default();
        let mut total: u64 = 0;
        let mut succeeded: u64 = 0;
        let mut failed: u64 = 0;

        // Resume: previously-succeeded URLs are skipped; previously-failed
        // URLs get another chance when rediscovered.
        if self.resume {
            if let StateLoad::Loaded(previous) = CrawlStateFile::load(&self.output_dir).await {
                for url in &previous.succeeded {
                    if let Ok(parsed) = Url::parse(url) {
                        let normalized = normalize_page_url(&parsed);
                        if seen.insert(normalized.clone()) {
                            total += 1;
                        }
                        done.insert(normalized);
                    }
                }
                succeeded = previous.succeeded.len() as u64;
                state = previous;
            }
        }

        let admit = |frontier: &mut VecDeque<FrontierEntry>,
                         seen: &mut HashSet<String>,
                         total: &mut u64,
                         url: Url,
                         source: DiscoverySource|
         -> bool {
            if !is_crawlable_url(&url, &base) {
                return false;
            }
            let normalized = normalize_page_url(&url);
            if self.site.is_excluded(&normalized) {
                return false;
            }
            if let Some(max) = self.site.max_pages {
                if seen.len() >= max {
                    return false;
                }
            }
            if !seen.insert(normalized.clone()) {
                return false;
            }
            *total += 1;
            let Ok(url) = Url::parse(&normalized) else {
                return false;
            };
            frontier.push_back(FrontierEntry {
                url,
                source,
                retries: 0,
            });
            true
        };

        admit(
            &mut frontier,
            &mut seen,
            &mut total,
            base.clone(),
            DiscoverySource::Seed,
        );

        match seed_from_sitemaps(&self.seed_client, &base).await {
            Ok(urls) => {
                let mut admitted = 0usize;
                for url in urls {
                    if admit(&mut frontier, &mut seen, &mut total, url, DiscoverySource::Sitemap) {
                        admitted += 1;
                    }
                }
                if admitted > 0 {
                    self.hooks
                        .on_log(
                            LogLevel::Info,
                            format!("Seeded {admitted} URLs from sitemaps"),
                            None,
                        )
                        .await;
                }
            }
            Err(e) => {
                self.hooks
                    .on_log(
                        LogLevel::Warn,
                        format!("Sitemap seeding failed: {e:#}"),
                        None,
                    )
                    .await;
            }
        }

        let mut active: FuturesUnordered<tokio::task::JoinHandle<PageTaskResult>> =
            FuturesUnordered::new();

        'crawl: loop {
            if self.cancel.is_cancelled() {
                break 'crawl;
            }

            // Fill the pool up to the site's concurrency.
            while active.len() < self.site.concurrency {
                let Some(entry) = frontier.pop_front() else {
                    break;
                };
                let normalized = normalize_page_url(&entry.url);
                if done.contains(&normalized) {
                    continue;
                }
                active.push(self.spawn_page_task(entry));
            }

            if active.is_empty() {
                break;
            }

            let result = match active.next().await {
                Some(Ok(result)) => result,
                Some(Err(join_err)) => {
                    log::error!("Page task panicked: {join_err}");
                    continue;
                }
                None => break,
            };

            let normalized = normalize_page_url(&result.url);
            done.insert(normalized.clone());

            match result.outcome {
                Ok(page) => {
                    succeeded += 1;
                    // A retry that succeeds clears the URL's earlier failure.
                    state.failed.retain(|u| u != &normalized);
                    state.succeeded.push(normalized);

                    if !self.site.sitemap_only {
                        for link in
                            discover_links(&page.html, &result.url, &base, &self.site.redirects)
                        {
                            admit(&mut frontier, &mut seen, &mut total, link, DiscoverySource::Link);
                        }
                    }
                }
                Err(message) => {
                    failed += 1;
                    state.failed.push(normalized);
                    self.hooks
                        .on_log(
                            LogLevel::Warn,
                            format!(
                                "Failed to crawl page after {} attempts: {message}",
                                result.attempts
                            ),
                            Some(result.url.to_string()),
                        )
                        .await;
                }
            }

            if let Err(e) = state.save(&self.output_dir).await {
                log::warn!("Failed to persist crawl state: {e:#}");
            }

            // Awaited progress tick; the driver's hook re-checks
            // cancellation in here.
            self.hooks
                .on_progress(ProgressUpdate {
                    total,
                    succeeded,
                    failed,
                    current_url: Some(result.url.to_string()),
                })
                .await;

            if let Some(max) = self.site.max_pages {
                if (succeeded + failed) as usize >= max {
                    self.hooks
                        .on_log(LogLevel::Info, format!("Reached page limit of {max}"), None)
                        .await;
                    break;
                }
            }
        }

        // On cancellation, in-flight pages are abandoned; their partial
        // output is harmless and the temp dir owner decides what survives.
        for handle in active.iter() {
            handle.abort();
        }

        self.hooks
            .on_progress(ProgressUpdate {
                total,
                succeeded,
                failed,
                current_url: None,
            })
            .await;

        Ok(CrawlOutcome {
            total,
            succeeded,
            failed,
            duration: start.elapsed(),
        })
    }

    fn spawn_page_task(
        &self,
        mut entry: FrontierEntry,
    ) -> tokio::task::JoinHandle<PageTaskResult> {
        let processor = Arc::clone(&self.processor);
        let cancel = self.cancel.clone();
        let max_retries = self.page_max_retries;
        let retry_delay = self.page_retry_delay;

        tokio::spawn(async move {
            let mut last_error = String::from("not attempted");
            loop {
                entry.retries += 1;
                if cancel.is_cancelled() {
                    return PageTaskResult {
                        url: entry.url,
                        attempts: entry.retries,
                        outcome: Err("cancelled".to_string()),
                    };
                }

                match processor.process(&entry.url).await {
                    Ok(page) => {
                        return PageTaskResult {
                            url: entry.url,
                            attempts: entry.retries,
                            outcome: Ok(page),
                        };
                    }
                    Err(e) => {
                        last_error = format!("{e:#}");
                        if entry.retries > max_retries {
                            break;
                        }
                        log::debug!(
                            "Retrying {} (attempt {}/{}): {last_error}",
                            entry.url,
                            entry.retries,
                            max_retries + 1
                        );
                        // Backoff grows linearly with the attempt number.
                        tokio::time::sleep(retry_delay * entry.retries).await;
                    }
                }
            }

            PageTaskResult {
                url: entry.url,
                attempts: entry.retries,
                outcome: Err(last_error),
            }
        })
    }
}
