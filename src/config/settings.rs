//! Environment-derived worker settings.
//!
//! Every tunable the worker recognizes lives here with its default, so the
//! rest of the crate never touches `std::env` directly.

use std::time::Duration;

/// All recognized environment knobs, resolved once at startup.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Whole-crawl timeout; bites only during the crawl phase.
    pub crawl_max_duration: Duration,
    /// Throttle for persisting progress counters to the DB.
    pub progress_persist_interval: Duration,
    /// Cancellation-poll interval (cached DB status re-read).
    pub status_check_interval: Duration,
    /// Per-page retry budget for transient failures.
    pub page_max_retries: u32,
    /// Base delay for per-page retry backoff (multiplied by attempt).
    pub page_retry_delay: Duration,
    /// Per-crawl page-parallelism cap; site concurrency clamps to this.
    pub max_site_concurrency: usize,
    /// Simultaneous crawls per worker process.
    pub worker_crawl_concurrency: usize,
    /// Queue lock TTL while a job is being processed.
    pub worker_lock_duration: Duration,
    /// How often the lock is renewed / stalled jobs are checked.
    pub worker_stalled_interval: Duration,
    /// Age past which an active-status crawl is suspect.
    pub orphan_grace: Duration,
    /// Orphan sweep period.
    pub orphan_reconcile_interval: Duration,
    /// Timeout for the archive upload phase.
    pub archive_upload_timeout: Duration,
    /// Preferred multipart part size.
    pub s3_part_size_bytes: u64,
    /// Retry attempts per multipart part.
    pub s3_part_attempts: u32,
    /// Base delay for per-part retry backoff.
    pub s3_retry_base_delay: Duration,
    /// Ceiling for the buffered single-PUT fallback.
    pub s3_buffer_fallback_max_bytes: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            crawl_max_duration: Duration::from_millis(2_700_000),
            progress_persist_interval: Duration::from_millis(1_500),
            status_check_interval: Duration::from_millis(3_000),
            page_max_retries: 2,
            page_retry_delay: Duration::from_millis(2_000),
            max_site_concurrency: 30,
            worker_crawl_concurrency: 2,
            worker_lock_duration: Duration::from_millis(900_000),
            worker_stalled_interval: Duration::from_millis(120_000),
            orphan_grace: Duration::from_millis(300_000),
            orphan_reconcile_interval: Duration::from_millis(120_000),
            archive_upload_timeout: Duration::from_millis(600_000),
            s3_part_size_bytes: 16 * 1024 * 1024,
            s3_part_attempts: 4,
            s3_retry_base_delay: Duration::from_millis(300),
            s3_buffer_fallback_max_bytes: 256 * 1024 * 1024,
        }
    }
}

impl WorkerSettings {
    /// Resolve settings from the process environment, falling back to
    /// defaults for unset or unparseable values.
    #[must_use]
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            crawl_max_duration: env_ms("CRAWL_MAX_DURATION_MS", d.crawl_max_duration),
            progress_persist_interval: env_ms(
                "CRAWL_PROGRESS_PERSIST_INTERVAL_MS",
                d.progress_persist_interval,
            ),
            status_check_interval: env_ms("CRAWL_STATUS_CHECK_INTERVAL_MS", d.status_check_interval),
            page_max_retries: env_num("CRAWL_PAGE_MAX_RETRIES", d.page_max_retries),
            page_retry_delay: env_ms("CRAWL_PAGE_RETRY_DELAY_MS", d.page_retry_delay),
            max_site_concurrency: env_num("MAX_SITE_CONCURRENCY", d.max_site_concurrency),
            worker_crawl_concurrency: env_num(
                "WORKER_CRAWL_CONCURRENCY",
                d.worker_crawl_concurrency,
            ),
            worker_lock_duration: env_ms("WORKER_LOCK_DURATION_MS", d.worker_lock_duration),
            worker_stalled_interval: env_ms("WORKER_STALLED_INTERVAL_MS", d.worker_stalled_interval),
            orphan_grace: env_ms("ORPHAN_CRAWL_GRACE_MS", d.orphan_grace),
            orphan_reconcile_interval: env_ms(
                "ORPHAN_CRAWL_RECONCILE_INTERVAL_MS",
                d.orphan_reconcile_interval,
            ),
            archive_upload_timeout: env_ms("ARCHIVE_UPLOAD_TIMEOUT_MS", d.archive_upload_timeout),
            s3_part_size_bytes: env_num("S3_MULTIPART_PART_SIZE_BYTES", d.s3_part_size_bytes),
            s3_part_attempts: env_num("S3_UPLOAD_PART_ATTEMPTS", d.s3_part_attempts),
            s3_retry_base_delay: env_ms("S3_UPLOAD_RETRY_BASE_DELAY_MS", d.s3_retry_base_delay),
            s3_buffer_fallback_max_bytes: env_num(
                "S3_BUFFER_FALLBACK_MAX_BYTES",
                d.s3_buffer_fallback_max_bytes,
            ),
        }
    }
}

fn env_ms(key: &str, default: Duration) -> Duration {
    match std::env::var(key) {
        Ok(v) => match v.trim().parse::<u64>() {
            Ok(ms) => Duration::from_millis(ms),
            Err(_) => {
                log::warn!("Ignoring unparseable {key}={v:?}, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_num<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(v) => match v.trim().parse::<T>() {
            Ok(n) => n,
            Err(_) => {
                log::warn!("Ignoring unparseable {key}={v:?}, using default");
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let s = WorkerSettings::default();
        assert_eq!(s.crawl_max_duration, Duration::from_secs(45 * 60));
        assert_eq!(s.progress_persist_interval, Duration::from_millis(1500));
        assert_eq!(s.status_check_interval, Duration::from_secs(3));
        assert_eq!(s.page_max_retries, 2);
        assert_eq!(s.max_site_concurrency, 30);
        assert_eq!(s.worker_crawl_concurrency, 2);
        assert_eq!(s.s3_part_size_bytes, 16 * 1024 * 1024);
        assert_eq!(s.s3_buffer_fallback_max_bytes, 256 * 1024 * 1024);
    }
}
