//! Progress and log capabilities passed into the executor by handle.
//!
//! The lifecycle manager implements these to publish events and persist
//! counters; tests use [`NoOpHooks`].

use async_trait::async_trait;

use crate::store::LogLevel;

/// One progress tick. `current_url` is set for per-page ticks and unset on
/// the final report.
#[derive(Debug, Clone, Default)]
pub struct ProgressUpdate {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub current_url: Option<String>,
}

/// Callbacks the executor invokes at defined suspension points. Progress
/// calls are awaited, so implementations double as cancellation check
/// sites.
#[async_trait]
pub trait CrawlHooks: Send + Sync {
    async fn on_progress(&self, update: ProgressUpdate);
    async fn on_log(&self, level: LogLevel, message: String, url: Option<String>);
}

/// Hooks that do nothing; used by tests and ad-hoc runs.
pub struct NoOpHooks;

#[async_trait]
impl CrawlHooks for NoOpHooks {
    async fn on_progress(&self, _update: ProgressUpdate) {}
    async fn on_log(&self, _level: LogLevel, _message: String, _url: Option<String>) {}
}
