//! Job lifecycle management: queue consumption, the per-job driver,
//! archive packaging/upload, retention pruning, and orphan reconciliation.

pub mod archive;
pub mod driver;
pub mod orphans;
pub mod worker;

use std::sync::Arc;

use chrono::Utc;

pub use archive::{archive_key, build_zip, prune_old_archives};
pub use driver::process_job;
pub use orphans::reconcile_orphans;
pub use worker::Worker;

use crate::config::WorkerSettings;
use crate::events::{CrawlEvent, EventBus};
use crate::queue::JobQueue;
use crate::storage::ObjectStorage;
use crate::store::{CrawlLogEntry, Database, LogLevel};

/// Shared handles every manager component needs. Cheap to clone.
#[derive(Clone)]
pub struct WorkerContext {
    pub db: Database,
    pub queue: JobQueue,
    pub bus: EventBus,
    pub storage: Arc<dyn ObjectStorage>,
    pub settings: Arc<WorkerSettings>,
}

/// Publish a log event on the bus and persist it to the crawl-logs table.
/// Debug entries are dropped entirely.
pub(crate) async fn publish_and_store_log(
    ctx: &WorkerContext,
    crawl_id: &str,
    level: LogLevel,
    message: String,
    url: Option<String>,
) {
    if !level.is_persisted() {
        return;
    }
    ctx.bus.publish(
        crawl_id,
        CrawlEvent::log(level, message.clone(), url.clone()),
    );
    let entry = CrawlLogEntry {
        crawl_id: crawl_id.to_string(),
        ts: Utc::now(),
        level,
        message,
        url,
    };
    if let Err(e) = ctx.db.insert_log(&entry).await {
        log::warn!("Failed to store crawl log: {e:#}");
    }
}
