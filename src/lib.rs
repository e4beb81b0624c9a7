//! sitevault: web-site archiving worker.
//!
//! The crate is a crawl execution engine: jobs come off a durable queue,
//! every reachable page of the configured site is fetched (statically or
//! through a headless browser), same-origin assets are mirrored to local
//! paths, the tree is packaged into a deflate ZIP and uploaded to object
//! storage. Progress and logs fan out live over the event bus, job state
//! persists in the relational store, and partially-finished crawls resume
//! after a worker restart.

pub mod assets;
pub mod browser;
pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod http;
pub mod manager;
pub mod processor;
pub mod queue;
pub mod storage;
pub mod store;
pub mod util;

pub use assets::{AssetCategory, AssetDownloader, Downloaded};
pub use browser::BrowserSession;
pub use config::{merge_blocklists, Blocklist, SiteConfig, WorkerSettings};
pub use error::{JobError, JobResult};
pub use events::{CrawlEvent, CrawlPhase, EventBus, ProgressSnapshot, UploadSnapshot};
pub use executor::{CrawlExecutor, CrawlHooks, CrawlOutcome, CrawlStateFile, NoOpHooks, ProgressUpdate, StateLoad};
pub use manager::{archive_key, process_job, reconcile_orphans, Worker, WorkerContext};
pub use processor::{FederationMirror, PageProcessor, ProcessedPage};
pub use queue::{JobQueue, JobState, QueueJob};
pub use storage::{LocalStorage, ObjectStorage, S3Config, S3Storage, StorageError, StreamPutOptions};
pub use store::{Crawl, CrawlLogEntry, CrawlStatus, Database, LogLevel, Site};
