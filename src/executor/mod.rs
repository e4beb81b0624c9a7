//! Crawl executor: frontier, seeding, bounded worker pool, resume state.

pub mod core;
pub mod hooks;
pub mod links;
pub mod seed;
pub mod state;

pub use core::{CrawlExecutor, CrawlOutcome};
pub use hooks::{CrawlHooks, NoOpHooks, ProgressUpdate};
pub use state::{CrawlStateFile, StateLoad, STATE_FILE_NAME};
