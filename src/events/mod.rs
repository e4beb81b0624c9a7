//! Live event fan-out for running crawls.
//!
//! Every crawl has its own channel on the bus; the lifecycle manager and
//! executor publish, SSE subscribers consume. Events are additionally
//! appended to a bounded replay buffer per crawl, available on explicit
//! request; new subscribers do not receive history by default.

pub mod bus;
pub mod types;

pub use bus::EventBus;
pub use types::{CrawlEvent, CrawlPhase, ProgressSnapshot, UploadSnapshot};
