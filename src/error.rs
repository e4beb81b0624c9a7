//! Job-level error taxonomy.
//!
//! The lifecycle driver matches on `JobError` to pick a terminal branch for
//! the crawl; everything else in the crate uses `anyhow` internally and is
//! converted at the driver boundary.

use thiserror::Error;

/// Errors that decide the terminal state of a crawl job.
#[derive(Debug, Error)]
pub enum JobError {
    /// Unknown site or crawl row; the job can never succeed.
    #[error("unrecoverable: {0}")]
    Unrecoverable(String),

    /// The crawl was cancelled externally (DB status flipped to cancelled,
    /// or the row disappeared).
    #[error("crawl cancelled")]
    Cancelled,

    /// The crawl-phase deadline expired; partial results may still upload.
    #[error("crawl exceeded maximum duration")]
    TimedOut,

    /// Anything else; mapped to the `failed` terminal state.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl JobError {
    /// True when retrying the same job could not possibly help.
    #[must_use]
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, Self::Unrecoverable(_))
    }
}

/// Convenience alias used by the manager modules.
pub type JobResult<T> = Result<T, JobError>;
