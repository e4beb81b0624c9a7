//! Object storage abstraction.
//!
//! The worker talks to storage through [`ObjectStorage`]; the S3 backend
//! implements multipart-with-retry for archive uploads, the local backend
//! short-circuits to filesystem copies for development and tests. Both own
//! the per-job temp directories the crawl tree is written into.

pub mod local;
pub mod s3;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::io::AsyncRead;

pub use local::LocalStorage;
pub use s3::{S3Config, S3Storage};

use crate::util::{MAX_MULTIPART_PARTS, MIN_MULTIPART_PART_SIZE};

/// Storage-level failures surfaced to callers.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Progress for one completed upload part.
#[derive(Debug, Clone, Copy)]
pub struct PartProgress {
    pub total_bytes: u64,
    pub uploaded_bytes: u64,
    pub part_number: u32,
    pub total_parts: u32,
}

/// Callback invoked after each successfully uploaded part.
pub type PartProgressFn = Arc<dyn Fn(PartProgress) + Send + Sync>;

/// Options for [`ObjectStorage::stream_put`].
#[derive(Default, Clone)]
pub struct StreamPutOptions {
    /// Declared size of the stream, if known up front. The stream is spooled
    /// to disk regardless, so this is advisory.
    pub total_size: Option<u64>,
    /// Optional pause between parts to smooth network usage.
    pub part_delay: Option<Duration>,
    pub on_progress: Option<PartProgressFn>,
}

/// Readable byte stream returned by [`ObjectStorage::get_stream`].
pub type ByteReader = Box<dyn AsyncRead + Send + Unpin>;

/// Abstract object storage: S3-compatible in production, local FS in tests.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Write a small object atomically.
    async fn put(&self, key: &str, bytes: Bytes) -> StorageResult<()>;

    /// Upload a stream of arbitrary size. Returns the byte count uploaded.
    async fn stream_put(
        &self,
        key: &str,
        reader: ByteReader,
        options: StreamPutOptions,
    ) -> StorageResult<u64>;

    /// Lazy byte stream of an object.
    async fn get_stream(&self, key: &str) -> StorageResult<ByteReader>;

    /// All keys under a prefix, paged internally until exhausted.
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;

    /// Bulk delete; missing keys are not an error.
    async fn delete_prefix(&self, prefix: &str) -> StorageResult<()>;

    /// Sum of object sizes under a prefix.
    async fn size(&self, prefix: &str) -> StorageResult<u64>;

    /// Single existence check; 404 maps to `false`, other errors propagate.
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Reserve (and create) the local temp directory for a job. The path is
    /// deterministic per job id so a resumed job finds its state file.
    async fn make_temp_dir(&self, job_id: &str) -> StorageResult<PathBuf>;

    /// The temp directory path without creating it.
    fn temp_dir_path(&self, job_id: &str) -> PathBuf;

    /// Remove a job's temp directory; absent is fine.
    async fn remove_temp_dir(&self, job_id: &str) -> StorageResult<()>;

    /// Opaque URL for a key; may be signed or plain depending on backend.
    fn public_url(&self, key: &str) -> String;
}

/// Effective multipart part size:
/// `max(5 MiB, configured, ceil(total / 10_000))` so uploads never exceed
/// the S3 part-count limit.
#[must_use]
pub fn effective_part_size(total_size: u64, configured: u64) -> u64 {
    let by_count = total_size.div_ceil(MAX_MULTIPART_PARTS);
    MIN_MULTIPART_PART_SIZE.max(configured).max(by_count)
}

/// Whether an HTTP status from the storage service warrants a retry.
#[must_use]
pub fn is_retryable_status(status: u16) -> bool {
    status == 408 || status == 429 || status >= 500
}

/// Whether an error string looks like a transient network/storage failure.
#[must_use]
pub fn is_retryable_message(message: &str) -> bool {
    let m = message.to_lowercase();
    m.contains("timeout")
        || m.contains("timed out")
        || m.contains("throttl")
        || m.contains("slowdown")
        || m.contains("slow down")
        || m.contains("internalerror")
        || m.contains("econnreset")
        || m.contains("etimedout")
        || m.contains("socket hang up")
        || m.contains("network error")
        || m.contains("connection reset")
        || m.contains("dispatch failure")
}

/// Whether an error string identifies a missing object.
#[must_use]
pub fn is_missing_message(message: &str) -> bool {
    let m = message.to_lowercase();
    m.contains("notfound") || m.contains("nosuchkey") || m.contains("404")
}

/// Signature/checksum mismatches that justify the buffered single-PUT
/// fallback.
#[must_use]
pub fn is_signature_mismatch_message(message: &str) -> bool {
    let m = message.to_lowercase();
    m.contains("signaturedoesnotmatch")
        || m.contains("xamzcontentsha256mismatch")
        || m.contains("baddigest")
        || m.contains("invaliddigest")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_size_floors_at_5mib() {
        assert_eq!(effective_part_size(1024, 1024), MIN_MULTIPART_PART_SIZE);
    }

    #[test]
    fn part_size_prefers_configured() {
        let configured = 16 * 1024 * 1024;
        assert_eq!(effective_part_size(1024, configured), configured);
    }

    #[test]
    fn part_size_grows_for_huge_objects() {
        // 1 TiB at 16 MiB parts would need >10k parts; size must grow.
        let total: u64 = 1024 * 1024 * 1024 * 1024;
        let size = effective_part_size(total, 16 * 1024 * 1024);
        assert!(total.div_ceil(size) <= MAX_MULTIPART_PARTS);
    }

    #[test]
    fn retryable_classification() {
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(503));
        assert!(!is_retryable_status(403));
        assert!(is_retryable_message("Connection reset by peer (ECONNRESET)"));
        assert!(is_retryable_message("SlowDown: please reduce request rate"));
        assert!(!is_retryable_message("AccessDenied"));
    }

    #[test]
    fn missing_classification() {
        assert!(is_missing_message("NoSuchKey: the key does not exist"));
        assert!(is_missing_message("status 404"));
        assert!(!is_missing_message("AccessDenied"));
    }
}
