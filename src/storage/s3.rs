//! S3-compatible storage backend.
//!
//! Archive uploads go through multipart with per-part retry; the stream is
//! spooled to a local temp file first so every part has a definite length
//! and a failed part can be re-read. A signature/checksum mismatch on a
//! small-enough object falls back to one buffered `PutObject`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use aws_sdk_s3::operation::head_object::HeadObjectError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, Delete, ObjectIdentifier};
use aws_sdk_s3::Client;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{
    effective_part_size, is_missing_message, is_retryable_message, is_retryable_status,
    is_signature_mismatch_message, ByteReader, ObjectStorage, PartProgress, StorageError,
    StorageResult, StreamPutOptions,
};
use crate::config::WorkerSettings;

/// Connection settings for the S3 backend.
#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub region: Option<String>,
    /// Custom endpoint for S3-compatible services.
    pub endpoint: Option<String>,
    /// Base URL for `public_url`; falls back to the bucket endpoint.
    pub public_base_url: Option<String>,
    /// Local directory for spool files and per-job temp dirs.
    pub temp_root: PathBuf,
}

/// S3-backed [`ObjectStorage`].
pub struct S3Storage {
    client: Client,
    bucket: String,
    public_base_url: Option<String>,
    temp_root: PathBuf,
    part_size: u64,
    part_attempts: u32,
    retry_base_delay: Duration,
    buffer_fallback_max: u64,
}

impl S3Storage {
    /// Build from an already-constructed SDK client.
    #[must_use]
    pub fn new(client: Client, config: S3Config, settings: &WorkerSettings) -> Self {
        Self {
            client,
            bucket: config.bucket,
            public_base_url: config.public_base_url,
            temp_root: config.temp_root,
            part_size: settings.s3_part_size_bytes,
            part_attempts: settings.s3_part_attempts.max(1),
            retry_base_delay: settings.s3_retry_base_delay,
            buffer_fallback_max: settings.s3_buffer_fallback_max_bytes,
        }
    }

    /// Resolve credentials/region from the environment and connect.
    pub async fn connect(config: S3Config, settings: &WorkerSettings) -> StorageResult<Self> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        let shared = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint.clone()).force_path_style(true);
        }
        let client = Client::from_conf(builder.build());

        tokio::fs::create_dir_all(&config.temp_root)
            .await
            .context("Failed to create temp root")?;

        Ok(Self::new(client, config, settings))
    }

    fn error_text<E: std::fmt::Debug>(err: &E) -> String {
        format!("{err:?}")
    }

    fn status_of<E>(err: &aws_sdk_s3::error::SdkError<E>) -> Option<u16> {
        err.raw_response().map(|r| r.status().as_u16())
    }

    fn is_retryable<E: std::fmt::Debug>(err: &aws_sdk_s3::error::SdkError<E>) -> bool {
        if let Some(status) = Self::status_of(err) {
            if is_retryable_status(status) {
                return true;
            }
        }
        // Dispatch/timeout failures have no HTTP response at all.
        matches!(
            err,
            aws_sdk_s3::error::SdkError::TimeoutError(_)
                | aws_sdk_s3::error::SdkError::DispatchFailure(_)
        ) || is_retryable_message(&Self::error_text(err))
    }

    /// Upload one part with bounded exponential backoff.
    async fn upload_part_with_retry(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> StorageResult<CompletedPart> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let result = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(body.clone()))
                .send()
                .await;

            match result {
                Ok(output) => {
                    return Ok(CompletedPart::builder()
                        .part_number(part_number)
                        .set_e_tag(output.e_tag)
                        .build());
                }
                Err(err) => {
                    let retryable = Self::is_retryable(&err);
                    if !retryable || attempt >= self.part_attempts {
                        return Err(StorageError::Other(anyhow!(
                            "part {part_number} failed after {attempt} attempts: {}",
                            Self::error_text(&err)
                        )));
                    }
                    // 300ms * 2^(n-1) plus a little jitter to avoid lockstep.
                    let backoff = self.retry_base_delay * 2u32.saturating_pow(attempt - 1);
                    let jitter = Duration::from_millis(rand::random::<u64>() % 100);
                    log::warn!(
                        "Retrying upload part {part_number} (attempt {attempt}/{}) after {:?}",
                        self.part_attempts,
                        backoff
                    );
                    tokio::time::sleep(backoff + jitter).await;
                }
            }
        }
    }

    /// Multipart upload of a spooled file. Returns total bytes uploaded.
    async fn multipart_upload(
        &self,
        key: &str,
        spool_path: &Path,
        total_size: u64,
        options: &StreamPutOptions,
    ) -> StorageResult<u64> {
        let part_size = effective_part_size(total_size, self.part_size);
        let total_parts = total_size.div_ceil(part_size).max(1) as u32;

        let create = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                StorageError::Other(anyhow!(
                    "create multipart upload failed: {}",
                    Self::error_text(&e)
                ))
            })?;
        let upload_id = create
            .upload_id()
            .ok_or_else(|| StorageError::Other(anyhow!("multipart create returned no upload id")))?
            .to_string();

        let result = self
            .upload_parts(key, &upload_id, spool_path, total_size, part_size, total_parts, options)
            .await;

        match result {
            Ok(uploaded) => Ok(uploaded),
            Err(err) => {
                // The create step succeeded, so always try to abort.
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    log::warn!(
                        "Failed to abort multipart upload for {key}: {}",
                        Self::error_text(&abort_err)
                    );
                }
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        spool_path: &Path,
        total_size: u64,
        part_size: u64,
        total_parts: u32,
        options: &StreamPutOptions,
    ) -> StorageResult<u64> {
        let mut file = tokio::fs::File::open(spool_path)
            .await
            .context("Failed to reopen spool file")?;

        let mut completed: Vec<CompletedPart> = Vec::with_capacity(total_parts as usize);
        let mut uploaded: u64 = 0;
        let mut part_number: i32 = 0;

        loop {
            let remaining = total_size - uploaded;
            if remaining == 0 && part_number > 0 {
                break;
            }
            part_number += 1;
            let this_part = remaining.min(part_size) as usize;

            let mut buf = vec![0u8; this_part];
            file.read_exact(&mut buf)
                .await
                .context("Failed to read spool file part")?;
            let body = Bytes::from(buf);

            let part = self
                .upload_part_with_retry(key, upload_id, part_number, body)
                .await?;
            completed.push(part);
            uploaded += this_part as u64;

            if let Some(on_progress) = &options.on_progress {
                on_progress(PartProgress {
                    total_bytes: total_size,
                    uploaded_bytes: uploaded,
                    part_number: part_number as u32,
                    total_parts,
                });
            }

            if uploaded < total_size {
                if let Some(delay) = options.part_delay {
                    tokio::time::sleep(delay).await;
                }
            }
        }

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| {
                StorageError::Other(anyhow!(
                    "complete multipart upload failed: {}",
                    Self::error_text(&e)
                ))
            })?;

        Ok(uploaded)
    }

    /// One buffered `PutObject`; used when multipart trips a
    /// signature/checksum mismatch on a small-enough object.
    async fn buffered_put(&self, key: &str, spool_path: &Path) -> StorageResult<u64> {
        let bytes = tokio::fs::read(spool_path)
            .await
            .context("Failed to buffer spool file")?;
        let len = bytes.len() as u64;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| {
                StorageError::Other(anyhow!("buffered put failed: {}", Self::error_text(&e)))
            })?;
        Ok(len)
    }
}

#[async_trait]
impl ObjectStorage for S3Storage {
    async fn put(&self, key: &str, bytes: Bytes) -> StorageResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| StorageError::Other(anyhow!("put failed: {}", Self::error_text(&e))))?;
        Ok(())
    }

    async fn stream_put(
        &self,
        key: &str,
        mut reader: ByteReader,
        options: StreamPutOptions,
    ) -> StorageResult<u64> {
        tokio::fs::create_dir_all(&self.temp_root)
            .await
            .context("Failed to create temp root")?;

        // Spool to disk so the HTTP layer gets definite content lengths and
        // failed parts can be re-read.
        let spool = tempfile::Builder::new()
            .prefix("upload-spool-")
            .tempfile_in(&self.temp_root)
            .context("Failed to create spool file")?;
        let spool_path = spool.path().to_path_buf();

        let mut spool_file = tokio::fs::File::create(&spool_path)
            .await
            .context("Failed to open spool file")?;
        let total_size = tokio::io::copy(&mut reader, &mut spool_file)
            .await
            .context("Failed to spool stream")?;
        spool_file.flush().await.context("Failed to flush spool")?;
        drop(spool_file);

        match self.multipart_upload(key, &spool_path, total_size, &options).await {
            Ok(uploaded) => Ok(uploaded),
            Err(err) => {
                let text = err.to_string();
                if is_signature_mismatch_message(&text) && total_size <= self.buffer_fallback_max {
                    log::warn!(
                        "Multipart upload of {key} hit a signature/checksum mismatch; \
                         falling back to buffered put ({total_size} bytes)"
                    );
                    self.buffered_put(key, &spool_path).await
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn get_stream(&self, key: &str) -> StorageResult<ByteReader> {
        match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => Ok(Box::new(output.body.into_async_read())),
            Err(err) => {
                let text = Self::error_text(&err);
                if is_missing_message(&text) {
                    Err(StorageError::NotFound(key.to_string()))
                } else {
                    Err(StorageError::Other(anyhow!("get failed: {text}")))
                }
            }
        }
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);
            if let Some(token) = &continuation {
                req = req.continuation_token(token);
            }
            let resp = req.send().await.map_err(|e| {
                StorageError::Other(anyhow!("list failed: {}", Self::error_text(&e)))
            })?;

            for object in resp.contents() {
                if let Some(key) = object.key() {
                    keys.push(key.to_string());
                }
            }

            match resp.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }
        Ok(keys)
    }

    async fn delete_prefix(&self, prefix: &str) -> StorageResult<()> {
        let keys = self.list(prefix).await?;
        for chunk in keys.chunks(1000) {
            let mut identifiers = Vec::with_capacity(chunk.len());
            for key in chunk {
                identifiers.push(
                    ObjectIdentifier::builder()
                        .key(key)
                        .build()
                        .map_err(|e| StorageError::Other(anyhow!("bad object id: {e}")))?,
                );
            }
            let delete = Delete::builder()
                .set_objects(Some(identifiers))
                .build()
                .map_err(|e| StorageError::Other(anyhow!("bad delete request: {e}")))?;
            self.client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(delete)
                .send()
                .await
                .map_err(|e| {
                    StorageError::Other(anyhow!("delete failed: {}", Self::error_text(&e)))
                })?;
        }
        Ok(())
    }

    async fn size(&self, prefix: &str) -> StorageResult<u64> {
        let mut total: u64 = 0;
        let mut continuation: Option<String> = None;
        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);
            if let Some(token) = &continuation {
                req = req.continuation_token(token);
            }
            let resp = req.send().await.map_err(|e| {
                StorageError::Other(anyhow!("size listing failed: {}", Self::error_text(&e)))
            })?;

            for object in resp.contents() {
                total += object.size().unwrap_or(0).max(0) as u64;
            }

            match resp.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }
        Ok(total)
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => {
                if let aws_sdk_s3::error::SdkError::ServiceError(service) = &err {
                    if matches!(service.err(), HeadObjectError::NotFound(_)) {
                        return Ok(false);
                    }
                }
                if Self::status_of(&err) == Some(404) {
                    return Ok(false);
                }
                Err(StorageError::Other(anyhow!(
                    "head failed: {}",
                    Self::error_text(&err)
                )))
            }
        }
    }

    async fn make_temp_dir(&self, job_id: &str) -> StorageResult<PathBuf> {
        let dir = self.temp_dir_path(job_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .context("Failed to create job temp directory")?;
        Ok(dir)
    }

    fn temp_dir_path(&self, job_id: &str) -> PathBuf {
        self.temp_root.join(sanitize_filename::sanitize(job_id))
    }

    async fn remove_temp_dir(&self, job_id: &str) -> StorageResult<()> {
        let dir = self.temp_dir_path(job_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn public_url(&self, key: &str) -> String {
        match &self.public_base_url {
            Some(base) => format!("{}/{}", base.trim_end_matches('/'), key),
            None => format!("s3://{}/{}", self.bucket, key),
        }
    }
}
