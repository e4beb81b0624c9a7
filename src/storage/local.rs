//! Local-filesystem storage backend.
//!
//! Keys map to paths under a root directory. `stream_put` short-circuits to
//! a plain copy with a single progress tick, which keeps the upload code
//! path exercised in tests without a network.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;

use super::{
    ByteReader, ObjectStorage, PartProgress, StorageError, StorageResult, StreamPutOptions,
};

/// Filesystem-backed [`ObjectStorage`].
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub async fn new(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .context("Failed to create storage root")?;
        Ok(Self { root })
    }

    fn key_path(&self, key: &str) -> StorageResult<PathBuf> {
        // Reject traversal; keys are always forward-slash relative paths.
        if key.split('/').any(|seg| seg == "..") || key.starts_with('/') {
            return Err(StorageError::Other(anyhow!("invalid storage key: {key}")));
        }
        Ok(self.root.join(key))
    }

    /// Walk the root and return `(key, size)` pairs under the prefix.
    async fn entries_under(&self, prefix: &str) -> StorageResult<Vec<(String, u64)>> {
        let root = self.root.clone();
        let prefix = prefix.to_string();
        let entries = tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            for entry in jwalk::WalkDir::new(&root).skip_hidden(false) {
                let Ok(entry) = entry else { continue };
                if !entry.file_type().is_file() {
                    continue;
                }
                let path = entry.path();
                let Ok(rel) = path.strip_prefix(&root) else {
                    continue;
                };
                let key = rel.to_string_lossy().replace('\\', "/");
                // Job temp directories live under the root but are not objects.
                if key.starts_with(".tmp/") {
                    continue;
                }
                if key.starts_with(&prefix) {
                    let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                    out.push((key, size));
                }
            }
            out
        })
        .await
        .map_err(|e| StorageError::Other(anyhow!("walk task failed: {e}")))?;
        Ok(entries)
    }
}

#[async_trait]
impl ObjectStorage for LocalStorage {
    async fn put(&self, key: &str, bytes: Bytes) -> StorageResult<()> {
        let path = self.key_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create object directory")?;
        }
        // Temp-file + rename keeps readers from observing partial objects.
        let tmp = path.with_extension("part");
        tokio::fs::write(&tmp, &bytes)
            .await
            .context("Failed to write object")?;
        tokio::fs::rename(&tmp, &path)
            .await
            .context("Failed to finalize object")?;
        Ok(())
    }

    async fn stream_put(
        &self,
        key: &str,
        mut reader: ByteReader,
        options: StreamPutOptions,
    ) -> StorageResult<u64> {
        let path = self.key_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create object directory")?;
        }

        let tmp = path.with_extension("part");
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .context("Failed to create object file")?;
        let written = tokio::io::copy(&mut reader, &mut file)
            .await
            .context("Failed to copy stream to object")?;
        file.flush().await.context("Failed to flush object")?;
        drop(file);
        tokio::fs::rename(&tmp, &path)
            .await
            .context("Failed to finalize object")?;

        if let Some(on_progress) = &options.on_progress {
            on_progress(PartProgress {
                total_bytes: options.total_size.unwrap_or(written),
                uploaded_bytes: written,
                part_number: 1,
                total_parts: 1,
            });
        }
        Ok(written)
    }

    async fn get_stream(&self, key: &str) -> StorageResult<ByteReader> {
        let path = self.key_path(key)?;
        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        Ok(self
            .entries_under(prefix)
            .await?
            .into_iter()
            .map(|(key, _)| key)
            .collect())
    }

    async fn delete_prefix(&self, prefix: &str) -> StorageResult<()> {
        for (key, _) in self.entries_under(prefix).await? {
            let path = self.key_path(&key)?;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn size(&self, prefix: &str) -> StorageResult<u64> {
        Ok(self
            .entries_under(prefix)
            .await?
            .into_iter()
            .map(|(_, size)| size)
            .sum())
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.key_path(key)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
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
        self.root
            .join(".tmp")
            .join(sanitize_filename::sanitize(job_id))
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
        format!("file://{}", self.root.join(key).display())
    }
}

impl LocalStorage {
    /// Root directory this backend writes under.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}
