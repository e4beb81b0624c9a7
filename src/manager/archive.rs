//! Archive packaging, upload, and retention pruning.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::events::{CrawlEvent, EventBus, ProgressSnapshot, UploadSnapshot};
use crate::storage::{ObjectStorage, PartProgress, StreamPutOptions};
use crate::store::{Database, Site};

/// Spool name for the archive inside the crawl temp dir; excluded from its
/// own contents.
pub const ARCHIVE_SPOOL_NAME: &str = "__archive__.zip";

/// Pause between uploaded parts to smooth network usage.
const UPLOAD_PART_DELAY: Duration = Duration::from_millis(50);

/// DB writes for upload progress are throttled to at most one per second.
const UPLOAD_DB_THROTTLE: Duration = Duration::from_secs(1);

/// Storage key of a crawl's archive.
#[must_use]
pub fn archive_key(crawl_id: &str) -> String {
    format!("archives/{crawl_id}.zip")
}

/// Package the crawl tree into a deflate ZIP spooled inside the same temp
/// dir. Entry names are forward-slash paths relative to the tree root.
/// Returns the spool path and its byte size.
pub async fn build_zip(temp_dir: &Path) -> Result<(PathBuf, u64)> {
    let temp_dir = temp_dir.to_path_buf();
    let zip_path = temp_dir.join(ARCHIVE_SPOOL_NAME);

    let result_path = zip_path.clone();
    let size = tokio::task::spawn_blocking(move || -> Result<u64> {
        let file = File::create(&zip_path).context("Failed to create archive spool")?;
        let mut writer = ZipWriter::new(file);
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(9));

        let mut buffer = Vec::with_capacity(64 * 1024);
        for entry in jwalk::WalkDir::new(&temp_dir).skip_hidden(false).sort(true) {
            let entry = entry.context("Failed to walk crawl tree")?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let rel = path
                .strip_prefix(&temp_dir)
                .context("Walked outside the crawl tree")?;
            let name = rel.to_string_lossy().replace('\\', "/");
            if name == ARCHIVE_SPOOL_NAME {
                continue;
            }

            writer
                .start_file(&name, options)
                .with_context(|| format!("Failed to start archive entry {name}"))?;
            let mut source =
                File::open(&path).with_context(|| format!("Failed to open {}", path.display()))?;
            buffer.clear();
            source
                .read_to_end(&mut buffer)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            writer
                .write_all(&buffer)
                .with_context(|| format!("Failed to write archive entry {name}"))?;
        }

        let file = writer.finish().context("Failed to finalize archive")?;
        Ok(file.metadata().context("Failed to stat archive")?.len())
    })
    .await
    .context("Archive task panicked")??;

    Ok((result_path, size))
}

/// Upload the spooled archive with live progress events and throttled DB
/// upload-progress writes. Returns uploaded byte count.
pub async fn upload_archive(
    db: &Database,
    bus: &EventBus,
    storage: &Arc<dyn ObjectStorage>,
    crawl_id: &str,
    zip_path: &Path,
    zip_size: u64,
    counters: ProgressSnapshot,
) -> Result<u64> {
    let key = archive_key(crawl_id);
    let file = tokio::fs::File::open(zip_path)
        .await
        .context("Failed to open archive spool")?;

    let sink = Arc::new(UploadProgressSink {
        db: db.clone(),
        bus: bus.clone(),
        crawl_id: crawl_id.to_string(),
        key: key.clone(),
        counters,
        last_db_write: Mutex::new(Instant::now() - UPLOAD_DB_THROTTLE),
    });

    let progress_sink = Arc::clone(&sink);
    let options = StreamPutOptions {
        total_size: Some(zip_size),
        part_delay: Some(UPLOAD_PART_DELAY),
        on_progress: Some(Arc::new(move |part: PartProgress| {
            progress_sink.on_part(part);
        })),
    };

    let uploaded = storage
        .stream_put(&key, Box::new(file), options)
        .await
        .map_err(|e| anyhow!("archive upload failed: {e}"))?;
    Ok(uploaded)
}

struct UploadProgressSink {
    db: Database,
    bus: EventBus,
    crawl_id: String,
    key: String,
    counters: ProgressSnapshot,
    last_db_write: Mutex<Instant>,
}

impl UploadProgressSink {
    fn on_part(&self, part: PartProgress) {
        let percent = if part.total_bytes == 0 {
            100.0
        } else {
            (part.uploaded_bytes as f64 / part.total_bytes as f64) * 100.0
        };
        let done = part.uploaded_bytes >= part.total_bytes;

        let event = CrawlEvent::upload_progress(
            &self.counters,
            UploadSnapshot {
                total_bytes: part.total_bytes,
                uploaded_bytes: part.uploaded_bytes,
                files_total: 1,
                files_uploaded: u64::from(done),
                current_file: Some(self.key.clone()),
                percent,
            },
        );
        self.bus.publish(&self.crawl_id, event);

        // DB writes ride behind a 1s throttle; the final part always lands.
        let should_write = {
            let mut last = self.last_db_write.lock();
            if done || last.elapsed() >= UPLOAD_DB_THROTTLE {
                *last = Instant::now();
                true
            } else {
                false
            }
        };
        if should_write {
            let db = self.db.clone();
            let crawl_id = self.crawl_id.clone();
            let key = self.key.clone();
            tokio::spawn(async move {
                if let Err(e) = db
                    .update_upload_progress(
                        &crawl_id,
                        part.total_bytes,
                        part.uploaded_bytes,
                        Some(&key),
                    )
                    .await
                {
                    log::warn!("Failed to persist upload progress: {e:#}");
                }
            });
        }
    }
}

/// Retention pruning: keep the site's most recent `max_archives_to_keep`
/// archives, delete the rest from storage and clear their pointers.
pub async fn prune_old_archives(
    db: &Database,
    storage: &Arc<dyn ObjectStorage>,
    site: &Site,
) -> Result<usize> {
    let Some(keep) = site.max_archives_to_keep else {
        return Ok(0);
    };
    let keep = keep.max(0) as usize;

    let archived = db.archived_crawls_for_site(&site.id).await?;
    let mut pruned = 0usize;

    for crawl in archived.into_iter().skip(keep) {
        let Some(output_path) = crawl.output_path.as_deref() else {
            continue;
        };
        if let Err(e) = storage.delete_prefix(output_path).await {
            log::warn!("Failed to delete pruned archive {output_path}: {e}");
            continue;
        }
        db.clear_archive(&crawl.id).await?;
        pruned += 1;
        log::info!(
            "Pruned archive {output_path} for site {} (retention {keep})",
            site.id
        );
    }

    Ok(pruned)
}
