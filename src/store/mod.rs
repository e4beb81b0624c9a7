//! Relational store for sites, crawls, crawl logs and global settings.
//!
//! Uses SQLite with WAL mode so progress writes from running crawls do not
//! block readers. Schema creation is idempotent; every logical operation is
//! a single statement.

pub mod types;

use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};

pub use types::{Crawl, CrawlLogEntry, CrawlStatus, LogLevel, Site};

use types::millis_to_datetime;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS sites (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    base_url TEXT NOT NULL,
    concurrency INTEGER NOT NULL DEFAULT 3,
    max_pages INTEGER,
    exclude_patterns TEXT NOT NULL DEFAULT '[]',
    download_blocklist TEXT NOT NULL DEFAULT '[]',
    remove_badge INTEGER NOT NULL DEFAULT 0,
    redirects_csv TEXT,
    schedule TEXT,
    max_archives_to_keep INTEGER,
    sitemap_only INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS crawls (
    id TEXT PRIMARY KEY,
    site_id TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    total_pages INTEGER NOT NULL DEFAULT 0,
    succeeded_pages INTEGER NOT NULL DEFAULT 0,
    failed_pages INTEGER NOT NULL DEFAULT 0,
    upload_total_bytes INTEGER,
    upload_sent_bytes INTEGER,
    upload_current_file TEXT,
    output_path TEXT,
    output_size_bytes INTEGER,
    error_message TEXT,
    created_at INTEGER NOT NULL,
    started_at INTEGER,
    completed_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_crawls_site ON crawls(site_id);
CREATE INDEX IF NOT EXISTS idx_crawls_status ON crawls(status);

CREATE TABLE IF NOT EXISTS crawl_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    crawl_id TEXT NOT NULL,
    ts INTEGER NOT NULL,
    level TEXT NOT NULL,
    message TEXT NOT NULL,
    url TEXT
);

CREATE INDEX IF NOT EXISTS idx_crawl_logs_crawl ON crawl_logs(crawl_id);

CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Settings key holding the global download blocklist (JSON array).
pub const GLOBAL_BLOCKLIST_KEY: &str = "download_blocklist";

/// Handle to the relational store. Cheap to clone; wraps the shared pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the database file and run schema setup.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create database directory")?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .context("Failed to open SQLite database")?;

        Self::init(pool).await
    }

    /// In-memory database for tests.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new().in_memory(true);
        let pool = SqlitePoolOptions::new()
            // A single connection keeps the in-memory DB alive and shared.
            .max_connections(1)
            .connect_with(options)
            .await
            .context("Failed to open in-memory SQLite database")?;
        Self::init(pool).await
    }

    async fn init(pool: SqlitePool) -> Result<Self> {
        sqlx::query(SCHEMA_SQL)
            .execute(&pool)
            .await
            .context("Failed to initialize database schema")?;
        crate::queue::ensure_queue_schema(&pool).await?;
        Ok(Self { pool })
    }

    /// The underlying pool, shared with the job queue.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ---- sites ----------------------------------------------------------

    pub async fn insert_site(&self, site: &Site) -> Result<()> {
        sqlx::query(
            "INSERT INTO sites (id, name, base_url, concurrency, max_pages, exclude_patterns,
                 download_blocklist, remove_badge, redirects_csv, schedule,
                 max_archives_to_keep, sitemap_only, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&site.id)
        .bind(&site.name)
        .bind(&site.base_url)
        .bind(site.concurrency)
        .bind(site.max_pages)
        .bind(serde_json::to_string(&site.exclude_patterns)?)
        .bind(serde_json::to_string(&site.download_blocklist)?)
        .bind(site.remove_badge)
        .bind(&site.redirects_csv)
        .bind(&site.schedule)
        .bind(site.max_archives_to_keep)
        .bind(site.sitemap_only)
        .bind(site.created_at.timestamp_millis())
        .bind(site.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .context("Failed to insert site")?;
        Ok(())
    }

    pub async fn get_site(&self, id: &str) -> Result<Option<Site>> {
        let row = sqlx::query("SELECT * FROM sites WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load site")?;

        row.map(|row| {
            let exclude: Vec<String> =
                serde_json::from_str(row.get::<String, _>("exclude_patterns").as_str())
                    .unwrap_or_default();
            let blocklist: Vec<String> =
                serde_json::from_str(row.get::<String, _>("download_blocklist").as_str())
                    .unwrap_or_default();
            Ok(Site {
                id: row.get("id"),
                name: row.get("name"),
                base_url: row.get("base_url"),
                concurrency: row.get("concurrency"),
                max_pages: row.get("max_pages"),
                exclude_patterns: exclude,
                download_blocklist: blocklist,
                remove_badge: row.get("remove_badge"),
                redirects_csv: row.get("redirects_csv"),
                schedule: row.get("schedule"),
                max_archives_to_keep: row.get("max_archives_to_keep"),
                sitemap_only: row.get("sitemap_only"),
                created_at: millis_to_datetime(row.get("created_at")),
                updated_at: millis_to_datetime(row.get("updated_at")),
            })
        })
        .transpose()
    }

    // ---- crawls ---------------------------------------------------------

    /// Create a fresh crawl row in `pending` and return it.
    pub async fn create_crawl(&self, site_id: &str) -> Result<Crawl> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        sqlx::query("INSERT INTO crawls (id, site_id, status, created_at) VALUES (?, ?, 'pending', ?)")
            .bind(&id)
            .bind(site_id)
            .bind(now.timestamp_millis())
            .execute(&self.pool)
            .await
            .context("Failed to create crawl")?;
        self.get_crawl(&id)
            .await?
            .context("Crawl vanished right after insert")
    }

    pub async fn get_crawl(&self, id: &str) -> Result<Option<Crawl>> {
        let row = sqlx::query("SELECT * FROM crawls WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load crawl")?;

        Ok(row.map(|row| {
            let status: String = row.get("status");
            Crawl {
                id: row.get("id"),
                site_id: row.get("site_id"),
                status: CrawlStatus::parse(&status).unwrap_or(CrawlStatus::Failed),
                total_pages: row.get("total_pages"),
                succeeded_pages: row.get("succeeded_pages"),
                failed_pages: row.get("failed_pages"),
                upload_total_bytes: row.get("upload_total_bytes"),
                upload_sent_bytes: row.get("upload_sent_bytes"),
                upload_current_file: row.get("upload_current_file"),
                output_path: row.get("output_path"),
                output_size_bytes: row.get("output_size_bytes"),
                error_message: row.get("error_message"),
                created_at: millis_to_datetime(row.get("created_at")),
                started_at: row
                    .get::<Option<i64>, _>("started_at")
                    .map(millis_to_datetime),
                completed_at: row
                    .get::<Option<i64>, _>("completed_at")
                    .map(millis_to_datetime),
            }
        }))
    }

    /// Transition a crawl to `running`, preserving any earlier `started_at`
    /// (manual retries keep the original start) and clearing the error.
    pub async fn mark_running(&self, id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE crawls SET status = 'running',
                 started_at = COALESCE(started_at, ?),
                 error_message = NULL
             WHERE id = ?",
        )
        .bind(Utc::now().timestamp_millis())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to mark crawl running")?;
        Ok(())
    }

    pub async fn mark_uploading(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE crawls SET status = 'uploading' WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to mark crawl uploading")?;
        Ok(())
    }

    /// Persist crawl-phase progress counters.
    pub async fn update_progress(
        &self,
        id: &str,
        total: u64,
        succeeded: u64,
        failed: u64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE crawls SET total_pages = ?, succeeded_pages = ?, failed_pages = ? WHERE id = ?",
        )
        .bind(total as i64)
        .bind(succeeded as i64)
        .bind(failed as i64)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to persist crawl progress")?;
        Ok(())
    }

    /// Persist upload-phase byte progress.
    pub async fn update_upload_progress(
        &self,
        id: &str,
        total_bytes: u64,
        sent_bytes: u64,
        current_file: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE crawls SET upload_total_bytes = ?, upload_sent_bytes = ?, upload_current_file = ?
             WHERE id = ?",
        )
        .bind(total_bytes as i64)
        .bind(sent_bytes as i64)
        .bind(current_file)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to persist upload progress")?;
        Ok(())
    }

    /// Land a crawl in a terminal state with an archive attached
    /// (`completed` or `timed_out`).
    #[allow(clippy::too_many_arguments)]
    pub async fn finish_with_archive(
        &self,
        id: &str,
        status: CrawlStatus,
        output_path: &str,
        output_size_bytes: u64,
        total: u64,
        succeeded: u64,
        failed: u64,
        error_message: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE crawls SET status = ?, output_path = ?, output_size_bytes = ?,
                 total_pages = ?, succeeded_pages = ?, failed_pages = ?,
                 error_message = ?, completed_at = ?
             WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(output_path)
        .bind(output_size_bytes as i64)
        .bind(total as i64)
        .bind(succeeded as i64)
        .bind(failed as i64)
        .bind(error_message)
        .bind(Utc::now().timestamp_millis())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to finish crawl")?;
        Ok(())
    }

    /// Land a crawl in a terminal state without an archive
    /// (`failed` or `cancelled`).
    pub async fn mark_terminal(
        &self,
        id: &str,
        status: CrawlStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE crawls SET status = ?, error_message = ?,
                 started_at = COALESCE(started_at, ?), completed_at = ?
             WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(error_message)
        .bind(Utc::now().timestamp_millis())
        .bind(Utc::now().timestamp_millis())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to mark crawl terminal")?;
        Ok(())
    }

    /// Request external cancellation; only bites while the crawl is active.
    pub async fn request_cancel(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE crawls SET status = 'cancelled'
             WHERE id = ? AND status IN ('pending', 'running', 'uploading')",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to request cancellation")?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete a crawl row and its logs.
    pub async fn delete_crawl(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM crawl_logs WHERE crawl_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM crawls WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to delete crawl")?;
        Ok(())
    }

    /// Active-status crawls created before the cutoff; orphan candidates.
    pub async fn active_crawls_created_before(
        &self,
        cutoff: chrono::DateTime<Utc>,
    ) -> Result<Vec<Crawl>> {
        let rows = sqlx::query(
            "SELECT id FROM crawls
             WHERE status IN ('pending', 'running', 'uploading') AND created_at < ?",
        )
        .bind(cutoff.timestamp_millis())
        .fetch_all(&self.pool)
        .await
        .context("Failed to list orphan candidates")?;

        let mut crawls = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get("id");
            if let Some(crawl) = self.get_crawl(&id).await? {
                crawls.push(crawl);
            }
        }
        Ok(crawls)
    }

    /// This site's terminal crawls that still hold an archive, most recent
    /// first. Input to retention pruning.
    pub async fn archived_crawls_for_site(&self, site_id: &str) -> Result<Vec<Crawl>> {
        let rows = sqlx::query(
            "SELECT id FROM crawls
             WHERE site_id = ? AND status IN ('completed', 'timed_out')
               AND output_path IS NOT NULL
             ORDER BY completed_at DESC",
        )
        .bind(site_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list archived crawls")?;

        let mut crawls = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get("id");
            if let Some(crawl) = self.get_crawl(&id).await? {
                crawls.push(crawl);
            }
        }
        Ok(crawls)
    }

    /// Clear the archive pointers after its storage objects are pruned.
    pub async fn clear_archive(&self, id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE crawls SET output_path = NULL, output_size_bytes = NULL WHERE id = ?",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to clear archive pointers")?;
        Ok(())
    }

    // ---- crawl logs -----------------------------------------------------

    pub async fn insert_log(&self, entry: &CrawlLogEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO crawl_logs (crawl_id, ts, level, message, url) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&entry.crawl_id)
        .bind(entry.ts.timestamp_millis())
        .bind(entry.level.as_str())
        .bind(&entry.message)
        .bind(&entry.url)
        .execute(&self.pool)
        .await
        .context("Failed to insert crawl log")?;
        Ok(())
    }

    pub async fn logs_for_crawl(&self, crawl_id: &str) -> Result<Vec<CrawlLogEntry>> {
        let rows = sqlx::query(
            "SELECT crawl_id, ts, level, message, url FROM crawl_logs
             WHERE crawl_id = ? ORDER BY id ASC",
        )
        .bind(crawl_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load crawl logs")?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let level: String = row.get("level");
                CrawlLogEntry {
                    crawl_id: row.get("crawl_id"),
                    ts: millis_to_datetime(row.get("ts")),
                    level: match level.as_str() {
                        "warn" => LogLevel::Warn,
                        "error" => LogLevel::Error,
                        _ => LogLevel::Info,
                    },
                    message: row.get("message"),
                    url: row.get("url"),
                }
            })
            .collect())
    }

    // ---- settings -------------------------------------------------------

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to read setting")?;
        Ok(row.map(|r| r.get("value")))
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .context("Failed to write setting")?;
        Ok(())
    }

    /// The global download blocklist (JSON array under
    /// [`GLOBAL_BLOCKLIST_KEY`]); absent or unparseable → empty.
    pub async fn global_blocklist(&self) -> Result<Vec<String>> {
        match self.get_setting(GLOBAL_BLOCKLIST_KEY).await? {
            Some(raw) => Ok(serde_json::from_str(&raw).unwrap_or_default()),
            None => Ok(Vec::new()),
        }
    }
}
