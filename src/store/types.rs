//! Row types for the relational store.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Configuration for a target origin, owned by the external admin API and
/// read by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Site {
    pub id: String,
    pub name: String,
    /// Absolute base URL; crawl root and origin filter.
    pub base_url: String,
    /// Requested page parallelism (1–30; clamped by the worker cap).
    pub concurrency: i64,
    pub max_pages: Option<i64>,
    /// Regex strings applied to discovered URLs.
    pub exclude_patterns: Vec<String>,
    /// Site-level download blocklist, merged with the global list per crawl.
    pub download_blocklist: Vec<String>,
    pub remove_badge: bool,
    /// Optional `from,to` CSV of canonical redirects.
    pub redirects_csv: Option<String>,
    /// Opaque schedule expression; the cron scheduler owns its meaning.
    pub schedule: Option<String>,
    /// Completed archives to retain; `None` = unbounded.
    pub max_archives_to_keep: Option<i64>,
    pub sitemap_only: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// State of one archiving attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlStatus {
    Pending,
    Running,
    Uploading,
    Completed,
    TimedOut,
    Failed,
    Cancelled,
}

impl CrawlStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Uploading => "uploading",
            Self::Completed => "completed",
            Self::TimedOut => "timed_out",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "uploading" => Some(Self::Uploading),
            "completed" => Some(Self::Completed),
            "timed_out" => Some(Self::TimedOut),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Only pending/running/uploading count as "still in flight".
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running | Self::Uploading)
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

impl std::fmt::Display for CrawlStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One archiving attempt for a site. The id doubles as the queue job id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Crawl {
    pub id: String,
    pub site_id: String,
    pub status: CrawlStatus,
    pub total_pages: i64,
    pub succeeded_pages: i64,
    pub failed_pages: i64,
    pub upload_total_bytes: Option<i64>,
    pub upload_sent_bytes: Option<i64>,
    pub upload_current_file: Option<String>,
    /// Storage key of the finished archive; set only for completed/timed_out.
    pub output_path: Option<String>,
    pub output_size_bytes: Option<i64>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Log severity. `Debug` is published to live subscribers but never
/// persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    #[must_use]
    pub fn is_persisted(&self) -> bool {
        !matches!(self, Self::Debug)
    }
}

/// Append-only log entry owned by a crawl.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlLogEntry {
    pub crawl_id: String,
    pub ts: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub url: Option<String>,
}

pub(crate) fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(Utc::now)
}
