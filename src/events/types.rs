//! Wire types for crawl events.
//!
//! These serialize to the exact JSON shapes the dashboard consumes, so the
//! serde attributes here are part of the protocol.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::LogLevel;

/// Crawl phase attached to progress events once uploading starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrawlPhase {
    Crawling,
    Uploading,
}

/// Byte-level upload progress attached to progress events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSnapshot {
    pub total_bytes: u64,
    pub uploaded_bytes: u64,
    pub files_total: u64,
    pub files_uploaded: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_file: Option<String>,
    pub percent: f64,
}

/// Page counters for a progress event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
}

/// An event on a crawl's channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CrawlEvent {
    Log {
        level: LogLevel,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        timestamp: DateTime<Utc>,
    },
    Progress {
        total: u64,
        succeeded: u64,
        failed: u64,
        #[serde(rename = "currentUrl", skip_serializing_if = "Option::is_none")]
        current_url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        phase: Option<CrawlPhase>,
        #[serde(skip_serializing_if = "Option::is_none")]
        upload: Option<UploadSnapshot>,
    },
    /// Emitted by subscribers on attach, never by the worker.
    Connected {
        #[serde(rename = "crawlId")]
        crawl_id: String,
    },
    /// Subscriber keep-alive.
    Ping,
}

impl CrawlEvent {
    #[must_use]
    pub fn log(level: LogLevel, message: impl Into<String>, url: Option<String>) -> Self {
        Self::Log {
            level,
            message: message.into(),
            url,
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn progress(snapshot: &ProgressSnapshot, current_url: Option<String>) -> Self {
        Self::Progress {
            total: snapshot.total,
            succeeded: snapshot.succeeded,
            failed: snapshot.failed,
            current_url,
            phase: None,
            upload: None,
        }
    }

    #[must_use]
    pub fn upload_progress(snapshot: &ProgressSnapshot, upload: UploadSnapshot) -> Self {
        Self::Progress {
            total: snapshot.total,
            succeeded: snapshot.succeeded,
            failed: snapshot.failed,
            current_url: None,
            phase: Some(CrawlPhase::Uploading),
            upload: Some(upload),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_event_wire_shape() {
        let event = CrawlEvent::log(LogLevel::Warn, "slow page", Some("https://a.com/x".into()));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "log");
        assert_eq!(json["level"], "warn");
        assert_eq!(json["url"], "https://a.com/x");
        assert!(json.get("timestamp").is_some());
    }

    #[test]
    fn progress_event_uses_camel_case_keys() {
        let event = CrawlEvent::upload_progress(
            &ProgressSnapshot {
                total: 10,
                succeeded: 9,
                failed: 1,
            },
            UploadSnapshot {
                total_bytes: 1000,
                uploaded_bytes: 500,
                files_total: 1,
                files_uploaded: 0,
                current_file: Some("archive.zip".into()),
                percent: 50.0,
            },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["phase"], "uploading");
        assert_eq!(json["upload"]["totalBytes"], 1000);
        assert_eq!(json["upload"]["uploadedBytes"], 500);
        assert_eq!(json["upload"]["currentFile"], "archive.zip");
    }

    #[test]
    fn current_url_omitted_when_unset() {
        let event = CrawlEvent::progress(&ProgressSnapshot::default(), None);
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("currentUrl"));
    }
}
