//! On-disk crawl state for crash resume.
//!
//! The state file records every page outcome so a worker restart can skip
//! already-archived pages. Writes are atomic (temp file + rename) because a
//! crash mid-write must never corrupt the resume data.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// File name inside the crawl temp directory.
pub const STATE_FILE_NAME: &str = ".crawl-state.json";

/// Per-crawl page outcomes, persisted after every page.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrawlStateFile {
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
}

/// Result of attempting to load the state file. `Invalid` is reported
/// distinctly so the caller can log the right resume decision.
#[derive(Debug)]
pub enum StateLoad {
    Missing,
    Invalid,
    Loaded(CrawlStateFile),
}

impl CrawlStateFile {
    /// Load from a crawl temp directory.
    pub async fn load(dir: &Path) -> StateLoad {
        let path = dir.join(STATE_FILE_NAME);
        match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<CrawlStateFile>(&bytes) {
                Ok(state) => StateLoad::Loaded(state),
                Err(e) => {
                    log::warn!("State file {} is not valid JSON: {e}", path.display());
                    StateLoad::Invalid
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StateLoad::Missing,
            Err(e) => {
                log::warn!("Failed to read state file {}: {e}", path.display());
                StateLoad::Invalid
            }
        }
    }

    /// Write atomically into the crawl temp directory.
    pub async fn save(&self, dir: &Path) -> Result<()> {
        let json = serde_json::to_vec(self).context("Failed to serialize crawl state")?;
        let dir = dir.to_path_buf();

        // NamedTempFile::persist renames within the same directory, so the
        // replacement is atomic on every sane filesystem.
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)
                .context("Failed to create state temp file")?;
            tmp.write_all(&json).context("Failed to write state")?;
            tmp.flush().context("Failed to flush state")?;
            tmp.persist(dir.join(STATE_FILE_NAME))
                .context("Failed to persist state file")?;
            Ok(())
        })
        .await
        .context("State write task panicked")?
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.succeeded.is_empty() && self.failed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let state = CrawlStateFile {
            succeeded: vec!["https://a.com/".into(), "https://a.com/about".into()],
            failed: vec!["https://a.com/broken".into()],
        };
        state.save(dir.path()).await.unwrap();

        match CrawlStateFile::load(dir.path()).await {
            StateLoad::Loaded(loaded) => {
                assert_eq!(loaded.succeeded, state.succeeded);
                assert_eq!(loaded.failed, state.failed);
            }
            other => panic!("expected Loaded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_file_reported_as_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            CrawlStateFile::load(dir.path()).await,
            StateLoad::Missing
        ));
    }

    #[tokio::test]
    async fn invalid_json_reported_as_invalid() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join(STATE_FILE_NAME), b"{not json")
            .await
            .unwrap();
        assert!(matches!(
            CrawlStateFile::load(dir.path()).await,
            StateLoad::Invalid
        ));
    }
}
