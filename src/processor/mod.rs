//! Page processor: fetch or render one URL, mirror its assets, and write
//! rewritten HTML into the crawl output tree.
//!
//! The top level is a match on the static-path outcome: pages without
//! dynamic-content signals never pay the browser cost.

pub mod browser;
pub mod federation;
pub mod js_scripts;
pub mod rewrite;
pub mod signals;
pub mod static_fetch;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use url::Url;

pub use federation::FederationMirror;
pub use signals::{requires_browser, scan_dynamic_signals, DynamicSignal};
pub use static_fetch::{fetch_static, FallbackReason, StaticOutcome};

use crate::assets::AssetDownloader;
use crate::browser::BrowserSession;
use crate::util::page_output_path;

/// Result of processing one page.
#[derive(Debug)]
pub struct ProcessedPage {
    /// The original (pre-rewrite) HTML; the executor mines it for links.
    pub html: String,
    /// Where the rewritten document landed, relative to the output dir.
    pub output_file: PathBuf,
    /// Whether the browser path was used.
    pub rendered: bool,
}

/// Shared page-processing context for one crawl.
pub struct PageProcessor {
    client: Client,
    output_dir: PathBuf,
    assets: Arc<AssetDownloader>,
    browser: Arc<BrowserSession>,
    federation: FederationMirror,
    remove_badge: bool,
    sitemap_only: bool,
    cancel: CancellationToken,
}

impl PageProcessor {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        client: Client,
        output_dir: PathBuf,
        assets: Arc<AssetDownloader>,
        browser: Arc<BrowserSession>,
        remove_badge: bool,
        sitemap_only: bool,
        cancel: CancellationToken,
    ) -> Self {
        let federation = FederationMirror::new(client.clone(), output_dir.clone());
        Self {
            client,
            output_dir,
            assets,
            browser,
            federation,
            remove_badge,
            sitemap_only,
            cancel,
        }
    }

    /// Shared asset downloader handle.
    #[must_use]
    pub fn assets(&self) -> &Arc<AssetDownloader> {
        &self.assets
    }

    /// Process one page: static-first, browser on fallback, rewrite, write.
    pub async fn process(&self, url: &Url) -> Result<ProcessedPage> {
        let (html, rendered) = match fetch_static(&self.client, url, &self.cancel).await? {
            StaticOutcome::Done(html) => (html, false),
            StaticOutcome::Fallback(reason) => {
                log::debug!("Static path fell back for {url}: {reason}");
                let html = browser::render_page(
                    &self.browser,
                    &self.assets,
                    url,
                    self.sitemap_only,
                    &self.cancel,
                )
                .await
                .with_context(|| format!("browser rendering failed for {url}"))?;
                (html, true)
            }
        };

        let rewritten = rewrite::rewrite_html(
            &html,
            url,
            &self.assets,
            &self.federation,
            self.remove_badge,
        )
        .await
        .with_context(|| format!("rewrite failed for {url}"))?;

        let output_file = page_output_path(url);
        let disk_path = self.output_dir.join(&output_file);
        if let Some(parent) = disk_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create page directory")?;
        }
        tokio::fs::write(&disk_path, rewritten)
            .await
            .with_context(|| format!("Failed to write {}", disk_path.display()))?;

        Ok(ProcessedPage {
            html,
            output_file,
            rendered,
        })
    }
}
