//! Shared asset downloader.
//!
//! One downloader is shared by every page task in a crawl, so two pages
//! referencing the same stylesheet download it once. File names are derived
//! from the normalized URL hash, which also makes re-downloads on resume
//! land on the same path.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use tokio::sync::OnceCell;
use url::Url;

use crate::config::Blocklist;
use crate::util::{DESKTOP_USER_AGENT, STATIC_FETCH_TIMEOUT};

/// Asset category; decides the local output directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetCategory {
    Js,
    Css,
    Image,
    Font,
    Media,
}

impl AssetCategory {
    /// Directory name under the crawl output dir.
    #[must_use]
    pub fn dir(&self) -> &'static str {
        match self {
            Self::Js => "js",
            Self::Css => "css",
            Self::Image => "images",
            Self::Font => "fonts",
            Self::Media => "media",
        }
    }

    /// Fallback extension for URLs that carry none.
    #[must_use]
    fn default_extension(&self) -> &'static str {
        match self {
            Self::Js => "js",
            Self::Css => "css",
            Self::Image => "bin",
            Self::Font => "bin",
            Self::Media => "bin",
        }
    }

    /// Classify by file extension.
    #[must_use]
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "js" | "mjs" => Some(Self::Js),
            "css" => Some(Self::Css),
            "png" | "jpg" | "jpeg" | "gif" | "webp" | "avif" | "svg" | "ico" | "bmp" => {
                Some(Self::Image)
            }
            "woff" | "woff2" | "ttf" | "otf" | "eot" => Some(Self::Font),
            "mp4" | "webm" | "ogg" | "mp3" | "wav" | "flac" | "m4a" => Some(Self::Media),
            _ => None,
        }
    }

    /// Classify a URL by its path extension.
    #[must_use]
    pub fn from_url(url: &Url) -> Option<Self> {
        let last = url.path().rsplit('/').next()?;
        let (_, ext) = last.rsplit_once('.')?;
        Self::from_extension(ext)
    }
}

/// Outcome of a download request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Downloaded {
    /// Site-relative path (e.g. `/css/a1b2c3.css`) the reference should be
    /// rewritten to.
    Saved(String),
    /// On the blocklist; the caller keeps the original reference.
    Blocked,
}

impl Downloaded {
    #[must_use]
    pub fn local_path(&self) -> Option<&str> {
        match self {
            Self::Saved(path) => Some(path),
            Self::Blocked => None,
        }
    }
}

/// `url(...)` references inside CSS, excluding data: URIs.
static CSS_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"url\(\s*['"]?([^'")\s]+)['"]?\s*\)"#).expect("valid regex"));

/// Shared, deduplicating asset downloader for one crawl.
pub struct AssetDownloader {
    client: Client,
    output_dir: PathBuf,
    blocklist: Blocklist,
    /// Normalized URL → at-most-once download slot.
    cache: DashMap<String, Arc<OnceCell<Downloaded>>>,
}

impl AssetDownloader {
    #[must_use]
    pub fn new(client: Client, output_dir: PathBuf, blocklist: Blocklist) -> Self {
        Self {
            client,
            output_dir,
            blocklist,
            cache: DashMap::new(),
        }
    }

    /// Build the shared HTTP client used by the downloader and the static
    /// fetch path.
    pub fn build_client() -> Result<Client> {
        Client::builder()
            .user_agent(DESKTOP_USER_AGENT)
            .timeout(STATIC_FETCH_TIMEOUT)
            .gzip(true)
            .build()
            .context("Failed to build HTTP client")
    }

    /// Number of distinct assets handled so far.
    #[must_use]
    pub fn asset_count(&self) -> usize {
        self.cache.len()
    }

    /// Download an asset, returning its site-relative path, or `Blocked`.
    ///
    /// Deduplicates by normalized URL: concurrent callers for the same URL
    /// share one download.
    pub async fn download(&self, url: &Url, category: AssetCategory) -> Result<Downloaded> {
        self.download_inner(url.clone(), category, 0).await
    }

    fn download_inner(
        &self,
        url: Url,
        category: AssetCategory,
        depth: u8,
    ) -> BoxFuture<'_, Result<Downloaded>> {
        async move {
            let mut normalized = url.clone();
            normalized.set_fragment(None);
            let key = normalized.to_string();

            if self.blocklist.is_blocked(&key) {
                log::debug!("Blocklisted, skipping download: {key}");
                return Ok(Downloaded::Blocked);
            }

            let cell = self
                .cache
                .entry(key.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone();

            let result = cell
                .get_or_try_init(|| self.fetch_and_store(normalized.clone(), category, depth))
                .await?;
            Ok(result.clone())
        }
        .boxed()
    }

    async fn fetch_and_store(
        &self,
        url: Url,
        category: AssetCategory,
        depth: u8,
    ) -> Result<Downloaded> {
        let response = self
            .client
            .get(url.clone())
            .header("Accept", "*/*")
            .send()
            .await
            .with_context(|| format!("Failed to fetch asset {url}"))?;

        if !response.status().is_success() {
            return Err(anyhow!(
                "asset fetch for {url} returned status {}",
                response.status()
            ));
        }

        let body = response
            .bytes()
            .await
            .with_context(|| format!("Failed to read asset body for {url}"))?;

        let file_name = hashed_file_name(&url, category);
        let local = format!("/{}/{}", category.dir(), file_name);
        let disk_path = self.output_dir.join(category.dir()).join(&file_name);
        if let Some(parent) = disk_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create asset directory")?;
        }

        // Stylesheets get their own url(...) references mirrored so fonts
        // and background images survive offline. Bounded depth guards
        // against @import cycles.
        if category == AssetCategory::Css && depth < 2 {
            let text = String::from_utf8_lossy(&body).into_owned();
            let rewritten = self.mirror_css_refs(&url, text, depth).await;
            tokio::fs::write(&disk_path, rewritten)
                .await
                .context("Failed to write stylesheet")?;
        } else {
            tokio::fs::write(&disk_path, &body)
                .await
                .context("Failed to write asset")?;
        }

        log::debug!("Mirrored {url} -> {local}");
        Ok(Downloaded::Saved(local))
    }

    /// Download each `url(...)` reference in a stylesheet and rewrite it to
    /// the mirrored path. Failures keep the original reference.
    async fn mirror_css_refs(&self, css_url: &Url, css: String, depth: u8) -> String {
        let mut replacements: Vec<(String, String)> = Vec::new();

        for capture in CSS_URL_RE.captures_iter(&css) {
            let raw = &capture[1];
            if raw.starts_with("data:") || raw.starts_with('#') {
                continue;
            }
            let Ok(absolute) = css_url.join(raw) else {
                continue;
            };
            let category = AssetCategory::from_url(&absolute).unwrap_or(AssetCategory::Font);
            match self
                .download_inner(absolute.clone(), category, depth + 1)
                .await
            {
                Ok(Downloaded::Saved(local)) => {
                    replacements.push((raw.to_string(), local));
                }
                Ok(Downloaded::Blocked) => {}
                Err(e) => {
                    log::warn!("Failed to mirror CSS reference {absolute}: {e:#}");
                }
            }
        }

        let mut out = css;
        for (from, to) in replacements {
            out = out.replace(&from, &to);
        }
        out
    }
}

/// Deterministic file name for an asset URL: xxh3 of the normalized URL
/// plus the original extension.
#[must_use]
fn hashed_file_name(url: &Url, category: AssetCategory) -> String {
    let hash = xxhash_rust::xxh3::xxh3_64(url.as_str().as_bytes());
    let ext = url
        .path()
        .rsplit('/')
        .next()
        .and_then(|seg| seg.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty() && ext.len() <= 8 && ext.chars().all(char::is_alphanumeric))
        .unwrap_or_else(|| category.default_extension().to_string());
    format!("{}.{ext}", hex::encode(hash.to_be_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_from_extension() {
        assert_eq!(AssetCategory::from_extension("woff2"), Some(AssetCategory::Font));
        assert_eq!(AssetCategory::from_extension("JPG"), Some(AssetCategory::Image));
        assert_eq!(AssetCategory::from_extension("mjs"), Some(AssetCategory::Js));
        assert_eq!(AssetCategory::from_extension("html"), None);
    }

    #[test]
    fn hashed_names_are_stable_and_keep_extension() {
        let url = Url::parse("https://example.com/static/app.min.js?v=3").unwrap();
        let a = hashed_file_name(&url, AssetCategory::Js);
        let b = hashed_file_name(&url, AssetCategory::Js);
        assert_eq!(a, b);
        assert!(a.ends_with(".js"));
    }

    #[test]
    fn hashed_name_falls_back_to_category_extension() {
        let url = Url::parse("https://example.com/fonts/loader").unwrap();
        let name = hashed_file_name(&url, AssetCategory::Css);
        assert!(name.ends_with(".css"));
    }

    #[test]
    fn css_url_regex_matches_variants() {
        let css = r#"a{background:url("/img/a.png")} b{src:url(fonts/x.woff2)} c{list-style:url( 'd.svg' )}"#;
        let refs: Vec<_> = CSS_URL_RE.captures_iter(css).map(|c| c[1].to_string()).collect();
        assert_eq!(refs, vec!["/img/a.png", "fonts/x.woff2", "d.svg"]);
    }
}
