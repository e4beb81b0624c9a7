//! Per-crawl site configuration derived from the site row.
//!
//! The lifecycle driver builds one `SiteConfig` per job: exclusion patterns
//! are compiled once here to keep regex compilation out of the hot path,
//! and the download blocklist is the global ∪ site merge.

use std::collections::HashMap;

use anyhow::{Context, Result};
use regex::Regex;
use url::Url;

use crate::store::Site;
use crate::util::parse_redirects_csv;

/// Download blocklist with exact and `*`-suffixed prefix entries.
#[derive(Debug, Clone, Default)]
pub struct Blocklist {
    exact: Vec<String>,
    prefixes: Vec<String>,
}

impl Blocklist {
    #[must_use]
    pub fn new(entries: Vec<String>) -> Self {
        let mut exact = Vec::new();
        let mut prefixes = Vec::new();
        for entry in entries {
            let entry = entry.trim().to_string();
            if entry.is_empty() {
                continue;
            }
            if let Some(prefix) = entry.strip_suffix('*') {
                prefixes.push(prefix.to_string());
            } else {
                exact.push(entry);
            }
        }
        Self { exact, prefixes }
    }

    /// Whether a URL must not be downloaded.
    #[must_use]
    pub fn is_blocked(&self, url: &str) -> bool {
        self.exact.iter().any(|e| e == url) || self.prefixes.iter().any(|p| url.starts_with(p.as_str()))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.prefixes.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.exact.len() + self.prefixes.len()
    }
}

/// Merge the global and site blocklists, deduplicating entries while
/// preserving first-seen order.
#[must_use]
pub fn merge_blocklists(global: &[String], site: &[String]) -> Vec<String> {
    let mut merged = Vec::with_capacity(global.len() + site.len());
    for entry in global.iter().chain(site.iter()) {
        let entry = entry.trim();
        if !entry.is_empty() && !merged.iter().any(|m: &String| m == entry) {
            merged.push(entry.to_string());
        }
    }
    merged
}

/// Resolved configuration for one crawl of one site.
#[derive(Debug, Clone)]
pub struct SiteConfig {
    pub base_url: Url,
    /// Already clamped to the worker's `MAX_SITE_CONCURRENCY`.
    pub concurrency: usize,
    pub max_pages: Option<usize>,
    pub exclude_patterns: Vec<Regex>,
    pub blocklist: Blocklist,
    pub remove_badge: bool,
    /// Canonical redirects applied during link normalization.
    pub redirects: HashMap<String, String>,
    /// Crawl only sitemap-seeded URLs; skip link discovery.
    pub sitemap_only: bool,
}

impl SiteConfig {
    /// Build the per-crawl config from the site row and the merged
    /// blocklist. Returns `(config, clamped)` where `clamped` reports
    /// whether the site's concurrency exceeded the global cap.
    pub fn resolve(
        site: &Site,
        merged_blocklist: Vec<String>,
        max_site_concurrency: usize,
    ) -> Result<(Self, bool)> {
        let base_url = Url::parse(&site.base_url)
            .with_context(|| format!("site {} has an invalid base URL", site.id))?;

        let mut exclude_patterns = Vec::with_capacity(site.exclude_patterns.len());
        for pattern in &site.exclude_patterns {
            let re = Regex::new(pattern)
                .with_context(|| format!("invalid exclusion pattern {pattern:?}"))?;
            exclude_patterns.push(re);
        }

        let requested = site.concurrency.max(1) as usize;
        let clamped = requested > max_site_concurrency;
        let concurrency = requested.min(max_site_concurrency);

        let redirects = site
            .redirects_csv
            .as_deref()
            .map(parse_redirects_csv)
            .unwrap_or_default();

        Ok((
            Self {
                base_url,
                concurrency,
                max_pages: site.max_pages.map(|n| n as usize),
                exclude_patterns,
                blocklist: Blocklist::new(merged_blocklist),
                remove_badge: site.remove_badge,
                redirects,
                sitemap_only: site.sitemap_only,
            },
            clamped,
        ))
    }

    /// Whether a URL matches any exclusion pattern.
    #[must_use]
    pub fn is_excluded(&self, url: &str) -> bool {
        self.exclude_patterns.iter().any(|re| re.is_match(url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocklist_exact_and_prefix() {
        let bl = Blocklist::new(vec![
            "https://cdn.example.com/analytics.js".to_string(),
            "https://tracker.example.com/*".to_string(),
        ]);
        assert!(bl.is_blocked("https://cdn.example.com/analytics.js"));
        assert!(bl.is_blocked("https://tracker.example.com/pixel.gif"));
        assert!(!bl.is_blocked("https://cdn.example.com/app.js"));
    }

    #[test]
    fn merge_dedupes_and_keeps_order() {
        let global = vec!["https://a/*".to_string(), "https://b".to_string()];
        let site = vec!["https://b".to_string(), "https://c".to_string()];
        let merged = merge_blocklists(&global, &site);
        assert_eq!(merged, vec!["https://a/*", "https://b", "https://c"]);
    }
}
