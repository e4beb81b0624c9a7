//! Frontier seeding from sitemaps and robots.txt.
//!
//! Order of attempts: `sitemap.xml`, then `Sitemap:` directives from
//! `robots.txt`, then `sitemap_index.xml` and a couple of conventional
//! locations. Sitemap indexes are followed exactly one level deep, and
//! gzipped sitemaps are transparently decompressed.

use std::io::Read;

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use reqwest::Client;
use url::Url;
use xml::reader::{EventReader, XmlEvent};

use crate::util::same_origin;

/// Conventional sitemap locations tried after robots.txt comes up empty.
const FALLBACK_SITEMAP_PATHS: &[&str] = &[
    "/sitemap_index.xml",
    "/sitemap-index.xml",
    "/wp-sitemap.xml",
    "/sitemap/sitemap.xml",
];

/// Page URLs and nested sitemap URLs pulled from one sitemap document.
#[derive(Debug, Default)]
struct SitemapContent {
    pages: Vec<Url>,
    nested: Vec<Url>,
}

/// Discover sitemap-listed page URLs for a site. Only same-origin URLs
/// survive; an unreachable or absent sitemap yields an empty list, never an
/// error, since the base URL alone still seeds the crawl.
pub async fn seed_from_sitemaps(client: &Client, base: &Url) -> Result<Vec<Url>> {
    let primary = base.join("/sitemap.xml").context("invalid base URL")?;

    // First-level sitemap documents, each fetched at most once.
    let mut documents: Vec<(Url, String)> = Vec::new();

    if let Some(content) = fetch_sitemap_text(client, &primary).await {
        documents.push((primary, content));
    } else {
        // 404 (or unreachable): consult robots.txt for Sitemap:
        // directives, then conventional locations.
        for sitemap in robots_sitemaps(client, base).await {
            if let Some(content) = fetch_sitemap_text(client, &sitemap).await {
                documents.push((sitemap, content));
            }
        }
        if documents.is_empty() {
            for path in FALLBACK_SITEMAP_PATHS {
                let Ok(candidate) = base.join(path) else { continue };
                if let Some(content) = fetch_sitemap_text(client, &candidate).await {
                    documents.push((candidate, content));
                    break;
                }
            }
        }
    }

    let mut pages = Vec::new();
    let mut seen_sitemaps: Vec<String> =
        documents.iter().map(|(url, _)| url.as_str().to_string()).collect();

    for (_, content) in &documents {
        let parsed = parse_sitemap(content);
        pages.extend(parsed.pages);

        // Indexes are followed one level deep, no further.
        for nested in parsed.nested {
            if seen_sitemaps.contains(&nested.as_str().to_string()) {
                continue;
            }
            seen_sitemaps.push(nested.as_str().to_string());
            if let Some(nested_content) = fetch_sitemap_text(client, &nested).await {
                pages.extend(parse_sitemap(&nested_content).pages);
            }
        }
    }

    // Extra-origin URLs are dropped.
    pages.retain(|url| same_origin(url, base));
    pages.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    pages.dedup();
    Ok(pages)
}

/// Fetch a sitemap document; `None` on 404 or network failure.
/// Gzip payloads (by extension or magic bytes) are decompressed.
async fn fetch_sitemap_text(client: &Client, url: &Url) -> Option<String> {
    let response = match client.get(url.clone()).send().await {
        Ok(response) => response,
        Err(e) => {
            log::debug!("Sitemap fetch failed for {url}: {e}");
            return None;
        }
    };
    if !response.status().is_success() {
        return None;
    }

    let bytes = response.bytes().await.ok()?;
    if url.path().ends_with(".gz") || bytes.starts_with(&[0x1f, 0x8b]) {
        let mut decoder = GzDecoder::new(bytes.as_ref());
        let mut out = String::new();
        match decoder.read_to_string(&mut out) {
            Ok(_) => Some(out),
            Err(e) => {
                log::warn!("Failed to decompress sitemap {url}: {e}");
                None
            }
        }
    } else {
        String::from_utf8(bytes.to_vec()).ok()
    }
}

/// `Sitemap:` directives from robots.txt (case-insensitive per RFC 9309).
async fn robots_sitemaps(client: &Client, base: &Url) -> Vec<Url> {
    let Ok(robots_url) = base.join("/robots.txt") else {
        return Vec::new();
    };
    let response = match client.get(robots_url.clone()).send().await {
        Ok(response) if response.status().is_success() => response,
        _ => return Vec::new(),
    };
    let Ok(content) = response.text().await else {
        return Vec::new();
    };

    let mut sitemaps = Vec::new();
    for line in content.lines() {
        let trimmed = line.trim();
        let lower = trimmed.to_ascii_lowercase();
        if let Some(rest) = lower.strip_prefix("sitemap:") {
            // Take the value from the original line to keep URL casing.
            let value = trimmed[trimmed.len() - rest.len()..].trim();
            if let Ok(url) = Url::parse(value) {
                if matches!(url.scheme(), "http" | "https") {
                    sitemaps.push(url);
                }
            }
        }
    }
    sitemaps
}

/// Pull `<loc>` values out of a sitemap or sitemap index, tracking element
/// context so page URLs and nested sitemap URLs stay separate.
fn parse_sitemap(content: &str) -> SitemapContent {
    let mut result = SitemapContent::default();
    let parser = EventReader::from_str(content);

    // Path of local element names from the root to the cursor.
    let mut stack: Vec<String> = Vec::new();
    let mut text = String::new();

    for event in parser {
        match event {
            Ok(XmlEvent::StartElement { name, .. }) => {
                stack.push(name.local_name.to_ascii_lowercase());
                text.clear();
            }
            Ok(XmlEvent::Characters(data)) => {
                text.push_str(&data);
            }
            Ok(XmlEvent::EndElement { .. }) => {
                let closed = stack.pop().unwrap_or_default();
                if closed == "loc" {
                    let parent = stack.last().map(String::as_str);
                    if let Ok(url) = Url::parse(text.trim()) {
                        match parent {
                            Some("url") => result.pages.push(url),
                            Some("sitemap") => result.nested.push(url),
                            _ => {}
                        }
                    }
                }
                text.clear();
            }
            Ok(_) => {}
            Err(e) => {
                log::warn!("Sitemap XML parse error: {e}");
                break;
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_urlset() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
            <urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
              <url><loc>https://example.com/</loc><lastmod>2026-01-01</lastmod></url>
              <url><loc>https://example.com/about</loc></url>
            </urlset>"#;
        let parsed = parse_sitemap(xml);
        assert_eq!(parsed.pages.len(), 2);
        assert!(parsed.nested.is_empty());
        assert_eq!(parsed.pages[0].as_str(), "https://example.com/");
    }

    #[test]
    fn parses_sitemap_index() {
        let xml = r#"<sitemapindex>
              <sitemap><loc>https://example.com/sitemap-pages.xml</loc></sitemap>
              <sitemap><loc>https://example.com/sitemap-posts.xml</loc></sitemap>
            </sitemapindex>"#;
        let parsed = parse_sitemap(xml);
        assert!(parsed.pages.is_empty());
        assert_eq!(parsed.nested.len(), 2);
    }

    #[test]
    fn lastmod_does_not_leak_into_locs() {
        let xml = r#"<urlset>
              <url><lastmod>2026-01-01</lastmod><loc>https://example.com/x</loc></url>
            </urlset>"#;
        let parsed = parse_sitemap(xml);
        assert_eq!(parsed.pages.len(), 1);
        assert_eq!(parsed.pages[0].as_str(), "https://example.com/x");
    }
}
