//! URL normalization and filtering helpers.
//!
//! These functions define what the executor considers "the same page" and
//! which discovered URLs are eligible for crawling at all.

use std::collections::HashMap;
use std::path::PathBuf;

use url::Url;

use super::constants::ASSET_EXTENSIONS;

/// Normalize a page URL for frontier/dedupe purposes: drop the fragment,
/// drop the trailing slash on non-root paths.
///
/// `https://a.com/page/#top` and `https://a.com/page` normalize equal;
/// `http://` and `https://` stay distinct.
#[must_use]
pub fn normalize_page_url(url: &Url) -> String {
    let mut u = url.clone();
    u.set_fragment(None);
    let s = u.to_string();
    // Keep the root URL's single slash; trim elsewhere.
    if u.path() != "/" && s.ends_with('/') && u.query().is_none() {
        s.trim_end_matches('/').to_string()
    } else {
        s
    }
}

/// Whether two URLs share scheme + host + port.
#[must_use]
pub fn same_origin(a: &Url, b: &Url) -> bool {
    a.origin() == b.origin()
}

/// Decide whether a discovered href is eligible to enter the frontier.
///
/// Rejects non-http(s) schemes, cross-origin URLs, and URLs whose path ends
/// in a known asset extension (those belong to the asset pipeline, not the
/// page frontier).
#[must_use]
pub fn is_crawlable_url(url: &Url, base: &Url) -> bool {
    if !matches!(url.scheme(), "http" | "https") {
        return false;
    }
    if !same_origin(url, base) {
        return false;
    }
    if let Some(ext) = url
        .path()
        .rsplit('/')
        .next()
        .and_then(|seg| seg.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase())
    {
        // .html/.htm etc. are still pages; only skip asset extensions.
        if ASSET_EXTENSIONS.contains(&ext.as_str()) {
            return false;
        }
    }
    true
}

/// Parse the site's canonical-redirects CSV (`from,to` per line) into a map
/// keyed by normalized source URL.
///
/// Malformed lines are skipped; the caller logs the count if it cares.
#[must_use]
pub fn parse_redirects_csv(csv: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in csv.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((from, to)) = line.split_once(',') else {
            continue;
        };
        let (from, to) = (from.trim(), to.trim());
        if let (Ok(from_url), Ok(to_url)) = (Url::parse(from), Url::parse(to)) {
            map.insert(normalize_page_url(&from_url), normalize_page_url(&to_url));
        }
    }
    map
}

/// Local output path for a page URL relative to the crawl output dir.
///
/// The site root becomes `index.html`; every other path becomes
/// `<path>/index.html` so directory-style links keep working offline.
#[must_use]
pub fn page_output_path(url: &Url) -> PathBuf {
    let trimmed = url.path().trim_matches('/');
    if trimmed.is_empty() {
        PathBuf::from("index.html")
    } else {
        let mut path = PathBuf::new();
        for seg in trimmed.split('/') {
            path.push(sanitize_filename::sanitize(seg));
        }
        path.join("index.html")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn normalize_drops_fragment_and_trailing_slash() {
        assert_eq!(
            normalize_page_url(&u("https://example.com/page/#top")),
            "https://example.com/page"
        );
        assert_eq!(
            normalize_page_url(&u("https://example.com/")),
            "https://example.com/"
        );
    }

    #[test]
    fn schemes_stay_distinct() {
        assert_ne!(
            normalize_page_url(&u("http://example.com/page")),
            normalize_page_url(&u("https://example.com/page"))
        );
    }

    #[test]
    fn crawlable_rejects_cross_origin_and_assets() {
        let base = u("https://example.com/");
        assert!(is_crawlable_url(&u("https://example.com/about"), &base));
        assert!(is_crawlable_url(&u("https://example.com/docs/intro.html"), &base));
        assert!(!is_crawlable_url(&u("https://other.com/about"), &base));
        assert!(!is_crawlable_url(&u("https://example.com/app.js"), &base));
        assert!(!is_crawlable_url(&u("https://example.com/logo.svg"), &base));
        assert!(!is_crawlable_url(&u("ftp://example.com/file"), &base));
    }

    #[test]
    fn output_paths_mirror_url_structure() {
        assert_eq!(page_output_path(&u("https://a.com/")), PathBuf::from("index.html"));
        assert_eq!(
            page_output_path(&u("https://a.com/about/")),
            PathBuf::from("about/index.html")
        );
        assert_eq!(
            page_output_path(&u("https://a.com/docs/guide")),
            PathBuf::from("docs/guide/index.html")
        );
    }

    #[test]
    fn redirects_csv_skips_malformed_lines() {
        let csv = "https://a.com/old,https://a.com/new\nnot-a-line\n# comment\n";
        let map = parse_redirects_csv(csv);
        assert_eq!(map.len(), 1);
        assert_eq!(
            map.get("https://a.com/old").map(String::as_str),
            Some("https://a.com/new")
        );
    }
}
