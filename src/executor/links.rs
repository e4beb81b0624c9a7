//! Anchor-link discovery from page HTML.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use scraper::{Html, Selector};
use url::Url;

use crate::util::{is_crawlable_url, normalize_page_url};

static ANCHOR_SEL: Lazy<Selector> =
    Lazy::new(|| Selector::parse("a[href]").expect("valid selector"));

/// Extract same-origin crawlable links from a page, normalized and with
/// canonical redirects applied. Deduplicates while preserving order.
#[must_use]
pub fn discover_links(
    html: &str,
    page_url: &Url,
    base: &Url,
    redirects: &HashMap<String, String>,
) -> Vec<Url> {
    let document = Html::parse_document(html);
    let mut links = Vec::new();
    let mut seen = Vec::new();

    for element in document.select(&ANCHOR_SEL) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        let href = href.trim();
        if href.is_empty()
            || href.starts_with('#')
            || href.starts_with("javascript:")
            || href.starts_with("mailto:")
            || href.starts_with("tel:")
            || href.starts_with("data:")
        {
            continue;
        }

        let Ok(resolved) = page_url.join(href) else {
            continue;
        };
        if !is_crawlable_url(&resolved, base) {
            continue;
        }

        let mut normalized = normalize_page_url(&resolved);
        // Canonical redirects rewrite known aliases to their target before
        // the URL enters the frontier.
        if let Some(target) = redirects.get(&normalized) {
            normalized = target.clone();
        }

        if seen.contains(&normalized) {
            continue;
        }
        if let Ok(url) = Url::parse(&normalized) {
            seen.push(normalized);
            links.push(url);
        }
    }

    links
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://example.com/").unwrap()
    }

    #[test]
    fn discovers_and_normalizes_same_origin_links() {
        let html = r##"
            <a href="/about/">About</a>
            <a href="contact#form">Contact</a>
            <a href="https://example.com/pricing">Pricing</a>
            <a href="https://other.com/">External</a>
            <a href="mailto:hi@example.com">Mail</a>
            <a href="tel:+123">Call</a>
            <a href="/styles/site.css">Asset</a>
            <a href="javascript:void(0)">JS</a>
        "##;
        let links = discover_links(html, &base(), &base(), &HashMap::new());
        let strings: Vec<_> = links.iter().map(Url::as_str).collect();
        assert_eq!(
            strings,
            vec![
                "https://example.com/about",
                "https://example.com/contact",
                "https://example.com/pricing",
            ]
        );
    }

    #[test]
    fn duplicate_variants_collapse() {
        let html = r##"
            <a href="/about">1</a>
            <a href="/about/">2</a>
            <a href="/about#team">3</a>
        "##;
        let links = discover_links(html, &base(), &base(), &HashMap::new());
        assert_eq!(links.len(), 1);
    }

    #[test]
    fn redirects_applied_during_normalization() {
        let mut redirects = HashMap::new();
        redirects.insert(
            "https://example.com/old".to_string(),
            "https://example.com/new".to_string(),
        );
        let html = r#"<a href="/old">Old</a>"#;
        let links = discover_links(html, &base(), &base(), &redirects);
        assert_eq!(links[0].as_str(), "https://example.com/new");
    }
}
