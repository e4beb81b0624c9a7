//! HTML rewrite pipeline shared by the static and browser paths.
//!
//! Three phases: a read-only pass collects every rewritable reference, the
//! asset downloader mirrors them concurrently, then one streaming lol_html
//! pass swaps references for local paths. Blocked and failed downloads keep
//! their original references, so rewriting is always safe to apply.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use anyhow::{anyhow, Context, Result};
use lol_html::html_content::ContentType;
use lol_html::{element, text, HtmlRewriter, Settings};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use url::Url;

use super::federation::FederationMirror;
use crate::assets::{AssetCategory, AssetDownloader, Downloaded};
use crate::util::same_origin;

static CSS_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"url\(\s*['"]?([^'")\s]+)['"]?\s*\)"#).expect("valid regex"));

static HEX_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9a-f]{16}\.[a-z0-9]+$").expect("valid regex"));

/// Attribute values that must never be treated as downloadable references.
fn is_skippable_ref(raw: &str) -> bool {
    let raw = raw.trim();
    raw.is_empty()
        || raw.starts_with('#')
        || raw.starts_with("data:")
        || raw.starts_with("blob:")
        || raw.starts_with("javascript:")
        || raw.starts_with("mailto:")
        || raw.starts_with("tel:")
}

/// Whether a reference already points into our local asset layout; the
/// idempotence guard that makes rewriting rewritten HTML a no-op.
fn is_local_asset_path(raw: &str) -> bool {
    for dir in ["js", "css", "images", "fonts", "media"] {
        if let Some(rest) = raw.strip_prefix(&format!("/{dir}/")) {
            if HEX_NAME_RE.is_match(rest) {
                return true;
            }
        }
    }
    raw.starts_with("/code-components/")
}

/// Resolve a raw attribute value to an absolute same-origin URL eligible
/// for mirroring.
fn resolve_ref(page_url: &Url, raw: &str) -> Option<Url> {
    if is_skippable_ref(raw) || is_local_asset_path(raw.trim()) {
        return None;
    }
    let url = page_url.join(raw.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    // Assets are only mirrored from the page's own origin.
    if !same_origin(&url, page_url) {
        return None;
    }
    Some(url)
}

/// Parse a srcset value into its candidate URLs.
fn srcset_candidates(srcset: &str) -> Vec<String> {
    srcset
        .split(',')
        .filter_map(|candidate| candidate.split_whitespace().next())
        .filter(|url| !url.is_empty())
        .map(str::to_string)
        .collect()
}

static STYLESHEET_SEL: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"link[rel="stylesheet"][href]"#).expect("valid selector"));
static SCRIPT_SEL: Lazy<Selector> =
    Lazy::new(|| Selector::parse("script[src]").expect("valid selector"));
static IMG_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("img").expect("valid selector"));
static SOURCE_SEL: Lazy<Selector> =
    Lazy::new(|| Selector::parse("source").expect("valid selector"));
static VIDEO_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("video").expect("valid selector"));
static AUDIO_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("audio").expect("valid selector"));
static ICON_SEL: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(r#"link[rel~="icon"][href], link[rel="apple-touch-icon"][href], link[rel="mask-icon"][href], link[rel="image_src"][href]"#)
        .expect("valid selector")
});
static META_IMAGE_SEL: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(r#"meta[property="og:image"], meta[property="og:image:url"], meta[property="og:image:secure_url"], meta[name="twitter:image"], meta[name="twitter:image:src"], meta[itemprop="image"]"#)
        .expect("valid selector")
});
static IFRAME_SEL: Lazy<Selector> =
    Lazy::new(|| Selector::parse("iframe[src]").expect("valid selector"));
static STYLED_SEL: Lazy<Selector> =
    Lazy::new(|| Selector::parse("[style]").expect("valid selector"));
static STYLE_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("style").expect("valid selector"));
static DATA_BG_SEL: Lazy<Selector> =
    Lazy::new(|| Selector::parse("[data-bg]").expect("valid selector"));
static ISLAND_SEL: Lazy<Selector> =
    Lazy::new(|| Selector::parse("code-island[data-loader]").expect("valid selector"));

/// References found by the read-only collection pass.
#[derive(Debug, Default)]
struct Collected {
    /// Absolute URL string → category.
    assets: HashMap<String, AssetCategory>,
    /// Raw `data-loader` attribute values.
    islands: Vec<String>,
}

impl Collected {
    fn add(&mut self, page_url: &Url, raw: &str, category: AssetCategory) {
        if let Some(url) = resolve_ref(page_url, raw) {
            let mut url = url;
            url.set_fragment(None);
            self.assets.entry(url.to_string()).or_insert(category);
        }
    }

    fn add_srcset(&mut self, page_url: &Url, srcset: &str, category: AssetCategory) {
        for candidate in srcset_candidates(srcset) {
            self.add(page_url, &candidate, category);
        }
    }

    fn add_css_text(&mut self, page_url: &Url, css: &str) {
        for capture in CSS_URL_RE.captures_iter(css) {
            let raw = &capture[1];
            let category = page_url
                .join(raw)
                .ok()
                .and_then(|u| AssetCategory::from_url(&u))
                .unwrap_or(AssetCategory::Image);
            self.add(page_url, raw, category);
        }
    }
}

fn collect_references(html: &str, page_url: &Url) -> Collected {
    let document = Html::parse_document(html);
    let mut collected = Collected::default();

    for el in document.select(&STYLESHEET_SEL) {
        if let Some(href) = el.value().attr("href") {
            collected.add(page_url, href, AssetCategory::Css);
        }
    }

    for el in document.select(&SCRIPT_SEL) {
        if let Some(src) = el.value().attr("src") {
            // Rocket Loader shims are removed by the rewrite pass, not
            // mirrored.
            if !src.contains("rocket-loader.min.js") {
                collected.add(page_url, src, AssetCategory::Js);
            }
        }
    }

    for el in document.select(&IMG_SEL) {
        let v = el.value();
        for attr in ["src", "data-src"] {
            if let Some(value) = v.attr(attr) {
                collected.add(page_url, value, AssetCategory::Image);
            }
        }
        for attr in ["srcset", "data-srcset"] {
            if let Some(value) = v.attr(attr) {
                collected.add_srcset(page_url, value, AssetCategory::Image);
            }
        }
    }

    for el in document.select(&SOURCE_SEL) {
        let in_picture = el
            .parent()
            .and_then(scraper::ElementRef::wrap)
            .map(|p| p.value().name() == "picture")
            .unwrap_or(false);
        let category = if in_picture {
            AssetCategory::Image
        } else {
            AssetCategory::Media
        };
        let v = el.value();
        for attr in ["src", "data-src"] {
            if let Some(value) = v.attr(attr) {
                collected.add(page_url, value, category);
            }
        }
        for attr in ["srcset", "data-srcset"] {
            if let Some(value) = v.attr(attr) {
                collected.add_srcset(page_url, value, category);
            }
        }
    }

    for el in document.select(&VIDEO_SEL) {
        let v = el.value();
        if let Some(src) = v.attr("src") {
            collected.add(page_url, src, AssetCategory::Media);
        }
        if let Some(poster) = v.attr("poster") {
            collected.add(page_url, poster, AssetCategory::Image);
        }
    }

    for el in document.select(&AUDIO_SEL) {
        if let Some(src) = el.value().attr("src") {
            collected.add(page_url, src, AssetCategory::Media);
        }
    }

    for el in document.select(&ICON_SEL) {
        if let Some(href) = el.value().attr("href") {
            collected.add(page_url, href, AssetCategory::Image);
        }
    }

    for el in document.select(&META_IMAGE_SEL) {
        if let Some(content) = el.value().attr("content") {
            collected.add(page_url, content, AssetCategory::Image);
        }
    }

    for el in document.select(&IFRAME_SEL) {
        if let Some(src) = el.value().attr("src") {
            let category = page_url
                .join(src)
                .ok()
                .and_then(|u| AssetCategory::from_url(&u))
                .unwrap_or(AssetCategory::Media);
            collected.add(page_url, src, category);
        }
    }

    for el in document.select(&STYLED_SEL) {
        if let Some(style) = el.value().attr("style") {
            collected.add_css_text(page_url, style);
        }
    }

    for el in document.select(&STYLE_SEL) {
        let css: String = el.text().collect();
        collected.add_css_text(page_url, &css);
    }

    for el in document.select(&DATA_BG_SEL) {
        if let Some(bg) = el.value().attr("data-bg") {
            collected.add(page_url, bg, AssetCategory::Image);
        }
    }

    for el in document.select(&ISLAND_SEL) {
        if let Some(loader) = el.value().attr("data-loader") {
            collected.islands.push(loader.to_string());
        }
    }

    collected
}

/// Rewrite every `url(...)` in a CSS string through the resolver.
fn rewrite_css_text(css: &str, resolver: &impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(css.len());
    let mut last = 0;
    for capture in CSS_URL_RE.captures_iter(css) {
        let whole = capture.get(0).expect("capture 0 always present");
        let inner = capture.get(1).expect("group 1 always present");
        out.push_str(&css[last..inner.start()]);
        match resolver(inner.as_str()) {
            Some(local) => out.push_str(&local),
            None => out.push_str(inner.as_str()),
        }
        out.push_str(&css[inner.end()..whole.end()]);
        last = whole.end();
    }
    out.push_str(&css[last..]);
    out
}

/// Rewrite a srcset value through the resolver, preserving descriptors.
fn rewrite_srcset(srcset: &str, resolver: &impl Fn(&str) -> Option<String>) -> String {
    srcset
        .split(',')
        .map(|candidate| {
            let trimmed = candidate.trim();
            let mut parts = trimmed.splitn(2, char::is_whitespace);
            let url = parts.next().unwrap_or_default();
            let descriptor = parts.next().unwrap_or_default();
            let rewritten = resolver(url).unwrap_or_else(|| url.to_string());
            if descriptor.is_empty() {
                rewritten
            } else {
                format!("{rewritten} {descriptor}")
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Rewrite a page's HTML so every mirrored reference points at its local
/// copy. Returns the rewritten document.
pub async fn rewrite_html(
    html: &str,
    page_url: &Url,
    assets: &AssetDownloader,
    federation: &FederationMirror,
    remove_badge: bool,
) -> Result<String> {
    // Phase 1: collect.
    let collected = collect_references(html, page_url);

    // Phase 2: mirror. Failures keep the original reference and log a
    // warning; blocked URLs keep the original reference silently.
    let downloads = collected.assets.iter().map(|(abs, category)| {
        let abs = abs.clone();
        let category = *category;
        async move {
            let url = Url::parse(&abs).ok()?;
            match assets.download(&url, category).await {
                Ok(Downloaded::Saved(local)) => Some((abs, local)),
                Ok(Downloaded::Blocked) => None,
                Err(e) => {
                    log::warn!("Failed to mirror asset {abs}: {e:#}");
                    None
                }
            }
        }
    });
    let url_map: HashMap<String, String> = futures::future::join_all(downloads)
        .await
        .into_iter()
        .flatten()
        .collect();

    let mut island_map: HashMap<String, String> = HashMap::new();
    for loader in &collected.islands {
        match federation.mirror_loader(loader, page_url).await {
            Ok(Some(rewritten)) => {
                island_map.insert(loader.clone(), rewritten);
            }
            Ok(None) => {}
            Err(e) => log::warn!("Failed to mirror code-island module: {e:#}"),
        }
    }

    // Phase 3: one streaming rewrite pass.
    rewrite_pass(html, page_url, &url_map, &island_map, remove_badge)
}

fn rewrite_pass(
    html: &str,
    page_url: &Url,
    url_map: &HashMap<String, String>,
    island_map: &HashMap<String, String>,
    remove_badge: bool,
) -> Result<String> {
    let resolver = |raw: &str| -> Option<String> {
        let mut url = page_url.join(raw.trim()).ok()?;
        url.set_fragment(None);
        url_map.get(url.as_str()).cloned()
    };

    let mut output = Vec::with_capacity(html.len());
    let style_buffer: Rc<RefCell<String>> = Rc::new(RefCell::new(String::new()));

    let mut handlers = vec![
        // Scripts: Rocket Loader normalization, then local rewrite.
        element!("script", |el| {
            if let Some(src) = el.get_attribute("src") {
                if src.contains("rocket-loader.min.js") {
                    el.remove();
                    return Ok(());
                }
                if let Some(local) = resolver(&src) {
                    el.set_attribute("src", &local)?;
                    el.remove_attribute("integrity");
                }
            }
            el.remove_attribute("data-cfasync");
            if el.get_attribute("type").as_deref() == Some("text/rocketscript") {
                el.set_attribute("type", "text/javascript")?;
            }
            Ok(())
        }),
        // Stylesheets, icons, legacy image_src.
        element!("link[href]", |el| {
            if let Some(href) = el.get_attribute("href") {
                if let Some(local) = resolver(&href) {
                    el.set_attribute("href", &local)?;
                    el.remove_attribute("integrity");
                }
            }
            Ok(())
        }),
        // Images: fold lazy attributes, then rewrite.
        element!("img", |el| {
            if let Some(data_src) = el.get_attribute("data-src") {
                el.set_attribute("src", &data_src)?;
                el.remove_attribute("data-src");
            }
            if let Some(data_srcset) = el.get_attribute("data-srcset") {
                el.set_attribute("srcset", &data_srcset)?;
                el.remove_attribute("data-srcset");
            }
            if let Some(src) = el.get_attribute("src") {
                if let Some(local) = resolver(&src) {
                    el.set_attribute("src", &local)?;
                }
            }
            if let Some(srcset) = el.get_attribute("srcset") {
                el.set_attribute("srcset", &rewrite_srcset(&srcset, &resolver))?;
            }
            Ok(())
        }),
        element!("source", |el| {
            if let Some(data_src) = el.get_attribute("data-src") {
                el.set_attribute("src", &data_src)?;
                el.remove_attribute("data-src");
            }
            if let Some(data_srcset) = el.get_attribute("data-srcset") {
                el.set_attribute("srcset", &data_srcset)?;
                el.remove_attribute("data-srcset");
            }
            if let Some(src) = el.get_attribute("src") {
                if let Some(local) = resolver(&src) {
                    el.set_attribute("src", &local)?;
                }
            }
            if let Some(srcset) = el.get_attribute("srcset") {
                el.set_attribute("srcset", &rewrite_srcset(&srcset, &resolver))?;
            }
            Ok(())
        }),
        element!("video", |el| {
            for attr in ["src", "poster"] {
                if let Some(value) = el.get_attribute(attr) {
                    if let Some(local) = resolver(&value) {
                        el.set_attribute(attr, &local)?;
                    }
                }
            }
            Ok(())
        }),
        element!("audio[src]", |el| {
            if let Some(src) = el.get_attribute("src") {
                if let Some(local) = resolver(&src) {
                    el.set_attribute("src", &local)?;
                }
            }
            Ok(())
        }),
        element!("iframe[src]", |el| {
            if let Some(src) = el.get_attribute("src") {
                if let Some(local) = resolver(&src) {
                    el.set_attribute("src", &local)?;
                }
            }
            Ok(())
        }),
        // OpenGraph / Twitter / itemprop image metadata.
        element!("meta[content]", |el| {
            let key = el
                .get_attribute("property")
                .or_else(|| el.get_attribute("name"))
                .or_else(|| el.get_attribute("itemprop"))
                .unwrap_or_default();
            if matches!(
                key.as_str(),
                "og:image"
                    | "og:image:url"
                    | "og:image:secure_url"
                    | "twitter:image"
                    | "twitter:image:src"
                    | "image"
            ) {
                if let Some(content) = el.get_attribute("content") {
                    if let Some(local) = resolver(&content) {
                        el.set_attribute("content", &local)?;
                    }
                }
            }
            Ok(())
        }),
        // Inline style attributes.
        element!("*[style]", |el| {
            if let Some(style) = el.get_attribute("style") {
                let rewritten = rewrite_css_text(&style, &resolver);
                if rewritten != style {
                    el.set_attribute("style", &rewritten)?;
                }
            }
            Ok(())
        }),
        // Lazy backgrounds fold into an appended background-image style.
        element!("*[data-bg]", |el| {
            if let Some(bg) = el.get_attribute("data-bg") {
                let local = resolver(&bg).unwrap_or_else(|| bg.clone());
                let mut style = el.get_attribute("style").unwrap_or_default();
                if !style.is_empty() && !style.trim_end().ends_with(';') {
                    style.push(';');
                }
                style.push_str(&format!("background-image:url('{local}')"));
                el.set_attribute("style", &style)?;
                el.remove_attribute("data-bg");
            }
            Ok(())
        }),
        // Federated code-island loaders.
        element!("code-island[data-loader]", |el| {
            if let Some(loader) = el.get_attribute("data-loader") {
                if let Some(rewritten) = island_map.get(&loader) {
                    el.set_attribute("data-loader", rewritten)?;
                }
            }
            Ok(())
        }),
        // Inline <style> blocks, buffered across text chunks.
        text!("style", {
            let style_buffer = Rc::clone(&style_buffer);
            let resolver = &resolver;
            move |t| {
                let mut buffer = style_buffer.borrow_mut();
                buffer.push_str(t.as_str());
                if t.last_in_text_node() {
                    let rewritten = rewrite_css_text(&buffer, resolver);
                    t.replace(&rewritten, ContentType::Html);
                    buffer.clear();
                } else {
                    t.remove();
                }
                Ok(())
            }
        }),
    ];

    if remove_badge {
        handlers.push(element!(".w-webflow-badge", |el| {
            el.remove();
            Ok(())
        }));
    }

    let mut rewriter = HtmlRewriter::new(
        Settings {
            element_content_handlers: handlers,
            ..Settings::default()
        },
        |chunk: &[u8]| output.extend_from_slice(chunk),
    );

    rewriter
        .write(html.as_bytes())
        .map_err(|e| anyhow!("HTML rewrite error: {e}"))?;
    rewriter
        .end()
        .map_err(|e| anyhow!("HTML rewrite finalization error: {e}"))?;

    String::from_utf8(output).context("Rewritten HTML is not valid UTF-8")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page() -> Url {
        Url::parse("https://example.com/docs/").unwrap()
    }

    fn rewrite_with(
        html: &str,
        map: &[(&str, &str)],
        remove_badge: bool,
    ) -> String {
        let url_map: HashMap<String, String> = map
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        rewrite_pass(html, &page(), &url_map, &HashMap::new(), remove_badge).unwrap()
    }

    #[test]
    fn collects_same_origin_assets_only() {
        let html = r#"
            <link rel="stylesheet" href="/css/site.css">
            <script src="https://example.com/js/app.js"></script>
            <script src="https://cdn.other.com/lib.js"></script>
            <img src="../images/logo.png">
        "#;
        let collected = collect_references(html, &page());
        assert!(collected.assets.contains_key("https://example.com/css/site.css"));
        assert!(collected.assets.contains_key("https://example.com/js/app.js"));
        assert!(collected.assets.contains_key("https://example.com/images/logo.png"));
        assert!(!collected.assets.keys().any(|k| k.contains("cdn.other.com")));
    }

    #[test]
    fn collects_srcset_and_meta_images() {
        let html = r#"
            <img srcset="/img/a.png 1x, /img/b.png 2x">
            <meta property="og:image" content="/img/og.png">
        "#;
        let collected = collect_references(html, &page());
        assert!(collected.assets.contains_key("https://example.com/img/a.png"));
        assert!(collected.assets.contains_key("https://example.com/img/b.png"));
        assert!(collected.assets.contains_key("https://example.com/img/og.png"));
    }

    #[test]
    fn rewrites_and_strips_integrity() {
        let html = r#"<script src="/js/app.js" integrity="sha384-x"></script>"#;
        let out = rewrite_with(
            html,
            &[("https://example.com/js/app.js", "/js/0011223344556677.js")],
            false,
        );
        assert!(out.contains(r#"src="/js/0011223344556677.js""#));
        assert!(!out.contains("integrity"));
    }

    #[test]
    fn rocket_loader_normalized() {
        let html = concat!(
            r#"<script src="/cdn-cgi/scripts/rocket-loader.min.js"></script>"#,
            r#"<script type="text/rocketscript" data-cfasync="false" src="/js/app.js"></script>"#,
        );
        let out = rewrite_with(html, &[], false);
        assert!(!out.contains("rocket-loader.min.js"));
        assert!(!out.contains("data-cfasync"));
        assert!(out.contains(r#"type="text/javascript""#));
    }

    #[test]
    fn lazy_media_folded() {
        let html = r#"<img data-src="/img/hero.png"><div data-bg="/img/bg.jpg"></div>"#;
        let out = rewrite_with(
            html,
            &[
                ("https://example.com/img/hero.png", "/images/aaaaaaaaaaaaaaaa.png"),
                ("https://example.com/img/bg.jpg", "/images/bbbbbbbbbbbbbbbb.jpg"),
            ],
            false,
        );
        assert!(out.contains(r#"src="/images/aaaaaaaaaaaaaaaa.png""#));
        assert!(!out.contains("data-src"));
        assert!(out.contains("background-image:url('/images/bbbbbbbbbbbbbbbb.jpg')"));
        assert!(!out.contains("data-bg"));
    }

    #[test]
    fn srcset_descriptors_preserved() {
        let html = r#"<img srcset="/img/a.png 1x, /img/b.png 2x">"#;
        let out = rewrite_with(
            html,
            &[
                ("https://example.com/img/a.png", "/images/0000000000000001.png"),
                ("https://example.com/img/b.png", "/images/0000000000000002.png"),
            ],
            false,
        );
        assert!(out.contains("/images/0000000000000001.png 1x"));
        assert!(out.contains("/images/0000000000000002.png 2x"));
    }

    #[test]
    fn badge_removed_only_when_enabled() {
        let html = r#"<div class="w-webflow-badge"><a href="x">badge</a></div><p>keep</p>"#;
        let kept = rewrite_with(html, &[], false);
        assert!(kept.contains("w-webflow-badge"));
        let removed = rewrite_with(html, &[], true);
        assert!(!removed.contains("w-webflow-badge"));
        assert!(removed.contains("keep"));
    }

    #[test]
    fn inline_style_blocks_rewritten() {
        let html = r#"<style>body { background: url('/img/bg.png'); }</style>"#;
        let out = rewrite_with(
            html,
            &[("https://example.com/img/bg.png", "/images/cccccccccccccccc.png")],
            false,
        );
        assert!(out.contains("url('/images/cccccccccccccccc.png')"));
    }

    #[test]
    fn rewriting_rewritten_html_is_noop() {
        let html = r#"<img src="/images/aaaaaaaaaaaaaaaa.png"><link rel="stylesheet" href="/css/bbbbbbbbbbbbbbbb.css">"#;
        // Already-local references never reach the collection phase...
        let collected = collect_references(html, &page());
        assert!(collected.assets.is_empty());
        // ...and an empty map leaves the document byte-identical.
        let out = rewrite_with(html, &[], false);
        assert_eq!(out, html);
    }

    #[test]
    fn blocked_references_stay_as_written() {
        // A URL absent from the map (blocked or failed) keeps its original
        // reference text.
        let html = r#"<script src="https://example.com/analytics.js"></script>"#;
        let out = rewrite_with(html, &[], false);
        assert!(out.contains(r#"src="https://example.com/analytics.js""#));
    }

    #[test]
    fn css_text_rewrite_preserves_surroundings() {
        let resolver = |raw: &str| {
            (raw == "/a.png").then(|| "/images/dddddddddddddddd.png".to_string())
        };
        let css = "x{background:url('/a.png') no-repeat;mask:url(#frag)}";
        let out = rewrite_css_text(css, &resolver);
        assert_eq!(
            out,
            "x{background:url('/images/dddddddddddddddd.png') no-repeat;mask:url(#frag)}"
        );
    }
}
