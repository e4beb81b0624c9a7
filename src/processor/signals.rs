//! Dynamic-content signal detection.
//!
//! The static path is preferred; a page only pays the headless-browser cost
//! when its raw HTML shows evidence that client-side rendering matters. A
//! lone `<code-island>` stays static so the original mount roots survive.

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};

/// Evidence found in raw HTML that dynamic rendering is required.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DynamicSignal {
    /// `webpackChunk*=` / `rspackChunk*=` runtime assignment.
    ChunkRuntime,
    /// `__webpack_require__` references.
    WebpackRequire,
    /// Dynamic `import(` inside an inline script block.
    DynamicImport,
    /// `data-src` / `data-srcset` / `data-bg` lazy media attributes.
    LazyMedia,
    /// `<code-island>` mount elements.
    CodeIsland,
}

impl DynamicSignal {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChunkRuntime => "chunk-runtime",
            Self::WebpackRequire => "webpack-require",
            Self::DynamicImport => "dynamic-import",
            Self::LazyMedia => "lazy-media",
            Self::CodeIsland => "code-island",
        }
    }
}

static CHUNK_RUNTIME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:webpackChunk|rspackChunk)\w*\s*=").expect("valid regex"));

static DYNAMIC_IMPORT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bimport\s*\(").expect("valid regex"));

static INLINE_SCRIPT_SEL: Lazy<Selector> =
    Lazy::new(|| Selector::parse("script:not([src])").expect("valid selector"));

static LAZY_MEDIA_SEL: Lazy<Selector> =
    Lazy::new(|| Selector::parse("[data-src],[data-srcset],[data-bg]").expect("valid selector"));

/// Scan raw HTML for dynamic-content signals.
#[must_use]
pub fn scan_dynamic_signals(html: &str) -> Vec<DynamicSignal> {
    let mut signals = Vec::new();

    if CHUNK_RUNTIME_RE.is_match(html) {
        signals.push(DynamicSignal::ChunkRuntime);
    }
    if html.contains("__webpack_require__") {
        signals.push(DynamicSignal::WebpackRequire);
    }

    let document = Html::parse_document(html);

    // import( only counts inside inline script bodies; a src attribute
    // containing "import" must not trip this.
    let has_dynamic_import = document
        .select(&INLINE_SCRIPT_SEL)
        .any(|script| DYNAMIC_IMPORT_RE.is_match(&script.text().collect::<String>()));
    if has_dynamic_import {
        signals.push(DynamicSignal::DynamicImport);
    }

    if document.select(&LAZY_MEDIA_SEL).next().is_some() {
        signals.push(DynamicSignal::LazyMedia);
    }

    if html.contains("<code-island") {
        signals.push(DynamicSignal::CodeIsland);
    }

    signals
}

/// Whether the detected signals force the browser path. A lone code-island
/// presence stays static.
#[must_use]
pub fn requires_browser(signals: &[DynamicSignal]) -> bool {
    signals
        .iter()
        .any(|s| !matches!(s, DynamicSignal::CodeIsland))
}
