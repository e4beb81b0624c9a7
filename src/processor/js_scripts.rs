//! JavaScript snippets evaluated in the page during browser rendering.
//!
//! All of these return plain JSON-serializable values so the results can be
//! pulled straight out of the evaluation.

/// Collect `<script src>` and `<link rel=preload|prefetch>` URLs that look
/// like hashed chunk files.
pub const CHUNK_HREFS_SCRIPT: &str = r#"
    (() => {
        const out = [];
        const chunkRe = /\.chunk\.[0-9a-f]+\.js(\?.*)?$/i;
        for (const s of document.querySelectorAll('script[src]')) {
            if (chunkRe.test(s.src)) out.push(s.src);
        }
        for (const l of document.querySelectorAll('link[rel="preload"],link[rel="prefetch"]')) {
            if (l.href && chunkRe.test(l.href)) out.push(l.href);
        }
        return out;
    })()
"#;

/// Probe the webpack runtime's chunk-name function for the first hundred
/// numeric chunk ids. Errors are expected for absent ids and swallowed.
pub const WEBPACK_PROBE_SCRIPT: &str = r#"
    (() => {
        const out = [];
        try {
            if (typeof __webpack_require__ === 'function' &&
                typeof __webpack_require__.u === 'function') {
                for (let i = 0; i < 100; i++) {
                    try {
                        const name = __webpack_require__.u(i);
                        if (typeof name === 'string' && name.length > 0 &&
                            !name.includes('undefined')) {
                            out.push(name);
                        }
                    } catch (e) { /* absent chunk id */ }
                }
            }
        } catch (e) { /* no webpack runtime */ }
        return out;
    })()
"#;

/// Walk `webpackChunk*` / `rspackChunk*` globals and pull out chunk id
/// strings from the registered tuples.
pub const CHUNK_GLOBALS_SCRIPT: &str = r#"
    (() => {
        const out = [];
        try {
            for (const key of Object.getOwnPropertyNames(window)) {
                if (!key.startsWith('webpackChunk') && !key.startsWith('rspackChunk')) continue;
                const registry = window[key];
                if (!Array.isArray(registry)) continue;
                for (const tuple of registry) {
                    if (!Array.isArray(tuple) || !Array.isArray(tuple[0])) continue;
                    for (const id of tuple[0]) {
                        if (typeof id === 'string' && id.length > 0) out.push(id);
                    }
                }
            }
        } catch (e) { /* ignore */ }
        return out;
    })()
"#;

/// Regex-scan inline script bodies for chunk-file and `/js/*.js` literals.
pub const INLINE_CHUNK_SCAN_SCRIPT: &str = r#"
    (() => {
        const out = [];
        const patterns = [
            /[\w\-./]+\.chunk\.[0-9a-f]+\.js/g,
            /[\w\-./]+\.achunk\.[0-9a-f]+\.js/g,
            /\/js\/[\w\-.]+\.js/g,
        ];
        for (const s of document.querySelectorAll('script:not([src])')) {
            const text = s.textContent || '';
            for (const re of patterns) {
                const matches = text.match(re);
                if (matches) out.push(...matches);
            }
        }
        return Array.from(new Set(out));
    })()
"#;

/// Current page height and viewport height, for the scroll loop.
pub const PAGE_METRICS_SCRIPT: &str = r#"
    (() => ({
        scrollHeight: document.documentElement.scrollHeight || document.body.scrollHeight || 0,
        viewportHeight: window.innerHeight || 800
    }))()
"#;

/// Scroll to an absolute Y offset.
#[must_use]
pub fn scroll_to_script(y: u64) -> String {
    format!("window.scrollTo(0, {y});")
}

/// Dispatch `mouseover` on up to `limit` interactive elements, returning the
/// number of elements touched.
#[must_use]
pub fn hover_script(limit: usize) -> String {
    format!(
        r#"
        (() => {{
            const selector = 'a,button,[role="button"],[onmouseover],[data-hover]';
            const elements = Array.from(document.querySelectorAll(selector)).slice(0, {limit});
            for (const el of elements) {{
                el.dispatchEvent(new MouseEvent('mouseover', {{ bubbles: true }}));
            }}
            return elements.length;
        }})()
        "#
    )
}
