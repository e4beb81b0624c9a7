//! Shared configuration constants for sitevault
//!
//! Default values and constants used throughout the codebase to ensure
//! consistency and avoid magic numbers.

use std::time::Duration;

/// Chrome user agent string used for static fetches, asset downloads and
/// the headless browser itself
///
/// Updated: 2025-01-29 to Chrome 132 (current stable)
/// Next update: 2025-04-29 (quarterly schedule)
///
/// Reference: https://chromiumdash.appspot.com/schedule
pub const DESKTOP_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.6834.160 Safari/537.36";

/// Timeout for plain HTTP fetches (pages and assets)
pub const STATIC_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for headless-browser page navigation
pub const PAGE_NAV_TIMEOUT: Duration = Duration::from_secs(30);

/// How long to wait for a recognizable content root to appear after navigation
pub const CONTENT_SELECTOR_TIMEOUT: Duration = Duration::from_secs(5);

/// Network-idle window raced against the content-selector wait
pub const NETWORK_IDLE_TIMEOUT: Duration = Duration::from_secs(8);

/// Post-navigation settle time before serializing the page
pub const PAGE_SETTLE: Duration = Duration::from_millis(500);

/// Shorter settle used in sitemap-only mode
pub const PAGE_SETTLE_SITEMAP_ONLY: Duration = Duration::from_millis(200);

/// Selector raced against network idle to decide the page has rendered
pub const CONTENT_ROOT_SELECTOR: &str = "main,[data-wf-page],.w-nav,article,#root";

/// Minimum S3 multipart part size (S3 rejects smaller non-final parts)
pub const MIN_MULTIPART_PART_SIZE: u64 = 5 * 1024 * 1024;

/// S3 caps multipart uploads at 10,000 parts
pub const MAX_MULTIPART_PARTS: u64 = 10_000;

/// File extensions treated as assets rather than pages during link discovery
pub const ASSET_EXTENSIONS: &[&str] = &[
    "js", "mjs", "css", "map", "png", "jpg", "jpeg", "gif", "webp", "avif", "svg", "ico", "bmp",
    "woff", "woff2", "ttf", "otf", "eot", "mp4", "webm", "ogg", "mp3", "wav", "flac", "m4a",
    "pdf", "zip", "gz", "tar", "rar", "7z", "json", "xml", "txt", "csv", "wasm",
];
