//! Browser rendering path.
//!
//! Used when the static path detects dynamic-content signals or fails
//! outright. The page is driven through navigation, chunk-discovery
//! triggers, a scroll pass and hover pass, while a CDP response listener
//! records every same-origin asset the page actually loaded.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chromiumoxide::cdp::browser_protocol::network::EventResponseReceived;
use chromiumoxide::Page;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::js_scripts;
use crate::assets::{AssetCategory, AssetDownloader, Downloaded};
use crate::browser::BrowserSession;
use crate::util::{
    same_origin, CONTENT_ROOT_SELECTOR, CONTENT_SELECTOR_TIMEOUT, NETWORK_IDLE_TIMEOUT,
    PAGE_NAV_TIMEOUT, PAGE_SETTLE, PAGE_SETTLE_SITEMAP_ONLY,
};

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageMetrics {
    scroll_height: u64,
    viewport_height: u64,
}

/// Render a page in the shared browser and return its serialized HTML.
/// Every recorded same-origin asset is downloaded before returning.
pub async fn render_page(
    session: &BrowserSession,
    assets: &AssetDownloader,
    page_url: &Url,
    sitemap_only: bool,
    cancel: &CancellationToken,
) -> Result<String> {
    let page = session.new_page().await?;
    let result = drive_page(&page, assets, page_url, sitemap_only, cancel).await;

    // page.close() is mandatory on every exit path; a leaked page keeps the
    // whole browser context alive.
    if let Err(e) = page.close().await {
        log::warn!("Failed to close page for {page_url}: {e}");
    }

    result
}

async fn drive_page(
    page: &Page,
    assets: &AssetDownloader,
    page_url: &Url,
    sitemap_only: bool,
    cancel: &CancellationToken,
) -> Result<String> {
    let check_cancelled = || {
        if cancel.is_cancelled() {
            Err(anyhow!("cancelled during browser rendering"))
        } else {
            Ok(())
        }
    };

    // Record same-origin successful responses by category while the page
    // loads and runs its triggers.
    let recorded: Arc<Mutex<Vec<(Url, AssetCategory)>>> = Arc::new(Mutex::new(Vec::new()));
    let listener_task = {
        let mut events = page
            .event_listener::<EventResponseReceived>()
            .await
            .context("Failed to install response listener")?;
        let recorded = Arc::clone(&recorded);
        let origin = page_url.clone();
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let raw = event.response.url.as_str();
                if raw.starts_with("data:") || raw.starts_with("blob:") {
                    continue;
                }
                let Ok(url) = Url::parse(raw) else { continue };
                if !matches!(url.scheme(), "http" | "https") || !same_origin(&url, &origin) {
                    continue;
                }
                let status = event.response.status;
                if !(200..300).contains(&status) {
                    continue;
                }
                if let Some(category) = AssetCategory::from_url(&url) {
                    recorded.lock().push((url, category));
                }
            }
        })
    };

    navigate(page, page_url).await?;
    check_cancelled()?;
    wait_for_content(page, sitemap_only).await;
    check_cancelled()?;

    // Dynamic chunk loading triggers, in sequence.
    let chunk_urls = discover_chunks(page, page_url).await;
    {
        let mut recorded = recorded.lock();
        for url in chunk_urls {
            recorded.push((url, AssetCategory::Js));
        }
    }
    check_cancelled()?;

    scroll_page(page, sitemap_only).await;
    hover_interactive(page, sitemap_only).await;
    tokio::time::sleep(if sitemap_only {
        PAGE_SETTLE_SITEMAP_ONLY
    } else {
        PAGE_SETTLE
    })
    .await;
    check_cancelled()?;

    listener_task.abort();
    let mut to_download = {
        let recorded = recorded.lock();
        recorded.clone()
    };
    to_download.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));
    to_download.dedup_by(|a, b| a.0 == b.0);

    let downloads = to_download.into_iter().map(|(url, category)| async move {
        match assets.download(&url, category).await {
            Ok(Downloaded::Saved(_)) | Ok(Downloaded::Blocked) => {}
            Err(e) => log::warn!("Failed to capture rendered asset {url}: {e:#}"),
        }
    });
    futures::future::join_all(downloads).await;

    let html = page
        .content()
        .await
        .context("Failed to serialize rendered page")?;
    Ok(html)
}

/// Navigate with a bounded wait; one retry with a longer load wait covers
/// pages that blow the first deadline.
async fn navigate(page: &Page, page_url: &Url) -> Result<()> {
    let goto = async {
        page.goto(page_url.as_str())
            .await
            .map_err(|e| anyhow!("{e}"))?;
        page.wait_for_navigation().await.map_err(|e| anyhow!("{e}"))?;
        Ok::<(), anyhow::Error>(())
    };

    match tokio::time::timeout(PAGE_NAV_TIMEOUT, goto).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e).with_context(|| format!("navigation failed for {page_url}")),
        Err(_) => {
            log::warn!("Navigation timeout for {page_url}, retrying with full load wait");
            let retry = async {
                page.goto(page_url.as_str())
                    .await
                    .map_err(|e| anyhow!("{e}"))?;
                page.wait_for_navigation().await.map_err(|e| anyhow!("{e}"))?;
                Ok::<(), anyhow::Error>(())
            };
            tokio::time::timeout(PAGE_NAV_TIMEOUT * 2, retry)
                .await
                .map_err(|_| anyhow!("navigation retry timed out for {page_url}"))?
                .with_context(|| format!("navigation retry failed for {page_url}"))
        }
    }
}

/// Race "a content root appeared" against a bounded network-idle window,
/// mirroring the selector-vs-idle wait of interactive archivers.
async fn wait_for_content(page: &Page, sitemap_only: bool) {
    let selector_wait = async {
        let deadline = tokio::time::Instant::now() + CONTENT_SELECTOR_TIMEOUT;
        loop {
            let script = format!(
                "document.querySelector('{CONTENT_ROOT_SELECTOR}') !== null"
            );
            let found = page
                .evaluate(script.as_str())
                .await
                .ok()
                .and_then(|v| v.into_value::<bool>().ok())
                .unwrap_or(false);
            if found || tokio::time::Instant::now() >= deadline {
                return found;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    };

    tokio::select! {
        found = selector_wait => {
            if !found {
                // No recognizable root; give the network the rest of the
                // idle window before serializing anyway.
                tokio::time::sleep(NETWORK_IDLE_TIMEOUT - CONTENT_SELECTOR_TIMEOUT).await;
            }
        }
        () = tokio::time::sleep(NETWORK_IDLE_TIMEOUT) => {}
    }

    tokio::time::sleep(if sitemap_only {
        PAGE_SETTLE_SITEMAP_ONLY
    } else {
        PAGE_SETTLE
    })
    .await;
}

/// Run the chunk-discovery triggers and resolve every hit against the page
/// URL. Only same-origin http(s) results survive.
async fn discover_chunks(page: &Page, page_url: &Url) -> Vec<Url> {
    let mut raw: Vec<String> = Vec::new();

    for script in [
        js_scripts::CHUNK_HREFS_SCRIPT,
        js_scripts::WEBPACK_PROBE_SCRIPT,
        js_scripts::CHUNK_GLOBALS_SCRIPT,
        js_scripts::INLINE_CHUNK_SCAN_SCRIPT,
    ] {
        match page.evaluate(script).await {
            Ok(result) => {
                if let Ok(values) = result.into_value::<Vec<String>>() {
                    raw.extend(values);
                }
            }
            Err(e) => log::debug!("Chunk discovery script failed: {e}"),
        }
    }

    // Probe results are chunk file names; globals are bare chunk ids. Give
    // ids the conventional /js/<id>.js shape before resolving.
    let mut urls = Vec::new();
    for item in raw {
        let candidate = if item.contains('/') || item.ends_with(".js") {
            item
        } else {
            format!("/js/{item}.js")
        };
        let Ok(url) = page_url.join(&candidate) else {
            continue;
        };
        if matches!(url.scheme(), "http" | "https") && same_origin(&url, page_url) {
            urls.push(url);
        }
    }
    urls.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    urls.dedup();
    urls
}

/// Scroll top-to-bottom in viewport-height steps (doubled in sitemap-only
/// mode) so lazy loaders fire.
async fn scroll_page(page: &Page, sitemap_only: bool) {
    let metrics = match page.evaluate(js_scripts::PAGE_METRICS_SCRIPT).await {
        Ok(result) => match result.into_value::<PageMetrics>() {
            Ok(metrics) => metrics,
            Err(_) => return,
        },
        Err(_) => return,
    };

    let step = metrics.viewport_height.max(1) * if sitemap_only { 2 } else { 1 };
    let mut y = 0u64;
    while y < metrics.scroll_height {
        y += step;
        let _ = page.evaluate(js_scripts::scroll_to_script(y).as_str()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let _ = page.evaluate(js_scripts::scroll_to_script(0).as_str()).await;
}

/// Mouseover up to 20 interactive elements (halved in sitemap-only mode);
/// hover-triggered prefetches land in the response listener.
async fn hover_interactive(page: &Page, sitemap_only: bool) {
    let limit = if sitemap_only { 10 } else { 20 };
    match page.evaluate(js_scripts::hover_script(limit).as_str()).await {
        Ok(result) => {
            let touched = result.into_value::<usize>().unwrap_or(0);
            log::debug!("Hovered {touched} interactive elements");
        }
        Err(e) => log::debug!("Hover pass failed: {e}"),
    }
}
