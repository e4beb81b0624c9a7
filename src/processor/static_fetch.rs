//! Static fetch path: cheap HTML retrieval without a browser.

use anyhow::{anyhow, Result};
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::signals::{requires_browser, scan_dynamic_signals, DynamicSignal};

/// Result of the static path attempt.
#[derive(Debug)]
pub enum StaticOutcome {
    /// Raw HTML, safe to rewrite directly.
    Done(String),
    /// The page needs (or the fetch forces) the browser path.
    Fallback(FallbackReason),
}

/// Why the static path gave up.
#[derive(Debug)]
pub enum FallbackReason {
    DynamicSignals(Vec<DynamicSignal>),
    HttpStatus(u16),
    NotHtml(String),
    FetchFailed(String),
}

impl std::fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DynamicSignals(signals) => {
                let names: Vec<_> = signals.iter().map(|s| s.as_str()).collect();
                write!(f, "dynamic signals: {}", names.join(", "))
            }
            Self::HttpStatus(code) => write!(f, "http status {code}"),
            Self::NotHtml(ct) => write!(f, "content-type {ct}"),
            Self::FetchFailed(err) => write!(f, "fetch failed: {err}"),
        }
    }
}

/// Fetch a page over plain HTTP and decide whether its HTML is usable
/// as-is. Network errors and non-HTML responses are fallbacks, not hard
/// errors; the browser path gets its chance. Cancellation is a hard error.
pub async fn fetch_static(
    client: &Client,
    url: &Url,
    cancel: &CancellationToken,
) -> Result<StaticOutcome> {
    let request = client
        .get(url.clone())
        .header("Accept", "text/html,application/xhtml+xml");

    let response = tokio::select! {
        result = request.send() => match result {
            Ok(response) => response,
            Err(e) => return Ok(StaticOutcome::Fallback(FallbackReason::FetchFailed(e.to_string()))),
        },
        () = cancel.cancelled() => return Err(anyhow!("cancelled during static fetch")),
    };

    let status = response.status();
    if !status.is_success() {
        return Ok(StaticOutcome::Fallback(FallbackReason::HttpStatus(
            status.as_u16(),
        )));
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    if !content_type.contains("text/html") && !content_type.contains("application/xhtml") {
        return Ok(StaticOutcome::Fallback(FallbackReason::NotHtml(content_type)));
    }

    let body = tokio::select! {
        result = response.text() => match result {
            Ok(body) => body,
            Err(e) => return Ok(StaticOutcome::Fallback(FallbackReason::FetchFailed(e.to_string()))),
        },
        () = cancel.cancelled() => return Err(anyhow!("cancelled during static fetch")),
    };

    let signals = scan_dynamic_signals(&body);
    if requires_browser(&signals) {
        return Ok(StaticOutcome::Fallback(FallbackReason::DynamicSignals(
            signals,
        )));
    }

    Ok(StaticOutcome::Done(body))
}
