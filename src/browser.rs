//! Headless browser discovery, launch, and the per-crawl session.
//!
//! The session launches lazily: crawls whose pages all take the static path
//! never pay the browser cold start. One browser serves every page task in
//! a crawl; tasks open and close their own pages.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use chromiumoxide::browser::{Browser, BrowserConfigBuilder, HeadlessMode};
use chromiumoxide::fetcher::{BrowserFetcher, BrowserFetcherOptions};
use chromiumoxide::Page;
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::{self, JoinHandle};
use log::{error, info, trace, warn};

use crate::util::DESKTOP_USER_AGENT;

/// Find a Chrome/Chromium executable with platform-specific search paths.
pub async fn find_browser_executable() -> Result<PathBuf> {
    // Environment variable overrides all other discovery.
    if let Ok(path) = std::env::var("CHROMIUM_PATH") {
        let path = PathBuf::from(path);
        if path.exists() {
            info!("Using browser from CHROMIUM_PATH: {}", path.display());
            return Ok(path);
        }
        warn!(
            "CHROMIUM_PATH points to a non-existent file: {}",
            path.display()
        );
    }

    let paths = if cfg!(target_os = "macos") {
        vec![
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
            "/opt/homebrew/bin/chromium",
        ]
    } else {
        vec![
            "/usr/bin/google-chrome",
            "/usr/bin/google-chrome-stable",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/snap/bin/chromium",
            "/usr/local/bin/chromium",
            "/opt/google/chrome/chrome",
        ]
    };

    for path_str in paths {
        let path = if let Some(rest) = path_str.strip_prefix("~/") {
            match dirs::home_dir() {
                Some(home) => home.join(rest),
                None => continue,
            }
        } else {
            PathBuf::from(path_str)
        };
        if path.exists() {
            info!("Found browser at: {}", path.display());
            return Ok(path);
        }
    }

    if !cfg!(target_os = "windows") {
        for cmd in &["chromium", "chromium-browser", "google-chrome", "chrome"] {
            if let Ok(output) = Command::new("which").arg(cmd).output() {
                if output.status.success() {
                    let path_str = String::from_utf8_lossy(&output.stdout).trim().to_string();
                    if !path_str.is_empty() {
                        let path = PathBuf::from(path_str);
                        info!("Found browser via 'which': {}", path.display());
                        return Ok(path);
                    }
                }
            }
        }
    }

    Err(anyhow::anyhow!("Chrome/Chromium executable not found"))
}

/// Download a managed Chromium when no system browser exists.
pub async fn download_managed_browser() -> Result<PathBuf> {
    info!("Downloading managed Chromium browser...");

    let cache_dir = dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("sitevault")
        .join("chromium");
    std::fs::create_dir_all(&cache_dir).context("Failed to create browser cache directory")?;

    let fetcher = BrowserFetcher::new(
        BrowserFetcherOptions::builder()
            .with_path(&cache_dir)
            .build()
            .context("Failed to build fetcher options")?,
    );
    let revision_info = fetcher.fetch().await.context("Failed to fetch browser")?;

    info!("Downloaded Chromium to: {}", revision_info.folder_path.display());
    Ok(revision_info.executable_path)
}

/// Launch a headless browser with a dedicated user-data directory and spawn
/// the CDP handler task.
pub async fn launch_browser(user_data_dir: PathBuf) -> Result<(Browser, JoinHandle<()>)> {
    let chrome_path = match find_browser_executable().await {
        Ok(path) => path,
        Err(_) => download_managed_browser().await?,
    };

    std::fs::create_dir_all(&user_data_dir).context("Failed to create user data directory")?;

    let browser_config = BrowserConfigBuilder::default()
        .request_timeout(Duration::from_secs(30))
        .window_size(1920, 1080)
        .user_data_dir(user_data_dir)
        .chrome_executable(chrome_path)
        .headless_mode(HeadlessMode::default())
        .arg(format!("--user-agent={DESKTOP_USER_AGENT}"))
        .arg("--disable-blink-features=AutomationControlled")
        .arg("--disable-notifications")
        .arg("--disable-background-networking")
        .arg("--disable-background-timer-throttling")
        .arg("--disable-backgrounding-occluded-windows")
        .arg("--disable-breakpad")
        .arg("--disable-hang-monitor")
        .arg("--disable-ipc-flooding-protection")
        .arg("--no-first-run")
        .arg("--no-default-browser-check")
        .arg("--no-sandbox")
        .arg("--ignore-certificate-errors")
        .arg("--metrics-recording-only")
        .arg("--password-store=basic")
        .arg("--use-mock-keychain")
        .arg("--hide-scrollbars")
        .arg("--mute-audio")
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to build browser config: {e}"))?;

    let (browser, mut handler) = Browser::launch(browser_config)
        .await
        .context("Failed to launch browser")?;

    let handler_task = task::spawn(async move {
        while let Some(h) = handler.next().await {
            if let Err(e) = h {
                let error_msg = e.to_string();
                // Chrome emits CDP events chromiumoxide doesn't model; those
                // deserialization misses are noise, not failures.
                let benign = error_msg
                    .contains("data did not match any variant of untagged enum Message")
                    || error_msg.contains("Failed to deserialize WS response");
                if benign {
                    trace!("Suppressed benign CDP serialization error: {error_msg}");
                } else {
                    error!("Browser handler error: {e:?}");
                }
            }
        }
        info!("Browser handler task completed");
    });

    Ok((browser, handler_task))
}

struct Launched {
    browser: Browser,
    handler: JoinHandle<()>,
}

/// Lazily-launched browser shared by every page task in one crawl.
pub struct BrowserSession {
    user_data_dir: PathBuf,
    slot: Mutex<Option<Launched>>,
}

impl BrowserSession {
    /// The user-data dir should be unique per crawl to avoid profile lock
    /// contention between concurrent crawls in one worker.
    #[must_use]
    pub fn new(user_data_dir: PathBuf) -> Self {
        Self {
            user_data_dir,
            slot: Mutex::new(None),
        }
    }

    /// Open a fresh page, launching the browser on first use.
    pub async fn new_page(&self) -> Result<Page> {
        let mut slot = self.slot.lock().await;
        let launched = match slot.as_mut() {
            Some(launched) => launched,
            None => {
                let (browser, handler) = launch_browser(self.user_data_dir.clone()).await?;
                slot.insert(Launched { browser, handler })
            }
        };
        launched
            .browser
            .new_page("about:blank")
            .await
            .context("Failed to open page")
    }

    /// Close the browser and clean up the profile directory. Safe to call
    /// when the browser never launched.
    pub async fn shutdown(&self) {
        let launched = self.slot.lock().await.take();
        let Some(Launched { mut browser, handler }) = launched else {
            return;
        };

        if let Err(e) = browser.close().await {
            warn!("Failed to close browser: {e}");
        }
        if let Err(e) = browser.wait().await {
            warn!("Failed to wait for browser exit: {e}");
        }

        handler.abort();
        if let Err(e) = handler.await {
            if !e.is_cancelled() {
                warn!("Handler task failed during abort: {e}");
            }
        }

        if let Err(e) = tokio::fs::remove_dir_all(&self.user_data_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove browser profile dir: {e}");
            }
        }
    }
}
