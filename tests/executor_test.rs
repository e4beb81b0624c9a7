//! End-to-end executor runs against a mocked site. Every page here is
//! static, so the browser never launches.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use sitevault::assets::AssetDownloader;
use sitevault::config::{Blocklist, SiteConfig};
use sitevault::executor::{CrawlExecutor, CrawlHooks, CrawlStateFile, ProgressUpdate};
use sitevault::processor::PageProcessor;
use sitevault::store::LogLevel;
use sitevault::BrowserSession;
use tokio_util::sync::CancellationToken;
use url::Url;

struct RecordingHooks {
    updates: tokio::sync::Mutex<Vec<ProgressUpdate>>,
    logs: tokio::sync::Mutex<Vec<(LogLevel, String)>>,
}

impl RecordingHooks {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            updates: tokio::sync::Mutex::new(Vec::new()),
            logs: tokio::sync::Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl CrawlHooks for RecordingHooks {
    async fn on_progress(&self, update: ProgressUpdate) {
        self.updates.lock().await.push(update);
    }
    async fn on_log(&self, level: LogLevel, message: String, _url: Option<String>) {
        self.logs.lock().await.push((level, message));
    }
}

fn site_config(base: &Url, blocklist: Vec<String>) -> SiteConfig {
    SiteConfig {
        base_url: base.clone(),
        concurrency: 2,
        max_pages: None,
        exclude_patterns: vec![regex::Regex::new("/private").unwrap()],
        blocklist: Blocklist::new(blocklist),
        remove_badge: false,
        redirects: HashMap::new(),
        sitemap_only: false,
    }
}

fn executor_for(
    base: &Url,
    output_dir: &Path,
    hooks: Arc<RecordingHooks>,
    blocklist: Vec<String>,
    resume: bool,
) -> CrawlExecutor {
    let client = AssetDownloader::build_client().unwrap();
    let config = site_config(base, blocklist);
    let cancel = CancellationToken::new();

    let assets = Arc::new(AssetDownloader::new(
        client.clone(),
        output_dir.to_path_buf(),
        config.blocklist.clone(),
    ));
    let browser = Arc::new(BrowserSession::new(
        output_dir.join(".browser-profile-test"),
    ));
    let processor = Arc::new(PageProcessor::new(
        client.clone(),
        output_dir.to_path_buf(),
        assets,
        browser,
        config.remove_badge,
        config.sitemap_only,
        cancel.clone(),
    ));

    CrawlExecutor::new(
        config,
        output_dir.to_path_buf(),
        processor,
        hooks,
        cancel,
        client,
        resume,
        0, // no page retries in tests
        std::time::Duration::from_millis(10),
    )
}

async fn mock_small_site(server: &mut mockito::ServerGuard) -> Vec<mockito::Mock> {
    let mut mocks = Vec::new();
    let base = server.url();
    let m = server
        .mock("GET", "/")
        .with_status(200)
        .with_header("content-type", "text/html")
        .with_body(format!(
            r#"<html><head><link rel="stylesheet" href="/css/site.css"></head>
               <body>
                 <a href="/about">About</a>
                 <a href="/contact">Contact</a>
                 <a href="/private/internal">Private</a>
                 <img src="/img/logo.png">
                 <script src="{base}/blocked.js"></script>
               </body></html>"#
        ))
        .create_async()
        .await;
    mocks.push(m);
    let m = server
        .mock("GET", "/about")
        .with_status(200)
        .with_header("content-type", "text/html")
        .with_body(r#"<html><body><a href="/">Home</a></body></html>"#)
        .create_async()
        .await;
    mocks.push(m);
    let m = server
        .mock("GET", "/contact")
        .with_status(200)
        .with_header("content-type", "text/html")
        .with_body(r#"<html><body><a href="/about">About</a></body></html>"#)
        .create_async()
        .await;
    mocks.push(m);
    let m = server
        .mock("GET", "/css/site.css")
        .with_status(200)
        .with_header("content-type", "text/css")
        .with_body("body { color: black; }")
        .create_async()
        .await;
    mocks.push(m);
    let m = server
        .mock("GET", "/img/logo.png")
        .with_status(200)
        .with_header("content-type", "image/png")
        .with_body("png-bytes")
        .create_async()
        .await;
    mocks.push(m);
    let m = server
        .mock("GET", "/sitemap.xml")
        .with_status(404)
        .create_async()
        .await;
    mocks.push(m);
    let m = server
        .mock("GET", "/robots.txt")
        .with_status(404)
        .create_async()
        .await;
    mocks.push(m);
    mocks
}

#[tokio::test]
async fn crawls_small_site_and_mirrors_assets() {
    let mut server = mockito::Server::new_async().await;
    let _mocks = mock_small_site(&mut server).await;
    let base = Url::parse(&server.url()).unwrap();

    let out = assert_fs::TempDir::new().unwrap();
    let hooks = RecordingHooks::new();
    let executor = executor_for(&base, out.path(), Arc::clone(&hooks), Vec::new(), false);

    let outcome = executor.run().await.unwrap();
    assert_eq!(outcome.total, 3, "excluded /private must not count");
    assert_eq!(outcome.succeeded, 3);
    assert_eq!(outcome.failed, 0);

    // Page tree mirrors URL structure.
    assert!(out.path().join("index.html").exists());
    assert!(out.path().join("about/index.html").exists());
    assert!(out.path().join("contact/index.html").exists());
    assert!(!out.path().join("private").exists());

    // Assets landed under their category dirs with hashed names.
    let css_files: Vec<_> = std::fs::read_dir(out.path().join("css"))
        .unwrap()
        .collect();
    assert_eq!(css_files.len(), 1);
    let img_files: Vec<_> = std::fs::read_dir(out.path().join("images"))
        .unwrap()
        .collect();
    assert_eq!(img_files.len(), 1);

    // The root page was rewritten to the local stylesheet path.
    let index = std::fs::read_to_string(out.path().join("index.html")).unwrap();
    assert!(index.contains(r#"href="/css/"#));
    assert!(!index.contains("site.css"));

    // State file recorded every success.
    match CrawlStateFile::load(out.path()).await {
        sitevault::executor::StateLoad::Loaded(state) => {
            assert_eq!(state.succeeded.len(), 3);
            assert!(state.failed.is_empty());
        }
        other => panic!("expected state file, got {other:?}"),
    }
}

#[tokio::test]
async fn counters_are_monotonic_and_final_tick_has_no_url() {
    let mut server = mockito::Server::new_async().await;
    let _mocks = mock_small_site(&mut server).await;
    let base = Url::parse(&server.url()).unwrap();

    let out = assert_fs::TempDir::new().unwrap();
    let hooks = RecordingHooks::new();
    let executor = executor_for(&base, out.path(), Arc::clone(&hooks), Vec::new(), false);
    executor.run().await.unwrap();

    let updates = hooks.updates.lock().await;
    assert!(!updates.is_empty());

    let mut last = (0u64, 0u64, 0u64);
    for update in updates.iter() {
        assert!(update.succeeded + update.failed <= update.total);
        assert!(update.total >= last.0);
        assert!(update.succeeded >= last.1);
        assert!(update.failed >= last.2);
        last = (update.total, update.succeeded, update.failed);
    }

    let final_update = updates.last().unwrap();
    assert!(final_update.current_url.is_none());
    assert_eq!(final_update.succeeded, 3);
}

#[tokio::test]
async fn blocklisted_assets_keep_their_references() {
    let mut server = mockito::Server::new_async().await;
    let _mocks = mock_small_site(&mut server).await;
    let base_str = server.url();
    let base = Url::parse(&base_str).unwrap();

    let out = assert_fs::TempDir::new().unwrap();
    let hooks = RecordingHooks::new();
    let executor = executor_for(
        &base,
        out.path(),
        Arc::clone(&hooks),
        vec![format!("{base_str}/blocked.js")],
        false,
    );
    executor.run().await.unwrap();

    // Nothing downloaded for the blocked URL, reference left as-written.
    let index = std::fs::read_to_string(out.path().join("index.html")).unwrap();
    assert!(index.contains(&format!("{base_str}/blocked.js")));
    let js_dir = out.path().join("js");
    let js_count = std::fs::read_dir(&js_dir).map(|d| d.count()).unwrap_or(0);
    assert_eq!(js_count, 0);
}

#[tokio::test]
async fn resume_skips_previously_succeeded_pages() {
    let mut server = mockito::Server::new_async().await;
    let _mocks = mock_small_site(&mut server).await;
    let base = Url::parse(&server.url()).unwrap();

    let out = assert_fs::TempDir::new().unwrap();

    // A previous attempt archived /about already.
    let previous = CrawlStateFile {
        succeeded: vec![format!("{}about", base)],
        failed: vec![],
    };
    previous.save(out.path()).await.unwrap();

    let hooks = RecordingHooks::new();
    let executor = executor_for(&base, out.path(), Arc::clone(&hooks), Vec::new(), true);
    let outcome = executor.run().await.unwrap();

    assert_eq!(outcome.total, 3);
    assert_eq!(outcome.succeeded, 3, "resumed page counts as succeeded");

    // The skipped page was never re-fetched, so no file was written for it.
    assert!(out.path().join("index.html").exists());
    assert!(out.path().join("contact/index.html").exists());
    assert!(!out.path().join("about/index.html").exists());
}
