use sitevault::assets::AssetDownloader;
use sitevault::processor::{fetch_static, FallbackReason, StaticOutcome};
use tokio_util::sync::CancellationToken;
use url::Url;

async fn outcome_for(body: &str, content_type: &str, status: usize) -> StaticOutcome {
    let mut server = mockito::Server::new_async().await;
    let _m = server
        .mock("GET", "/page")
        .with_status(status)
        .with_header("content-type", content_type)
        .with_body(body)
        .create_async()
        .await;

    let client = AssetDownloader::build_client().unwrap();
    let url = Url::parse(&format!("{}/page", server.url())).unwrap();
    fetch_static(&client, &url, &CancellationToken::new())
        .await
        .unwrap()
}

#[tokio::test]
async fn plain_html_is_done() {
    let outcome = outcome_for("<html><body>hi</body></html>", "text/html; charset=utf-8", 200).await;
    match outcome {
        StaticOutcome::Done(html) => assert!(html.contains("hi")),
        other => panic!("expected Done, got {other:?}"),
    }
}

#[tokio::test]
async fn dynamic_signals_force_fallback() {
    let outcome = outcome_for(
        "<html><script>self.webpackChunkapp=self.webpackChunkapp||[]</script></html>",
        "text/html",
        200,
    )
    .await;
    assert!(matches!(
        outcome,
        StaticOutcome::Fallback(FallbackReason::DynamicSignals(_))
    ));
}

#[tokio::test]
async fn non_html_content_falls_back() {
    let outcome = outcome_for("{}", "application/json", 200).await;
    assert!(matches!(
        outcome,
        StaticOutcome::Fallback(FallbackReason::NotHtml(_))
    ));
}

#[tokio::test]
async fn error_status_falls_back() {
    let outcome = outcome_for("gone", "text/html", 500).await;
    assert!(matches!(
        outcome,
        StaticOutcome::Fallback(FallbackReason::HttpStatus(500))
    ));
}

#[tokio::test]
async fn lone_code_island_stays_static() {
    let outcome = outcome_for(
        r#"<html><code-island data-loader='{"tag":"OTHER"}'></code-island></html>"#,
        "text/html",
        200,
    )
    .await;
    assert!(matches!(outcome, StaticOutcome::Done(_)));
}
