use sitevault::assets::AssetDownloader;
use sitevault::processor::FederationMirror;
use url::Url;

#[tokio::test]
async fn mirrors_federated_module_and_rewrites_loader() {
    let mut server = mockito::Server::new_async().await;
    let base = server.url();
    let page_url = Url::parse(&format!("{base}/")).unwrap();
    let host = page_url.host_str().unwrap().to_string();

    let _wf = server
        .mock("GET", "/cc/widget/wf.json")
        .with_status(200)
        .with_body(r#"{"entry":"mf-manifest.json","name":"widget"}"#)
        .create_async()
        .await;
    let _mf = server
        .mock("GET", "/cc/widget/mf-manifest.json")
        .with_status(200)
        .with_body(format!(
            r#"{{
                "metaData": {{
                    "remoteEntry": {{"name": "remoteEntry.js"}},
                    "publicPath": "{base}/cc/widget/"
                }},
                "exposes": [{{"assets": {{"js": {{"sync": ["js/widget.js"], "async": []}},
                                          "css": {{"sync": [], "async": []}}}}}}],
                "shared": [],
                "remotes": []
            }}"#
        ))
        .create_async()
        .await;
    let _entry = server
        .mock("GET", "/cc/widget/remoteEntry.js")
        .with_status(200)
        .with_body("// remote entry")
        .create_async()
        .await;
    let _chunk = server
        .mock("GET", "/cc/widget/js/widget.js")
        .with_status(200)
        .with_body("// widget chunk")
        .create_async()
        .await;

    let out = assert_fs::TempDir::new().unwrap();
    let client = AssetDownloader::build_client().unwrap();
    let mirror = FederationMirror::new(client, out.path().to_path_buf());

    let loader = format!(
        r#"{{"tag":"FEDERATION","val":{{"clientModuleUrl":"{base}/cc/widget/wf.json"}}}}"#
    );
    let rewritten = mirror
        .mirror_loader(&loader, &page_url)
        .await
        .unwrap()
        .expect("federation loader should be rewritten");

    let parsed: serde_json::Value = serde_json::from_str(&rewritten).unwrap();
    let local_wf = format!("/code-components/{host}/cc/widget/wf.json");
    assert_eq!(parsed["val"]["clientModuleUrl"], local_wf.as_str());

    // Manifests and chunks landed in the mirrored layout.
    let root = out.path().join("code-components").join(&host).join("cc/widget");
    assert!(root.join("wf.json").exists());
    assert!(root.join("mf-manifest.json").exists());
    assert!(root.join("remoteEntry.js").exists());
    assert!(root.join("js/widget.js").exists());

    // The mirrored MF manifest advertises the local public path.
    let mf: serde_json::Value =
        serde_json::from_slice(&std::fs::read(root.join("mf-manifest.json")).unwrap()).unwrap();
    assert_eq!(
        mf["metaData"]["publicPath"],
        format!("/code-components/{host}/cc/widget/")
    );
}

#[tokio::test]
async fn same_module_is_mirrored_once() {
    let mut server = mockito::Server::new_async().await;
    let base = server.url();
    let page_url = Url::parse(&format!("{base}/")).unwrap();

    let wf = server
        .mock("GET", "/cc/one/wf.json")
        .with_status(200)
        .with_body(r#"{"entry":"mf-manifest.json"}"#)
        .expect(1)
        .create_async()
        .await;
    let _mf = server
        .mock("GET", "/cc/one/mf-manifest.json")
        .with_status(200)
        .with_body(r#"{"metaData":{},"exposes":[],"shared":[],"remotes":[]}"#)
        .create_async()
        .await;

    let out = assert_fs::TempDir::new().unwrap();
    let client = AssetDownloader::build_client().unwrap();
    let mirror = FederationMirror::new(client, out.path().to_path_buf());

    let loader =
        format!(r#"{{"tag":"FEDERATION","val":{{"clientModuleUrl":"{base}/cc/one/wf.json"}}}}"#);
    mirror.mirror_loader(&loader, &page_url).await.unwrap().unwrap();
    mirror.mirror_loader(&loader, &page_url).await.unwrap().unwrap();

    assert_eq!(mirror.mirrored_count(), 1);
    wf.assert_async().await;
}

#[tokio::test]
async fn non_federation_loaders_are_ignored() {
    let out = assert_fs::TempDir::new().unwrap();
    let client = AssetDownloader::build_client().unwrap();
    let mirror = FederationMirror::new(client, out.path().to_path_buf());
    let page_url = Url::parse("https://example.com/").unwrap();

    let result = mirror
        .mirror_loader(r#"{"tag":"INLINE","val":{}}"#, &page_url)
        .await
        .unwrap();
    assert!(result.is_none());
}
