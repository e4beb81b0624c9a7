use sitevault::assets::AssetDownloader;
use sitevault::executor::seed::seed_from_sitemaps;
use url::Url;

fn urls(list: &[Url]) -> Vec<&str> {
    list.iter().map(Url::as_str).collect()
}

#[tokio::test]
async fn seeds_from_sitemap_xml() {
    let mut server = mockito::Server::new_async().await;
    let base = Url::parse(&server.url()).unwrap();

    let body = format!(
        r#"<?xml version="1.0"?><urlset>
            <url><loc>{base}</loc></url>
            <url><loc>{base}about</loc></url>
            <url><loc>https://elsewhere.com/page</loc></url>
        </urlset>"#
    );
    let _m = server
        .mock("GET", "/sitemap.xml")
        .with_status(200)
        .with_header("content-type", "application/xml")
        .with_body(body)
        .create_async()
        .await;

    let client = AssetDownloader::build_client().unwrap();
    let seeded = seed_from_sitemaps(&client, &base).await.unwrap();

    // Extra-origin URLs are dropped.
    assert_eq!(
        urls(&seeded),
        vec![base.as_str().to_string(), format!("{base}about")]
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn falls_back_to_robots_directives() {
    let mut server = mockito::Server::new_async().await;
    let base = Url::parse(&server.url()).unwrap();

    let _sitemap_404 = server
        .mock("GET", "/sitemap.xml")
        .with_status(404)
        .create_async()
        .await;
    let _robots = server
        .mock("GET", "/robots.txt")
        .with_status(200)
        .with_body(format!(
            "User-agent: *\nDisallow:\nSitemap: {base}custom-sitemap.xml\n"
        ))
        .create_async()
        .await;
    let _custom = server
        .mock("GET", "/custom-sitemap.xml")
        .with_status(200)
        .with_body(format!(
            r#"<urlset><url><loc>{base}pricing</loc></url></urlset>"#
        ))
        .create_async()
        .await;

    let client = AssetDownloader::build_client().unwrap();
    let seeded = seed_from_sitemaps(&client, &base).await.unwrap();
    assert_eq!(urls(&seeded), vec![format!("{base}pricing").as_str()]);
}

#[tokio::test]
async fn follows_sitemap_index_one_level() {
    let mut server = mockito::Server::new_async().await;
    let base = Url::parse(&server.url()).unwrap();

    let _index = server
        .mock("GET", "/sitemap.xml")
        .with_status(200)
        .with_body(format!(
            r#"<sitemapindex>
                <sitemap><loc>{base}sitemap-pages.xml</loc></sitemap>
            </sitemapindex>"#
        ))
        .create_async()
        .await;
    let _pages = server
        .mock("GET", "/sitemap-pages.xml")
        .with_status(200)
        .with_body(format!(
            r#"<urlset>
                <url><loc>{base}docs</loc></url>
                <url><loc>{base}blog</loc></url>
            </urlset>"#
        ))
        .create_async()
        .await;

    let client = AssetDownloader::build_client().unwrap();
    let seeded = seed_from_sitemaps(&client, &base).await.unwrap();
    assert_eq!(
        urls(&seeded),
        vec![format!("{base}blog").as_str(), format!("{base}docs").as_str()]
    );
}

#[tokio::test]
async fn absent_sitemaps_seed_nothing() {
    let mut server = mockito::Server::new_async().await;
    let base = Url::parse(&server.url()).unwrap();

    let _sitemap_404 = server
        .mock("GET", "/sitemap.xml")
        .with_status(404)
        .create_async()
        .await;
    let _robots_404 = server
        .mock("GET", "/robots.txt")
        .with_status(404)
        .create_async()
        .await;

    let client = AssetDownloader::build_client().unwrap();
    let seeded = seed_from_sitemaps(&client, &base).await.unwrap();
    assert!(seeded.is_empty());
}
