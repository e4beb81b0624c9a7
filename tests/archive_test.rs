use std::io::Read;

use sitevault::manager::{archive_key, build_zip};

#[tokio::test]
async fn zip_contains_relative_forward_slash_entries() {
    let dir = assert_fs::TempDir::new().unwrap();
    tokio::fs::write(dir.path().join("index.html"), b"<html>root</html>")
        .await
        .unwrap();
    tokio::fs::create_dir_all(dir.path().join("about")).await.unwrap();
    tokio::fs::write(dir.path().join("about/index.html"), b"<html>about</html>")
        .await
        .unwrap();
    tokio::fs::create_dir_all(dir.path().join("css")).await.unwrap();
    tokio::fs::write(dir.path().join("css/site.css"), b"body{}")
        .await
        .unwrap();

    let (zip_path, size) = build_zip(dir.path()).await.unwrap();
    assert!(size > 0);

    let file = std::fs::File::open(&zip_path).unwrap();
    let mut archive = zip::ZipArchive::new(file).unwrap();
    let mut names: Vec<String> = (0..archive.len())
        .map(|i| archive.by_index(i).unwrap().name().to_string())
        .collect();
    names.sort();
    assert_eq!(names, vec!["about/index.html", "css/site.css", "index.html"]);

    let mut contents = String::new();
    archive
        .by_name("about/index.html")
        .unwrap()
        .read_to_string(&mut contents)
        .unwrap();
    assert_eq!(contents, "<html>about</html>");
}

#[tokio::test]
async fn zip_excludes_its_own_spool() {
    let dir = assert_fs::TempDir::new().unwrap();
    tokio::fs::write(dir.path().join("index.html"), b"<html></html>")
        .await
        .unwrap();

    // Build twice: the second build must not swallow the first spool.
    build_zip(dir.path()).await.unwrap();
    let (zip_path, _) = build_zip(dir.path()).await.unwrap();

    let file = std::fs::File::open(&zip_path).unwrap();
    let mut archive = zip::ZipArchive::new(file).unwrap();
    for i in 0..archive.len() {
        assert_ne!(archive.by_index(i).unwrap().name(), "__archive__.zip");
    }
}

#[tokio::test]
async fn state_file_is_archived_with_the_tree() {
    let dir = assert_fs::TempDir::new().unwrap();
    tokio::fs::write(dir.path().join("index.html"), b"<html></html>")
        .await
        .unwrap();
    tokio::fs::write(
        dir.path().join(".crawl-state.json"),
        br#"{"succeeded":[],"failed":[]}"#,
    )
    .await
    .unwrap();

    let (zip_path, _) = build_zip(dir.path()).await.unwrap();
    let file = std::fs::File::open(&zip_path).unwrap();
    let mut archive = zip::ZipArchive::new(file).unwrap();
    assert!(archive.by_name(".crawl-state.json").is_ok());
}

#[test]
fn archive_keys_are_deterministic() {
    assert_eq!(archive_key("abc-123"), "archives/abc-123.zip");
}
