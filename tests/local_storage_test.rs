use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use sitevault::storage::{LocalStorage, ObjectStorage, StorageError, StreamPutOptions};

async fn storage() -> (assert_fs::TempDir, LocalStorage) {
    let dir = assert_fs::TempDir::new().unwrap();
    let storage = LocalStorage::new(dir.path().to_path_buf()).await.unwrap();
    (dir, storage)
}

#[tokio::test]
async fn put_get_exists_roundtrip() {
    let (_dir, storage) = storage().await;

    storage
        .put("archives/a.zip", Bytes::from_static(b"zip-bytes"))
        .await
        .unwrap();

    assert!(storage.exists("archives/a.zip").await.unwrap());
    assert!(!storage.exists("archives/b.zip").await.unwrap());

    let mut reader = storage.get_stream("archives/a.zip").await.unwrap();
    let mut contents = Vec::new();
    tokio::io::copy(&mut reader, &mut contents).await.unwrap();
    assert_eq!(contents, b"zip-bytes");
}

#[tokio::test]
async fn get_missing_maps_to_not_found() {
    let (_dir, storage) = storage().await;
    match storage.get_stream("missing").await {
        Err(StorageError::NotFound(key)) => assert_eq!(key, "missing"),
        Err(other) => panic!("expected NotFound, got Err({other:?})"),
        Ok(_) => panic!("expected NotFound, got Ok"),
    }
}

#[tokio::test]
async fn list_size_and_delete_prefix() {
    let (_dir, storage) = storage().await;

    storage.put("archives/a.zip", Bytes::from_static(b"aaaa")).await.unwrap();
    storage.put("archives/b.zip", Bytes::from_static(b"bb")).await.unwrap();
    storage.put("other/c.bin", Bytes::from_static(b"c")).await.unwrap();

    let mut keys = storage.list("archives/").await.unwrap();
    keys.sort();
    assert_eq!(keys, vec!["archives/a.zip", "archives/b.zip"]);
    assert_eq!(storage.size("archives/").await.unwrap(), 6);

    storage.delete_prefix("archives/").await.unwrap();
    assert!(storage.list("archives/").await.unwrap().is_empty());
    // Other prefixes untouched; deleting again tolerates absence.
    assert!(storage.exists("other/c.bin").await.unwrap());
    storage.delete_prefix("archives/").await.unwrap();
}

#[tokio::test]
async fn stream_put_reports_progress() {
    let (_dir, storage) = storage().await;

    let payload = vec![7u8; 4096];
    let calls = Arc::new(AtomicU32::new(0));
    let calls_clone = Arc::clone(&calls);

    let written = storage
        .stream_put(
            "archives/stream.zip",
            Box::new(std::io::Cursor::new(payload.clone())),
            StreamPutOptions {
                total_size: Some(payload.len() as u64),
                part_delay: None,
                on_progress: Some(Arc::new(move |part| {
                    calls_clone.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(part.total_bytes, 4096);
                    assert_eq!(part.uploaded_bytes, 4096);
                    assert_eq!((part.part_number, part.total_parts), (1, 1));
                })),
            },
        )
        .await
        .unwrap();

    assert_eq!(written, 4096);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(storage.size("archives/stream.zip").await.unwrap(), 4096);
}

#[tokio::test]
async fn temp_dirs_are_deterministic_and_excluded_from_listing() {
    let (_dir, storage) = storage().await;

    let first = storage.make_temp_dir("crawl-1").await.unwrap();
    let second = storage.make_temp_dir("crawl-1").await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first, storage.temp_dir_path("crawl-1"));

    tokio::fs::write(first.join("index.html"), b"<html></html>")
        .await
        .unwrap();
    // Temp contents are not objects.
    assert!(storage.list("").await.unwrap().is_empty());

    storage.remove_temp_dir("crawl-1").await.unwrap();
    assert!(!first.exists());
    // Removing again is fine.
    storage.remove_temp_dir("crawl-1").await.unwrap();
}

#[tokio::test]
async fn traversal_keys_are_rejected() {
    let (_dir, storage) = storage().await;
    let result = storage.put("../escape", Bytes::from_static(b"x")).await;
    assert!(result.is_err());
}
