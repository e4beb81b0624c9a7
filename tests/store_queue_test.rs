use std::time::Duration;

use chrono::Utc;
use sitevault::queue::{JobQueue, JobState};
use sitevault::store::{CrawlStatus, Database, Site};

fn test_site(id: &str) -> Site {
    Site {
        id: id.to_string(),
        name: "Example".to_string(),
        base_url: "https://example.com".to_string(),
        concurrency: 3,
        max_pages: None,
        exclude_patterns: vec![],
        download_blocklist: vec!["https://tracker.example.com/*".to_string()],
        remove_badge: false,
        redirects_csv: None,
        schedule: None,
        max_archives_to_keep: Some(2),
        sitemap_only: false,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

#[tokio::test]
async fn crawl_lifecycle_states_and_timestamps() {
    let db = Database::open_in_memory().await.unwrap();
    db.insert_site(&test_site("site-1")).await.unwrap();

    let crawl = db.create_crawl("site-1").await.unwrap();
    assert_eq!(crawl.status, CrawlStatus::Pending);
    assert!(crawl.started_at.is_none());
    assert!(crawl.completed_at.is_none());

    db.mark_running(&crawl.id).await.unwrap();
    let running = db.get_crawl(&crawl.id).await.unwrap().unwrap();
    assert_eq!(running.status, CrawlStatus::Running);
    assert!(running.started_at.is_some());
    assert!(running.completed_at.is_none());

    db.mark_uploading(&crawl.id).await.unwrap();
    db.finish_with_archive(
        &crawl.id,
        CrawlStatus::Completed,
        &format!("archives/{}.zip", crawl.id),
        1234,
        3,
        3,
        0,
        None,
    )
    .await
    .unwrap();

    let done = db.get_crawl(&crawl.id).await.unwrap().unwrap();
    assert_eq!(done.status, CrawlStatus::Completed);
    // Terminal iff both timestamps set.
    assert!(done.started_at.is_some());
    assert!(done.completed_at.is_some());
    assert_eq!(done.output_path.as_deref(), Some(format!("archives/{}.zip", crawl.id).as_str()));
    assert_eq!(done.output_size_bytes, Some(1234));
    assert_eq!((done.total_pages, done.succeeded_pages, done.failed_pages), (3, 3, 0));
}

#[tokio::test]
async fn running_preserves_started_at_across_retries() {
    let db = Database::open_in_memory().await.unwrap();
    db.insert_site(&test_site("site-1")).await.unwrap();
    let crawl = db.create_crawl("site-1").await.unwrap();

    db.mark_running(&crawl.id).await.unwrap();
    let first = db.get_crawl(&crawl.id).await.unwrap().unwrap().started_at;

    tokio::time::sleep(Duration::from_millis(10)).await;
    db.mark_running(&crawl.id).await.unwrap();
    let second = db.get_crawl(&crawl.id).await.unwrap().unwrap().started_at;
    assert_eq!(first, second);
}

#[tokio::test]
async fn cancel_only_bites_active_crawls() {
    let db = Database::open_in_memory().await.unwrap();
    db.insert_site(&test_site("site-1")).await.unwrap();
    let crawl = db.create_crawl("site-1").await.unwrap();

    assert!(db.request_cancel(&crawl.id).await.unwrap());
    let cancelled = db.get_crawl(&crawl.id).await.unwrap().unwrap();
    assert_eq!(cancelled.status, CrawlStatus::Cancelled);

    // A second request finds nothing active.
    assert!(!db.request_cancel(&crawl.id).await.unwrap());
}

#[tokio::test]
async fn archived_crawls_ordered_and_clearable() {
    let db = Database::open_in_memory().await.unwrap();
    db.insert_site(&test_site("site-1")).await.unwrap();

    let mut ids = Vec::new();
    for i in 0..3 {
        let crawl = db.create_crawl("site-1").await.unwrap();
        db.mark_running(&crawl.id).await.unwrap();
        db.finish_with_archive(
            &crawl.id,
            CrawlStatus::Completed,
            &format!("archives/{}.zip", crawl.id),
            100 + i,
            1,
            1,
            0,
            None,
        )
        .await
        .unwrap();
        ids.push(crawl.id);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let archived = db.archived_crawls_for_site("site-1").await.unwrap();
    assert_eq!(archived.len(), 3);
    // Most recent first.
    assert_eq!(archived[0].id, ids[2]);
    assert_eq!(archived[2].id, ids[0]);

    db.clear_archive(&ids[0]).await.unwrap();
    let remaining = db.archived_crawls_for_site("site-1").await.unwrap();
    assert_eq!(remaining.len(), 2);
    let cleared = db.get_crawl(&ids[0]).await.unwrap().unwrap();
    assert!(cleared.output_path.is_none());
    assert!(cleared.output_size_bytes.is_none());
}

#[tokio::test]
async fn global_blocklist_setting_roundtrip() {
    let db = Database::open_in_memory().await.unwrap();
    assert!(db.global_blocklist().await.unwrap().is_empty());

    db.set_setting(
        sitevault::store::GLOBAL_BLOCKLIST_KEY,
        r#"["https://tracker.example.com/*"]"#,
    )
    .await
    .unwrap();
    let list = db.global_blocklist().await.unwrap();
    assert_eq!(list, vec!["https://tracker.example.com/*"]);
}

#[tokio::test]
async fn queue_lease_is_exclusive() {
    let db = Database::open_in_memory().await.unwrap();
    let queue = JobQueue::new(db.pool().clone());

    queue.add("job-1").await.unwrap();
    assert_eq!(queue.get_state("job-1").await.unwrap(), Some(JobState::Waiting));

    let leased = queue
        .lease_next(Duration::from_secs(60))
        .await
        .unwrap()
        .expect("job should lease");
    assert_eq!(leased.id, "job-1");
    assert_eq!(leased.attempts_made, 1);

    // Nothing else to lease while the lock holds.
    assert!(queue.lease_next(Duration::from_secs(60)).await.unwrap().is_none());

    queue.complete("job-1").await.unwrap();
    assert_eq!(queue.get_state("job-1").await.unwrap(), Some(JobState::Completed));
}

#[tokio::test]
async fn expired_lock_releases_the_job() {
    let db = Database::open_in_memory().await.unwrap();
    let queue = JobQueue::new(db.pool().clone());

    queue.add("job-1").await.unwrap();
    queue
        .lease_next(Duration::from_millis(20))
        .await
        .unwrap()
        .expect("first lease");

    tokio::time::sleep(Duration::from_millis(50)).await;

    let released = queue
        .lease_next(Duration::from_secs(60))
        .await
        .unwrap()
        .expect("expired lock should re-lease");
    assert_eq!(released.id, "job-1");
    assert_eq!(released.attempts_made, 2);
}

#[tokio::test]
async fn reenqueue_resets_finished_job() {
    let db = Database::open_in_memory().await.unwrap();
    let queue = JobQueue::new(db.pool().clone());

    queue.add("job-1").await.unwrap();
    queue.lease_next(Duration::from_secs(60)).await.unwrap().unwrap();
    queue.fail("job-1").await.unwrap();
    assert_eq!(queue.get_state("job-1").await.unwrap(), Some(JobState::Failed));

    // Orphan reconciliation path: same id, back to waiting.
    queue.add("job-1").await.unwrap();
    assert_eq!(queue.get_state("job-1").await.unwrap(), Some(JobState::Waiting));

    let releases = queue.lease_next(Duration::from_secs(60)).await.unwrap().unwrap();
    assert_eq!(releases.attempts_made, 2);
}

#[tokio::test]
async fn missing_job_has_no_state() {
    let db = Database::open_in_memory().await.unwrap();
    let queue = JobQueue::new(db.pool().clone());
    assert_eq!(queue.get_state("nope").await.unwrap(), None);
}
