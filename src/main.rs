//! Worker binary: wires settings, stores, storage backend, event bus, HTTP
//! surface and the queue consumer together.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use sitevault::manager::WorkerContext;
use sitevault::storage::{LocalStorage, ObjectStorage, S3Config, S3Storage};
use sitevault::store::Database;
use sitevault::{http, EventBus, JobQueue, Worker, WorkerSettings};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let settings = Arc::new(WorkerSettings::from_env());
    let data_dir = PathBuf::from(std::env::var("DATA_DIR").unwrap_or_else(|_| "./data".into()));

    let db = Database::open(&data_dir.join("sitevault.db"))
        .await
        .context("Failed to open database")?;
    let queue = JobQueue::new(db.pool().clone());
    let bus = EventBus::new();

    let storage: Arc<dyn ObjectStorage> = match std::env::var("S3_BUCKET") {
        Ok(bucket) => {
            let config = S3Config {
                bucket,
                region: std::env::var("S3_REGION").ok(),
                endpoint: std::env::var("S3_ENDPOINT").ok(),
                public_base_url: std::env::var("S3_PUBLIC_BASE_URL").ok(),
                temp_root: data_dir.join("tmp"),
            };
            log::info!("Using S3 storage bucket {}", config.bucket);
            Arc::new(
                S3Storage::connect(config, &settings)
                    .await
                    .map_err(|e| anyhow::anyhow!("failed to connect S3 storage: {e}"))?,
            )
        }
        Err(_) => {
            let root = data_dir.join("storage");
            log::info!("Using local storage at {}", root.display());
            Arc::new(
                LocalStorage::new(root)
                    .await
                    .map_err(|e| anyhow::anyhow!("failed to open local storage: {e}"))?,
            )
        }
    };

    let ctx = WorkerContext {
        db,
        queue,
        bus,
        storage,
        settings,
    };

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("Shutdown signal received");
                shutdown.cancel();
            }
        });
    }

    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:8088".into());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {bind_addr}"))?;
    log::info!("HTTP handlers listening on {bind_addr}");

    let app = http::router(ctx.clone());
    let http_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { http_shutdown.cancelled().await })
            .await
        {
            log::error!("HTTP server error: {e}");
        }
    });

    Worker::new(ctx).run(shutdown).await?;
    let _ = server.await;
    Ok(())
}
