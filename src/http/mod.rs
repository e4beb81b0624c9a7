//! HTTP handlers the admin app mounts.
//!
//! The admin app owns the server; this module only provides the router:
//! crawl enqueue, crawl cancel, and the SSE live-events stream.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::events::CrawlEvent;
use crate::manager::WorkerContext;

/// Interval between subscriber keep-alive pings.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Build the router the admin app mounts.
pub fn router(ctx: WorkerContext) -> Router {
    Router::new()
        .route("/api/crawls", post(enqueue_crawl))
        .route("/api/crawls/:id/cancel", post(cancel_crawl))
        .route("/sse/crawls/:id", get(crawl_events))
        .with_state(ctx)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnqueueRequest {
    site_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EnqueueResponse {
    crawl_id: String,
}

/// Create a pending crawl row and its queue job; returns the crawl id.
async fn enqueue_crawl(
    State(ctx): State<WorkerContext>,
    Json(body): Json<EnqueueRequest>,
) -> impl IntoResponse {
    match ctx.db.get_site(&body.site_id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return (StatusCode::NOT_FOUND, format!("unknown site {}", body.site_id))
                .into_response()
        }
        Err(e) => {
            log::error!("Site lookup failed: {e:#}");
            return (StatusCode::INTERNAL_SERVER_ERROR, "site lookup failed").into_response();
        }
    }

    let crawl = match ctx.db.create_crawl(&body.site_id).await {
        Ok(crawl) => crawl,
        Err(e) => {
            log::error!("Failed to create crawl: {e:#}");
            return (StatusCode::INTERNAL_SERVER_ERROR, "failed to create crawl").into_response();
        }
    };

    if let Err(e) = ctx.queue.add(&crawl.id).await {
        log::error!("Failed to enqueue crawl {}: {e:#}", crawl.id);
        return (StatusCode::INTERNAL_SERVER_ERROR, "failed to enqueue crawl").into_response();
    }

    (StatusCode::CREATED, Json(EnqueueResponse { crawl_id: crawl.id })).into_response()
}

/// Flip the DB status to cancelled; the running executor notices within one
/// status-check interval.
async fn cancel_crawl(
    State(ctx): State<WorkerContext>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match ctx.db.request_cancel(&id).await {
        Ok(true) => StatusCode::ACCEPTED.into_response(),
        Ok(false) => (
            StatusCode::CONFLICT,
            "crawl is not active or does not exist",
        )
            .into_response(),
        Err(e) => {
            log::error!("Cancel request failed for {id}: {e:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, "cancel request failed").into_response()
        }
    }
}

/// SSE live-events stream: immediate `connected`, every bus event as a
/// message frame, `ping` keep-alives, closed when the crawl's channel is
/// dropped at terminal state or the client disconnects.
async fn crawl_events(
    State(ctx): State<WorkerContext>,
    Path(id): Path<String>,
) -> Sse<ReceiverStream<Result<Event, Infallible>>> {
    let mut receiver = ctx.bus.subscribe(&id);
    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(64);

    tokio::spawn(async move {
        let connected = CrawlEvent::Connected {
            crawl_id: id.clone(),
        };
        if tx.send(Ok(to_sse_event(&connected))).await.is_err() {
            return;
        }

        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ping.tick().await; // consume the immediate tick

        loop {
            tokio::select! {
                received = receiver.recv() => match received {
                    Ok(event) => {
                        if tx.send(Ok(to_sse_event(&event))).await.is_err() {
                            return; // client disconnected
                        }
                    }
                    // Slow consumer: skip over the gap and continue.
                    Err(RecvError::Lagged(skipped)) => {
                        log::debug!("SSE subscriber for {id} lagged by {skipped} events");
                    }
                    // Channel dropped at terminal state: end the stream.
                    Err(RecvError::Closed) => return,
                },
                _ = ping.tick() => {
                    if tx.send(Ok(to_sse_event(&CrawlEvent::Ping))).await.is_err() {
                        return;
                    }
                }
            }
        }
    });

    Sse::new(ReceiverStream::new(rx))
}

fn to_sse_event(event: &CrawlEvent) -> Event {
    match serde_json::to_string(event) {
        Ok(json) => Event::default().data(json),
        Err(e) => {
            log::error!("Failed to serialize crawl event: {e}");
            Event::default().data("{}")
        }
    }
}
