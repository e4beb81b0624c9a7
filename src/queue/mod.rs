//! Durable job queue backed by the shared SQLite pool.
//!
//! One row per job; the job id is the crawl id. Workers lease jobs by
//! atomically flipping a waiting row to `active` with a lock deadline, then
//! renew the lock while processing. `max_attempts` is 1: retries are
//! manual (a fresh enqueue) or driven by orphan reconciliation.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::time::Duration;

const QUEUE_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS queue_jobs (
    id TEXT PRIMARY KEY,
    state TEXT NOT NULL DEFAULT 'waiting',
    attempts_made INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL DEFAULT 1,
    locked_until INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_queue_jobs_state ON queue_jobs(state);
"#;

pub(crate) async fn ensure_queue_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(QUEUE_SCHEMA_SQL)
        .execute(pool)
        .await
        .context("Failed to initialize queue schema")?;
    Ok(())
}

/// Queue-side state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(Self::Waiting),
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Waiting or active (leased, lock not yet expired) jobs still count
    /// toward the crawl being in flight.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Waiting | Self::Active)
    }
}

/// A queue row.
#[derive(Debug, Clone)]
pub struct QueueJob {
    pub id: String,
    pub state: JobState,
    pub attempts_made: i64,
    pub max_attempts: i64,
    pub locked_until: Option<i64>,
}

/// Handle to the durable queue. Cheap to clone.
#[derive(Clone)]
pub struct JobQueue {
    pool: SqlitePool,
}

impl JobQueue {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Enqueue a job. Re-enqueueing an id whose previous run finished resets
    /// the row to `waiting` (used by orphan reconciliation and manual
    /// retries).
    pub async fn add(&self, job_id: &str) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        sqlx::query(
            "INSERT INTO queue_jobs (id, state, created_at, updated_at)
             VALUES (?, 'waiting', ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 state = 'waiting', locked_until = NULL, updated_at = excluded.updated_at",
        )
        .bind(job_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to enqueue job")?;
        Ok(())
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<QueueJob>> {
        let row = sqlx::query(
            "SELECT id, state, attempts_made, max_attempts, locked_until
             FROM queue_jobs WHERE id = ?",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load queue job")?;

        Ok(row.map(|row| {
            let state: String = row.get("state");
            QueueJob {
                id: row.get("id"),
                state: JobState::parse(&state).unwrap_or(JobState::Failed),
                attempts_made: row.get("attempts_made"),
                max_attempts: row.get("max_attempts"),
                locked_until: row.get("locked_until"),
            }
        }))
    }

    /// Queue-side state for a job id, if the job exists at all.
    pub async fn get_state(&self, job_id: &str) -> Result<Option<JobState>> {
        Ok(self.get_job(job_id).await?.map(|j| j.state))
    }

    /// Lease the next runnable job: a waiting row, or an active row whose
    /// lock expired (worker died mid-lease). Atomic via a single UPDATE.
    pub async fn lease_next(&self, lock_ttl: Duration) -> Result<Option<QueueJob>> {
        let now = Utc::now().timestamp_millis();
        let locked_until = now + lock_ttl.as_millis() as i64;

        let row = sqlx::query(
            "UPDATE queue_jobs
             SET state = 'active', attempts_made = attempts_made + 1,
                 locked_until = ?, updated_at = ?
             WHERE id = (
                 SELECT id FROM queue_jobs
                 WHERE state = 'waiting'
                    OR (state = 'active' AND locked_until IS NOT NULL AND locked_until < ?)
                 ORDER BY created_at ASC
                 LIMIT 1
             )
             RETURNING id, state, attempts_made, max_attempts, locked_until",
        )
        .bind(locked_until)
        .bind(now)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to lease job")?;

        Ok(row.map(|row| QueueJob {
            id: row.get("id"),
            state: JobState::Active,
            attempts_made: row.get("attempts_made"),
            max_attempts: row.get("max_attempts"),
            locked_until: row.get("locked_until"),
        }))
    }

    /// Extend the lease while the job is still being processed.
    pub async fn renew_lock(&self, job_id: &str, lock_ttl: Duration) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        sqlx::query(
            "UPDATE queue_jobs SET locked_until = ?, updated_at = ?
             WHERE id = ? AND state = 'active'",
        )
        .bind(now + lock_ttl.as_millis() as i64)
        .bind(now)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .context("Failed to renew job lock")?;
        Ok(())
    }

    pub async fn complete(&self, job_id: &str) -> Result<()> {
        self.finish(job_id, JobState::Completed).await
    }

    pub async fn fail(&self, job_id: &str) -> Result<()> {
        self.finish(job_id, JobState::Failed).await
    }

    async fn finish(&self, job_id: &str, state: JobState) -> Result<()> {
        sqlx::query(
            "UPDATE queue_jobs SET state = ?, locked_until = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(state.as_str())
        .bind(Utc::now().timestamp_millis())
        .bind(job_id)
        .execute(&self.pool)
        .await
        .context("Failed to finish job")?;
        Ok(())
    }
}
