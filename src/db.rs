//! Postgres-backed store.
//!
//! Claiming uses `FOR UPDATE SKIP LOCKED` inside a single statement so the
//! select and the flip to PROCESSING are one atomic step; contended rows are
//! left for the next claimer instead of blocking.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::Executor;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::store::{JobStore, LockStore, NotificationStore, WeekStore};
use crate::{
    JobStatus, LeaderboardEntry, LockStatus, Priority, ProcessingJob, RunLock, Submission,
    TaskType, UserRecord, WeeklyAggregate,
};

const JOB_COLUMNS: &str = "id, submission_id, status, priority, retry_count, created_at, \
     processing_started_at, processing_completed_at, next_attempt_at, error_message";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn new(url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new().max_connections(5).connect(url).await?;

        (&pool).execute(include_str!("setup.sql")).await?;

        Ok(PgStore { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn enqueue_job(
        &self,
        submission_id: Uuid,
        priority: Priority,
    ) -> StoreResult<ProcessingJob> {
        let inserted = sqlx::query_as::<_, ProcessingJob>(&format!(
            "INSERT INTO processing_jobs (id, submission_id, status, priority) \
             VALUES ($1, $2, 'PENDING', $3) \
             ON CONFLICT (submission_id) DO NOTHING \
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(submission_id)
        .bind(priority)
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some(job) => Ok(job),
            // Lost the insert race or the submission already has a job.
            None => self
                .job_for_submission(submission_id)
                .await?
                .ok_or_else(|| {
                    StoreError::Missing(format!("no job for submission {submission_id}"))
                }),
        }
    }

    async fn claim_batch(
        &self,
        limit: i64,
        max_retries: i32,
        processing_timeout: Duration,
    ) -> StoreResult<Vec<ProcessingJob>> {
        let mut claimed = sqlx::query_as::<_, ProcessingJob>(&format!(
            "WITH eligible AS ( \
                 SELECT id FROM processing_jobs \
                 WHERE retry_count < $1 \
                   AND ( \
                     (status = 'PENDING' \
                      AND (next_attempt_at IS NULL OR next_attempt_at <= now())) \
                     OR (status = 'PROCESSING' \
                         AND (processing_started_at IS NULL \
                              OR processing_started_at < now() - make_interval(secs => $2))) \
                   ) \
                 ORDER BY priority DESC, created_at ASC \
                 LIMIT $3 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             UPDATE processing_jobs j \
             SET status = 'PROCESSING', processing_started_at = now(), next_attempt_at = NULL \
             FROM eligible e \
             WHERE j.id = e.id \
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(max_retries)
        .bind(processing_timeout.as_secs_f64())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        // UPDATE ... RETURNING does not preserve the subquery ordering.
        claimed.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(claimed)
    }

    async fn complete_job(&self, id: Uuid) -> StoreResult<()> {
        sqlx::query(
            "UPDATE processing_jobs \
             SET status = 'COMPLETED', processing_completed_at = now(), error_message = NULL \
             WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail_job(&self, id: Uuid, error: &str) -> StoreResult<()> {
        sqlx::query(
            "UPDATE processing_jobs \
             SET status = 'FAILED', processing_completed_at = now(), error_message = $2 \
             WHERE id = $1",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reschedule_job(
        &self,
        id: Uuid,
        error: &str,
        delay: Duration,
        count_retry: bool,
    ) -> StoreResult<()> {
        sqlx::query(
            "UPDATE processing_jobs \
             SET status = 'PENDING', \
                 processing_started_at = NULL, \
                 next_attempt_at = now() + make_interval(secs => $2), \
                 error_message = $3, \
                 retry_count = retry_count + $4 \
             WHERE id = $1",
        )
        .bind(id)
        .bind(delay.as_secs_f64())
        .bind(error)
        .bind(i32::from(count_retry))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn job(&self, id: Uuid) -> StoreResult<Option<ProcessingJob>> {
        Ok(sqlx::query_as::<_, ProcessingJob>(&format!(
            "SELECT {JOB_COLUMNS} FROM processing_jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn job_for_submission(&self, submission_id: Uuid) -> StoreResult<Option<ProcessingJob>> {
        Ok(sqlx::query_as::<_, ProcessingJob>(&format!(
            "SELECT {JOB_COLUMNS} FROM processing_jobs WHERE submission_id = $1"
        ))
        .bind(submission_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn status_counts(&self) -> StoreResult<Vec<(JobStatus, i64)>> {
        Ok(sqlx::query_as::<_, (JobStatus, i64)>(
            "SELECT status, COUNT(*) FROM processing_jobs GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    async fn submission(&self, id: Uuid) -> StoreResult<Option<Submission>> {
        Ok(sqlx::query_as::<_, Submission>(
            "SELECT id, user_id, platform, url, status, task_types, final_score, week, created_at \
             FROM submissions WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn set_submission_task_types(
        &self,
        id: Uuid,
        task_types: &[TaskType],
    ) -> StoreResult<()> {
        sqlx::query("UPDATE submissions SET task_types = $2 WHERE id = $1")
            .bind(id)
            .bind(Json(task_types.to_vec()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn store_fingerprint(
        &self,
        submission_id: Uuid,
        user_id: Uuid,
        digest: &str,
    ) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO content_fingerprints (submission_id, user_id, digest) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (submission_id) DO NOTHING",
        )
        .bind(submission_id)
        .bind(user_id)
        .bind(digest)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_duplicate(
        &self,
        digest: &str,
        submission_id: Uuid,
    ) -> StoreResult<Option<Uuid>> {
        Ok(sqlx::query_scalar::<_, Uuid>(
            "SELECT submission_id FROM content_fingerprints \
             WHERE digest = $1 AND submission_id <> $2 \
             LIMIT 1",
        )
        .bind(digest)
        .bind(submission_id)
        .fetch_optional(&self.pool)
        .await?)
    }
}

#[async_trait]
impl LockStore for PgStore {
    async fn try_acquire(&self, name: &str, stale_after: Duration) -> StoreResult<bool> {
        // The unique job_name row is the mutex; the conditional upsert either
        // starts a fresh run or takes over an expired one.
        let acquired = sqlx::query_scalar::<_, String>(
            "INSERT INTO exclusive_run_locks (job_name, status, started_at) \
             VALUES ($1, 'RUNNING', now()) \
             ON CONFLICT (job_name) DO UPDATE \
             SET status = 'RUNNING', started_at = now(), \
                 completed_at = NULL, duration_ms = NULL, result = NULL \
             WHERE exclusive_run_locks.status <> 'RUNNING' \
                OR exclusive_run_locks.started_at < now() - make_interval(secs => $2) \
             RETURNING job_name",
        )
        .bind(name)
        .bind(stale_after.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;
        Ok(acquired.is_some())
    }

    async fn write_progress(&self, name: &str, result: &serde_json::Value) -> StoreResult<()> {
        sqlx::query(
            "UPDATE exclusive_run_locks SET result = $2 \
             WHERE job_name = $1 AND status = 'RUNNING'",
        )
        .bind(name)
        .bind(result.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn release(
        &self,
        name: &str,
        status: LockStatus,
        result: &serde_json::Value,
    ) -> StoreResult<()> {
        sqlx::query(
            "UPDATE exclusive_run_locks \
             SET status = $2, \
                 completed_at = now(), \
                 duration_ms = (extract(epoch from now() - started_at) * 1000)::bigint, \
                 result = $3 \
             WHERE job_name = $1",
        )
        .bind(name)
        .bind(status)
        .bind(result.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn lock(&self, name: &str) -> StoreResult<Option<RunLock>> {
        Ok(sqlx::query_as::<_, RunLock>(
            "SELECT job_name, status, started_at, completed_at, duration_ms, result \
             FROM exclusive_run_locks WHERE job_name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?)
    }
}

#[async_trait]
impl WeekStore for PgStore {
    async fn users_pending_reset(&self, week: i32) -> StoreResult<Vec<Uuid>> {
        Ok(sqlx::query_scalar::<_, Uuid>(
            "SELECT u.id FROM users u \
             WHERE NOT EXISTS ( \
                 SELECT 1 FROM weekly_aggregates a \
                 WHERE a.user_id = u.id AND a.week = $1 \
             ) \
             ORDER BY u.id",
        )
        .bind(week)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn finalize_user_week(
        &self,
        user_id: Uuid,
        week: i32,
        streak_xp_threshold: i64,
    ) -> StoreResult<WeeklyAggregate> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query_as::<_, WeeklyAggregate>(
            "SELECT user_id, week, xp_total, reviews_completed, streak_weeks, earned_streak, \
                    created_at \
             FROM weekly_aggregates WHERE user_id = $1 AND week = $2",
        )
        .bind(user_id)
        .bind(week)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(aggregate) = existing {
            tx.rollback().await?;
            return Ok(aggregate);
        }

        let user = sqlx::query_as::<_, UserRecord>(
            "SELECT id, username, weekly_xp, weekly_reviews, total_xp, streak_weeks \
             FROM users WHERE id = $1 \
             FOR UPDATE",
        )
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::Missing(format!("user {user_id} not found")))?;

        // Recompute from the ledger inside the transaction; the cached rolling
        // counter is not trusted under concurrent XP writes.
        let xp_total = sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(SUM(amount), 0) FROM xp_ledger WHERE user_id = $1 AND week = $2",
        )
        .bind(user_id)
        .bind(week)
        .fetch_one(&mut *tx)
        .await?;

        let earned_streak = xp_total >= streak_xp_threshold;
        let streak_weeks = if earned_streak {
            user.streak_weeks + 1
        } else {
            0
        };

        let aggregate = sqlx::query_as::<_, WeeklyAggregate>(
            "INSERT INTO weekly_aggregates \
                 (user_id, week, xp_total, reviews_completed, streak_weeks, earned_streak) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             RETURNING user_id, week, xp_total, reviews_completed, streak_weeks, earned_streak, \
                       created_at",
        )
        .bind(user_id)
        .bind(week)
        .bind(xp_total)
        .bind(user.weekly_reviews)
        .bind(streak_weeks)
        .bind(earned_streak)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE users SET weekly_xp = 0, weekly_reviews = 0, streak_weeks = $2 WHERE id = $1",
        )
        .bind(user_id)
        .bind(streak_weeks)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(aggregate)
    }

    async fn weekly_leaderboard(
        &self,
        week: i32,
        limit: i64,
    ) -> StoreResult<Vec<LeaderboardEntry>> {
        Ok(sqlx::query_as::<_, LeaderboardEntry>(
            "SELECT a.user_id, u.username, a.xp_total, a.reviews_completed \
             FROM weekly_aggregates a \
             JOIN users u ON u.id = a.user_id \
             WHERE a.week = $1 \
             ORDER BY a.xp_total DESC, u.username ASC \
             LIMIT $2",
        )
        .bind(week)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn top_submission(&self, week: i32) -> StoreResult<Option<Submission>> {
        Ok(sqlx::query_as::<_, Submission>(
            "SELECT id, user_id, platform, url, status, task_types, final_score, week, created_at \
             FROM submissions \
             WHERE status = 'FINALIZED' AND week = $1 AND final_score IS NOT NULL \
             ORDER BY final_score DESC \
             LIMIT 1",
        )
        .bind(week)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn purge_rate_limit_entries(&self, before: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM rate_limit_entries WHERE created_at < $1")
            .bind(before)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn purge_read_notifications(&self, before: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            "DELETE FROM notifications WHERE read_at IS NOT NULL AND created_at < $1",
        )
        .bind(before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn user(&self, id: Uuid) -> StoreResult<Option<UserRecord>> {
        Ok(sqlx::query_as::<_, UserRecord>(
            "SELECT id, username, weekly_xp, weekly_reviews, total_xp, streak_weeks \
             FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?)
    }
}

#[async_trait]
impl NotificationStore for PgStore {
    async fn insert_notification(
        &self,
        user_id: Uuid,
        kind: &str,
        title: &str,
        message: &str,
        metadata: &serde_json::Value,
    ) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO notifications (id, user_id, kind, title, message, metadata) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(kind)
        .bind(title)
        .bind(message)
        .bind(Json(metadata.clone()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
