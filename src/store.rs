//! Storage traits behind the claim loop and the weekly coordinator.
//!
//! Two implementations exist: [`crate::db::PgStore`] against Postgres and
//! [`crate::memory::MemoryStore`] for tests. The relational store is the only
//! coordination primitive; both backends must honor the same claim atomicity.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreResult;
use crate::{
    JobStatus, LeaderboardEntry, LockStatus, Priority, ProcessingJob, RunLock, Submission,
    TaskType, UserRecord, WeeklyAggregate,
};

/// Job rows plus the submission/fingerprint state the pipeline touches.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a PENDING job for a submission. At most one job exists per
    /// submission; re-enqueueing returns the existing row untouched.
    async fn enqueue_job(
        &self,
        submission_id: Uuid,
        priority: Priority,
    ) -> StoreResult<ProcessingJob>;

    /// Atomically claim up to `limit` eligible jobs: PENDING and due, or
    /// PROCESSING with a `processing_started_at` older than
    /// `processing_timeout` (stale, presumed abandoned). Claimed rows are
    /// flipped to PROCESSING with a fresh `processing_started_at` in the same
    /// atomic step; rows locked by a concurrent claimer are skipped, never
    /// waited on. Ordering within a batch: priority descending, then
    /// creation time ascending.
    async fn claim_batch(
        &self,
        limit: i64,
        max_retries: i32,
        processing_timeout: Duration,
    ) -> StoreResult<Vec<ProcessingJob>>;

    async fn complete_job(&self, id: Uuid) -> StoreResult<()>;

    /// Terminal failure; sets `processing_completed_at` and the error message.
    async fn fail_job(&self, id: Uuid, error: &str) -> StoreResult<()>;

    /// Put a job back to PENDING, eligible again after `delay`. Clears
    /// `processing_started_at`, records the error, and increments the retry
    /// count only when `count_retry` is set (rate-limit deferrals do not
    /// consume the budget).
    async fn reschedule_job(
        &self,
        id: Uuid,
        error: &str,
        delay: Duration,
        count_retry: bool,
    ) -> StoreResult<()>;

    async fn job(&self, id: Uuid) -> StoreResult<Option<ProcessingJob>>;

    async fn job_for_submission(&self, submission_id: Uuid) -> StoreResult<Option<ProcessingJob>>;

    /// Job counts by status, for operational visibility.
    async fn status_counts(&self) -> StoreResult<Vec<(JobStatus, i64)>>;

    async fn submission(&self, id: Uuid) -> StoreResult<Option<Submission>>;

    /// Record the resolved task classification on the submission.
    async fn set_submission_task_types(
        &self,
        id: Uuid,
        task_types: &[TaskType],
    ) -> StoreResult<()>;

    /// Idempotent: at most one fingerprint per submission.
    async fn store_fingerprint(
        &self,
        submission_id: Uuid,
        user_id: Uuid,
        digest: &str,
    ) -> StoreResult<()>;

    /// Another submission already carrying this content digest, if any.
    async fn find_duplicate(&self, digest: &str, submission_id: Uuid)
        -> StoreResult<Option<Uuid>>;
}

/// Named exclusive-run locks. A lock row is the sole mutual-exclusion
/// mechanism for the operation it names; there is no separate lock service.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Take the lock unless an unexpired RUNNING row already holds it.
    /// Returns false when another run is in flight (expected under concurrent
    /// triggers, not an error). A RUNNING row older than `stale_after` is
    /// presumed crashed and taken over.
    async fn try_acquire(&self, name: &str, stale_after: Duration) -> StoreResult<bool>;

    /// Incremental progress snapshot while the lock is RUNNING.
    async fn write_progress(&self, name: &str, result: &serde_json::Value) -> StoreResult<()>;

    /// Terminal transition; records duration since `started_at` and the final
    /// result summary.
    async fn release(
        &self,
        name: &str,
        status: LockStatus,
        result: &serde_json::Value,
    ) -> StoreResult<()>;

    async fn lock(&self, name: &str) -> StoreResult<Option<RunLock>>;
}

/// Per-user weekly state touched by the coordinator, plus the read-only
/// aggregation the coordinator triggers downstream.
#[async_trait]
pub trait WeekStore: Send + Sync {
    /// Users with no aggregate row for `week` yet, i.e. not yet reset.
    async fn users_pending_reset(&self, week: i32) -> StoreResult<Vec<Uuid>>;

    /// One transaction per user: recompute the week's XP from the ledger
    /// (never the cached rolling counter), create the aggregate row, zero the
    /// rolling weekly counters, and update the streak. If the aggregate row
    /// already exists the stored row is returned unchanged.
    async fn finalize_user_week(
        &self,
        user_id: Uuid,
        week: i32,
        streak_xp_threshold: i64,
    ) -> StoreResult<WeeklyAggregate>;

    async fn weekly_leaderboard(&self, week: i32, limit: i64)
        -> StoreResult<Vec<LeaderboardEntry>>;

    /// Highest-scoring finalized submission of the week.
    async fn top_submission(&self, week: i32) -> StoreResult<Option<Submission>>;

    async fn purge_rate_limit_entries(&self, before: DateTime<Utc>) -> StoreResult<u64>;

    async fn purge_read_notifications(&self, before: DateTime<Utc>) -> StoreResult<u64>;

    async fn user(&self, id: Uuid) -> StoreResult<Option<UserRecord>>;
}

/// Notification rows written by the best-effort notifier.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn insert_notification(
        &self,
        user_id: Uuid,
        kind: &str,
        title: &str,
        message: &str,
        metadata: &serde_json::Value,
    ) -> StoreResult<()>;
}
