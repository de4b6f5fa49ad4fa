//! In-memory store used by the test suite.
//!
//! Implements the same claim atomicity as the Postgres store by holding the
//! table mutex for the whole select-and-flip step, so concurrent claimers can
//! never double-claim a row.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::store::{JobStore, LockStore, NotificationStore, WeekStore};
use crate::{
    JobStatus, LeaderboardEntry, LockStatus, Notification, Platform, Priority, ProcessingJob,
    RunLock, Submission, SubmissionStatus, TaskType, UserRecord, WeeklyAggregate,
};

#[derive(Debug, Clone)]
struct Fingerprint {
    submission_id: Uuid,
    user_id: Uuid,
    digest: String,
}

#[derive(Debug, Clone)]
struct XpEntry {
    user_id: Uuid,
    week: i32,
    amount: i64,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, ProcessingJob>,
    locks: HashMap<String, RunLock>,
    progress_log: HashMap<String, Vec<String>>,
    submissions: HashMap<Uuid, Submission>,
    users: HashMap<Uuid, UserRecord>,
    ledger: Vec<XpEntry>,
    aggregates: HashMap<(Uuid, i32), WeeklyAggregate>,
    fingerprints: Vec<Fingerprint>,
    notifications: Vec<Notification>,
    rate_limit_entries: Vec<DateTime<Utc>>,
    claim_count: u64,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    // Test seeding and inspection helpers below; the traits cover everything
    // the production code paths need.

    pub async fn insert_user(&self, username: &str) -> UserRecord {
        let user = UserRecord {
            id: Uuid::new_v4(),
            username: username.to_owned(),
            weekly_xp: 0,
            weekly_reviews: 0,
            total_xp: 0,
            streak_weeks: 0,
        };
        self.inner.lock().await.users.insert(user.id, user.clone());
        user
    }

    pub async fn insert_submission(&self, user_id: Uuid, platform: Platform, url: &str) -> Submission {
        let submission = Submission {
            id: Uuid::new_v4(),
            user_id,
            platform,
            url: url.to_owned(),
            status: SubmissionStatus::Processing,
            task_types: Json(Vec::new()),
            final_score: None,
            week: None,
            created_at: Utc::now(),
        };
        self.inner
            .lock()
            .await
            .submissions
            .insert(submission.id, submission.clone());
        submission
    }

    pub async fn finalize_submission(&self, id: Uuid, week: i32, score: i32) {
        let mut inner = self.inner.lock().await;
        if let Some(submission) = inner.submissions.get_mut(&id) {
            submission.status = SubmissionStatus::Finalized;
            submission.week = Some(week);
            submission.final_score = Some(score);
        }
    }

    pub async fn add_xp(&self, user_id: Uuid, week: i32, amount: i64) {
        let mut inner = self.inner.lock().await;
        inner.ledger.push(XpEntry {
            user_id,
            week,
            amount,
        });
        if let Some(user) = inner.users.get_mut(&user_id) {
            user.weekly_xp += amount;
            user.total_xp += amount;
        }
    }

    pub async fn add_weekly_reviews(&self, user_id: Uuid, count: i32) {
        let mut inner = self.inner.lock().await;
        if let Some(user) = inner.users.get_mut(&user_id) {
            user.weekly_reviews += count;
        }
    }

    pub async fn add_rate_limit_entry(&self, created_at: DateTime<Utc>) {
        self.inner.lock().await.rate_limit_entries.push(created_at);
    }

    pub async fn rate_limit_entry_count(&self) -> usize {
        self.inner.lock().await.rate_limit_entries.len()
    }

    pub async fn notifications_for(&self, user_id: Uuid) -> Vec<Notification> {
        self.inner
            .lock()
            .await
            .notifications
            .iter()
            .filter(|n| n.user_id == user_id)
            .cloned()
            .collect()
    }

    pub async fn notification_count(&self) -> usize {
        self.inner.lock().await.notifications.len()
    }

    pub async fn mark_notifications_read(&self, user_id: Uuid, read_at: DateTime<Utc>) {
        let mut inner = self.inner.lock().await;
        for notification in inner.notifications.iter_mut() {
            if notification.user_id == user_id {
                notification.read_at = Some(read_at);
            }
        }
    }

    pub async fn backdate_notifications(&self, user_id: Uuid, created_at: DateTime<Utc>) {
        let mut inner = self.inner.lock().await;
        for notification in inner.notifications.iter_mut() {
            if notification.user_id == user_id {
                notification.created_at = created_at;
            }
        }
    }

    /// Total rows ever flipped to PROCESSING inside the atomic claim step.
    pub async fn claim_count(&self) -> u64 {
        self.inner.lock().await.claim_count
    }

    /// Every progress snapshot written for a lock, oldest first. The Postgres
    /// store updates the row in place; the history is kept here so tests can
    /// observe intermediate states.
    pub async fn progress_history(&self, name: &str) -> Vec<String> {
        self.inner
            .lock()
            .await
            .progress_log
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn aggregate(&self, user_id: Uuid, week: i32) -> Option<WeeklyAggregate> {
        self.inner
            .lock()
            .await
            .aggregates
            .get(&(user_id, week))
            .cloned()
    }

    pub async fn aggregate_count(&self, week: i32) -> usize {
        self.inner
            .lock()
            .await
            .aggregates
            .keys()
            .filter(|(_, w)| *w == week)
            .count()
    }

    pub async fn backdate_lock(&self, name: &str, started_at: DateTime<Utc>) {
        let mut inner = self.inner.lock().await;
        if let Some(lock) = inner.locks.get_mut(name) {
            lock.started_at = started_at;
        }
    }

    pub async fn set_processing_started(&self, job_id: Uuid, at: DateTime<Utc>) {
        let mut inner = self.inner.lock().await;
        if let Some(job) = inner.jobs.get_mut(&job_id) {
            job.processing_started_at = Some(at);
        }
    }

    pub async fn set_next_attempt(&self, job_id: Uuid, at: Option<DateTime<Utc>>) {
        let mut inner = self.inner.lock().await;
        if let Some(job) = inner.jobs.get_mut(&job_id) {
            job.next_attempt_at = at;
        }
    }

    pub async fn set_created_at(&self, job_id: Uuid, at: DateTime<Utc>) {
        let mut inner = self.inner.lock().await;
        if let Some(job) = inner.jobs.get_mut(&job_id) {
            job.created_at = at;
        }
    }
}

fn eligible(job: &ProcessingJob, now: DateTime<Utc>, max_retries: i32, timeout: Duration) -> bool {
    if job.retry_count >= max_retries {
        return false;
    }
    match job.status {
        JobStatus::Pending => job
            .next_attempt_at
            .map(|at| at <= now)
            .unwrap_or(true),
        JobStatus::Processing => match job.processing_started_at {
            None => true,
            Some(started) => {
                now.signed_duration_since(started)
                    > chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::zero())
            }
        },
        JobStatus::Completed | JobStatus::Failed => false,
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn enqueue_job(
        &self,
        submission_id: Uuid,
        priority: Priority,
    ) -> StoreResult<ProcessingJob> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner
            .jobs
            .values()
            .find(|j| j.submission_id == submission_id)
        {
            return Ok(existing.clone());
        }
        let job = ProcessingJob {
            id: Uuid::new_v4(),
            submission_id,
            status: JobStatus::Pending,
            priority,
            retry_count: 0,
            created_at: Utc::now(),
            processing_started_at: None,
            processing_completed_at: None,
            next_attempt_at: None,
            error_message: None,
        };
        inner.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn claim_batch(
        &self,
        limit: i64,
        max_retries: i32,
        processing_timeout: Duration,
    ) -> StoreResult<Vec<ProcessingJob>> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();

        let mut candidates: Vec<(Priority, DateTime<Utc>, Uuid)> = inner
            .jobs
            .values()
            .filter(|job| eligible(job, now, max_retries, processing_timeout))
            .map(|job| (job.priority, job.created_at, job.id))
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        candidates.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, _, id) in candidates {
            if let Some(job) = inner.jobs.get_mut(&id) {
                job.status = JobStatus::Processing;
                job.processing_started_at = Some(now);
                job.next_attempt_at = None;
                claimed.push(job.clone());
            }
        }
        inner.claim_count += claimed.len() as u64;
        Ok(claimed)
    }

    async fn complete_job(&self, id: Uuid) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or_else(|| StoreError::Missing(format!("job {id} not found")))?;
        job.status = JobStatus::Completed;
        job.processing_completed_at = Some(Utc::now());
        job.error_message = None;
        Ok(())
    }

    async fn fail_job(&self, id: Uuid, error: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or_else(|| StoreError::Missing(format!("job {id} not found")))?;
        job.status = JobStatus::Failed;
        job.processing_completed_at = Some(Utc::now());
        job.error_message = Some(error.to_owned());
        Ok(())
    }

    async fn reschedule_job(
        &self,
        id: Uuid,
        error: &str,
        delay: Duration,
        count_retry: bool,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or_else(|| StoreError::Missing(format!("job {id} not found")))?;
        job.status = JobStatus::Pending;
        job.processing_started_at = None;
        job.next_attempt_at = Some(
            Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()),
        );
        job.error_message = Some(error.to_owned());
        if count_retry {
            job.retry_count += 1;
        }
        Ok(())
    }

    async fn job(&self, id: Uuid) -> StoreResult<Option<ProcessingJob>> {
        Ok(self.inner.lock().await.jobs.get(&id).cloned())
    }

    async fn job_for_submission(&self, submission_id: Uuid) -> StoreResult<Option<ProcessingJob>> {
        Ok(self
            .inner
            .lock()
            .await
            .jobs
            .values()
            .find(|j| j.submission_id == submission_id)
            .cloned())
    }

    async fn status_counts(&self) -> StoreResult<Vec<(JobStatus, i64)>> {
        let inner = self.inner.lock().await;
        let mut counts: HashMap<JobStatus, i64> = HashMap::new();
        for job in inner.jobs.values() {
            *counts.entry(job.status).or_default() += 1;
        }
        Ok(counts.into_iter().collect())
    }

    async fn submission(&self, id: Uuid) -> StoreResult<Option<Submission>> {
        Ok(self.inner.lock().await.submissions.get(&id).cloned())
    }

    async fn set_submission_task_types(
        &self,
        id: Uuid,
        task_types: &[TaskType],
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let submission = inner
            .submissions
            .get_mut(&id)
            .ok_or_else(|| StoreError::Missing(format!("submission {id} not found")))?;
        submission.task_types = Json(task_types.to_vec());
        Ok(())
    }

    async fn store_fingerprint(
        &self,
        submission_id: Uuid,
        user_id: Uuid,
        digest: &str,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if inner
            .fingerprints
            .iter()
            .any(|f| f.submission_id == submission_id)
        {
            return Ok(());
        }
        inner.fingerprints.push(Fingerprint {
            submission_id,
            user_id,
            digest: digest.to_owned(),
        });
        Ok(())
    }

    async fn find_duplicate(
        &self,
        digest: &str,
        submission_id: Uuid,
    ) -> StoreResult<Option<Uuid>> {
        Ok(self
            .inner
            .lock()
            .await
            .fingerprints
            .iter()
            .find(|f| f.digest == digest && f.submission_id != submission_id)
            .map(|f| f.submission_id))
    }
}

#[async_trait]
impl LockStore for MemoryStore {
    async fn try_acquire(&self, name: &str, stale_after: Duration) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        if let Some(existing) = inner.locks.get(name) {
            let age = now.signed_duration_since(existing.started_at);
            let expired = age
                > chrono::Duration::from_std(stale_after).unwrap_or_else(|_| chrono::Duration::zero());
            if existing.status == LockStatus::Running && !expired {
                return Ok(false);
            }
        }
        inner.locks.insert(
            name.to_owned(),
            RunLock {
                job_name: name.to_owned(),
                status: LockStatus::Running,
                started_at: now,
                completed_at: None,
                duration_ms: None,
                result: None,
            },
        );
        Ok(true)
    }

    async fn write_progress(&self, name: &str, result: &serde_json::Value) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let serialized = result.to_string();
        let lock = inner
            .locks
            .get_mut(name)
            .ok_or_else(|| StoreError::Missing(format!("lock {name} not found")))?;
        lock.result = Some(serialized.clone());
        inner
            .progress_log
            .entry(name.to_owned())
            .or_default()
            .push(serialized);
        Ok(())
    }

    async fn release(
        &self,
        name: &str,
        status: LockStatus,
        result: &serde_json::Value,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let lock = inner
            .locks
            .get_mut(name)
            .ok_or_else(|| StoreError::Missing(format!("lock {name} not found")))?;
        let now = Utc::now();
        lock.status = status;
        lock.completed_at = Some(now);
        lock.duration_ms = Some(now.signed_duration_since(lock.started_at).num_milliseconds());
        lock.result = Some(result.to_string());
        Ok(())
    }

    async fn lock(&self, name: &str) -> StoreResult<Option<RunLock>> {
        Ok(self.inner.lock().await.locks.get(name).cloned())
    }
}

#[async_trait]
impl WeekStore for MemoryStore {
    async fn users_pending_reset(&self, week: i32) -> StoreResult<Vec<Uuid>> {
        let inner = self.inner.lock().await;
        let mut pending: Vec<Uuid> = inner
            .users
            .keys()
            .filter(|id| !inner.aggregates.contains_key(&(**id, week)))
            .copied()
            .collect();
        pending.sort();
        Ok(pending)
    }

    async fn finalize_user_week(
        &self,
        user_id: Uuid,
        week: i32,
        streak_xp_threshold: i64,
    ) -> StoreResult<WeeklyAggregate> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.aggregates.get(&(user_id, week)) {
            return Ok(existing.clone());
        }

        let xp_total: i64 = inner
            .ledger
            .iter()
            .filter(|e| e.user_id == user_id && e.week == week)
            .map(|e| e.amount)
            .sum();

        let user = inner
            .users
            .get_mut(&user_id)
            .ok_or_else(|| StoreError::Missing(format!("user {user_id} not found")))?;

        let earned_streak = xp_total >= streak_xp_threshold;
        let streak_weeks = if earned_streak {
            user.streak_weeks + 1
        } else {
            0
        };
        let aggregate = WeeklyAggregate {
            user_id,
            week,
            xp_total,
            reviews_completed: user.weekly_reviews,
            streak_weeks,
            earned_streak,
            created_at: Utc::now(),
        };

        user.weekly_xp = 0;
        user.weekly_reviews = 0;
        user.streak_weeks = streak_weeks;

        inner.aggregates.insert((user_id, week), aggregate.clone());
        Ok(aggregate)
    }

    async fn weekly_leaderboard(
        &self,
        week: i32,
        limit: i64,
    ) -> StoreResult<Vec<LeaderboardEntry>> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<LeaderboardEntry> = inner
            .aggregates
            .values()
            .filter(|a| a.week == week)
            .filter_map(|a| {
                inner.users.get(&a.user_id).map(|user| LeaderboardEntry {
                    user_id: a.user_id,
                    username: user.username.clone(),
                    xp_total: a.xp_total,
                    reviews_completed: a.reviews_completed,
                })
            })
            .collect();
        rows.sort_by(|a, b| b.xp_total.cmp(&a.xp_total).then(a.username.cmp(&b.username)));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn top_submission(&self, week: i32) -> StoreResult<Option<Submission>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .submissions
            .values()
            .filter(|s| {
                s.status == SubmissionStatus::Finalized
                    && s.week == Some(week)
                    && s.final_score.is_some()
            })
            .max_by_key(|s| s.final_score)
            .cloned())
    }

    async fn purge_rate_limit_entries(&self, before: DateTime<Utc>) -> StoreResult<u64> {
        let mut inner = self.inner.lock().await;
        let original = inner.rate_limit_entries.len();
        inner.rate_limit_entries.retain(|at| *at >= before);
        Ok((original - inner.rate_limit_entries.len()) as u64)
    }

    async fn purge_read_notifications(&self, before: DateTime<Utc>) -> StoreResult<u64> {
        let mut inner = self.inner.lock().await;
        let original = inner.notifications.len();
        inner
            .notifications
            .retain(|n| n.read_at.is_none() || n.created_at >= before);
        Ok((original - inner.notifications.len()) as u64)
    }

    async fn user(&self, id: Uuid) -> StoreResult<Option<UserRecord>> {
        Ok(self.inner.lock().await.users.get(&id).cloned())
    }
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn insert_notification(
        &self,
        user_id: Uuid,
        kind: &str,
        title: &str,
        message: &str,
        metadata: &serde_json::Value,
    ) -> StoreResult<()> {
        self.inner.lock().await.notifications.push(Notification {
            id: Uuid::new_v4(),
            user_id,
            kind: kind.to_owned(),
            title: title.to_owned(),
            message: message.to_owned(),
            metadata: Json(metadata.clone()),
            read_at: None,
            created_at: Utc::now(),
        });
        Ok(())
    }
}
