//! Weekly reset coordinator tests: lock-row mutual exclusion, idempotent
//! resumption, streak bookkeeping, progress reporting, and retention cleanup.

mod support;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use subq::config::WeeklyConfig;
use subq::error::{StoreError, StoreResult};
use subq::insights::InsightsService;
use subq::memory::MemoryStore;
use subq::store::{LockStore, NotificationStore, WeekStore};
use subq::weekly::{lock_name, WeeklyCoordinator};
use subq::{LeaderboardEntry, LockStatus, Platform, Submission, UserRecord, WeeklyAggregate};
use uuid::Uuid;

use support::{coordinator, seeded};

const WEEK: i32 = 202534;

fn notify_inline(store: &Arc<MemoryStore>) -> subq::notify::NotifyHandle {
    subq::notify::NotifyHandle::inline(Arc::new(subq::notify::StoreNotifier::new(store.clone())))
}

#[tokio::test]
async fn a_held_lock_makes_concurrent_runs_no_ops() {
    let store = Arc::new(MemoryStore::new());
    let user = store.insert_user("ada").await;
    store.add_xp(user.id, WEEK, 120).await;

    let config = WeeklyConfig::default();
    let name = lock_name(WEEK);
    assert!(store.try_acquire(&name, config.lock_timeout).await.unwrap());

    let outcome = coordinator(store.clone(), config).run(WEEK).await.unwrap();
    assert!(!outcome.ran);
    assert_eq!(outcome.processed, 0);
    assert_eq!(outcome.total, 0);

    // Nothing was touched, and the loser did not release the holder's lock.
    assert_eq!(store.aggregate_count(WEEK).await, 0);
    assert_eq!(store.user(user.id).await.unwrap().unwrap().weekly_xp, 120);
    assert_eq!(
        store.lock(&name).await.unwrap().unwrap().status,
        LockStatus::Running
    );
}

#[tokio::test]
async fn a_stale_running_lock_is_taken_over() {
    let store = Arc::new(MemoryStore::new());
    let user = store.insert_user("grace").await;
    store.add_xp(user.id, WEEK, 120).await;

    let config = WeeklyConfig::default();
    let name = lock_name(WEEK);
    assert!(store.try_acquire(&name, config.lock_timeout).await.unwrap());
    // The previous run crashed three hours ago without releasing.
    store
        .backdate_lock(&name, Utc::now() - chrono::Duration::hours(3))
        .await;

    let outcome = coordinator(store.clone(), config).run(WEEK).await.unwrap();
    assert!(outcome.ran);
    assert_eq!(outcome.processed, 1);
    assert_eq!(
        store.lock(&name).await.unwrap().unwrap().status,
        LockStatus::Success
    );
}

/// WeekStore wrapper whose per-user finalization blocks until the test opens
/// the gate, to hold a run mid-flight deterministically.
struct GatedWeeks {
    inner: Arc<MemoryStore>,
    gate: Arc<tokio::sync::Semaphore>,
}

#[async_trait]
impl WeekStore for GatedWeeks {
    async fn users_pending_reset(&self, week: i32) -> StoreResult<Vec<Uuid>> {
        self.inner.users_pending_reset(week).await
    }

    async fn finalize_user_week(
        &self,
        user_id: Uuid,
        week: i32,
        streak_xp_threshold: i64,
    ) -> StoreResult<WeeklyAggregate> {
        let _permit = self.gate.acquire().await.expect("gate closed");
        self.inner
            .finalize_user_week(user_id, week, streak_xp_threshold)
            .await
    }

    async fn weekly_leaderboard(
        &self,
        week: i32,
        limit: i64,
    ) -> StoreResult<Vec<LeaderboardEntry>> {
        self.inner.weekly_leaderboard(week, limit).await
    }

    async fn top_submission(&self, week: i32) -> StoreResult<Option<Submission>> {
        self.inner.top_submission(week).await
    }

    async fn purge_rate_limit_entries(&self, before: DateTime<Utc>) -> StoreResult<u64> {
        self.inner.purge_rate_limit_entries(before).await
    }

    async fn purge_read_notifications(&self, before: DateTime<Utc>) -> StoreResult<u64> {
        self.inner.purge_read_notifications(before).await
    }

    async fn user(&self, id: Uuid) -> StoreResult<Option<UserRecord>> {
        self.inner.user(id).await
    }
}

#[tokio::test]
async fn only_one_of_two_concurrent_runs_does_the_work() {
    let store = Arc::new(MemoryStore::new());
    for name in ["ada", "grace"] {
        let user = store.insert_user(name).await;
        store.add_xp(user.id, WEEK, 150).await;
    }

    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    let gated = WeeklyCoordinator::new(
        WeeklyConfig::default(),
        store.clone(),
        Arc::new(GatedWeeks {
            inner: store.clone(),
            gate: gate.clone(),
        }),
        notify_inline(&store),
    );
    let first = tokio::spawn(async move { gated.run(WEEK).await });

    // Wait for the first run to take the lock, then race a second run.
    let name = lock_name(WEEK);
    for _ in 0..200 {
        if let Some(lock) = store.lock(&name).await.unwrap() {
            if lock.status == LockStatus::Running {
                break;
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    let second = coordinator(store.clone(), WeeklyConfig::default())
        .run(WEEK)
        .await
        .unwrap();
    assert!(!second.ran);

    gate.add_permits(8);
    let first = first.await.unwrap().unwrap();
    assert!(first.ran);
    assert_eq!(first.processed, 2);

    // Exactly one aggregate per user, despite two triggers.
    assert_eq!(store.aggregate_count(WEEK).await, 2);
    assert_eq!(
        store.lock(&name).await.unwrap().unwrap().status,
        LockStatus::Success
    );
}

#[tokio::test]
async fn a_fresh_run_resumes_where_a_crashed_one_stopped() {
    let store = Arc::new(MemoryStore::new());
    let mut users = Vec::new();
    for i in 0..5 {
        let user = store.insert_user(&format!("user-{i}")).await;
        store.add_xp(user.id, WEEK, 50).await;
        users.push(user);
    }

    // Two users were already finalized before the previous run died.
    for user in &users[..2] {
        store.finalize_user_week(user.id, WEEK, 100).await.unwrap();
    }

    let outcome = coordinator(store.clone(), WeeklyConfig::default())
        .run(WEEK)
        .await
        .unwrap();
    assert!(outcome.ran);
    assert_eq!(outcome.total, 3);
    assert_eq!(outcome.processed, 3);
    assert_eq!(outcome.failed, 0);
    assert_eq!(store.aggregate_count(WEEK).await, 5);

    // Running again for the same week finds nothing left to do.
    let again = coordinator(store.clone(), WeeklyConfig::default())
        .run(WEEK)
        .await
        .unwrap();
    assert!(again.ran);
    assert_eq!(again.total, 0);
    assert_eq!(store.aggregate_count(WEEK).await, 5);
}

#[tokio::test]
async fn progress_is_written_once_per_chunk() {
    let store = Arc::new(MemoryStore::new());
    for i in 0..120 {
        store.insert_user(&format!("user-{i:03}")).await;
    }

    // Default chunk size is 50.
    let outcome = coordinator(store.clone(), WeeklyConfig::default())
        .run(WEEK)
        .await
        .unwrap();
    assert_eq!(outcome.processed, 120);

    let name = lock_name(WEEK);
    let history = store.progress_history(&name).await;
    let processed: Vec<i64> = history
        .iter()
        .map(|snapshot| {
            serde_json::from_str::<serde_json::Value>(snapshot).unwrap()["processed"]
                .as_i64()
                .unwrap()
        })
        .collect();
    assert_eq!(processed, vec![50, 100, 120]);

    let lock = store.lock(&name).await.unwrap().unwrap();
    assert_eq!(lock.status, LockStatus::Success);
    assert!(lock.duration_ms.is_some());
    let summary: serde_json::Value = serde_json::from_str(&lock.result.unwrap()).unwrap();
    assert_eq!(summary["total"], 120);
    assert!(summary["durationMs"].is_u64());
}

#[tokio::test]
async fn streaks_extend_on_threshold_and_reset_below_it() {
    let store = Arc::new(MemoryStore::new());
    let user = store.insert_user("ada").await;
    store.add_xp(user.id, WEEK, 150).await;
    store.add_weekly_reviews(user.id, 7).await;

    let config = WeeklyConfig::default(); // threshold 100
    coordinator(store.clone(), config.clone()).run(WEEK).await.unwrap();

    let aggregate = store.aggregate(user.id, WEEK).await.unwrap();
    assert_eq!(aggregate.xp_total, 150);
    assert_eq!(aggregate.reviews_completed, 7);
    assert!(aggregate.earned_streak);
    assert_eq!(aggregate.streak_weeks, 1);

    let row = store.user(user.id).await.unwrap().unwrap();
    assert_eq!(row.weekly_xp, 0);
    assert_eq!(row.weekly_reviews, 0);
    assert_eq!(row.streak_weeks, 1);
    assert_eq!(row.total_xp, 150);

    let notifications = store.notifications_for(user.id).await;
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].kind, "WEEKLY_SUMMARY");
    assert!(notifications[0].message.contains("You earned 150 XP"));
    assert!(notifications[0].message.contains("streak is now 1"));

    // A second qualifying week extends the streak.
    store.add_xp(user.id, WEEK + 1, 120).await;
    coordinator(store.clone(), config.clone()).run(WEEK + 1).await.unwrap();
    assert_eq!(
        store.user(user.id).await.unwrap().unwrap().streak_weeks,
        2
    );

    // A quiet week resets it.
    coordinator(store.clone(), config).run(WEEK + 2).await.unwrap();
    let aggregate = store.aggregate(user.id, WEEK + 2).await.unwrap();
    assert!(!aggregate.earned_streak);
    assert_eq!(aggregate.streak_weeks, 0);
    assert_eq!(store.user(user.id).await.unwrap().unwrap().streak_weeks, 0);
}

#[tokio::test]
async fn the_ledger_outranks_the_cached_weekly_counter() {
    let store = Arc::new(MemoryStore::new());
    let user = store.insert_user("grace").await;
    // 80 XP in the week being closed, 40 more already earned in the next
    // week; the rolling counter reads 120.
    store.add_xp(user.id, WEEK, 80).await;
    store.add_xp(user.id, WEEK + 1, 40).await;
    assert_eq!(store.user(user.id).await.unwrap().unwrap().weekly_xp, 120);

    coordinator(store.clone(), WeeklyConfig::default())
        .run(WEEK)
        .await
        .unwrap();

    let aggregate = store.aggregate(user.id, WEEK).await.unwrap();
    assert_eq!(aggregate.xp_total, 80);
    assert!(!aggregate.earned_streak);
}

#[tokio::test]
async fn retention_cleanup_purges_only_old_read_rows() {
    let store = Arc::new(MemoryStore::new());
    let old_read = store.insert_user("old-read").await;
    let old_unread = store.insert_user("old-unread").await;
    let recent_read = store.insert_user("recent-read").await;

    // Pre-finalize everyone so the run only exercises the downstream stage.
    for user in [&old_read, &old_unread, &recent_read] {
        store.finalize_user_week(user.id, WEEK, 100).await.unwrap();
    }

    for user in [&old_read, &old_unread, &recent_read] {
        store
            .insert_notification(
                user.id,
                "SUBMISSION_PROCESSED",
                "Submission received",
                "Your submission is in the review queue.",
                &serde_json::Value::Null,
            )
            .await
            .unwrap();
    }
    let now = Utc::now();
    store.mark_notifications_read(old_read.id, now).await;
    store.mark_notifications_read(recent_read.id, now).await;
    store
        .backdate_notifications(old_read.id, now - chrono::Duration::days(60))
        .await;
    store
        .backdate_notifications(old_unread.id, now - chrono::Duration::days(60))
        .await;

    store.add_rate_limit_entry(now - chrono::Duration::days(10)).await;
    store.add_rate_limit_entry(now - chrono::Duration::days(1)).await;

    let outcome = coordinator(store.clone(), WeeklyConfig::default())
        .run(WEEK)
        .await
        .unwrap();
    assert_eq!(outcome.total, 0);

    // Only read-and-older-than-retention notifications are gone.
    assert!(store.notifications_for(old_read.id).await.is_empty());
    assert_eq!(store.notifications_for(old_unread.id).await.len(), 1);
    assert_eq!(store.notifications_for(recent_read.id).await.len(), 1);
    assert_eq!(store.rate_limit_entry_count().await, 1);
}

/// WeekStore wrapper that fails the pending-user query, to exercise the
/// failure arm of the lock release.
struct FailingWeeks {
    inner: Arc<MemoryStore>,
}

#[async_trait]
impl WeekStore for FailingWeeks {
    async fn users_pending_reset(&self, _week: i32) -> StoreResult<Vec<Uuid>> {
        Err(StoreError::Missing("users table offline".to_owned()))
    }

    async fn finalize_user_week(
        &self,
        user_id: Uuid,
        week: i32,
        streak_xp_threshold: i64,
    ) -> StoreResult<WeeklyAggregate> {
        self.inner
            .finalize_user_week(user_id, week, streak_xp_threshold)
            .await
    }

    async fn weekly_leaderboard(
        &self,
        week: i32,
        limit: i64,
    ) -> StoreResult<Vec<LeaderboardEntry>> {
        self.inner.weekly_leaderboard(week, limit).await
    }

    async fn top_submission(&self, week: i32) -> StoreResult<Option<Submission>> {
        self.inner.top_submission(week).await
    }

    async fn purge_rate_limit_entries(&self, before: DateTime<Utc>) -> StoreResult<u64> {
        self.inner.purge_rate_limit_entries(before).await
    }

    async fn purge_read_notifications(&self, before: DateTime<Utc>) -> StoreResult<u64> {
        self.inner.purge_read_notifications(before).await
    }

    async fn user(&self, id: Uuid) -> StoreResult<Option<UserRecord>> {
        self.inner.user(id).await
    }
}

#[tokio::test]
async fn a_failed_run_releases_the_lock_with_the_error() {
    let store = Arc::new(MemoryStore::new());
    let failing = WeeklyCoordinator::new(
        WeeklyConfig::default(),
        store.clone(),
        Arc::new(FailingWeeks {
            inner: store.clone(),
        }),
        notify_inline(&store),
    );

    assert!(failing.run(WEEK).await.is_err());

    let lock = store.lock(&lock_name(WEEK)).await.unwrap().unwrap();
    assert_eq!(lock.status, LockStatus::Failed);
    assert!(lock.result.unwrap().contains("users table offline"));

    // The lock is free again for the next scheduled run.
    let retry = coordinator(store.clone(), WeeklyConfig::default())
        .run(WEEK)
        .await
        .unwrap();
    assert!(retry.ran);
}

#[tokio::test]
async fn insights_report_the_leaderboard_and_top_submission() {
    let store = Arc::new(MemoryStore::new());
    let scores = [("ada", 300), ("grace", 200), ("ida", 100)];
    for (name, xp) in scores {
        let user = store.insert_user(name).await;
        store.add_xp(user.id, WEEK, xp).await;
    }

    let (_, runner_up) = seeded(&store, Platform::Blog).await;
    store.finalize_submission(runner_up.id, WEEK, 80).await;
    let (_, best) = seeded(&store, Platform::Youtube).await;
    store.finalize_submission(best.id, WEEK, 95).await;

    coordinator(store.clone(), WeeklyConfig::default())
        .run(WEEK)
        .await
        .unwrap();

    let insights = InsightsService::new(store.clone())
        .weekly_insights(WEEK, 2)
        .await
        .unwrap();
    assert_eq!(insights.week, WEEK);
    assert_eq!(insights.top_performers.len(), 2);
    assert_eq!(insights.top_performers[0].username, "ada");
    assert_eq!(insights.top_performers[0].xp_total, 300);
    assert_eq!(insights.top_performers[1].username, "grace");
    assert_eq!(insights.top_submission.unwrap().id, best.id);
}
