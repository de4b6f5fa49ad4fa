//! Weekly batch-reset coordinator.
//!
//! One exclusive run per week, guarded by a named lock row. Cron ticks,
//! manual triggers and multiple server instances may all invoke `run`
//! concurrently; everyone but the lock holder returns a zero-progress outcome.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Datelike, Utc};
use serde_json::json;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::WeeklyConfig;
use crate::error::StoreResult;
use crate::notify::{NotificationKind, NotificationRequest, NotifyHandle};
use crate::store::{LockStore, WeekStore};
use crate::{LockStatus, WeeklyAggregate};

/// Week key: ISO year * 100 + ISO week, e.g. 202534.
pub fn week_number(at: DateTime<Utc>) -> i32 {
    let iso = at.iso_week();
    iso.year() * 100 + iso.week() as i32
}

/// The week a reset running at `at` should finalize: the one that just ended.
pub fn previous_week_number(at: DateTime<Utc>) -> i32 {
    week_number(at - chrono::Duration::days(7))
}

pub fn lock_name(week: i32) -> String {
    format!("weekly-reset-{week}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetOutcome {
    /// False when another run held the lock; nothing was touched.
    pub ran: bool,
    pub week: i32,
    pub processed: usize,
    pub failed: usize,
    pub total: usize,
}

impl ResetOutcome {
    fn skipped(week: i32) -> Self {
        ResetOutcome {
            ran: false,
            week,
            processed: 0,
            failed: 0,
            total: 0,
        }
    }
}

pub struct WeeklyCoordinator {
    config: WeeklyConfig,
    locks: Arc<dyn LockStore>,
    weeks: Arc<dyn WeekStore>,
    notify: NotifyHandle,
}

impl WeeklyCoordinator {
    pub fn new(
        config: WeeklyConfig,
        locks: Arc<dyn LockStore>,
        weeks: Arc<dyn WeekStore>,
        notify: NotifyHandle,
    ) -> Self {
        WeeklyCoordinator {
            config,
            locks,
            weeks,
            notify,
        }
    }

    #[instrument(skip(self))]
    pub async fn run(&self, week: i32) -> StoreResult<ResetOutcome> {
        let name = lock_name(week);
        if !self
            .locks
            .try_acquire(&name, self.config.lock_timeout)
            .await?
        {
            info!(week, "weekly reset already in flight, skipping");
            return Ok(ResetOutcome::skipped(week));
        }

        let started = Instant::now();
        let outcome = self.reset_users(week, &name).await;

        // Release on both paths; the lock's staleness timeout only covers the
        // case where this release itself never runs.
        let (status, summary) = match &outcome {
            Ok(outcome) => (
                LockStatus::Success,
                json!({
                    "processed": outcome.processed,
                    "failed": outcome.failed,
                    "total": outcome.total,
                    "durationMs": started.elapsed().as_millis() as u64,
                }),
            ),
            Err(failure) => (LockStatus::Failed, json!({ "error": failure.to_string() })),
        };
        if let Err(release_error) = self.locks.release(&name, status, &summary).await {
            error!(week, %release_error, "failed to release weekly reset lock");
        }

        // Leaderboard and retention cleanup run even after a partial failure.
        self.run_downstream(week).await;

        outcome
    }

    /// Users already holding an aggregate row for the week were finalized by
    /// an earlier (possibly crashed) run and are skipped, so re-entry is safe.
    async fn reset_users(&self, week: i32, lock: &str) -> StoreResult<ResetOutcome> {
        let users = self.weeks.users_pending_reset(week).await?;
        let total = users.len();
        info!(week, total, "starting weekly reset");

        let mut processed = 0usize;
        let mut failed = 0usize;
        for chunk in users.chunks(self.config.user_batch_size.max(1)) {
            for &user_id in chunk {
                match self
                    .weeks
                    .finalize_user_week(user_id, week, self.config.streak_xp_threshold)
                    .await
                {
                    Ok(aggregate) => {
                        processed += 1;
                        self.notify_summary(user_id, &aggregate).await;
                    }
                    Err(failure) => {
                        // Best effort: this user stays unprocessed and will be
                        // picked up by the next scheduled run.
                        failed += 1;
                        warn!(week, %user_id, %failure, "weekly reset failed for user");
                    }
                }
            }
            self.locks
                .write_progress(
                    lock,
                    &json!({ "processed": processed, "failed": failed, "total": total }),
                )
                .await?;
        }

        Ok(ResetOutcome {
            ran: true,
            week,
            processed,
            failed,
            total,
        })
    }

    async fn run_downstream(&self, week: i32) {
        match self
            .weeks
            .weekly_leaderboard(week, self.config.leaderboard_size)
            .await
        {
            Ok(entries) => info!(week, leaders = entries.len(), "weekly leaderboard generated"),
            Err(failure) => warn!(week, %failure, "weekly leaderboard generation failed"),
        }
        match self.weeks.top_submission(week).await {
            Ok(Some(submission)) => {
                info!(week, submission_id = %submission.id, score = ?submission.final_score,
                    "top submission of the week")
            }
            Ok(None) => info!(week, "no finalized submissions this week"),
            Err(failure) => warn!(week, %failure, "top submission lookup failed"),
        }

        let now = Utc::now();
        let rate_limit_cutoff = now
            - chrono::Duration::from_std(self.config.rate_limit_retention)
                .unwrap_or_else(|_| chrono::Duration::zero());
        match self.weeks.purge_rate_limit_entries(rate_limit_cutoff).await {
            Ok(purged) => info!(purged, "purged stale rate limit entries"),
            Err(failure) => warn!(%failure, "rate limit cleanup failed"),
        }

        let notification_cutoff = now
            - chrono::Duration::from_std(self.config.notification_retention)
                .unwrap_or_else(|_| chrono::Duration::zero());
        match self
            .weeks
            .purge_read_notifications(notification_cutoff)
            .await
        {
            Ok(purged) => info!(purged, "purged old read notifications"),
            Err(failure) => warn!(%failure, "notification cleanup failed"),
        }
    }

    async fn notify_summary(&self, user_id: Uuid, aggregate: &WeeklyAggregate) {
        let streak_line = if aggregate.earned_streak {
            format!(" Your streak is now {} weeks.", aggregate.streak_weeks)
        } else {
            String::new()
        };
        self.notify
            .dispatch(NotificationRequest {
                user_id,
                kind: NotificationKind::WeeklySummary,
                title: "Your weekly summary".to_owned(),
                message: format!(
                    "You earned {} XP and completed {} reviews last week.{streak_line}",
                    aggregate.xp_total, aggregate.reviews_completed
                ),
                metadata: json!({
                    "week": aggregate.week,
                    "xpTotal": aggregate.xp_total,
                    "earnedStreak": aggregate.earned_streak,
                }),
            })
            .await;
    }
}
