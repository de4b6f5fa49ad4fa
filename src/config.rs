use std::collections::HashSet;
use std::time::Duration;

use crate::Platform;

/// Operational switches and limits for the claim loop and pipeline, read once
/// at startup and passed into the constructors. Kill switches and per-platform
/// fast paths live here instead of being re-read from the environment per call.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Maximum jobs claimed per `process_batch` invocation.
    pub batch_size: i64,
    /// A job whose retry count reaches this is terminally rejected.
    pub max_retries: i32,
    /// A PROCESSING job older than this is presumed abandoned and reclaimable.
    pub processing_timeout: Duration,
    /// Ceiling on a single content fetch call.
    pub fetch_timeout: Duration,
    /// Fixed cooldown before a rate-limited job becomes eligible again.
    pub rate_limit_cooldown: Duration,
    /// Kill switch: when false, submissions are routed with a heuristic
    /// classification and no content is fetched.
    pub content_fetch_enabled: bool,
    /// Kill switch for the downstream AI evaluation hand-off.
    pub ai_evaluation_enabled: bool,
    /// Spawn a detached `process_batch` right after enqueueing a job.
    pub inline_trigger: bool,
    /// Platforms routed straight to review, bypassing fetch and validation.
    pub platform_fast_paths: HashSet<Platform>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        ProcessorConfig {
            batch_size: 10,
            max_retries: 3,
            processing_timeout: Duration::from_secs(10 * 60),
            fetch_timeout: Duration::from_secs(30),
            rate_limit_cooldown: Duration::from_secs(60),
            content_fetch_enabled: true,
            ai_evaluation_enabled: true,
            inline_trigger: true,
            // Thread extraction is not reliable enough yet to gate reviews on.
            platform_fast_paths: HashSet::from([Platform::Twitter]),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WeeklyConfig {
    /// Users finalized per chunk before a progress write.
    pub user_batch_size: usize,
    /// Staleness timeout for the exclusive run lock. Longer than the job
    /// claim timeout since a full reset can legitimately run for a while.
    pub lock_timeout: Duration,
    /// Weekly XP at or above this earns (and extends) the streak.
    pub streak_xp_threshold: i64,
    /// Leaderboard size generated after the reset.
    pub leaderboard_size: i64,
    /// Retention window for rate-limit bookkeeping rows.
    pub rate_limit_retention: Duration,
    /// Retention window for notifications the user has already read.
    pub notification_retention: Duration,
}

impl Default for WeeklyConfig {
    fn default() -> Self {
        WeeklyConfig {
            user_batch_size: 50,
            lock_timeout: Duration::from_secs(2 * 60 * 60),
            streak_xp_threshold: 100,
            leaderboard_size: 10,
            rate_limit_retention: Duration::from_secs(7 * 24 * 60 * 60),
            notification_retention: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}
