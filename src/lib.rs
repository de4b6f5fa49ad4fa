use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use uuid::Uuid;

pub mod collab;
pub mod config;
pub mod db;
pub mod error;
pub mod insights;
pub mod memory;
pub mod notify;
pub mod pipeline;
pub mod processor;
pub mod store;
pub mod telemetry;
pub mod weekly;

/// One unit of background work, tied to exactly one submission.
///
/// Rows are never deleted; terminal rows form the processing audit trail.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProcessingJob {
    pub id: Uuid,
    pub submission_id: Uuid,
    pub status: JobStatus,
    pub priority: Priority,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processing_completed_at: Option<DateTime<Utc>>,
    /// When a retried or rate-limit-deferred job becomes eligible again.
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_status_enum", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Claim ordering only; the Postgres enum is declared LOW → HIGH so that
/// `ORDER BY priority DESC` yields HIGH first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "job_priority_enum", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    Normal,
    High,
}

/// Application-level mutex row guarding one long-running exclusive operation.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RunLock {
    pub job_name: String,
    pub status: LockStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    /// Progress snapshot while RUNNING, final summary once terminal.
    pub result: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "lock_status_enum", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockStatus {
    Running,
    Success,
    Failed,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Submission {
    pub id: Uuid,
    pub user_id: Uuid,
    pub platform: Platform,
    pub url: String,
    pub status: SubmissionStatus,
    pub task_types: Json<Vec<TaskType>>,
    pub final_score: Option<i32>,
    pub week: Option<i32>,
    pub created_at: DateTime<Utc>,
}

/// Externally visible submission state. A rejected submission deliberately
/// stays `Processing` so the user can fix the content and resubmit; only the
/// job row records the failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "submission_status_enum", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmissionStatus {
    Processing,
    UnderReview,
    Finalized,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "platform_enum", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Platform {
    Twitter,
    Youtube,
    Instagram,
    Tiktok,
    Blog,
}

impl Platform {
    /// Heuristic task classification used when fetch/evaluation is skipped
    /// (kill switch or platform fast-path).
    pub fn default_task_types(self) -> Vec<TaskType> {
        match self {
            Platform::Twitter => vec![TaskType::Thread],
            Platform::Youtube => vec![TaskType::Video],
            Platform::Blog => vec![TaskType::Article],
            Platform::Instagram | Platform::Tiktok => vec![TaskType::Social],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    Thread,
    Article,
    Video,
    Social,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserRecord {
    pub id: Uuid,
    pub username: String,
    /// Rolling counters, reset by the weekly coordinator.
    pub weekly_xp: i64,
    pub weekly_reviews: i32,
    pub total_xp: i64,
    pub streak_weeks: i32,
}

/// Once-per-user-per-week XP/streak snapshot. Its existence doubles as the
/// "already processed" marker for idempotent weekly resumption.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WeeklyAggregate {
    pub user_id: Uuid,
    pub week: i32,
    pub xp_total: i64,
    pub reviews_completed: i32,
    pub streak_weeks: i32,
    pub earned_streak: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LeaderboardEntry {
    pub user_id: Uuid,
    pub username: String,
    pub xp_total: i64,
    pub reviews_completed: i32,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: String,
    pub title: String,
    pub message: String,
    pub metadata: Json<serde_json::Value>,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}
