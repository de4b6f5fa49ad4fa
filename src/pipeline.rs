//! Per-job submission pipeline: fetch → validate → deduplicate → route.
//!
//! Failures attributable to the submission content become terminal rejections
//! here and return `Ok`; only transient conditions (timeout, rate limit,
//! storage trouble) propagate as `Err` to the claim loop's retry policy.
//!
//! A rejection marks the job row FAILED and notifies the user, but leaves the
//! submission itself in its externally-visible state so the user can fix the
//! content and resubmit.

use std::sync::Arc;

use serde_json::json;
use tracing::{instrument, warn};

use crate::collab::{Collaborators, ContentData, DuplicateMode};
use crate::config::ProcessorConfig;
use crate::error::{FetchError, ProcessError, RejectionReason};
use crate::notify::{NotificationKind, NotificationRequest, NotifyHandle};
use crate::store::JobStore;
use crate::{ProcessingJob, Submission, TaskType};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Completed { task_types: Vec<TaskType> },
    Rejected { reason: RejectionReason },
}

pub struct SubmissionPipeline {
    config: ProcessorConfig,
    store: Arc<dyn JobStore>,
    collaborators: Collaborators,
    notify: NotifyHandle,
}

impl SubmissionPipeline {
    pub fn new(
        config: ProcessorConfig,
        store: Arc<dyn JobStore>,
        collaborators: Collaborators,
        notify: NotifyHandle,
    ) -> Self {
        SubmissionPipeline {
            config,
            store,
            collaborators,
            notify,
        }
    }

    #[instrument(skip_all, fields(job_id = %job.id, submission_id = %job.submission_id))]
    pub async fn process(&self, job: &ProcessingJob) -> Result<PipelineOutcome, ProcessError> {
        let submission = self
            .store
            .submission(job.submission_id)
            .await?
            .ok_or_else(|| {
                crate::error::StoreError::Missing(format!(
                    "submission {} not found",
                    job.submission_id
                ))
            })?;

        // Kill switch: degraded-mode operation routes on a heuristic
        // classification without touching the fetchers or the evaluator.
        if !self.config.content_fetch_enabled || !self.config.ai_evaluation_enabled {
            return self.route_without_fetch(job, &submission, "degraded mode").await;
        }

        // Platforms whose extraction is not trusted yet skip straight to
        // review rather than gating users on a flaky fetch path.
        if self.config.platform_fast_paths.contains(&submission.platform) {
            return self.route_without_fetch(job, &submission, "platform fast path").await;
        }

        let fetch = self.collaborators.fetcher.fetch(&submission.url);
        let content = match tokio::time::timeout(self.config.fetch_timeout, fetch).await {
            Err(_) => return Err(ProcessError::TimedOut(self.config.fetch_timeout)),
            Ok(Err(FetchError::Timeout)) => {
                return Err(ProcessError::TimedOut(self.config.fetch_timeout))
            }
            Ok(Err(FetchError::RateLimited(message))) => {
                return Err(ProcessError::RateLimited(message))
            }
            Ok(Err(error)) => {
                // Access denied, extraction failure: retrying will not change
                // the outcome, reject now with an actionable message.
                return self
                    .reject(
                        job,
                        &submission,
                        RejectionReason::ContentFetchFailed,
                        &error.to_string(),
                        format!(
                            "We couldn't read your content at {}: {error}. \
                             Check that the link is public and resubmit.",
                            submission.url
                        ),
                        json!({ "url": submission.url }),
                    )
                    .await;
            }
            Ok(Ok(content)) => content,
        };

        // Validation runs before the duplicate check: it is cheap and local
        // and filters out most invalid submissions first.
        let report = self.collaborators.validator.validate(&content, &submission);
        if !report.is_valid {
            let details = report
                .issues
                .iter()
                .map(|issue| issue.message.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            return self
                .reject(
                    job,
                    &submission,
                    RejectionReason::ValidationFailed,
                    &details,
                    format!(
                        "Your submission doesn't meet the requirements yet: {details}. \
                         Fix the content and resubmit."
                    ),
                    json!({ "issues": report.issues }),
                )
                .await;
        }

        let check = self
            .collaborators
            .dedup
            .check_duplicate(
                &submission.url,
                &content,
                submission.user_id,
                submission.id,
                DuplicateMode::ContentOnly,
            )
            .await?;
        if check.is_duplicate {
            return self
                .reject(
                    job,
                    &submission,
                    RejectionReason::DuplicateContent,
                    "content fingerprint already on record",
                    "This content was already submitted. \
                     Submit new, original content to earn XP."
                        .to_owned(),
                    json!({ "duplicateType": "CONTENT" }),
                )
                .await;
        }

        let task_types = if report.qualifying_task_types.is_empty() {
            submission.platform.default_task_types()
        } else {
            report.qualifying_task_types
        };

        self.collaborators
            .fingerprints
            .store(submission.id, submission.user_id, &content)
            .await?;
        self.store
            .set_submission_task_types(submission.id, &task_types)
            .await?;
        self.hand_off(&submission, &task_types).await;
        self.store.complete_job(job.id).await?;
        self.notify_processed(&submission, &content).await;

        Ok(PipelineOutcome::Completed { task_types })
    }

    /// Shared tail for the kill switch and the platform fast path: classify
    /// heuristically from the platform alone and route straight to review.
    async fn route_without_fetch(
        &self,
        job: &ProcessingJob,
        submission: &Submission,
        cause: &str,
    ) -> Result<PipelineOutcome, ProcessError> {
        let task_types = submission.platform.default_task_types();
        tracing::debug!(cause, ?task_types, "routing without fetch");

        self.store
            .set_submission_task_types(submission.id, &task_types)
            .await?;
        self.hand_off(submission, &task_types).await;
        self.store.complete_job(job.id).await?;

        self.notify
            .dispatch(NotificationRequest {
                user_id: submission.user_id,
                kind: NotificationKind::SubmissionProcessed,
                title: "Submission received".to_owned(),
                message: "Your submission is in the review queue.".to_owned(),
                metadata: json!({ "submissionId": submission.id }),
            })
            .await;

        Ok(PipelineOutcome::Completed { task_types })
    }

    /// The review hand-off sits outside this pipeline's transactional
    /// boundary; a routing failure is logged, not retried.
    async fn hand_off(&self, submission: &Submission, task_types: &[TaskType]) {
        if let Err(error) = self
            .collaborators
            .router
            .ensure_assignments(submission.id, submission.user_id, task_types)
            .await
        {
            warn!(submission_id = %submission.id, %error, "review assignment hand-off failed");
        }
    }

    async fn notify_processed(&self, submission: &Submission, content: &ContentData) {
        self.notify
            .dispatch(NotificationRequest {
                user_id: submission.user_id,
                kind: NotificationKind::SubmissionProcessed,
                title: "Submission in review".to_owned(),
                message: "Your submission passed the checks and was routed to reviewers."
                    .to_owned(),
                metadata: json!({
                    "submissionId": submission.id,
                    "title": content.title,
                }),
            })
            .await;
    }

    /// Terminal rejection: the job row carries the machine-readable reason and
    /// detail, the user gets exactly one actionable notification, and the
    /// submission row is deliberately left untouched.
    async fn reject(
        &self,
        job: &ProcessingJob,
        submission: &Submission,
        reason: RejectionReason,
        detail: &str,
        user_message: String,
        metadata: serde_json::Value,
    ) -> Result<PipelineOutcome, ProcessError> {
        self.store
            .fail_job(job.id, &format!("{}: {detail}", reason.as_str()))
            .await?;

        self.notify
            .dispatch(NotificationRequest {
                user_id: submission.user_id,
                kind: NotificationKind::SubmissionRejected,
                title: "Submission needs changes".to_owned(),
                message: user_message,
                metadata,
            })
            .await;

        Ok(PipelineOutcome::Rejected { reason })
    }
}
