//! Claim-and-process loop and the retry/rejection policy.
//!
//! Any number of processes may run `process_batch` concurrently; the store's
//! claim step guarantees no job is ever claimed twice. One long-lived
//! [`JobProcessor`] is built at startup and shared by handle.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::collab::Collaborators;
use crate::config::ProcessorConfig;
use crate::error::{ProcessError, RejectionReason, StoreResult};
use crate::notify::{NotificationKind, NotificationRequest, NotifyHandle};
use crate::pipeline::SubmissionPipeline;
use crate::store::JobStore;
use crate::{JobStatus, Priority, ProcessingJob};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Jobs driven to a terminal outcome, deliberate rejections included.
    pub processed: u32,
    /// Jobs that raised a transient error and went to the retry policy.
    pub failed: u32,
}

pub struct JobProcessor {
    config: ProcessorConfig,
    store: Arc<dyn JobStore>,
    pipeline: SubmissionPipeline,
    notify: NotifyHandle,
}

impl JobProcessor {
    pub fn new(
        config: ProcessorConfig,
        store: Arc<dyn JobStore>,
        collaborators: Collaborators,
        notify: NotifyHandle,
    ) -> Self {
        let pipeline = SubmissionPipeline::new(
            config.clone(),
            store.clone(),
            collaborators,
            notify.clone(),
        );
        JobProcessor {
            config,
            store,
            pipeline,
            notify,
        }
    }

    /// Insert a PENDING job for the submission; at most one job exists per
    /// submission, re-enqueueing returns the existing row. With inline
    /// triggering enabled, a detached batch run is spawned so the caller's
    /// request path is unaffected by its outcome.
    pub async fn enqueue(
        self: &Arc<Self>,
        submission_id: Uuid,
        priority: Priority,
    ) -> StoreResult<ProcessingJob> {
        let job = self.store.enqueue_job(submission_id, priority).await?;
        if self.config.inline_trigger {
            self.trigger_detached();
        }
        Ok(job)
    }

    /// Fire-and-forget batch run; errors land in the log, not on the caller.
    pub fn trigger_detached(self: &Arc<Self>) {
        let processor = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(error) = processor.process_batch().await {
                error!(%error, "detached batch run failed");
            }
        });
    }

    /// Claim one batch of eligible jobs and drive each through the pipeline.
    /// A single job's failure never aborts the batch.
    #[instrument(skip(self))]
    pub async fn process_batch(&self) -> StoreResult<BatchOutcome> {
        let jobs = self
            .store
            .claim_batch(
                self.config.batch_size,
                self.config.max_retries,
                self.config.processing_timeout,
            )
            .await?;

        if jobs.is_empty() {
            return Ok(BatchOutcome::default());
        }
        debug!(claimed = jobs.len(), "claimed job batch");

        let mut outcome = BatchOutcome::default();
        for job in &jobs {
            match self.pipeline.process(job).await {
                Ok(_) => outcome.processed += 1,
                Err(failure) => {
                    outcome.failed += 1;
                    self.handle_failure(job, failure).await;
                }
            }
        }

        info!(
            processed = outcome.processed,
            failed = outcome.failed,
            "batch complete"
        );
        Ok(outcome)
    }

    /// Retry policy for transient failures.
    ///
    /// Rate limits are an external condition, not a job defect: the job goes
    /// back to PENDING after a fixed cooldown without consuming a retry, with
    /// no bound on attempts. Other failures retry with exponential backoff
    /// until the budget is spent, then reject terminally.
    async fn handle_failure(&self, job: &ProcessingJob, failure: ProcessError) {
        let result = if failure.is_rate_limited() {
            debug!(job_id = %job.id, "rate limited, deferring without consuming a retry");
            self.store
                .reschedule_job(
                    job.id,
                    &failure.to_string(),
                    self.config.rate_limit_cooldown,
                    false,
                )
                .await
        } else if job.retry_count < self.config.max_retries - 1 {
            let delay = Duration::from_secs(2u64.pow(job.retry_count.clamp(0, 16) as u32));
            debug!(job_id = %job.id, retry_count = job.retry_count, ?delay, %failure,
                "rescheduling with backoff");
            self.store
                .reschedule_job(job.id, &failure.to_string(), delay, true)
                .await
        } else {
            self.reject_exhausted(job, &failure).await
        };

        if let Err(store_error) = result {
            error!(job_id = %job.id, %store_error, "failed to record job failure");
        }
    }

    async fn reject_exhausted(&self, job: &ProcessingJob, failure: &ProcessError) -> StoreResult<()> {
        info!(job_id = %job.id, retry_count = job.retry_count, %failure, "retries exhausted");
        self.store
            .fail_job(
                job.id,
                &format!("{}: {failure}", RejectionReason::ProcessingFailed.as_str()),
            )
            .await?;

        if let Some(submission) = self.store.submission(job.submission_id).await? {
            self.notify
                .dispatch(NotificationRequest {
                    user_id: submission.user_id,
                    kind: NotificationKind::SubmissionRejected,
                    title: "Submission needs changes".to_owned(),
                    message: "We couldn't process your submission after several attempts. \
                              Please resubmit later."
                        .to_owned(),
                    metadata: json!({ "submissionId": submission.id }),
                })
                .await;
        }
        Ok(())
    }

    /// Job counts by status, for operational visibility.
    pub async fn status_counts(&self) -> StoreResult<Vec<(JobStatus, i64)>> {
        self.store.status_counts().await
    }
}
