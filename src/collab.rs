//! External collaborator contracts consumed by the pipeline, and the minimal
//! built-in implementations. The heavyweight collaborators (the AI content
//! evaluator, the platform-specific thread extractors, the peer-review
//! assignment subsystem) live outside this crate and are only reached through
//! these traits.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{FetchError, ValidationIssue};
use crate::store::JobStore;
use crate::{Platform, Submission, TaskType};

/// Extracted content as returned by a fetcher.
#[derive(Debug, Clone)]
pub struct ContentData {
    pub title: Option<String>,
    pub text: String,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub qualifying_task_types: Vec<TaskType>,
    pub issues: Vec<ValidationIssue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateMode {
    /// URL-level duplicates; checked upstream at submission time.
    UrlOnly,
    /// Content fingerprint match, the mode the pipeline uses.
    ContentOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateKind {
    Url,
    Content,
}

#[derive(Debug, Clone, Copy)]
pub struct DuplicateCheck {
    pub is_duplicate: bool,
    pub duplicate_type: Option<DuplicateKind>,
}

#[async_trait]
pub trait ContentFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<ContentData, FetchError>;
}

/// Pure, local validation; no I/O beyond the passed content.
pub trait ContentValidator: Send + Sync {
    fn validate(&self, content: &ContentData, submission: &Submission) -> ValidationReport;
}

#[async_trait]
pub trait DuplicateDetector: Send + Sync {
    async fn check_duplicate(
        &self,
        url: &str,
        content: &ContentData,
        user_id: Uuid,
        submission_id: Uuid,
        mode: DuplicateMode,
    ) -> anyhow::Result<DuplicateCheck>;
}

/// Idempotent; safe to call once per validated, non-duplicate submission.
#[async_trait]
pub trait FingerprintSink: Send + Sync {
    async fn store(
        &self,
        submission_id: Uuid,
        user_id: Uuid,
        content: &ContentData,
    ) -> anyhow::Result<()>;
}

/// Fire-and-forget hand-off to the peer-review assignment subsystem.
#[async_trait]
pub trait ReviewRouter: Send + Sync {
    async fn ensure_assignments(
        &self,
        submission_id: Uuid,
        user_id: Uuid,
        task_types: &[TaskType],
    ) -> anyhow::Result<()>;
}

/// Bundled collaborator handles passed into the pipeline constructor.
#[derive(Clone)]
pub struct Collaborators {
    pub fetcher: Arc<dyn ContentFetcher>,
    pub validator: Arc<dyn ContentValidator>,
    pub dedup: Arc<dyn DuplicateDetector>,
    pub fingerprints: Arc<dyn FingerprintSink>,
    pub router: Arc<dyn ReviewRouter>,
}

/// Plain HTTP fetcher. Platform-specific thread extraction is out of scope;
/// this pulls the page body and classifies transport failures so the pipeline
/// can tell retryable conditions from terminal ones.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("subq/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(HttpFetcher { client })
    }
}

#[async_trait]
impl ContentFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<ContentData, FetchError> {
        let response = self.client.get(url).send().await.map_err(|err| {
            if err.is_timeout() {
                FetchError::Timeout
            } else {
                FetchError::Extraction(err.to_string())
            }
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(FetchError::RateLimited(format!("{url} returned 429")));
        }
        if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(FetchError::AccessDenied(format!("{url} returned {status}")));
        }
        if !status.is_success() {
            return Err(FetchError::Extraction(format!(
                "{url} returned unexpected status {status}"
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|err| FetchError::Extraction(err.to_string()))?;
        if body.trim().is_empty() {
            return Err(FetchError::Extraction(format!("{url} returned no content")));
        }

        let metadata = serde_json::json!({ "content_length": body.len() });
        Ok(ContentData {
            title: extract_title(&body),
            text: body,
            metadata,
        })
    }
}

fn extract_title(body: &str) -> Option<String> {
    let start = body.find("<title>")? + "<title>".len();
    let end = body[start..].find("</title>")? + start;
    let title = body[start..end].trim();
    (!title.is_empty()).then(|| title.to_owned())
}

/// Checks the community posting requirements: the platform mention, an
/// optional campaign hashtag, and a minimum content length. Issue messages are
/// written for the submitting user, who sees them verbatim in the rejection
/// notification.
pub struct MentionValidator {
    pub required_mention: String,
    pub required_hashtag: Option<String>,
    pub min_length: usize,
}

impl MentionValidator {
    pub fn new(required_mention: impl Into<String>) -> Self {
        MentionValidator {
            required_mention: required_mention.into(),
            required_hashtag: None,
            min_length: 280,
        }
    }
}

impl ContentValidator for MentionValidator {
    fn validate(&self, content: &ContentData, submission: &Submission) -> ValidationReport {
        let mut issues = Vec::new();
        let text_lower = content.text.to_lowercase();

        if !text_lower.contains(&self.required_mention.to_lowercase()) {
            issues.push(ValidationIssue {
                requirement: "required_mention".to_owned(),
                message: format!("add the required mention {}", self.required_mention),
            });
        }
        if let Some(hashtag) = &self.required_hashtag {
            if !text_lower.contains(&hashtag.to_lowercase()) {
                issues.push(ValidationIssue {
                    requirement: "required_hashtag".to_owned(),
                    message: format!("add the required hashtag {hashtag}"),
                });
            }
        }
        let length = content.text.chars().count();
        if length < self.min_length {
            issues.push(ValidationIssue {
                requirement: "min_length".to_owned(),
                message: format!(
                    "content is too short ({length} characters, {} required)",
                    self.min_length
                ),
            });
        }

        let mut qualifying_task_types = submission.platform.default_task_types();
        if length >= 2000
            && submission.platform == Platform::Blog
            && !qualifying_task_types.contains(&TaskType::Article)
        {
            qualifying_task_types.push(TaskType::Article);
        }

        ValidationReport {
            is_valid: issues.is_empty(),
            qualifying_task_types,
            issues,
        }
    }
}

/// Content fingerprinting over the store's fingerprint table: one SHA-256
/// digest of the normalized text per submission.
pub struct StoreDedup {
    store: Arc<dyn JobStore>,
}

impl StoreDedup {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        StoreDedup { store }
    }
}

pub fn content_digest(content: &ContentData) -> String {
    let normalized = content
        .text
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    let digest = Sha256::digest(normalized.as_bytes());
    hex::encode(digest)
}

#[async_trait]
impl DuplicateDetector for StoreDedup {
    async fn check_duplicate(
        &self,
        url: &str,
        content: &ContentData,
        _user_id: Uuid,
        submission_id: Uuid,
        mode: DuplicateMode,
    ) -> anyhow::Result<DuplicateCheck> {
        if mode == DuplicateMode::UrlOnly {
            // URL-level duplicates are rejected at submission time, before a
            // job ever exists.
            debug!(url, "url-only duplicate check delegated upstream");
            return Ok(DuplicateCheck {
                is_duplicate: false,
                duplicate_type: None,
            });
        }

        let digest = content_digest(content);
        let existing = self.store.find_duplicate(&digest, submission_id).await?;
        Ok(DuplicateCheck {
            is_duplicate: existing.is_some(),
            duplicate_type: existing.map(|_| DuplicateKind::Content),
        })
    }
}

#[async_trait]
impl FingerprintSink for StoreDedup {
    async fn store(
        &self,
        submission_id: Uuid,
        user_id: Uuid,
        content: &ContentData,
    ) -> anyhow::Result<()> {
        let digest = content_digest(content);
        self.store
            .store_fingerprint(submission_id, user_id, &digest)
            .await?;
        Ok(())
    }
}

/// Stand-in router used until the peer-review subsystem is wired in; the
/// hand-off is logged so dropped assignments are visible.
pub struct LogRouter;

#[async_trait]
impl ReviewRouter for LogRouter {
    async fn ensure_assignments(
        &self,
        submission_id: Uuid,
        user_id: Uuid,
        task_types: &[TaskType],
    ) -> anyhow::Result<()> {
        info!(%submission_id, %user_id, ?task_types, "review assignment hand-off");
        Ok(())
    }
}
