//! Shared fixtures for the integration tests: scripted collaborators around
//! the in-memory store, wired the same way `main` wires the real ones.
#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use subq::collab::{
    Collaborators, ContentData, ContentFetcher, MentionValidator, ReviewRouter, StoreDedup,
};
use subq::config::{ProcessorConfig, WeeklyConfig};
use subq::error::FetchError;
use subq::memory::MemoryStore;
use subq::notify::{NotifyHandle, StoreNotifier};
use subq::processor::JobProcessor;
use subq::weekly::WeeklyCoordinator;
use subq::{Platform, Submission, TaskType, UserRecord};

pub const MENTION: &str = "@reviewhub";
pub const VALID_TEXT: &str = "hello @reviewhub here is my write-up for this week";

pub fn page(text: &str) -> ContentData {
    ContentData {
        title: None,
        text: text.to_owned(),
        metadata: serde_json::Value::Null,
    }
}

/// Fetcher that replays a script of responses, then falls back to a fixed
/// page (or an extraction error when no fallback is set).
pub struct ScriptedFetcher {
    script: Mutex<VecDeque<Result<ContentData, FetchError>>>,
    fallback: Option<String>,
}

impl ScriptedFetcher {
    pub fn always(text: &str) -> Self {
        ScriptedFetcher {
            script: Mutex::new(VecDeque::new()),
            fallback: Some(text.to_owned()),
        }
    }

    pub fn script(steps: Vec<Result<ContentData, FetchError>>) -> Self {
        ScriptedFetcher {
            script: Mutex::new(steps.into()),
            fallback: None,
        }
    }
}

#[async_trait]
impl ContentFetcher for ScriptedFetcher {
    async fn fetch(&self, url: &str) -> Result<ContentData, FetchError> {
        if let Some(step) = self.script.lock().await.pop_front() {
            return step;
        }
        match &self.fallback {
            Some(text) => Ok(page(text)),
            None => Err(FetchError::Extraction(format!(
                "no scripted response left for {url}"
            ))),
        }
    }
}

/// Returns a distinct valid page per URL, so parallel submissions never trip
/// the duplicate check.
pub struct UrlEchoFetcher;

#[async_trait]
impl ContentFetcher for UrlEchoFetcher {
    async fn fetch(&self, url: &str) -> Result<ContentData, FetchError> {
        Ok(page(&format!("{MENTION} original content posted at {url}")))
    }
}

pub struct NullRouter;

#[async_trait]
impl ReviewRouter for NullRouter {
    async fn ensure_assignments(
        &self,
        _submission_id: Uuid,
        _user_id: Uuid,
        _task_types: &[TaskType],
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Default config minus the bits that make tests nondeterministic: no
/// detached batch runs, no platform fast paths.
pub fn quiet_config() -> ProcessorConfig {
    ProcessorConfig {
        inline_trigger: false,
        platform_fast_paths: HashSet::new(),
        ..ProcessorConfig::default()
    }
}

pub fn processor(
    store: Arc<MemoryStore>,
    config: ProcessorConfig,
    fetcher: Arc<dyn ContentFetcher>,
) -> Arc<JobProcessor> {
    let notify = NotifyHandle::inline(Arc::new(StoreNotifier::new(store.clone())));
    let collaborators = Collaborators {
        fetcher,
        validator: Arc::new(MentionValidator {
            required_mention: MENTION.to_owned(),
            required_hashtag: None,
            min_length: 10,
        }),
        dedup: Arc::new(StoreDedup::new(store.clone())),
        fingerprints: Arc::new(StoreDedup::new(store.clone())),
        router: Arc::new(NullRouter),
    };
    Arc::new(JobProcessor::new(config, store, collaborators, notify))
}

pub fn coordinator(store: Arc<MemoryStore>, config: WeeklyConfig) -> WeeklyCoordinator {
    let notify = NotifyHandle::inline(Arc::new(StoreNotifier::new(store.clone())));
    WeeklyCoordinator::new(config, store.clone(), store, notify)
}

pub async fn seeded(store: &MemoryStore, platform: Platform) -> (UserRecord, Submission) {
    let user = store.insert_user(&format!("user-{}", Uuid::new_v4())).await;
    let submission = store
        .insert_submission(
            user.id,
            platform,
            &format!("https://example.com/posts/{}", Uuid::new_v4()),
        )
        .await;
    (user, submission)
}
