//! Best-effort user notifications.
//!
//! Delivery failures are logged and never re-thrown into the pipeline or the
//! coordinator. The queued mode pushes requests onto a bounded channel drained
//! by a background dispatcher task; the inline mode awaits delivery directly
//! (still swallowing errors) and keeps tests deterministic.

use std::sync::Arc;

use async_channel::{Receiver, Sender};
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::store::NotificationStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    SubmissionProcessed,
    SubmissionRejected,
    WeeklySummary,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::SubmissionProcessed => "SUBMISSION_PROCESSED",
            NotificationKind::SubmissionRejected => "SUBMISSION_REJECTED",
            NotificationKind::WeeklySummary => "WEEKLY_SUMMARY",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NotificationRequest {
    pub user_id: Uuid,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub metadata: serde_json::Value,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, request: &NotificationRequest) -> anyhow::Result<()>;
}

/// Writes notification rows; the delivery surface (web, email) reads them.
pub struct StoreNotifier {
    store: Arc<dyn NotificationStore>,
}

impl StoreNotifier {
    pub fn new(store: Arc<dyn NotificationStore>) -> Self {
        StoreNotifier { store }
    }
}

#[async_trait]
impl Notifier for StoreNotifier {
    async fn notify(&self, request: &NotificationRequest) -> anyhow::Result<()> {
        self.store
            .insert_notification(
                request.user_id,
                request.kind.as_str(),
                &request.title,
                &request.message,
                &request.metadata,
            )
            .await?;
        Ok(())
    }
}

enum Mode {
    Inline(Arc<dyn Notifier>),
    Queued(Sender<NotificationRequest>),
}

#[derive(Clone)]
pub struct NotifyHandle {
    mode: Arc<Mode>,
}

impl NotifyHandle {
    /// Deliver through the notifier directly, awaiting completion.
    pub fn inline(notifier: Arc<dyn Notifier>) -> Self {
        NotifyHandle {
            mode: Arc::new(Mode::Inline(notifier)),
        }
    }

    /// Spawn a background dispatcher draining a bounded queue; the handle's
    /// `dispatch` never blocks on delivery.
    pub fn spawned(
        notifier: Arc<dyn Notifier>,
        capacity: usize,
        cancel_token: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = async_channel::bounded(capacity);
        let worker = tokio::spawn(dispatch_loop(notifier, receiver, cancel_token));
        (
            NotifyHandle {
                mode: Arc::new(Mode::Queued(sender)),
            },
            worker,
        )
    }

    /// Best-effort send; errors and overflow are logged, never propagated.
    pub async fn dispatch(&self, request: NotificationRequest) {
        match &*self.mode {
            Mode::Inline(notifier) => {
                if let Err(error) = notifier.notify(&request).await {
                    warn!(user_id = %request.user_id, kind = request.kind.as_str(),
                        %error, "failed to deliver notification");
                }
            }
            Mode::Queued(sender) => {
                if let Err(error) = sender.try_send(request) {
                    warn!(%error, "notification queue full or closed, dropping notification");
                }
            }
        }
    }
}

async fn dispatch_loop(
    notifier: Arc<dyn Notifier>,
    receiver: Receiver<NotificationRequest>,
    cancel_token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Notification dispatcher cancelled");
                break;
            },
            request = receiver.recv() => {
                match request {
                    Err(_) => break,
                    Ok(request) => {
                        if let Err(error) = notifier.notify(&request).await {
                            warn!(user_id = %request.user_id, kind = request.kind.as_str(),
                                %error, "failed to deliver notification");
                        }
                    }
                }
            }
        }
    }
    info!("Notification dispatcher stopped.");
}
