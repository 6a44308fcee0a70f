//! Notification instructions.
//!
//! The engine only decides *that* a notification must be produced and *to
//! whom*. Delivery belongs to an external dispatcher fed through [`Notifier`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::GatewayError;

/// Default capacity of the notification channel.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// What the notification is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// A slot offer was extended to a cleaner.
    OfferIssued,
    /// A co-worker dropped out and their rooms are up for grabs.
    ExtraWorkAvailable,
    /// The requester must decide whether an understaffed job goes ahead.
    EdgeCaseDecisionNeeded,
    /// A non-preferred cleaner is waiting for the requester's approval.
    JoinRequestPending,
    /// The cleaner's join request was approved or declined.
    JoinRequestResolved,
    /// Every slot on the job is taken.
    JobFilled,
    /// The job was cancelled.
    JobCancelled,
}

/// "Produce a notification of kind K to recipient R with payload P."
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub recipient: String,
    pub job_id: Uuid,
    pub payload: serde_json::Value,
}

impl Notification {
    pub fn new(
        kind: NotificationKind,
        recipient: impl Into<String>,
        job_id: Uuid,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            kind,
            recipient: recipient.into(),
            job_id,
            payload,
        }
    }
}

/// Sink for notification instructions.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<(), GatewayError>;
}

/// Send a notification, logging instead of failing the calling operation.
pub async fn dispatch(notifier: &dyn Notifier, notification: Notification) {
    let kind = notification.kind;
    let recipient = notification.recipient.clone();
    if let Err(e) = notifier.notify(notification).await {
        warn!(?kind, %recipient, error = %e, "Notification dispatch failed");
    }
}

/// Notifier backed by an mpsc channel; the receiving half is drained by the
/// delivery side (or inspected directly in tests).
#[derive(Clone)]
pub struct ChannelNotifier {
    tx: mpsc::Sender<Notification>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::Receiver<Notification>) {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), GatewayError> {
        debug!(
            kind = ?notification.kind,
            recipient = %notification.recipient,
            job_id = %notification.job_id,
            "Queueing notification"
        );
        self.tx
            .send(notification)
            .await
            .map_err(|e| GatewayError::Unavailable {
                collaborator: "notification dispatcher",
                reason: e.to_string(),
            })
    }
}
