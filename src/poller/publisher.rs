//! Notification Sink
//!
//! Outbound status notifications, keyed by lifecycle id. Delivery is
//! at-least-once per logical event; no ordering across messages.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::delivery::{
    AppRecStatus, ExternalDeliveryState, LifecycleId, MessageDeliveryState, MessageState,
    TransportStatus,
};

/// What a notification reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    /// Application receipt accepted the message
    AppRec,
    /// Application receipt rejected the message
    AppRecRejected,
    /// Transport refused the message
    TransportFailure,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::AppRec => "APP_REC",
            NotificationKind::AppRecRejected => "APP_REC_REJECTED",
            NotificationKind::TransportFailure => "TRANSPORT_FAILURE",
        }
    }
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status notification payload (JSON)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusNotification {
    pub id: LifecycleId,
    pub external_ref_id: String,
    pub message_type: String,
    pub kind: NotificationKind,
    pub delivery_state: MessageDeliveryState,
    pub transport_status: TransportStatus,
    pub external_delivery_state: Option<ExternalDeliveryState>,
    pub app_rec_status: Option<AppRecStatus>,
    pub occurred_at: DateTime<Utc>,
}

impl StatusNotification {
    /// Build from the persisted row after the change was recorded
    pub fn from_state(state: &MessageState, kind: NotificationKind) -> Self {
        let evaluation = state.evaluation_state();
        Self {
            id: state.id,
            external_ref_id: state.external_ref_id.clone(),
            message_type: state.message_type.clone(),
            kind,
            delivery_state: state.lifecycle(),
            transport_status: evaluation.transport,
            external_delivery_state: state.external_delivery_state,
            app_rec_status: state.app_rec_status,
            occurred_at: state.last_state_change,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, PublishError> {
        serde_json::to_vec(self).map_err(|e| PublishError::Encode(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PublishError> {
        serde_json::from_slice(bytes).map_err(|e| PublishError::Encode(e.to_string()))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("Failed to encode notification: {0}")]
    Encode(String),

    #[error("Notification channel closed")]
    Closed,

    #[error("Notification rejected: {0}")]
    Rejected(String),
}

impl PublishError {
    pub fn code(&self) -> &'static str {
        match self {
            PublishError::Encode(_) => "ENCODE_FAILED",
            PublishError::Closed => "CHANNEL_CLOSED",
            PublishError::Rejected(_) => "REJECTED",
        }
    }
}

#[async_trait]
pub trait NotificationPublisher: Send + Sync {
    async fn publish(&self, key: LifecycleId, payload: Vec<u8>) -> Result<(), PublishError>;
}

/// One outbound record on the in-process channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundNotification {
    pub key: LifecycleId,
    pub payload: Vec<u8>,
}

/// Publishes onto a bounded tokio channel; the receiver forwards downstream
#[derive(Clone)]
pub struct ChannelPublisher {
    tx: mpsc::Sender<OutboundNotification>,
}

impl ChannelPublisher {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<OutboundNotification>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl NotificationPublisher for ChannelPublisher {
    async fn publish(&self, key: LifecycleId, payload: Vec<u8>) -> Result<(), PublishError> {
        self.tx
            .send(OutboundNotification { key, payload })
            .await
            .map_err(|_| PublishError::Closed)
    }
}
