//! Message State Types
//!
//! Entities persisted by the state store and the inputs used to create and
//! mutate them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use super::resolver::{Resolution, resolve};
use super::status::{
    AppRecStatus, DeliveryEvaluationState, ExternalDeliveryState, MessageDeliveryState,
    TransportStatus,
};
use super::translator::evaluation_state;

/// Caller-assigned lifecycle key
pub type LifecycleId = Uuid;

/// One tracked outbound message.
///
/// `id`, `external_ref_id` and `external_message_url` are each unique.
/// The resolved lifecycle is never stored; it is derived from the raw axes,
/// or is INVALID once `invalidated_at` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageState {
    pub id: LifecycleId,
    pub external_ref_id: String,
    pub message_type: String,
    pub external_message_url: String,
    pub external_delivery_state: Option<ExternalDeliveryState>,
    pub app_rec_status: Option<AppRecStatus>,
    /// When a reported status broke the transition rules. The raw axes keep
    /// the last legal pair.
    pub invalidated_at: Option<DateTime<Utc>>,
    pub last_state_change: DateTime<Utc>,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MessageState {
    /// Fresh row with both raw axes unset
    pub fn new(message: &NewMessage) -> Self {
        Self {
            id: message.id,
            external_ref_id: message.external_ref_id.clone(),
            message_type: message.message_type.clone(),
            external_message_url: message.external_message_url.clone(),
            external_delivery_state: None,
            app_rec_status: None,
            invalidated_at: None,
            last_state_change: message.at,
            last_polled_at: None,
            created_at: message.at,
            updated_at: message.at,
        }
    }

    #[inline]
    pub fn raw_state(&self) -> RawDeliveryState {
        RawDeliveryState {
            delivery_state: self.external_delivery_state,
            app_rec: self.app_rec_status,
        }
    }

    #[inline]
    pub fn is_invalidated(&self) -> bool {
        self.invalidated_at.is_some()
    }

    pub fn evaluation_state(&self) -> DeliveryEvaluationState {
        if self.is_invalidated() {
            return DeliveryEvaluationState::new(TransportStatus::Invalid, self.app_rec_status);
        }
        self.raw_state().evaluation_state()
    }

    pub fn resolution(&self) -> Resolution {
        resolve(self.evaluation_state())
    }

    pub fn lifecycle(&self) -> MessageDeliveryState {
        self.resolution().lifecycle()
    }

    /// Polling eligibility. Mirrors the SQL predicate of the polling query:
    /// the delivery state is unset or still in flight, no apprec has been
    /// recorded, the message was never invalidated, and the last poll (if
    /// any) is older than `cutoff`.
    pub fn is_pollable(&self, cutoff: DateTime<Utc>) -> bool {
        let delivery_open = self
            .external_delivery_state
            .is_none_or(|state| state.is_pollable());
        let due = self.last_polled_at.is_none_or(|at| at < cutoff);
        delivery_open && self.app_rec_status.is_none() && !self.is_invalidated() && due
    }
}

/// Raw `(delivery state, apprec)` pair as stored on the message row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RawDeliveryState {
    pub delivery_state: Option<ExternalDeliveryState>,
    pub app_rec: Option<AppRecStatus>,
}

impl RawDeliveryState {
    pub fn new(
        delivery_state: Option<ExternalDeliveryState>,
        app_rec: Option<AppRecStatus>,
    ) -> Self {
        Self {
            delivery_state,
            app_rec,
        }
    }

    #[inline]
    pub fn evaluation_state(&self) -> DeliveryEvaluationState {
        evaluation_state(self.delivery_state, self.app_rec)
    }
}

/// Append-only history row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageStateChange {
    pub id: i64,
    pub message_id: LifecycleId,
    pub old_delivery_state: Option<ExternalDeliveryState>,
    pub new_delivery_state: Option<ExternalDeliveryState>,
    pub old_app_rec_status: Option<AppRecStatus>,
    pub new_app_rec_status: Option<AppRecStatus>,
    /// Row records a forced INVALID; old and new raw values are equal
    pub forced_invalid: bool,
    pub changed_at: DateTime<Utc>,
}

impl MessageStateChange {
    /// The creation row: all old/new values unset
    pub fn is_baseline(&self) -> bool {
        !self.forced_invalid
            && self.old_delivery_state.is_none()
            && self.new_delivery_state.is_none()
            && self.old_app_rec_status.is_none()
            && self.new_app_rec_status.is_none()
    }
}

/// Message row together with its full history (oldest first)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageSnapshot {
    pub state: MessageState,
    pub history: Vec<MessageStateChange>,
}

/// Request to start tracking a message
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub id: LifecycleId,
    pub external_ref_id: String,
    pub message_type: String,
    pub external_message_url: String,
    /// Registration time; defaults to receipt time
    #[serde(default = "Utc::now")]
    pub at: DateTime<Utc>,
}

impl NewMessage {
    pub fn new(
        id: LifecycleId,
        external_ref_id: impl Into<String>,
        message_type: impl Into<String>,
        external_message_url: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            external_ref_id: external_ref_id.into(),
            message_type: message_type.into(),
            external_message_url: external_message_url.into(),
            at,
        }
    }

    /// Same identity triple as an existing row
    pub fn matches(&self, state: &MessageState) -> bool {
        self.id == state.id
            && self.external_ref_id == state.external_ref_id
            && self.external_message_url == state.external_message_url
    }
}

/// A recorded change of the raw axes for one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub external_ref_id: String,
    pub message_type: String,
    pub old: RawDeliveryState,
    pub new: RawDeliveryState,
    pub at: DateTime<Utc>,
}

/// Request to force a message to INVALID.
///
/// `expected` is the raw pair the caller evaluated against; `rejected` is
/// the reported pair that broke the rules. Only the former is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invalidation {
    pub external_ref_id: String,
    pub message_type: String,
    pub expected: RawDeliveryState,
    pub rejected: RawDeliveryState,
    pub at: DateTime<Utc>,
}

/// Result of an idempotent create
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome<T> {
    /// A new row was written
    Created(T),
    /// An identical row already existed; nothing was written
    Existing(T),
}

impl<T> CreateOutcome<T> {
    #[inline]
    pub fn is_created(&self) -> bool {
        matches!(self, CreateOutcome::Created(_))
    }

    pub fn value(&self) -> &T {
        match self {
            CreateOutcome::Created(v) | CreateOutcome::Existing(v) => v,
        }
    }

    pub fn into_inner(self) -> T {
        match self {
            CreateOutcome::Created(v) | CreateOutcome::Existing(v) => v,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CreateOutcome<U> {
        match self {
            CreateOutcome::Created(v) => CreateOutcome::Created(f(v)),
            CreateOutcome::Existing(v) => CreateOutcome::Existing(f(v)),
        }
    }
}

/// Message counts for observability
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateCounts {
    pub by_delivery_state: HashMap<Option<ExternalDeliveryState>, i64>,
    pub by_app_rec_status: HashMap<Option<AppRecStatus>, i64>,
    pub by_lifecycle: HashMap<MessageDeliveryState, i64>,
}

impl StateCounts {
    /// Build all three groupings from counts keyed by the raw pair and the
    /// invalidated flag
    pub fn from_raw_counts(
        rows: impl IntoIterator<Item = (RawDeliveryState, bool, i64)>,
    ) -> Self {
        let mut counts = StateCounts::default();
        for (raw, invalidated, count) in rows {
            *counts.by_delivery_state.entry(raw.delivery_state).or_default() += count;
            *counts.by_app_rec_status.entry(raw.app_rec).or_default() += count;
            let lifecycle = if invalidated {
                MessageDeliveryState::Invalid
            } else {
                resolve(raw.evaluation_state()).lifecycle()
            };
            *counts.by_lifecycle.entry(lifecycle).or_default() += count;
        }
        counts
    }

    pub fn total(&self) -> i64 {
        self.by_lifecycle.values().sum()
    }
}
