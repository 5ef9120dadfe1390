//! Message State Store
//!
//! Persistence of tracked messages and their append-only history.
//!
//! # Layers
//!
//! - [`repository::MessageStateRepository`]: single SQL operations on one connection
//! - [`service::StateService`]: transactional units of work over the repository
//! - [`MessageStateStore`]: the trait the poller and intake depend on
//!
//! # Safety Invariants
//!
//! 1. **Baseline history**: every message row has at least one history row
//! 2. **Atomic record**: a row update and its history row commit together
//! 3. **CAS update**: a change is applied only if the stored raw axes still
//!    equal the caller's `old` values
//! 4. **Idempotent create**: an identical create returns the existing row
//! 5. **Sticky INVALID**: an invalidated row keeps its last legal raw pair,
//!    is never polled and rejects every further change

pub mod error;
pub mod repository;
pub mod service;

#[cfg(test)]
pub mod mock;

pub use error::{LifecycleError, StoreError};
pub use repository::MessageStateRepository;
pub use service::StateService;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use std::time::Duration;

use crate::delivery::{
    CreateOutcome, Invalidation, MessageSnapshot, MessageState, NewMessage, StateChange,
    StateCounts,
};

/// Transactional state operations used by the poller and the intake path
#[async_trait]
pub trait MessageStateStore: Send + Sync {
    /// Create the message row and its baseline history row in one unit.
    ///
    /// Idempotent on the `(id, external_ref_id, url)` triple; any other
    /// overlap fails with a [`LifecycleError`].
    async fn create_initial_state(
        &self,
        message: NewMessage,
    ) -> Result<CreateOutcome<MessageSnapshot>, StoreError>;

    /// Update the raw axes and append one history row, atomically
    async fn record_state_change(&self, change: StateChange)
    -> Result<MessageSnapshot, StoreError>;

    /// Force the lifecycle to INVALID and append a history row, atomically.
    /// The raw axes are left as they are.
    async fn invalidate(&self, invalidation: Invalidation)
    -> Result<MessageSnapshot, StoreError>;

    async fn get_snapshot(&self, external_ref_id: &str)
    -> Result<Option<MessageSnapshot>, StoreError>;

    /// Messages due for polling, never-polled first
    async fn find_pollable(&self) -> Result<Vec<MessageState>, StoreError>;

    /// Stamp `last_polled_at = now` on the given messages.
    /// Returns how many rows were actually updated.
    async fn mark_polled(&self, external_ref_ids: &[String]) -> Result<u64, StoreError>;

    async fn state_counts(&self) -> Result<StateCounts, StoreError>;
}

/// Polling eligibility parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollingQuery {
    /// Minimum time since the last poll before a message is due again
    pub min_poll_age: Duration,
    /// Maximum messages returned per query
    pub fetch_limit: usize,
}

impl PollingQuery {
    pub fn new(min_poll_age: Duration, fetch_limit: usize) -> Self {
        Self {
            min_poll_age,
            fetch_limit,
        }
    }

    /// Messages polled at or after the cutoff are not yet due
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        TimeDelta::from_std(self.min_poll_age)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

impl Default for PollingQuery {
    fn default() -> Self {
        Self {
            min_poll_age: Duration::from_secs(60),
            fetch_limit: 100,
        }
    }
}

/// Classify rows that collided with a create request.
///
/// `existing` holds every row sharing the id, the external reference id or
/// the url with `message`. Returns `None` when none of them overlap.
/// The lifecycle id is checked first, then the reference id, then the url.
pub fn classify_conflict(
    message: &NewMessage,
    existing: &[MessageState],
) -> Option<Result<MessageState, LifecycleError>> {
    if let Some(row) = existing.iter().find(|row| row.id == message.id) {
        if message.matches(row) {
            return Some(Ok(row.clone()));
        }
        return Some(Err(LifecycleError::ConflictingLifecycleId {
            id: message.id,
            existing_external_ref_id: row.external_ref_id.clone(),
            existing_url: row.external_message_url.clone(),
            new_external_ref_id: message.external_ref_id.clone(),
            new_url: message.external_message_url.clone(),
        }));
    }

    if let Some(row) = existing
        .iter()
        .find(|row| row.external_ref_id == message.external_ref_id)
    {
        return Some(Err(LifecycleError::ConflictingExternalReferenceId {
            external_ref_id: message.external_ref_id.clone(),
            existing_id: row.id,
            new_id: message.id,
        }));
    }

    existing
        .iter()
        .find(|row| row.external_message_url == message.external_message_url)
        .map(|row| {
            Err(LifecycleError::ConflictingExternalMessageUrl {
                url: message.external_message_url.clone(),
                existing_id: row.id,
                new_id: message.id,
            })
        })
}
