//! State Store Error Types
//!
//! The three identity conflicts stay distinct so the intake path can decide
//! per kind whether a duplicate is benign or fatal.

use thiserror::Error;

use crate::delivery::{LifecycleId, RawDeliveryState, UnknownStatus};

/// Identity conflict detected while creating a message row
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error(
        "Lifecycle id {id} already tracked with ref {existing_external_ref_id} / url {existing_url} \
         (new: ref {new_external_ref_id} / url {new_url})"
    )]
    ConflictingLifecycleId {
        id: LifecycleId,
        existing_external_ref_id: String,
        existing_url: String,
        new_external_ref_id: String,
        new_url: String,
    },

    #[error("External reference id {external_ref_id} already tracked by {existing_id} (new: {new_id})")]
    ConflictingExternalReferenceId {
        external_ref_id: String,
        existing_id: LifecycleId,
        new_id: LifecycleId,
    },

    #[error("External message url {url} already tracked by {existing_id} (new: {new_id})")]
    ConflictingExternalMessageUrl {
        url: String,
        existing_id: LifecycleId,
        new_id: LifecycleId,
    },
}

impl LifecycleError {
    pub fn code(&self) -> &'static str {
        match self {
            LifecycleError::ConflictingLifecycleId { .. } => "CONFLICTING_LIFECYCLE_ID",
            LifecycleError::ConflictingExternalReferenceId { .. } => {
                "CONFLICTING_EXTERNAL_REFERENCE_ID"
            }
            LifecycleError::ConflictingExternalMessageUrl { .. } => {
                "CONFLICTING_EXTERNAL_MESSAGE_URL"
            }
        }
    }
}

/// State store error types
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error(transparent)]
    Conflict(#[from] LifecycleError),

    #[error("Message not found: {0}")]
    NotFound(String),

    #[error(
        "Concurrent modification of {external_ref_id}: expected {expected:?}, found {actual:?}"
    )]
    ConcurrentModification {
        external_ref_id: String,
        expected: RawDeliveryState,
        actual: RawDeliveryState,
    },

    #[error("Corrupt row: {0}")]
    CorruptRow(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl StoreError {
    /// Get the error code for logs
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Conflict(e) => e.code(),
            StoreError::NotFound(_) => "NOT_FOUND",
            StoreError::ConcurrentModification { .. } => "CONCURRENT_MODIFICATION",
            StoreError::CorruptRow(_) => "CORRUPT_ROW",
            StoreError::Database(_) => "DATABASE_ERROR",
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<UnknownStatus> for StoreError {
    fn from(e: UnknownStatus) -> Self {
        StoreError::CorruptRow(e.to_string())
    }
}
