//! Message Intake
//!
//! Starts tracking a message once it has been handed to the external system
//! and its `(external_ref_id, external_message_url)` are known.
//!
//! Conflicts are returned with their kind intact; whether a duplicate is
//! benign is the caller's decision.
//!
//! [`forward_json_lines`] feeds the intake channel from newline-delimited
//! JSON, one camelCase `NewMessage` per line:
//!
//! ```text
//! {"id":"…","externalRefId":"ref-1","messageType":"DIALOG_MESSAGE","externalMessageUrl":"https://…"}
//! ```

use std::io::{self, BufRead};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::delivery::{LifecycleId, MessageSnapshot, NewMessage};
use crate::store::{MessageStateStore, StoreError};

/// Result of a successful registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntakeOutcome {
    /// Tracking started now
    Registered(MessageSnapshot),
    /// The same message was already tracked
    AlreadyRegistered(MessageSnapshot),
}

impl IntakeOutcome {
    pub fn snapshot(&self) -> &MessageSnapshot {
        match self {
            IntakeOutcome::Registered(s) | IntakeOutcome::AlreadyRegistered(s) => s,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, IntakeOutcome::Registered(_))
    }
}

/// Create the initial state for a message
pub async fn register_message(
    store: &dyn MessageStateStore,
    message: NewMessage,
) -> Result<IntakeOutcome, StoreError> {
    let outcome = store.create_initial_state(message).await?;
    Ok(if outcome.is_created() {
        IntakeOutcome::Registered(outcome.into_inner())
    } else {
        IntakeOutcome::AlreadyRegistered(outcome.into_inner())
    })
}

/// Counts from one intake run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntakeStats {
    pub registered: usize,
    pub duplicates: usize,
    pub conflicts: usize,
    pub failed: usize,
}

/// Register every message received on `rx` until the channel closes.
///
/// Identical re-deliveries are treated as already processed. Identity
/// conflicts and store failures are logged and the message is dropped.
pub async fn run_intake(
    store: &dyn MessageStateStore,
    mut rx: mpsc::Receiver<NewMessage>,
) -> IntakeStats {
    let mut stats = IntakeStats::default();

    while let Some(message) = rx.recv().await {
        let id: LifecycleId = message.id;
        let external_ref_id = message.external_ref_id.clone();

        match register_message(store, message).await {
            Ok(IntakeOutcome::Registered(_)) => {
                stats.registered += 1;
            }
            Ok(IntakeOutcome::AlreadyRegistered(_)) => {
                debug!(%id, %external_ref_id, "Message already registered");
                stats.duplicates += 1;
            }
            Err(StoreError::Conflict(conflict)) => {
                error!(
                    %id,
                    %external_ref_id,
                    code = conflict.code(),
                    error = %conflict,
                    "Conflicting message registration"
                );
                stats.conflicts += 1;
            }
            Err(e) => {
                error!(
                    %id,
                    %external_ref_id,
                    code = e.code(),
                    error = %e,
                    "Failed to register message"
                );
                stats.failed += 1;
            }
        }
    }

    info!(
        registered = stats.registered,
        duplicates = stats.duplicates,
        conflicts = stats.conflicts,
        failed = stats.failed,
        "Intake channel closed"
    );
    stats
}

/// Forward newline-delimited JSON messages from `reader` into the intake
/// channel until EOF or until the receiver is gone.
///
/// Blocking; run it on a dedicated thread. Blank lines are skipped and
/// malformed lines are logged and dropped. Returns how many messages were
/// forwarded.
pub fn forward_json_lines<R: BufRead>(
    reader: R,
    tx: &mpsc::Sender<NewMessage>,
) -> io::Result<usize> {
    let mut forwarded = 0;

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match serde_json::from_str::<NewMessage>(line) {
            Ok(message) => {
                if tx.blocking_send(message).is_err() {
                    warn!("Intake channel closed, stopping feed");
                    break;
                }
                forwarded += 1;
            }
            Err(e) => warn!(line = index + 1, error = %e, "Skipping malformed intake line"),
        }
    }

    Ok(forwarded)
}
