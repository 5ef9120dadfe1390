//! Poll Outcomes
//!
//! What happened to one message in one cycle, and the per-cycle tally.

use std::fmt;

use super::source::SourceError;
use crate::delivery::{DeliveryDecision, StateTransitionError};
use crate::store::StoreError;

/// Outcome of processing one message
#[derive(Debug, Clone)]
pub enum PollOutcome {
    /// External system returned no status entries
    NoStatus,
    /// Status fetch failed; message skipped this cycle
    FetchFailed(SourceError),
    /// Resolved lifecycle is the same as the stored one
    Unchanged(DeliveryDecision),
    /// Change persisted
    Updated {
        from: DeliveryDecision,
        to: DeliveryDecision,
        published: bool,
    },
    /// Transition rule violated; lifecycle forced to INVALID, reported pair not written
    Invalid(StateTransitionError),
    /// Persisting the change failed; message skipped this cycle
    PersistFailed(StoreError),
    /// Decision that requires no action (NEW, INVALID or out-of-domain target)
    Ignored(DeliveryDecision),
}

impl PollOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            PollOutcome::NoStatus => "no_status",
            PollOutcome::FetchFailed(_) => "fetch_failed",
            PollOutcome::Unchanged(_) => "unchanged",
            PollOutcome::Updated { .. } => "updated",
            PollOutcome::Invalid(_) => "invalid",
            PollOutcome::PersistFailed(_) => "persist_failed",
            PollOutcome::Ignored(_) => "ignored",
        }
    }
}

impl fmt::Display for PollOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollOutcome::Updated { from, to, published } => {
                write!(f, "updated {} -> {} (published: {})", from, to, published)
            }
            PollOutcome::Invalid(e) => write!(f, "invalid ({})", e.code()),
            PollOutcome::FetchFailed(e) => write!(f, "fetch_failed ({})", e.code()),
            PollOutcome::PersistFailed(e) => write!(f, "persist_failed ({})", e.code()),
            other => f.write_str(other.label()),
        }
    }
}

/// Tally of one poll cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Messages returned by the polling query
    pub fetched: usize,
    pub batches: usize,
    pub unchanged: usize,
    pub updated: usize,
    pub invalid: usize,
    pub no_status: usize,
    pub ignored: usize,
    /// Fetch or persist failures
    pub failed: usize,
    pub published: usize,
    pub marked_polled: u64,
}

impl CycleReport {
    pub fn record(&mut self, outcome: &PollOutcome) {
        match outcome {
            PollOutcome::NoStatus => self.no_status += 1,
            PollOutcome::FetchFailed(_) | PollOutcome::PersistFailed(_) => self.failed += 1,
            PollOutcome::Unchanged(_) => self.unchanged += 1,
            PollOutcome::Updated { published, .. } => {
                self.updated += 1;
                if *published {
                    self.published += 1;
                }
            }
            PollOutcome::Invalid(_) => self.invalid += 1,
            PollOutcome::Ignored(_) => self.ignored += 1,
        }
    }

    /// Messages that reached an outcome, one per fetched message
    pub fn processed(&self) -> usize {
        self.unchanged + self.updated + self.invalid + self.no_status + self.ignored + self.failed
    }
}
