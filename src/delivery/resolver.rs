//! Delivery Resolver
//!
//! Maps a `(transport, appRec)` pair to a lifecycle decision.
//!
//! ```text
//! NEW                         → Transition(NEW)
//! PENDING                     → Pending(Transport)
//! ACKNOWLEDGED + -            → Pending(AppRec)
//! ACKNOWLEDGED + REJECTED     → Rejected(AppRec)
//! ACKNOWLEDGED + OK | OK_ERR  → Transition(COMPLETED)
//! REJECTED                    → Rejected(Transport)
//! INVALID                     → Transition(INVALID)
//! ```

use std::fmt;

use super::status::{AppRecStatus, DeliveryEvaluationState, MessageDeliveryState, TransportStatus};

/// Which status axis a pending or rejected decision is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    Transport,
    AppRec,
}

impl Axis {
    pub fn as_str(&self) -> &'static str {
        match self {
            Axis::Transport => "TRANSPORT",
            Axis::AppRec => "APPREC",
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a message is still in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PendingReason {
    WaitingForTransportAcknowledgement,
    WaitingForAppRec,
}

impl PendingReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingReason::WaitingForTransportAcknowledgement => {
                "waiting for transport acknowledgement"
            }
            PendingReason::WaitingForAppRec => "waiting for apprec",
        }
    }
}

impl fmt::Display for PendingReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle decision for one evaluation pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryDecision {
    Transition(MessageDeliveryState),
    Pending(Axis),
    Rejected(Axis),
}

impl DeliveryDecision {
    /// Lifecycle state used when comparing two decisions
    pub fn lifecycle(&self) -> MessageDeliveryState {
        match self {
            DeliveryDecision::Transition(state) => *state,
            DeliveryDecision::Pending(_) => MessageDeliveryState::Pending,
            DeliveryDecision::Rejected(_) => MessageDeliveryState::Rejected,
        }
    }
}

impl fmt::Display for DeliveryDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryDecision::Transition(state) => write!(f, "Transition({})", state),
            DeliveryDecision::Pending(axis) => write!(f, "Pending({})", axis),
            DeliveryDecision::Rejected(axis) => write!(f, "Rejected({})", axis),
        }
    }
}

/// Result of resolving an evaluation pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub decision: DeliveryDecision,
    pub pending_reason: Option<PendingReason>,
}

impl Resolution {
    fn decided(decision: DeliveryDecision) -> Self {
        Self {
            decision,
            pending_reason: None,
        }
    }

    fn pending(axis: Axis, reason: PendingReason) -> Self {
        Self {
            decision: DeliveryDecision::Pending(axis),
            pending_reason: Some(reason),
        }
    }

    #[inline]
    pub fn lifecycle(&self) -> MessageDeliveryState {
        self.decision.lifecycle()
    }
}

/// Resolve an evaluation pair. Pure and total.
///
/// The transport axis dominates: any apprec reported alongside a
/// non-acknowledged transport is ignored here and rejected earlier by the
/// combining evaluator.
pub fn resolve(state: DeliveryEvaluationState) -> Resolution {
    match (state.transport, state.app_rec) {
        (TransportStatus::New, _) => {
            Resolution::decided(DeliveryDecision::Transition(MessageDeliveryState::New))
        }
        (TransportStatus::Pending, _) => Resolution::pending(
            Axis::Transport,
            PendingReason::WaitingForTransportAcknowledgement,
        ),
        (TransportStatus::Acknowledged, None) => {
            Resolution::pending(Axis::AppRec, PendingReason::WaitingForAppRec)
        }
        (TransportStatus::Acknowledged, Some(AppRecStatus::Rejected)) => {
            Resolution::decided(DeliveryDecision::Rejected(Axis::AppRec))
        }
        (
            TransportStatus::Acknowledged,
            Some(AppRecStatus::Ok | AppRecStatus::OkErrorInMessagePart),
        ) => Resolution::decided(DeliveryDecision::Transition(MessageDeliveryState::Completed)),
        (TransportStatus::Rejected, _) => {
            Resolution::decided(DeliveryDecision::Rejected(Axis::Transport))
        }
        (TransportStatus::Invalid, _) => {
            Resolution::decided(DeliveryDecision::Transition(MessageDeliveryState::Invalid))
        }
    }
}

/// Shorthand for `resolve(state).lifecycle()`
#[inline]
pub fn resolve_lifecycle(state: DeliveryEvaluationState) -> MessageDeliveryState {
    resolve(state).lifecycle()
}
