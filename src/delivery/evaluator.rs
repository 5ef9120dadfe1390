//! Transition Evaluators
//!
//! Pure rule checkers deciding whether a move from one delivery state to the
//! next is legal.
//!
//! # Lifecycle Transition Table
//!
//! ```text
//! NEW       → any
//! PENDING   → PENDING | COMPLETED | REJECTED | INVALID
//! COMPLETED → COMPLETED
//! REJECTED  → REJECTED
//! INVALID   → INVALID
//! ```
//!
//! # Rules
//!
//! 1. **AppRec immutability**: a recorded apprec is never overwritten or retracted
//! 2. **Monotonic lifecycle**: no regression, terminal states are final
//! 3. **Cross-axis**: an apprec can only exist once transport is acknowledged
//!
//! Only [`StateTransitionEvaluator`] is used by the poller; the other two are
//! its building blocks.

use super::error::{
    IllegalAppRecTransition, IllegalCombinedState, IllegalTransition, StateTransitionError,
};
use super::resolver::resolve_lifecycle;
use super::status::{AppRecStatus, DeliveryEvaluationState, MessageDeliveryState, TransportStatus};

/// Rule 1: application receipts are write-once
pub struct AppRecTransitionEvaluator;

impl AppRecTransitionEvaluator {
    pub fn evaluate(
        old: Option<AppRecStatus>,
        new: Option<AppRecStatus>,
    ) -> Result<(), IllegalAppRecTransition> {
        match old {
            Some(recorded) if new != Some(recorded) => Err(IllegalAppRecTransition {
                from: old,
                to: new,
            }),
            _ => Ok(()),
        }
    }
}

/// Rule 2: lifecycle progression is monotonic
pub struct TransportTransitionEvaluator;

impl TransportTransitionEvaluator {
    /// Whether `to` is in the allowed set of `from`
    pub fn is_allowed(from: MessageDeliveryState, to: MessageDeliveryState) -> bool {
        use MessageDeliveryState::*;

        match from {
            New => true,
            Pending => matches!(to, Pending | Completed | Rejected | Invalid),
            Completed | Rejected | Invalid => to == from,
        }
    }

    pub fn evaluate(
        old: MessageDeliveryState,
        new: MessageDeliveryState,
    ) -> Result<(), IllegalTransition> {
        if Self::is_allowed(old, new) {
            Ok(())
        } else {
            Err(IllegalTransition { from: old, to: new })
        }
    }
}

/// Combining evaluator: apprec rule, cross-axis invariant, then lifecycle rule
/// on the resolved pair. First failure wins.
pub struct StateTransitionEvaluator;

impl StateTransitionEvaluator {
    pub fn evaluate(
        old: DeliveryEvaluationState,
        new: DeliveryEvaluationState,
    ) -> Result<(), StateTransitionError> {
        AppRecTransitionEvaluator::evaluate(old.app_rec, new.app_rec)?;

        if let Some(app_rec) = new.app_rec
            && new.transport != TransportStatus::Acknowledged
        {
            return Err(IllegalCombinedState {
                transport: new.transport,
                app_rec,
            }
            .into());
        }

        TransportTransitionEvaluator::evaluate(resolve_lifecycle(old), resolve_lifecycle(new))?;
        Ok(())
    }
}
