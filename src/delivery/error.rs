//! Transition Error Types
//!
//! Domain rule violations found by the transition evaluators. These are
//! values, not panics: the poller turns them into a forced INVALID outcome.

use thiserror::Error;

use super::status::{AppRecStatus, MessageDeliveryState, TransportStatus};

fn app_rec_label(status: &Option<AppRecStatus>) -> &'static str {
    status.map(|s| s.as_str()).unwrap_or("NONE")
}

/// An application receipt was overwritten or retracted
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Illegal apprec transition: {} -> {}", app_rec_label(.from), app_rec_label(.to))]
pub struct IllegalAppRecTransition {
    pub from: Option<AppRecStatus>,
    pub to: Option<AppRecStatus>,
}

/// The resolved lifecycle moved backwards or left a terminal state
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Illegal lifecycle transition: {from} -> {to}")]
pub struct IllegalTransition {
    pub from: MessageDeliveryState,
    pub to: MessageDeliveryState,
}

/// An apprec was reported while transport is not acknowledged
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Illegal combined state: apprec {app_rec} with transport {transport}")]
pub struct IllegalCombinedState {
    pub transport: TransportStatus,
    pub app_rec: AppRecStatus,
}

/// Any failure from the combining state transition evaluator
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateTransitionError {
    #[error(transparent)]
    IllegalAppRecTransition(#[from] IllegalAppRecTransition),

    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransition),

    #[error(transparent)]
    IllegalCombinedState(#[from] IllegalCombinedState),
}

impl StateTransitionError {
    /// Stable code for logs and metrics labels
    pub fn code(&self) -> &'static str {
        match self {
            StateTransitionError::IllegalAppRecTransition(_) => "ILLEGAL_APPREC_TRANSITION",
            StateTransitionError::IllegalTransition(_) => "ILLEGAL_TRANSITION",
            StateTransitionError::IllegalCombinedState(_) => "ILLEGAL_COMBINED_STATE",
        }
    }
}
