//! Status Translator
//!
//! Maps the external system's raw delivery vocabulary onto the internal
//! transport axis. Total: every input, including "no signal yet", has a
//! defined translation.

use super::status::{AppRecStatus, DeliveryEvaluationState, ExternalDeliveryState, TransportStatus};

/// Translate a raw external delivery state into a [`TransportStatus`]
pub fn translate(external: Option<ExternalDeliveryState>) -> TransportStatus {
    match external {
        None => TransportStatus::New,
        Some(ExternalDeliveryState::Unconfirmed) => TransportStatus::Pending,
        Some(ExternalDeliveryState::Acknowledged) => TransportStatus::Acknowledged,
        Some(ExternalDeliveryState::Rejected) => TransportStatus::Rejected,
    }
}

/// Build the evaluation pair for a raw (delivery state, apprec) combination
pub fn evaluation_state(
    external: Option<ExternalDeliveryState>,
    app_rec: Option<AppRecStatus>,
) -> DeliveryEvaluationState {
    DeliveryEvaluationState::new(translate(external), app_rec)
}
