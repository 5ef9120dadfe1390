//! Delivery Tracker
//!
//! Tracks outbound messages handed to an external transport system and
//! reconciles their delivery state from two independently reported axes:
//! transport delivery and application receipt (apprec).
//!
//! # Modules
//!
//! - [`delivery`] - Status model, translator, transition evaluators, resolver
//! - [`store`] - PostgreSQL state repository and transactional service
//! - [`poller`] - Periodic status reconciliation loop and its adapters
//! - [`intake`] - Registration of newly sent messages
//! - [`config`] / [`logging`] / [`db`] - Process plumbing

pub mod config;
pub mod db;
pub mod delivery;
pub mod intake;
pub mod logging;
pub mod poller;
pub mod store;

// Convenient re-exports at crate root
pub use delivery::{
    AppRecStatus, DeliveryDecision, ExternalDeliveryState, MessageDeliveryState,
    StateTransitionError, StateTransitionEvaluator, TransportStatus, resolve, translate,
};
pub use intake::{IntakeOutcome, register_message};
pub use poller::{CycleReport, PollOutcome, Poller, PollerSettings};
pub use store::{LifecycleError, MessageStateStore, StateService, StoreError};
