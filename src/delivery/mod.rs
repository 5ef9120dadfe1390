//! Delivery State Reconciliation
//!
//! Pure domain logic: the two raw status axes reported by the external
//! system, their translation, the transition rules and the resolver that
//! turns a `(transport, appRec)` pair into one lifecycle state.
//!
//! # State Machine (resolved lifecycle)
//!
//! ```text
//! NEW → PENDING → COMPLETED
//!          ↓  ↘
//!     REJECTED  INVALID
//! ```
//!
//! COMPLETED, REJECTED and INVALID are terminal. PENDING may persist across
//! any number of poll cycles.

pub mod error;
pub mod evaluator;
pub mod resolver;
pub mod status;
pub mod translator;
pub mod types;

// Re-exports for convenience
pub use error::{
    IllegalAppRecTransition, IllegalCombinedState, IllegalTransition, StateTransitionError,
};
pub use evaluator::{
    AppRecTransitionEvaluator, StateTransitionEvaluator, TransportTransitionEvaluator,
};
pub use resolver::{Axis, DeliveryDecision, PendingReason, Resolution, resolve};
pub use status::{
    AppRecStatus, DeliveryEvaluationState, ExternalDeliveryState, MessageDeliveryState,
    TransportStatus, UnknownStatus,
};
pub use translator::translate;
pub use types::{
    CreateOutcome, Invalidation, LifecycleId, MessageSnapshot, MessageState, MessageStateChange,
    NewMessage, RawDeliveryState, StateChange, StateCounts,
};
