//! Delivery State Poller
//!
//! Drives due messages towards a terminal lifecycle by asking the external
//! system for their current status.
//!
//! # Per-message actions
//!
//! Old and new are compared by resolved lifecycle, so a move between the
//! two pending axes counts as unchanged.
//!
//! | Resolved decision      | Persist | Publish              |
//! |------------------------|---------|----------------------|
//! | unchanged lifecycle    | no      | no                   |
//! | `Pending(*)`           | yes     | no                   |
//! | `Transition(COMPLETED)`| yes     | `APP_REC`            |
//! | `Rejected(APPREC)`     | yes     | `APP_REC_REJECTED`   |
//! | `Rejected(TRANSPORT)`  | yes     | `TRANSPORT_FAILURE`  |
//! | `Transition(NEW)`      | no      | no                   |
//! | `Transition(INVALID)`  | no      | no                   |
//! | rule violation         | marker  | no (forced INVALID)  |

pub mod outcome;
pub mod publisher;
pub mod source;
pub mod worker;

#[cfg(test)]
mod integration_tests;

pub use outcome::{CycleReport, PollOutcome};
pub use publisher::{
    ChannelPublisher, NotificationKind, NotificationPublisher, OutboundNotification,
    PublishError, StatusNotification,
};
pub use source::{ExternalStatus, HttpStatusSource, SourceError, StatusSource};
pub use worker::{Poller, PollerSettings};
