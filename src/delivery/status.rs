//! Delivery Status Model
//!
//! Value types for the two raw status axes reported by the external system
//! (transport delivery state and application receipt) and the resolved
//! lifecycle that is persisted and published.
//!
//! # Axes
//!
//! ```text
//! ExternalDeliveryState ──translate──▶ TransportStatus ─┐
//!                                                       ├──resolve──▶ MessageDeliveryState
//!                        AppRecStatus (nullable) ───────┘
//! ```
//!
//! Raw values are stored as TEXT using the `as_str()` spelling.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Error returned when a stored or received status string is not recognised
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct UnknownStatus {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownStatus {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Raw delivery state as reported by the external transport system.
///
/// An absent value (`None`) means no signal has been received yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExternalDeliveryState {
    Acknowledged,
    Unconfirmed,
    Rejected,
}

impl ExternalDeliveryState {
    pub const ALL: [ExternalDeliveryState; 3] = [
        ExternalDeliveryState::Acknowledged,
        ExternalDeliveryState::Unconfirmed,
        ExternalDeliveryState::Rejected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExternalDeliveryState::Acknowledged => "ACKNOWLEDGED",
            ExternalDeliveryState::Unconfirmed => "UNCONFIRMED",
            ExternalDeliveryState::Rejected => "REJECTED",
        }
    }

    /// States that still warrant polling the external system
    #[inline]
    pub fn is_pollable(&self) -> bool {
        matches!(
            self,
            ExternalDeliveryState::Acknowledged | ExternalDeliveryState::Unconfirmed
        )
    }
}

impl fmt::Display for ExternalDeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ExternalDeliveryState {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACKNOWLEDGED" => Ok(ExternalDeliveryState::Acknowledged),
            "UNCONFIRMED" => Ok(ExternalDeliveryState::Unconfirmed),
            "REJECTED" => Ok(ExternalDeliveryState::Rejected),
            other => Err(UnknownStatus::new("delivery state", other)),
        }
    }
}

/// Application receipt (AppRec) status.
///
/// Nullable on the message row; `None` means the receipt has not arrived.
/// Once recorded it can never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppRecStatus {
    Ok,
    OkErrorInMessagePart,
    Rejected,
}

impl AppRecStatus {
    pub const ALL: [AppRecStatus; 3] = [
        AppRecStatus::Ok,
        AppRecStatus::OkErrorInMessagePart,
        AppRecStatus::Rejected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AppRecStatus::Ok => "OK",
            AppRecStatus::OkErrorInMessagePart => "OK_ERROR_IN_MESSAGE_PART",
            AppRecStatus::Rejected => "REJECTED",
        }
    }

    /// Receipt accepted the message (possibly with part errors)
    #[inline]
    pub fn is_accepted(&self) -> bool {
        matches!(self, AppRecStatus::Ok | AppRecStatus::OkErrorInMessagePart)
    }
}

impl fmt::Display for AppRecStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AppRecStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OK" => Ok(AppRecStatus::Ok),
            "OK_ERROR_IN_MESSAGE_PART" => Ok(AppRecStatus::OkErrorInMessagePart),
            "REJECTED" => Ok(AppRecStatus::Rejected),
            other => Err(UnknownStatus::new("apprec status", other)),
        }
    }
}

/// Internal transport axis, derived from [`ExternalDeliveryState`].
///
/// `Invalid` is never produced by translation; it exists so the lifecycle
/// can be forced there when the reported state is inconsistent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransportStatus {
    New,
    Pending,
    Acknowledged,
    Rejected,
    Invalid,
}

impl TransportStatus {
    pub const ALL: [TransportStatus; 5] = [
        TransportStatus::New,
        TransportStatus::Pending,
        TransportStatus::Acknowledged,
        TransportStatus::Rejected,
        TransportStatus::Invalid,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportStatus::New => "NEW",
            TransportStatus::Pending => "PENDING",
            TransportStatus::Acknowledged => "ACKNOWLEDGED",
            TransportStatus::Rejected => "REJECTED",
            TransportStatus::Invalid => "INVALID",
        }
    }
}

impl fmt::Display for TransportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Resolved delivery lifecycle
///
/// Terminal states: COMPLETED, REJECTED, INVALID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageDeliveryState {
    New,
    Pending,
    Completed,
    Rejected,
    Invalid,
}

impl MessageDeliveryState {
    pub const ALL: [MessageDeliveryState; 5] = [
        MessageDeliveryState::New,
        MessageDeliveryState::Pending,
        MessageDeliveryState::Completed,
        MessageDeliveryState::Rejected,
        MessageDeliveryState::Invalid,
    ];

    /// Check if this is a terminal state (no more transitions possible)
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MessageDeliveryState::Completed
                | MessageDeliveryState::Rejected
                | MessageDeliveryState::Invalid
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageDeliveryState::New => "NEW",
            MessageDeliveryState::Pending => "PENDING",
            MessageDeliveryState::Completed => "COMPLETED",
            MessageDeliveryState::Rejected => "REJECTED",
            MessageDeliveryState::Invalid => "INVALID",
        }
    }
}

impl fmt::Display for MessageDeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The full input to lifecycle resolution.
///
/// The two axes are always evaluated as a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryEvaluationState {
    pub transport: TransportStatus,
    pub app_rec: Option<AppRecStatus>,
}

impl DeliveryEvaluationState {
    pub fn new(transport: TransportStatus, app_rec: Option<AppRecStatus>) -> Self {
        Self { transport, app_rec }
    }
}

impl fmt::Display for DeliveryEvaluationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.app_rec {
            Some(app_rec) => write!(f, "{}/{}", self.transport, app_rec),
            None => write!(f, "{}/-", self.transport),
        }
    }
}
