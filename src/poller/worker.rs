//! Poller Worker
//!
//! Periodically fetches due messages, queries the external status source,
//! evaluates the reported transition and applies the outcome.
//!
//! # Cycle
//!
//! ```text
//! find_pollable ─▶ chunk(batch_size) ─▶ for each batch (sequential):
//!                                         join_all(process_message) ─▶ mark_polled(batch)
//! ```
//!
//! Messages inside a batch are processed concurrently; `mark_polled` runs
//! only after every message in the batch has an outcome.

use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::outcome::{CycleReport, PollOutcome};
use super::publisher::{NotificationKind, NotificationPublisher, StatusNotification};
use super::source::StatusSource;
use crate::config::PollerConfig;
use crate::delivery::{
    Axis, DeliveryDecision, Invalidation, MessageDeliveryState, MessageState, RawDeliveryState,
    StateChange, StateTransitionError, StateTransitionEvaluator, resolve,
};
use crate::store::{MessageStateStore, StoreError};

/// Scheduling parameters for the poller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerSettings {
    /// Time between the start of two cycles
    pub poll_interval: Duration,
    /// Messages processed concurrently per batch
    pub batch_size: usize,
}

impl PollerSettings {
    pub fn from_config(config: &PollerConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            batch_size: config.effective_batch_size(),
        }
    }
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            batch_size: 10,
        }
    }
}

/// What the poller does with a changed decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    /// Record the change, then publish if a kind is given
    Persist(Option<NotificationKind>),
    /// Target lifecycle is NEW
    IgnoreRegression,
    /// INVALID target, or a decision `resolve()` never produces
    IgnoreUnexpected,
}

impl Action {
    fn for_decision(to: DeliveryDecision) -> Self {
        match to {
            DeliveryDecision::Pending(_) => Action::Persist(None),
            DeliveryDecision::Transition(MessageDeliveryState::Completed) => {
                Action::Persist(Some(NotificationKind::AppRec))
            }
            DeliveryDecision::Rejected(Axis::AppRec) => {
                Action::Persist(Some(NotificationKind::AppRecRejected))
            }
            DeliveryDecision::Rejected(Axis::Transport) => {
                Action::Persist(Some(NotificationKind::TransportFailure))
            }
            DeliveryDecision::Transition(MessageDeliveryState::New) => Action::IgnoreRegression,
            // Pending and Rejected are expressed as Pending(_) and Rejected(_)
            DeliveryDecision::Transition(
                MessageDeliveryState::Invalid
                | MessageDeliveryState::Pending
                | MessageDeliveryState::Rejected,
            ) => Action::IgnoreUnexpected,
        }
    }
}

/// Delivery state poller
pub struct Poller {
    store: Arc<dyn MessageStateStore>,
    source: Arc<dyn StatusSource>,
    publisher: Arc<dyn NotificationPublisher>,
    settings: PollerSettings,
}

impl Poller {
    pub fn new(
        store: Arc<dyn MessageStateStore>,
        source: Arc<dyn StatusSource>,
        publisher: Arc<dyn NotificationPublisher>,
        settings: PollerSettings,
    ) -> Self {
        Self {
            store,
            source,
            publisher,
            settings,
        }
    }

    pub fn settings(&self) -> &PollerSettings {
        &self.settings
    }

    /// Run cycles until `shutdown` turns true or its sender is dropped.
    ///
    /// Shutdown is observed between cycles only, so an in-flight cycle
    /// always drains.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_interval_ms = self.settings.poll_interval.as_millis() as u64,
            batch_size = self.settings.batch_size,
            "Starting delivery state poller"
        );

        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }

            match self.poll_once().await {
                Ok(report) if report.fetched > 0 => {
                    info!(
                        fetched = report.fetched,
                        batches = report.batches,
                        updated = report.updated,
                        unchanged = report.unchanged,
                        invalid = report.invalid,
                        no_status = report.no_status,
                        failed = report.failed,
                        published = report.published,
                        marked_polled = report.marked_polled,
                        "Poll cycle complete"
                    );
                }
                Ok(_) => debug!("Poll cycle complete, nothing due"),
                Err(e) => error!(error = %e, code = e.code(), "Poll cycle failed"),
            }
        }

        info!("Delivery state poller stopped");
    }

    /// Run one poll cycle.
    ///
    /// Only a failure of the polling query itself is returned; per-message
    /// failures are logged and counted in the report.
    pub async fn poll_once(&self) -> Result<CycleReport, StoreError> {
        let messages = self.store.find_pollable().await?;

        let mut report = CycleReport {
            fetched: messages.len(),
            ..CycleReport::default()
        };

        if messages.is_empty() {
            return Ok(report);
        }

        debug!(count = messages.len(), "Found messages due for polling");

        for batch in messages.chunks(self.settings.batch_size.max(1)) {
            report.batches += 1;
            self.process_batch(batch, &mut report).await;
        }

        Ok(report)
    }

    async fn process_batch(&self, batch: &[MessageState], report: &mut CycleReport) {
        let outcomes = join_all(batch.iter().map(|message| self.process_message(message))).await;
        for outcome in &outcomes {
            report.record(outcome);
        }

        let ids: Vec<String> = batch.iter().map(|m| m.external_ref_id.clone()).collect();
        match self.store.mark_polled(&ids).await {
            Ok(marked) => report.marked_polled += marked,
            Err(e) => {
                // Unmarked messages are simply due again next cycle
                warn!(
                    batch_size = ids.len(),
                    error = %e,
                    "Failed to mark batch as polled"
                );
            }
        }
    }

    /// Fetch, evaluate and apply the reported status for one message
    pub async fn process_message(&self, message: &MessageState) -> PollOutcome {
        let external_ref_id = message.external_ref_id.as_str();

        let statuses = match self.source.get_status(external_ref_id).await {
            Ok(statuses) => statuses,
            Err(e) => {
                warn!(
                    external_ref_id,
                    code = e.code(),
                    error = %e,
                    "Status fetch failed, skipping message"
                );
                return PollOutcome::FetchFailed(e);
            }
        };

        let Some(latest) = statuses.last() else {
            debug!(external_ref_id, "No status reported yet");
            return PollOutcome::NoStatus;
        };

        let new_raw = latest.raw_state();
        let old = message.evaluation_state();
        let new = new_raw.evaluation_state();

        if let Err(e) = StateTransitionEvaluator::evaluate(old, new) {
            error!(
                external_ref_id,
                message_type = %message.message_type,
                from = %old,
                to = %new,
                code = e.code(),
                error = %e,
                "Illegal state transition, lifecycle forced to {}",
                MessageDeliveryState::Invalid
            );
            return self.invalidate(message, new_raw, e).await;
        }

        let from = resolve(old).decision;
        let to = resolve(new).decision;

        // Pending(TRANSPORT) and Pending(APPREC) are both PENDING here
        if from.lifecycle() == to.lifecycle() {
            debug!(external_ref_id, decision = %to, "Delivery state unchanged");
            return PollOutcome::Unchanged(to);
        }

        match Action::for_decision(to) {
            Action::Persist(notify) => self.apply(message, new_raw, from, to, notify).await,
            Action::IgnoreRegression => {
                warn!(external_ref_id, from = %from, "Message resolved back to NEW, ignoring");
                PollOutcome::Ignored(to)
            }
            Action::IgnoreUnexpected => {
                error!(
                    external_ref_id,
                    from = %from,
                    to = %to,
                    "Unexpected target decision, ignoring"
                );
                PollOutcome::Ignored(to)
            }
        }
    }

    /// Persist the forced INVALID lifecycle. The reported pair is not written.
    async fn invalidate(
        &self,
        message: &MessageState,
        rejected: RawDeliveryState,
        error: StateTransitionError,
    ) -> PollOutcome {
        // Terminal rows are never polled; a direct call must not overwrite them
        if message.lifecycle().is_terminal() {
            return PollOutcome::Invalid(error);
        }

        let invalidation = Invalidation {
            external_ref_id: message.external_ref_id.clone(),
            message_type: message.message_type.clone(),
            expected: message.raw_state(),
            rejected,
            at: Utc::now(),
        };

        match self.store.invalidate(invalidation).await {
            Ok(_) => PollOutcome::Invalid(error),
            Err(e) => {
                warn!(
                    external_ref_id = %message.external_ref_id,
                    code = e.code(),
                    error = %e,
                    "Failed to persist INVALID lifecycle, skipping message"
                );
                PollOutcome::PersistFailed(e)
            }
        }
    }

    /// Persist the change, then publish if the decision calls for it
    async fn apply(
        &self,
        message: &MessageState,
        new_raw: RawDeliveryState,
        from: DeliveryDecision,
        to: DeliveryDecision,
        notify: Option<NotificationKind>,
    ) -> PollOutcome {
        let change = StateChange {
            external_ref_id: message.external_ref_id.clone(),
            message_type: message.message_type.clone(),
            old: message.raw_state(),
            new: new_raw,
            at: Utc::now(),
        };

        let snapshot = match self.store.record_state_change(change).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(
                    external_ref_id = %message.external_ref_id,
                    from = %from,
                    to = %to,
                    code = e.code(),
                    error = %e,
                    "Failed to persist state change, skipping message"
                );
                return PollOutcome::PersistFailed(e);
            }
        };

        info!(
            id = %snapshot.state.id,
            external_ref_id = %snapshot.state.external_ref_id,
            from = %from,
            to = %to,
            lifecycle = %snapshot.state.lifecycle(),
            "Delivery state updated"
        );

        let published = match notify {
            Some(kind) => self.publish(&snapshot.state, kind).await,
            None => false,
        };

        PollOutcome::Updated {
            from,
            to,
            published,
        }
    }

    async fn publish(&self, state: &MessageState, kind: NotificationKind) -> bool {
        let notification = StatusNotification::from_state(state, kind);
        let result = match notification.to_bytes() {
            Ok(payload) => self.publisher.publish(state.id, payload).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                debug!(id = %state.id, kind = %kind, "Status notification published");
                true
            }
            Err(e) => {
                warn!(
                    id = %state.id,
                    external_ref_id = %state.external_ref_id,
                    kind = %kind,
                    code = e.code(),
                    error = %e,
                    "Failed to publish status notification"
                );
                false
            }
        }
    }
}
