//! Poller cycle tests against the in-memory store, a scripted status source
//! and a recording publisher.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::outcome::PollOutcome;
use super::publisher::NotificationKind;
use super::publisher::mock::RecordingPublisher;
use super::source::ExternalStatus;
use super::source::mock::MockStatusSource;
use super::worker::{Poller, PollerSettings};
use crate::delivery::{
    AppRecStatus, Axis, DeliveryDecision, ExternalDeliveryState, MessageDeliveryState,
    NewMessage, RawDeliveryState, StateTransitionError,
};
use crate::store::mock::InMemoryStateStore;
use crate::store::{MessageStateStore, PollingQuery, StoreError};

struct Harness {
    store: Arc<InMemoryStateStore>,
    source: Arc<MockStatusSource>,
    publisher: Arc<RecordingPublisher>,
    poller: Poller,
}

fn harness(batch_size: usize) -> Harness {
    let store = Arc::new(InMemoryStateStore::new(PollingQuery::new(
        Duration::from_secs(60),
        100,
    )));
    let source = Arc::new(MockStatusSource::new());
    let publisher = Arc::new(RecordingPublisher::new());
    let poller = Poller::new(
        store.clone(),
        source.clone(),
        publisher.clone(),
        PollerSettings {
            poll_interval: Duration::from_secs(30),
            batch_size,
        },
    );
    Harness {
        store,
        source,
        publisher,
        poller,
    }
}

impl Harness {
    async fn track(&self, external_ref_id: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.store
            .create_initial_state(NewMessage::new(
                id,
                external_ref_id,
                "DIALOG_MESSAGE",
                format!("https://transport.test/messages/{}", external_ref_id),
                Utc::now(),
            ))
            .await
            .unwrap();
        id
    }

    fn lifecycle(&self, external_ref_id: &str) -> MessageDeliveryState {
        self.store.get(external_ref_id).unwrap().lifecycle()
    }

    /// Make messages due again
    fn age_polls(&self, external_ref_ids: &[&str]) {
        let long_ago = Utc::now() - chrono::Duration::hours(1);
        for id in external_ref_ids {
            self.store.set_last_polled(id, Some(long_ago));
        }
    }
}

// ============================================================================
// Lifecycle scenarios
// ============================================================================

#[tokio::test]
async fn test_new_message_acknowledged_becomes_pending() {
    let h = harness(10);
    h.track("ref-1").await;

    let due = h.store.find_pollable().await.unwrap();
    assert_eq!(due.len(), 1);

    h.source
        .report("ref-1", ExternalDeliveryState::Acknowledged, None);
    let report = h.poller.poll_once().await.unwrap();

    assert_eq!(report.fetched, 1);
    assert_eq!(report.updated, 1);
    assert_eq!(report.published, 0);
    assert_eq!(h.lifecycle("ref-1"), MessageDeliveryState::Pending);
    assert_eq!(h.publisher.count(), 0, "pending is never published");
    assert_eq!(h.store.history_len("ref-1"), 2);
}

#[tokio::test]
async fn test_pending_then_apprec_ok_completes_and_publishes_once() {
    let h = harness(10);
    let id = h.track("ref-1").await;

    h.source
        .report("ref-1", ExternalDeliveryState::Acknowledged, None);
    h.poller.poll_once().await.unwrap();

    h.age_polls(&["ref-1"]);
    h.source.report(
        "ref-1",
        ExternalDeliveryState::Acknowledged,
        Some(AppRecStatus::Ok),
    );
    let report = h.poller.poll_once().await.unwrap();

    assert_eq!(report.updated, 1);
    assert_eq!(report.published, 1);
    assert_eq!(h.lifecycle("ref-1"), MessageDeliveryState::Completed);

    let notifications = h.publisher.notifications();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].kind, NotificationKind::AppRec);
    assert_eq!(notifications[0].app_rec_status, Some(AppRecStatus::Ok));
    assert_eq!(notifications[0].delivery_state, MessageDeliveryState::Completed);
    assert_eq!(h.publisher.keys(), vec![id]);

    // Completed messages are never polled again
    h.age_polls(&["ref-1"]);
    let report = h.poller.poll_once().await.unwrap();
    assert_eq!(report.fetched, 0);
    assert_eq!(h.publisher.count(), 1);
}

#[tokio::test]
async fn test_transport_rejection_publishes_failure_and_stops_polling() {
    let h = harness(10);
    h.track("ref-1").await;

    h.source
        .report("ref-1", ExternalDeliveryState::Rejected, None);
    let report = h.poller.poll_once().await.unwrap();

    assert_eq!(report.published, 1);
    assert_eq!(h.lifecycle("ref-1"), MessageDeliveryState::Rejected);
    assert_eq!(
        h.publisher.notifications()[0].kind,
        NotificationKind::TransportFailure
    );

    h.age_polls(&["ref-1"]);
    assert!(h.store.find_pollable().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_apprec_without_acknowledgement_is_invalid() {
    let h = harness(10);
    h.track("ref-1").await;
    let fresh = h.store.get("ref-1").unwrap();

    h.source.report(
        "ref-1",
        ExternalDeliveryState::Unconfirmed,
        Some(AppRecStatus::Rejected),
    );
    match h.poller.process_message(&fresh).await {
        PollOutcome::Invalid(StateTransitionError::IllegalCombinedState(e)) => {
            assert_eq!(e.app_rec, AppRecStatus::Rejected);
        }
        other => panic!("expected illegal combined state, got {}", other),
    }

    assert_eq!(h.lifecycle("ref-1"), MessageDeliveryState::Invalid);
    assert_eq!(h.publisher.count(), 0);
    // The illegal pair itself is never written
    let stored = h.store.get("ref-1").unwrap();
    assert_eq!(stored.raw_state(), RawDeliveryState::default());
    assert!(stored.invalidated_at.is_some());

    let snapshot = h.store.get_snapshot("ref-1").await.unwrap().unwrap();
    assert_eq!(snapshot.history.len(), 2);
    assert!(snapshot.history[1].forced_invalid);

    // INVALID is terminal and never polled again
    h.age_polls(&["ref-1"]);
    let report = h.poller.poll_once().await.unwrap();
    assert_eq!(report.fetched, 0);
    assert_eq!(h.source.calls(), 1);
}

#[tokio::test]
async fn test_invalid_cycle_is_counted_and_stops_polling() {
    let h = harness(10);
    h.track("ref-1").await;

    h.source.report(
        "ref-1",
        ExternalDeliveryState::Unconfirmed,
        Some(AppRecStatus::Rejected),
    );
    let report = h.poller.poll_once().await.unwrap();

    assert_eq!(report.invalid, 1);
    assert_eq!(report.updated, 0);
    assert_eq!(h.lifecycle("ref-1"), MessageDeliveryState::Invalid);

    h.age_polls(&["ref-1"]);
    assert!(h.store.find_pollable().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_invalid_persist_failure_keeps_message_due() {
    let h = harness(10);
    h.track("ref-1").await;
    h.store.set_fail_record(true);

    h.source.report(
        "ref-1",
        ExternalDeliveryState::Unconfirmed,
        Some(AppRecStatus::Rejected),
    );
    let report = h.poller.poll_once().await.unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(report.invalid, 0);
    assert_eq!(h.lifecycle("ref-1"), MessageDeliveryState::New);

    h.store.set_fail_record(false);
    h.age_polls(&["ref-1"]);
    let report = h.poller.poll_once().await.unwrap();
    assert_eq!(report.invalid, 1);
    assert_eq!(h.lifecycle("ref-1"), MessageDeliveryState::Invalid);
}

#[tokio::test]
async fn test_apprec_rejection_publishes_rejection() {
    let h = harness(10);
    h.track("ref-1").await;

    h.source.report(
        "ref-1",
        ExternalDeliveryState::Acknowledged,
        Some(AppRecStatus::Rejected),
    );
    h.poller.poll_once().await.unwrap();

    assert_eq!(h.lifecycle("ref-1"), MessageDeliveryState::Rejected);
    let notifications = h.publisher.notifications();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].kind, NotificationKind::AppRecRejected);
    assert_eq!(notifications[0].app_rec_status, Some(AppRecStatus::Rejected));
}

#[tokio::test]
async fn test_backwards_transition_is_invalid() {
    let h = harness(10);
    h.track("ref-1").await;
    h.store.overwrite_raw(
        "ref-1",
        RawDeliveryState::new(Some(ExternalDeliveryState::Rejected), None),
    );
    let state = h.store.get("ref-1").unwrap();

    h.source
        .report("ref-1", ExternalDeliveryState::Acknowledged, None);
    let outcome = h.poller.process_message(&state).await;

    assert!(matches!(
        outcome,
        PollOutcome::Invalid(StateTransitionError::IllegalTransition(_))
    ));
    // A terminal lifecycle is left alone
    assert_eq!(h.lifecycle("ref-1"), MessageDeliveryState::Rejected);
    assert_eq!(h.store.history_len("ref-1"), 1);
}

// ============================================================================
// Per-message outcomes
// ============================================================================

#[tokio::test]
async fn test_uses_last_status_entry() {
    let h = harness(10);
    h.track("ref-1").await;

    h.source.set_status(
        "ref-1",
        vec![
            ExternalStatus::new(ExternalDeliveryState::Unconfirmed, None),
            ExternalStatus::new(ExternalDeliveryState::Acknowledged, Some(AppRecStatus::Ok)),
        ],
    );
    h.poller.poll_once().await.unwrap();

    assert_eq!(h.lifecycle("ref-1"), MessageDeliveryState::Completed);
}

#[tokio::test]
async fn test_no_status_leaves_message_untouched() {
    let h = harness(10);
    h.track("ref-1").await;

    let report = h.poller.poll_once().await.unwrap();

    assert_eq!(report.no_status, 1);
    assert_eq!(report.marked_polled, 1);
    assert_eq!(h.store.history_len("ref-1"), 1);
    assert!(h.store.get("ref-1").unwrap().last_polled_at.is_some());
}

#[tokio::test]
async fn test_unchanged_decision_is_not_persisted() {
    let h = harness(10);
    h.track("ref-1").await;
    h.source
        .report("ref-1", ExternalDeliveryState::Acknowledged, None);
    h.poller.poll_once().await.unwrap();

    h.age_polls(&["ref-1"]);
    let report = h.poller.poll_once().await.unwrap();

    assert_eq!(report.unchanged, 1);
    assert_eq!(report.updated, 0);
    assert_eq!(h.store.history_len("ref-1"), 2);
}

#[tokio::test]
async fn test_pending_axis_change_is_unchanged() {
    let h = harness(10);
    h.track("ref-1").await;
    h.source
        .report("ref-1", ExternalDeliveryState::Unconfirmed, None);
    h.poller.poll_once().await.unwrap();
    assert_eq!(h.store.history_len("ref-1"), 2);

    h.age_polls(&["ref-1"]);
    h.source
        .report("ref-1", ExternalDeliveryState::Acknowledged, None);
    let report = h.poller.poll_once().await.unwrap();

    assert_eq!(report.unchanged, 1);
    assert_eq!(report.updated, 0);
    assert_eq!(h.store.history_len("ref-1"), 2);
    assert_eq!(h.publisher.count(), 0);
    assert_eq!(
        h.store.get("ref-1").unwrap().external_delivery_state,
        Some(ExternalDeliveryState::Unconfirmed)
    );

    let state = h.store.get("ref-1").unwrap();
    assert!(matches!(
        h.poller.process_message(&state).await,
        PollOutcome::Unchanged(DeliveryDecision::Pending(Axis::AppRec))
    ));

    // The apprec still completes the message from the stored UNCONFIRMED row
    h.age_polls(&["ref-1"]);
    h.source.report(
        "ref-1",
        ExternalDeliveryState::Acknowledged,
        Some(AppRecStatus::Ok),
    );
    let report = h.poller.poll_once().await.unwrap();
    assert_eq!(report.updated, 1);
    assert_eq!(report.published, 1);
    assert_eq!(h.lifecycle("ref-1"), MessageDeliveryState::Completed);
    assert_eq!(h.store.history_len("ref-1"), 3);
}

#[tokio::test]
async fn test_fetch_failure_skips_only_that_message() {
    let h = harness(10);
    h.track("ref-ok").await;
    h.track("ref-down").await;

    h.source
        .report("ref-ok", ExternalDeliveryState::Rejected, None);
    h.source.set_failing("ref-down");
    let report = h.poller.poll_once().await.unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(report.updated, 1);
    assert_eq!(report.marked_polled, 2);
    assert_eq!(h.lifecycle("ref-ok"), MessageDeliveryState::Rejected);
    assert_eq!(h.lifecycle("ref-down"), MessageDeliveryState::New);
}

#[tokio::test]
async fn test_publish_failure_keeps_persisted_change() {
    let h = harness(10);
    h.track("ref-1").await;
    h.publisher.set_fail(true);

    h.source
        .report("ref-1", ExternalDeliveryState::Rejected, None);
    let report = h.poller.poll_once().await.unwrap();

    assert_eq!(report.updated, 1);
    assert_eq!(report.published, 0);
    assert_eq!(h.lifecycle("ref-1"), MessageDeliveryState::Rejected);
}

#[tokio::test]
async fn test_concurrent_writer_is_detected() {
    let h = harness(10);
    h.track("ref-1").await;
    let stale = h.store.get("ref-1").unwrap();

    // Another writer moves the row first
    h.store.overwrite_raw(
        "ref-1",
        RawDeliveryState::new(Some(ExternalDeliveryState::Unconfirmed), None),
    );

    h.source
        .report("ref-1", ExternalDeliveryState::Acknowledged, Some(AppRecStatus::Ok));
    let outcome = h.poller.process_message(&stale).await;

    assert!(matches!(
        outcome,
        PollOutcome::PersistFailed(StoreError::ConcurrentModification { .. })
    ));
    assert_eq!(h.publisher.count(), 0);
    assert_eq!(h.lifecycle("ref-1"), MessageDeliveryState::Pending);
}

#[tokio::test]
async fn test_persist_failure_does_not_publish() {
    let h = harness(10);
    h.track("ref-1").await;
    h.store.set_fail_record(true);

    h.source
        .report("ref-1", ExternalDeliveryState::Rejected, None);
    let report = h.poller.poll_once().await.unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(h.publisher.count(), 0);
    assert_eq!(report.marked_polled, 1);
}

// ============================================================================
// Batching and mark-polled
// ============================================================================

#[tokio::test]
async fn test_batch_marked_polled_once_and_excluded_next_query() {
    let h = harness(10);
    let refs: Vec<String> = (0..6).map(|i| format!("ref-{}", i)).collect();
    for r in &refs {
        h.track(r).await;
        h.source
            .report(r, ExternalDeliveryState::Unconfirmed, None);
    }

    let report = h.poller.poll_once().await.unwrap();

    assert_eq!(report.batches, 1);
    assert_eq!(h.store.mark_polled_calls(), 1);
    assert_eq!(report.marked_polled, 6);
    for r in &refs {
        assert!(h.store.get(r).unwrap().last_polled_at.is_some());
    }
    assert!(h.store.find_pollable().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_messages_split_into_batches() {
    let h = harness(2);
    for i in 0..5 {
        h.track(&format!("ref-{}", i)).await;
    }

    let report = h.poller.poll_once().await.unwrap();

    assert_eq!(report.fetched, 5);
    assert_eq!(report.batches, 3);
    assert_eq!(h.store.mark_polled_calls(), 3);
    assert_eq!(h.source.calls(), 5);
    assert_eq!(report.processed(), 5);
}

#[tokio::test]
async fn test_mark_polled_failure_is_not_fatal() {
    let h = harness(10);
    h.track("ref-1").await;
    h.store.set_fail_mark_polled(true);

    let report = h.poller.poll_once().await.unwrap();
    assert_eq!(report.marked_polled, 0);

    // Still due next cycle
    h.store.set_fail_mark_polled(false);
    assert_eq!(h.store.find_pollable().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_empty_cycle() {
    let h = harness(10);
    let report = h.poller.poll_once().await.unwrap();

    assert_eq!(report.fetched, 0);
    assert_eq!(report.batches, 0);
    assert_eq!(h.store.mark_polled_calls(), 0);
    assert_eq!(h.source.calls(), 0);
}

#[tokio::test]
async fn test_find_failure_fails_cycle() {
    let h = harness(10);
    h.track("ref-1").await;
    h.store.set_fail_find(true);

    let err = h.poller.poll_once().await.unwrap_err();
    assert_eq!(err.code(), "DATABASE_ERROR");
    assert_eq!(h.source.calls(), 0);
}
