//! In-memory [`MessageStateStore`] for unit tests
//!
//! Follows the PostgreSQL service's semantics: idempotent create with the
//! same conflict classification, CAS on record and invalidate, polling
//! order with never-polled rows first.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::error::StoreError;
use super::{MessageStateStore, PollingQuery, classify_conflict};
use crate::delivery::{
    CreateOutcome, Invalidation, MessageSnapshot, MessageState, MessageStateChange, NewMessage,
    RawDeliveryState, StateChange, StateCounts,
};

#[derive(Default)]
struct Inner {
    // Keyed by external reference id
    messages: HashMap<String, MessageState>,
    history: Vec<MessageStateChange>,
    next_history_id: i64,
}

impl Inner {
    fn append(
        &mut self,
        state: &MessageState,
        old: RawDeliveryState,
        new: RawDeliveryState,
        forced_invalid: bool,
    ) {
        self.next_history_id += 1;
        self.history.push(MessageStateChange {
            id: self.next_history_id,
            message_id: state.id,
            old_delivery_state: old.delivery_state,
            new_delivery_state: new.delivery_state,
            old_app_rec_status: old.app_rec,
            new_app_rec_status: new.app_rec,
            forced_invalid,
            changed_at: state.last_state_change,
        });
    }

    /// Row for a CAS write, or the error the SQL path would report
    fn cas_target(
        &mut self,
        external_ref_id: &str,
        expected: RawDeliveryState,
    ) -> Result<&mut MessageState, StoreError> {
        let state = self
            .messages
            .get_mut(external_ref_id)
            .ok_or_else(|| StoreError::NotFound(external_ref_id.to_string()))?;

        let actual = state.raw_state();
        if actual != expected || state.is_invalidated() {
            return Err(StoreError::ConcurrentModification {
                external_ref_id: external_ref_id.to_string(),
                expected,
                actual,
            });
        }
        Ok(state)
    }

    fn snapshot(&self, state: &MessageState) -> MessageSnapshot {
        MessageSnapshot {
            state: state.clone(),
            history: self
                .history
                .iter()
                .filter(|h| h.message_id == state.id)
                .cloned()
                .collect(),
        }
    }
}

pub struct InMemoryStateStore {
    polling: PollingQuery,
    inner: Mutex<Inner>,
    fail_find: AtomicBool,
    fail_record: AtomicBool,
    fail_mark_polled: AtomicBool,
    mark_polled_calls: AtomicUsize,
}

impl InMemoryStateStore {
    pub fn new(polling: PollingQuery) -> Self {
        Self {
            polling,
            inner: Mutex::new(Inner::default()),
            fail_find: AtomicBool::new(false),
            fail_record: AtomicBool::new(false),
            fail_mark_polled: AtomicBool::new(false),
            mark_polled_calls: AtomicUsize::new(0),
        }
    }

    /// Overwrite the raw axes without CAS or history, simulating another writer
    pub fn overwrite_raw(&self, external_ref_id: &str, raw: RawDeliveryState) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(state) = inner.messages.get_mut(external_ref_id) {
            state.external_delivery_state = raw.delivery_state;
            state.app_rec_status = raw.app_rec;
        }
    }

    pub fn set_last_polled(&self, external_ref_id: &str, at: Option<DateTime<Utc>>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(state) = inner.messages.get_mut(external_ref_id) {
            state.last_polled_at = at;
        }
    }

    pub fn get(&self, external_ref_id: &str) -> Option<MessageState> {
        self.inner
            .lock()
            .unwrap()
            .messages
            .get(external_ref_id)
            .cloned()
    }

    pub fn history_len(&self, external_ref_id: &str) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .messages
            .get(external_ref_id)
            .map(|s| inner.history.iter().filter(|h| h.message_id == s.id).count())
            .unwrap_or(0)
    }

    pub fn set_fail_find(&self, fail: bool) {
        self.fail_find.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_record(&self, fail: bool) {
        self.fail_record.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_mark_polled(&self, fail: bool) {
        self.fail_mark_polled.store(fail, Ordering::SeqCst);
    }

    pub fn mark_polled_calls(&self) -> usize {
        self.mark_polled_calls.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new(PollingQuery::default())
    }
}

#[async_trait]
impl MessageStateStore for InMemoryStateStore {
    async fn create_initial_state(
        &self,
        message: NewMessage,
    ) -> Result<CreateOutcome<MessageSnapshot>, StoreError> {
        let mut inner = self.inner.lock().unwrap();

        let overlapping: Vec<MessageState> = inner
            .messages
            .values()
            .filter(|s| {
                s.id == message.id
                    || s.external_ref_id == message.external_ref_id
                    || s.external_message_url == message.external_message_url
            })
            .cloned()
            .collect();

        match classify_conflict(&message, &overlapping) {
            Some(Ok(existing)) => Ok(CreateOutcome::Existing(inner.snapshot(&existing))),
            Some(Err(conflict)) => Err(conflict.into()),
            None => {
                let state = MessageState::new(&message);
                inner.append(
                    &state,
                    RawDeliveryState::default(),
                    RawDeliveryState::default(),
                    false,
                );
                inner
                    .messages
                    .insert(state.external_ref_id.clone(), state.clone());
                Ok(CreateOutcome::Created(inner.snapshot(&state)))
            }
        }
    }

    async fn record_state_change(
        &self,
        change: StateChange,
    ) -> Result<MessageSnapshot, StoreError> {
        if self.fail_record.load(Ordering::SeqCst) {
            return Err(StoreError::Database("record failure injected".into()));
        }

        let mut inner = self.inner.lock().unwrap();
        let state = inner.cas_target(&change.external_ref_id, change.old)?;

        state.external_delivery_state = change.new.delivery_state;
        state.app_rec_status = change.new.app_rec;
        state.last_state_change = change.at;
        state.updated_at = change.at;
        let state = state.clone();

        inner.append(&state, change.old, change.new, false);
        Ok(inner.snapshot(&state))
    }

    async fn invalidate(&self, invalidation: Invalidation) -> Result<MessageSnapshot, StoreError> {
        if self.fail_record.load(Ordering::SeqCst) {
            return Err(StoreError::Database("record failure injected".into()));
        }

        let mut inner = self.inner.lock().unwrap();
        let state = inner.cas_target(&invalidation.external_ref_id, invalidation.expected)?;

        state.invalidated_at = Some(invalidation.at);
        state.last_state_change = invalidation.at;
        state.updated_at = invalidation.at;
        let state = state.clone();

        inner.append(&state, invalidation.expected, invalidation.expected, true);
        Ok(inner.snapshot(&state))
    }

    async fn get_snapshot(
        &self,
        external_ref_id: &str,
    ) -> Result<Option<MessageSnapshot>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .messages
            .get(external_ref_id)
            .map(|state| inner.snapshot(state)))
    }

    async fn find_pollable(&self) -> Result<Vec<MessageState>, StoreError> {
        if self.fail_find.load(Ordering::SeqCst) {
            return Err(StoreError::Database("find failure injected".into()));
        }

        let cutoff = self.polling.cutoff(Utc::now());
        let inner = self.inner.lock().unwrap();
        let mut due: Vec<MessageState> = inner
            .messages
            .values()
            .filter(|s| s.is_pollable(cutoff))
            .cloned()
            .collect();
        // None sorts before Some, matching NULLS FIRST
        due.sort_by_key(|s| (s.last_polled_at, s.created_at, s.external_ref_id.clone()));
        due.truncate(self.polling.fetch_limit);
        Ok(due)
    }

    async fn mark_polled(&self, external_ref_ids: &[String]) -> Result<u64, StoreError> {
        self.mark_polled_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_mark_polled.load(Ordering::SeqCst) {
            return Err(StoreError::Database("mark_polled failure injected".into()));
        }

        let now = Utc::now();
        let mut inner = self.inner.lock().unwrap();
        let mut updated = 0;
        for id in external_ref_ids {
            if let Some(state) = inner.messages.get_mut(id) {
                state.last_polled_at = Some(now);
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn state_counts(&self) -> Result<StateCounts, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut raw: HashMap<(RawDeliveryState, bool), i64> = HashMap::new();
        for state in inner.messages.values() {
            *raw.entry((state.raw_state(), state.is_invalidated()))
                .or_default() += 1;
        }
        Ok(StateCounts::from_raw_counts(
            raw.into_iter()
                .map(|((raw, invalidated), count)| (raw, invalidated, count)),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{AppRecStatus, ExternalDeliveryState, MessageDeliveryState};
    use crate::store::LifecycleError;
    use std::time::Duration;
    use uuid::Uuid;

    fn message(ext: &str) -> NewMessage {
        NewMessage::new(
            Uuid::new_v4(),
            ext,
            "DIALOG_MESSAGE",
            format!("https://transport.test/{}", ext),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_create_then_duplicate() {
        let store = InMemoryStateStore::default();
        let msg = message("a");

        let first = store.create_initial_state(msg.clone()).await.unwrap();
        assert!(first.is_created());
        assert_eq!(first.value().history.len(), 1);

        let second = store.create_initial_state(msg.clone()).await.unwrap();
        assert!(!second.is_created());
        assert_eq!(store.history_len("a"), 1);

        let mut clash = message("a");
        clash.external_message_url = "https://elsewhere".into();
        let err = store.create_initial_state(clash).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Conflict(LifecycleError::ConflictingExternalReferenceId { .. })
        ));
    }

    #[tokio::test]
    async fn test_record_is_cas() {
        let store = InMemoryStateStore::default();
        store.create_initial_state(message("a")).await.unwrap();

        let ack = RawDeliveryState::new(Some(ExternalDeliveryState::Acknowledged), None);
        let snapshot = store
            .record_state_change(StateChange {
                external_ref_id: "a".into(),
                message_type: "DIALOG_MESSAGE".into(),
                old: RawDeliveryState::default(),
                new: ack,
                at: Utc::now(),
            })
            .await
            .unwrap();
        assert_eq!(snapshot.state.lifecycle(), MessageDeliveryState::Pending);
        assert_eq!(snapshot.history.len(), 2);

        let err = store
            .record_state_change(StateChange {
                external_ref_id: "a".into(),
                message_type: "DIALOG_MESSAGE".into(),
                old: RawDeliveryState::default(),
                new: RawDeliveryState::new(
                    Some(ExternalDeliveryState::Acknowledged),
                    Some(AppRecStatus::Ok),
                ),
                at: Utc::now(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CONCURRENT_MODIFICATION");
        assert_eq!(store.history_len("a"), 2);
    }

    #[tokio::test]
    async fn test_invalidate_keeps_raw_pair_and_blocks_changes() {
        let store = InMemoryStateStore::default();
        store.create_initial_state(message("a")).await.unwrap();

        let snapshot = store
            .invalidate(Invalidation {
                external_ref_id: "a".into(),
                message_type: "DIALOG_MESSAGE".into(),
                expected: RawDeliveryState::default(),
                rejected: RawDeliveryState::new(
                    Some(ExternalDeliveryState::Unconfirmed),
                    Some(AppRecStatus::Rejected),
                ),
                at: Utc::now(),
            })
            .await
            .unwrap();
        assert_eq!(snapshot.state.lifecycle(), MessageDeliveryState::Invalid);
        assert_eq!(snapshot.state.raw_state(), RawDeliveryState::default());
        assert!(snapshot.history[1].forced_invalid);
        assert!(store.find_pollable().await.unwrap().is_empty());

        let err = store
            .record_state_change(StateChange {
                external_ref_id: "a".into(),
                message_type: "DIALOG_MESSAGE".into(),
                old: RawDeliveryState::default(),
                new: RawDeliveryState::new(Some(ExternalDeliveryState::Acknowledged), None),
                at: Utc::now(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CONCURRENT_MODIFICATION");
        assert_eq!(store.history_len("a"), 2);

        let counts = store.state_counts().await.unwrap();
        assert_eq!(counts.by_lifecycle[&MessageDeliveryState::Invalid], 1);
    }

    #[tokio::test]
    async fn test_find_pollable_orders_never_polled_first() {
        let store = InMemoryStateStore::new(PollingQuery::new(Duration::from_secs(60), 2));
        for ext in ["a", "b", "c"] {
            store.create_initial_state(message(ext)).await.unwrap();
        }
        store.mark_polled(&["a".to_string()]).await.unwrap();

        let due = store.find_pollable().await.unwrap();
        assert_eq!(due.len(), 2);
        assert!(due.iter().all(|s| s.external_ref_id != "a"));
    }
}
