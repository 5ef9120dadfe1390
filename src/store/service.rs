//! State Service
//!
//! Transactional façade over [`MessageStateRepository`]. A state mutation and
//! its history row are never visible to another transaction independently.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use tracing::{debug, info};

use super::error::StoreError;
use super::repository::MessageStateRepository;
use super::{MessageStateStore, PollingQuery};
use crate::db::Database;
use crate::delivery::{
    CreateOutcome, Invalidation, MessageSnapshot, MessageState, NewMessage, RawDeliveryState,
    StateChange, StateCounts,
};

/// PostgreSQL-backed [`MessageStateStore`]
#[derive(Clone)]
pub struct StateService {
    pool: PgPool,
    repo: MessageStateRepository,
}

impl StateService {
    pub fn new(pool: PgPool, polling: PollingQuery) -> Self {
        Self {
            pool,
            repo: MessageStateRepository::new(polling),
        }
    }

    pub fn from_database(db: &Database, polling: PollingQuery) -> Self {
        Self::new(db.pool().clone(), polling)
    }

    pub fn repository(&self) -> &MessageStateRepository {
        &self.repo
    }
}

#[async_trait]
impl MessageStateStore for StateService {
    async fn create_initial_state(
        &self,
        message: NewMessage,
    ) -> Result<CreateOutcome<MessageSnapshot>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let outcome = match self.repo.create_state(&mut *tx, &message).await? {
            CreateOutcome::Created(state) => {
                let baseline = self
                    .repo
                    .append_history(
                        &mut *tx,
                        state.id,
                        RawDeliveryState::default(),
                        RawDeliveryState::default(),
                        false,
                        message.at,
                    )
                    .await?;
                CreateOutcome::Created(MessageSnapshot {
                    state,
                    history: vec![baseline],
                })
            }
            CreateOutcome::Existing(state) => {
                let history = self.repo.find_history(&mut *tx, state.id).await?;
                CreateOutcome::Existing(MessageSnapshot { state, history })
            }
        };

        tx.commit().await?;

        if outcome.is_created() {
            info!(
                id = %message.id,
                external_ref_id = %message.external_ref_id,
                message_type = %message.message_type,
                "Message state created"
            );
        }

        Ok(outcome)
    }

    async fn record_state_change(
        &self,
        change: StateChange,
    ) -> Result<MessageSnapshot, StoreError> {
        let mut tx = self.pool.begin().await?;

        let state = self
            .repo
            .update_state(
                &mut *tx,
                &change.external_ref_id,
                change.old,
                change.new,
                change.at,
            )
            .await?;
        self.repo
            .append_history(&mut *tx, state.id, change.old, change.new, false, change.at)
            .await?;
        let history = self.repo.find_history(&mut *tx, state.id).await?;

        tx.commit().await?;

        debug!(
            external_ref_id = %change.external_ref_id,
            message_type = %change.message_type,
            history_len = history.len(),
            "State change recorded"
        );

        Ok(MessageSnapshot { state, history })
    }

    async fn invalidate(&self, invalidation: Invalidation) -> Result<MessageSnapshot, StoreError> {
        let mut tx = self.pool.begin().await?;

        let state = self
            .repo
            .invalidate_state(
                &mut *tx,
                &invalidation.external_ref_id,
                invalidation.expected,
                invalidation.at,
            )
            .await?;
        // The reported pair broke the rules; history records the kept pair
        self.repo
            .append_history(
                &mut *tx,
                state.id,
                invalidation.expected,
                invalidation.expected,
                true,
                invalidation.at,
            )
            .await?;
        let history = self.repo.find_history(&mut *tx, state.id).await?;

        tx.commit().await?;

        info!(
            id = %state.id,
            external_ref_id = %invalidation.external_ref_id,
            message_type = %invalidation.message_type,
            kept = %invalidation.expected.evaluation_state(),
            rejected = %invalidation.rejected.evaluation_state(),
            "Message forced to INVALID"
        );

        Ok(MessageSnapshot { state, history })
    }

    async fn get_snapshot(
        &self,
        external_ref_id: &str,
    ) -> Result<Option<MessageSnapshot>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let Some(state) = self.repo.find_or_null(&mut *tx, external_ref_id).await? else {
            return Ok(None);
        };
        let history = self.repo.find_history(&mut *tx, state.id).await?;

        tx.commit().await?;
        Ok(Some(MessageSnapshot { state, history }))
    }

    async fn find_pollable(&self) -> Result<Vec<MessageState>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        self.repo.find_for_polling(&mut *conn, Utc::now()).await
    }

    async fn mark_polled(&self, external_ref_ids: &[String]) -> Result<u64, StoreError> {
        let mut conn = self.pool.acquire().await?;
        self.repo
            .mark_polled(&mut *conn, external_ref_ids, Utc::now())
            .await
    }

    async fn state_counts(&self) -> Result<StateCounts, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let raw = self.repo.count_by_raw_state(&mut *conn).await?;
        Ok(StateCounts::from_raw_counts(raw))
    }
}
