//! Message State Repository
//!
//! PostgreSQL operations on the `messages` and `message_state_history`
//! tables. Every method runs on a caller-supplied connection so the
//! [`StateService`](super::StateService) can compose them inside one
//! transaction.
//!
//! Raw status columns are TEXT in the enums' `as_str()` spelling; parsing
//! happens in `row_to_state` / `row_to_change` and unknown values surface as
//! [`StoreError::CorruptRow`].

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Row};
use std::str::FromStr;

use super::error::StoreError;
use super::{PollingQuery, classify_conflict};
use crate::delivery::{
    AppRecStatus, CreateOutcome, ExternalDeliveryState, LifecycleId, MessageState,
    MessageStateChange, NewMessage, RawDeliveryState, UnknownStatus,
};

/// Message state repository
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageStateRepository {
    polling: PollingQuery,
}

impl MessageStateRepository {
    pub fn new(polling: PollingQuery) -> Self {
        Self { polling }
    }

    pub fn polling(&self) -> &PollingQuery {
        &self.polling
    }

    /// Insert a new message row with both raw axes unset.
    ///
    /// Idempotent: an existing row with the same id, reference id and url is
    /// returned as [`CreateOutcome::Existing`] without writing. Any other
    /// overlap on one of the three unique keys fails with the matching
    /// [`LifecycleError`](super::LifecycleError).
    pub async fn create_state(
        &self,
        conn: &mut PgConnection,
        message: &NewMessage,
    ) -> Result<CreateOutcome<MessageState>, StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO messages
                (id, external_ref_id, message_type, external_message_url,
                 external_delivery_state, app_rec_status, invalidated_at, last_state_change,
                 last_polled_at, created_at, updated_at)
            VALUES
                ($1, $2, $3, $4, NULL, NULL, NULL, $5, NULL, $5, $5)
            ON CONFLICT DO NOTHING
            RETURNING id, external_ref_id, message_type, external_message_url,
                      external_delivery_state, app_rec_status, invalidated_at, last_state_change,
                      last_polled_at, created_at, updated_at
            "#,
        )
        .bind(message.id)
        .bind(&message.external_ref_id)
        .bind(&message.message_type)
        .bind(&message.external_message_url)
        .bind(message.at)
        .fetch_optional(&mut *conn)
        .await?;

        if let Some(row) = inserted {
            return Ok(CreateOutcome::Created(row_to_state(&row)?));
        }

        // One of the unique keys collided - find out which
        let rows = sqlx::query(
            r#"
            SELECT id, external_ref_id, message_type, external_message_url,
                   external_delivery_state, app_rec_status, invalidated_at, last_state_change,
                   last_polled_at, created_at, updated_at
            FROM messages
            WHERE id = $1 OR external_ref_id = $2 OR external_message_url = $3
            "#,
        )
        .bind(message.id)
        .bind(&message.external_ref_id)
        .bind(&message.external_message_url)
        .fetch_all(&mut *conn)
        .await?;

        let existing = rows
            .iter()
            .map(row_to_state)
            .collect::<Result<Vec<_>, _>>()?;

        match classify_conflict(message, &existing) {
            Some(Ok(state)) => {
                tracing::debug!(
                    id = %message.id,
                    external_ref_id = %message.external_ref_id,
                    "Message already tracked - returning existing row (idempotent)"
                );
                Ok(CreateOutcome::Existing(state))
            }
            Some(Err(conflict)) => Err(conflict.into()),
            None => Err(StoreError::Database(format!(
                "insert of {} skipped but no conflicting row is visible",
                message.external_ref_id
            ))),
        }
    }

    /// Atomic CAS update of both raw axes.
    ///
    /// Applies `new` only if the stored axes still equal `expected` and the
    /// row was never invalidated. Fails with `NotFound` if no row has
    /// `external_ref_id`, and with `ConcurrentModification` if another writer
    /// got there first.
    pub async fn update_state(
        &self,
        conn: &mut PgConnection,
        external_ref_id: &str,
        expected: RawDeliveryState,
        new: RawDeliveryState,
        at: DateTime<Utc>,
    ) -> Result<MessageState, StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE messages
            SET external_delivery_state = $1,
                app_rec_status = $2,
                last_state_change = $3,
                updated_at = $3
            WHERE external_ref_id = $4
              AND invalidated_at IS NULL
              AND external_delivery_state IS NOT DISTINCT FROM $5::text
              AND app_rec_status IS NOT DISTINCT FROM $6::text
            RETURNING id, external_ref_id, message_type, external_message_url,
                      external_delivery_state, app_rec_status, invalidated_at, last_state_change,
                      last_polled_at, created_at, updated_at
            "#,
        )
        .bind(new.delivery_state.map(|s| s.as_str()))
        .bind(new.app_rec.map(|s| s.as_str()))
        .bind(at)
        .bind(external_ref_id)
        .bind(expected.delivery_state.map(|s| s.as_str()))
        .bind(expected.app_rec.map(|s| s.as_str()))
        .fetch_optional(&mut *conn)
        .await?;

        if let Some(row) = updated {
            return row_to_state(&row);
        }

        Err(self.cas_miss(conn, external_ref_id, expected).await?)
    }

    /// Stamp `invalidated_at` without touching the raw axes.
    ///
    /// Same CAS guard as [`update_state`](Self::update_state): the raw pair
    /// must still equal `expected` and the row must not be invalidated yet.
    pub async fn invalidate_state(
        &self,
        conn: &mut PgConnection,
        external_ref_id: &str,
        expected: RawDeliveryState,
        at: DateTime<Utc>,
    ) -> Result<MessageState, StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE messages
            SET invalidated_at = $1,
                last_state_change = $1,
                updated_at = $1
            WHERE external_ref_id = $2
              AND invalidated_at IS NULL
              AND external_delivery_state IS NOT DISTINCT FROM $3::text
              AND app_rec_status IS NOT DISTINCT FROM $4::text
            RETURNING id, external_ref_id, message_type, external_message_url,
                      external_delivery_state, app_rec_status, invalidated_at, last_state_change,
                      last_polled_at, created_at, updated_at
            "#,
        )
        .bind(at)
        .bind(external_ref_id)
        .bind(expected.delivery_state.map(|s| s.as_str()))
        .bind(expected.app_rec.map(|s| s.as_str()))
        .fetch_optional(&mut *conn)
        .await?;

        if let Some(row) = updated {
            return row_to_state(&row);
        }

        Err(self.cas_miss(conn, external_ref_id, expected).await?)
    }

    /// Explain why a CAS statement matched no row
    async fn cas_miss(
        &self,
        conn: &mut PgConnection,
        external_ref_id: &str,
        expected: RawDeliveryState,
    ) -> Result<StoreError, StoreError> {
        Ok(match self.find_or_null(conn, external_ref_id).await? {
            None => StoreError::NotFound(external_ref_id.to_string()),
            Some(current) => StoreError::ConcurrentModification {
                external_ref_id: external_ref_id.to_string(),
                expected,
                actual: current.raw_state(),
            },
        })
    }

    /// Append one history row
    pub async fn append_history(
        &self,
        conn: &mut PgConnection,
        message_id: LifecycleId,
        old: RawDeliveryState,
        new: RawDeliveryState,
        forced_invalid: bool,
        at: DateTime<Utc>,
    ) -> Result<MessageStateChange, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO message_state_history
                (message_id, old_delivery_state, new_delivery_state,
                 old_app_rec_status, new_app_rec_status, forced_invalid, changed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id, message_id, old_delivery_state, new_delivery_state,
                      old_app_rec_status, new_app_rec_status, forced_invalid, changed_at
            "#,
        )
        .bind(message_id)
        .bind(old.delivery_state.map(|s| s.as_str()))
        .bind(new.delivery_state.map(|s| s.as_str()))
        .bind(old.app_rec.map(|s| s.as_str()))
        .bind(new.app_rec.map(|s| s.as_str()))
        .bind(forced_invalid)
        .bind(at)
        .fetch_one(&mut *conn)
        .await?;

        row_to_change(&row)
    }

    /// Get a message row by external reference id
    pub async fn find_or_null(
        &self,
        conn: &mut PgConnection,
        external_ref_id: &str,
    ) -> Result<Option<MessageState>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, external_ref_id, message_type, external_message_url,
                   external_delivery_state, app_rec_status, invalidated_at, last_state_change,
                   last_polled_at, created_at, updated_at
            FROM messages
            WHERE external_ref_id = $1
            "#,
        )
        .bind(external_ref_id)
        .fetch_optional(&mut *conn)
        .await?;

        row.as_ref().map(row_to_state).transpose()
    }

    /// Full history of one message, oldest first
    pub async fn find_history(
        &self,
        conn: &mut PgConnection,
        message_id: LifecycleId,
    ) -> Result<Vec<MessageStateChange>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, message_id, old_delivery_state, new_delivery_state,
                   old_app_rec_status, new_app_rec_status, forced_invalid, changed_at
            FROM message_state_history
            WHERE message_id = $1
            ORDER BY changed_at ASC, id ASC
            "#,
        )
        .bind(message_id)
        .fetch_all(&mut *conn)
        .await?;

        rows.iter().map(row_to_change).collect()
    }

    /// Messages due for polling.
    ///
    /// Eligible: delivery state unset or still in flight, no apprec, never
    /// invalidated, and not polled since the cutoff. Never-polled messages
    /// come first.
    pub async fn find_for_polling(
        &self,
        conn: &mut PgConnection,
        now: DateTime<Utc>,
    ) -> Result<Vec<MessageState>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, external_ref_id, message_type, external_message_url,
                   external_delivery_state, app_rec_status, invalidated_at, last_state_change,
                   last_polled_at, created_at, updated_at
            FROM messages
            WHERE (external_delivery_state IS NULL OR external_delivery_state IN ($1, $2))
              AND app_rec_status IS NULL
              AND invalidated_at IS NULL
              AND (last_polled_at IS NULL OR last_polled_at < $3)
            ORDER BY last_polled_at ASC NULLS FIRST, created_at ASC
            LIMIT $4
            "#,
        )
        .bind(ExternalDeliveryState::Acknowledged.as_str())
        .bind(ExternalDeliveryState::Unconfirmed.as_str())
        .bind(self.polling.cutoff(now))
        .bind(i64::try_from(self.polling.fetch_limit).unwrap_or(i64::MAX))
        .fetch_all(&mut *conn)
        .await?;

        let mut states = Vec::with_capacity(rows.len());
        for row in rows {
            states.push(row_to_state(&row)?);
        }
        Ok(states)
    }

    /// Set `last_polled_at` for exactly the given messages
    pub async fn mark_polled(
        &self,
        conn: &mut PgConnection,
        external_ref_ids: &[String],
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        if external_ref_ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            r#"
            UPDATE messages
            SET last_polled_at = $1
            WHERE external_ref_id = ANY($2)
            "#,
        )
        .bind(at)
        .bind(external_ref_ids)
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected())
    }

    /// Row counts grouped by the stored raw pair and the invalidated flag
    pub async fn count_by_raw_state(
        &self,
        conn: &mut PgConnection,
    ) -> Result<Vec<(RawDeliveryState, bool, i64)>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT external_delivery_state, app_rec_status,
                   (invalidated_at IS NOT NULL) AS invalidated, COUNT(*) AS count
            FROM messages
            GROUP BY external_delivery_state, app_rec_status, (invalidated_at IS NOT NULL)
            "#,
        )
        .fetch_all(&mut *conn)
        .await?;

        rows.iter()
            .map(|row| -> Result<(RawDeliveryState, bool, i64), StoreError> {
                let raw = RawDeliveryState::new(
                    parse_column::<ExternalDeliveryState>(row.try_get("external_delivery_state")?)?,
                    parse_column::<AppRecStatus>(row.try_get("app_rec_status")?)?,
                );
                Ok((
                    raw,
                    row.try_get::<bool, _>("invalidated")?,
                    row.try_get::<i64, _>("count")?,
                ))
            })
            .collect()
    }
}

fn parse_column<T>(value: Option<String>) -> Result<Option<T>, StoreError>
where
    T: FromStr<Err = UnknownStatus>,
{
    Ok(value.map(|v| v.parse::<T>()).transpose()?)
}

/// Convert database row to MessageState
fn row_to_state(row: &PgRow) -> Result<MessageState, StoreError> {
    Ok(MessageState {
        id: row.try_get("id")?,
        external_ref_id: row.try_get("external_ref_id")?,
        message_type: row.try_get("message_type")?,
        external_message_url: row.try_get("external_message_url")?,
        external_delivery_state: parse_column(row.try_get("external_delivery_state")?)?,
        app_rec_status: parse_column(row.try_get("app_rec_status")?)?,
        invalidated_at: row.try_get("invalidated_at")?,
        last_state_change: row.try_get("last_state_change")?,
        last_polled_at: row.try_get("last_polled_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Convert database row to MessageStateChange
fn row_to_change(row: &PgRow) -> Result<MessageStateChange, StoreError> {
    Ok(MessageStateChange {
        id: row.try_get("id")?,
        message_id: row.try_get("message_id")?,
        old_delivery_state: parse_column(row.try_get("old_delivery_state")?)?,
        new_delivery_state: parse_column(row.try_get("new_delivery_state")?)?,
        old_app_rec_status: parse_column(row.try_get("old_app_rec_status")?)?,
        new_app_rec_status: parse_column(row.try_get("new_app_rec_status")?)?,
        forced_invalid: row.try_get("forced_invalid")?,
        changed_at: row.try_get("changed_at")?,
    })
}
