//! Database repository for event rows.

use chrono::{DateTime, Utc};
use sqlx::{PgConnection, Postgres, QueryBuilder};
use tracing::instrument;

use crate::db::errors::Result;
use crate::db::models::events::{Event, EventCreateDBRequest, EventFilter, EventStatus};

/// Repository for event operations.
pub struct Events<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Events<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// Insert a new event row with `status = pending`.
    #[instrument(skip(self, request), fields(event_id = %request.id), err)]
    pub async fn create(&mut self, request: &EventCreateDBRequest) -> Result<Event> {
        let event = sqlx::query_as::<_, Event>(
            r#"
            INSERT INTO events (id, event_type, source, data, metadata, idempotency_key, credential_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(&request.id)
        .bind(&request.event_type)
        .bind(&request.source)
        .bind(&request.data)
        .bind(&request.metadata)
        .bind(&request.idempotency_key)
        .bind(&request.credential_id)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(event)
    }

    #[instrument(skip(self), err)]
    pub async fn get_by_id(&mut self, id: &str) -> Result<Option<Event>> {
        let event = sqlx::query_as::<_, Event>("SELECT * FROM events WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;

        Ok(event)
    }

    #[instrument(skip_all, err)]
    pub async fn get_by_idempotency_key(&mut self, key: &str) -> Result<Option<Event>> {
        let event = sqlx::query_as::<_, Event>("SELECT * FROM events WHERE idempotency_key = $1")
            .bind(key)
            .fetch_optional(&mut *self.db)
            .await?;

        Ok(event)
    }

    /// List events ordered `created_at DESC, id DESC`.
    ///
    /// `cursor` is the `(created_at, id)` pair of the last row of the
    /// previous page; rows strictly before it are returned. Callers fetch
    /// `limit + 1` rows to detect overflow.
    #[instrument(skip(self, filter, cursor), err)]
    pub async fn list(
        &mut self,
        filter: &EventFilter,
        limit: i64,
        cursor: Option<(DateTime<Utc>, String)>,
    ) -> Result<Vec<Event>> {
        let mut query: QueryBuilder<Postgres> = QueryBuilder::new("SELECT * FROM events WHERE 1=1");

        if let Some(event_type) = &filter.event_type {
            query.push(" AND event_type = ").push_bind(event_type.clone());
        }
        if let Some(source) = &filter.source {
            query.push(" AND source = ").push_bind(source.clone());
        }
        if let Some(status) = filter.status {
            query.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(since) = filter.since {
            query.push(" AND created_at >= ").push_bind(since);
        }
        if let Some(until) = filter.until {
            query.push(" AND created_at <= ").push_bind(until);
        }
        if let Some((created_at, id)) = cursor {
            query
                .push(" AND (created_at, id) < (")
                .push_bind(created_at)
                .push(", ")
                .push_bind(id)
                .push(")");
        }

        query.push(" ORDER BY created_at DESC, id DESC LIMIT ").push_bind(limit);

        let events = query.build_query_as::<Event>().fetch_all(&mut *self.db).await?;

        Ok(events)
    }

    /// Claim up to `limit` pending events for fan-out, oldest first.
    ///
    /// Must run inside a transaction; `FOR UPDATE SKIP LOCKED` keeps
    /// concurrent processor shards from double-working an event.
    #[instrument(skip(self), err)]
    pub async fn claim_pending(&mut self, limit: i64) -> Result<Vec<Event>> {
        let events = sqlx::query_as::<_, Event>(
            r#"
            SELECT * FROM events
            WHERE status = 'pending'
            ORDER BY created_at ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(limit)
        .fetch_all(&mut *self.db)
        .await?;

        Ok(events)
    }

    /// Transition an event into fan-out: `pending -> processing`.
    #[instrument(skip(self), err)]
    pub async fn mark_processing(&mut self, id: &str, delivery_attempts: i32) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE events
            SET status = 'processing', delivery_attempts = $2, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(delivery_attempts)
        .execute(&mut *self.db)
        .await?;

        Ok(())
    }

    /// No matching subscriptions: the event is terminally delivered.
    #[instrument(skip(self), err)]
    pub async fn mark_delivered_no_matches(&mut self, id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE events
            SET status = 'delivered', processed_at = now(), updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&mut *self.db)
        .await?;

        Ok(())
    }

    /// Matcher or insert failure: terminal `failed` with the error recorded.
    #[instrument(skip(self, error), err)]
    pub async fn mark_failed(&mut self, id: &str, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE events
            SET status = 'failed', last_error = $2, processed_at = now(), updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&mut *self.db)
        .await?;

        Ok(())
    }

    /// Force a status (DLQ retry/dismiss path). Terminal statuses stamp
    /// `processed_at`; `pending` clears it so the processor picks the event
    /// back up.
    #[instrument(skip(self), err)]
    pub async fn set_status(&mut self, id: &str, status: EventStatus) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE events
            SET status = $2,
                processed_at = CASE
                    WHEN $3 THEN now()
                    ELSE NULL
                END,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(status.is_terminal())
        .execute(&mut *self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, error), err)]
    pub async fn set_last_error(&mut self, id: &str, error: &str) -> Result<()> {
        sqlx::query("UPDATE events SET last_error = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(error)
            .execute(&mut *self.db)
            .await?;

        Ok(())
    }

    /// Recompute the event's aggregate status from its delivery rows.
    ///
    /// Any non-terminal delivery keeps the event `processing`; otherwise a
    /// pure-success set is `delivered`, a mixed set `partially_delivered`,
    /// and a pure-failure set `failed`. Terminal outcomes stamp
    /// `processed_at`.
    #[instrument(skip(self), err)]
    pub async fn recompute_from_deliveries(&mut self, id: &str) -> Result<()> {
        sqlx::query(
            r#"
            WITH agg AS (
                SELECT
                    count(*) FILTER (WHERE status = 'delivered') AS delivered,
                    count(*) FILTER (WHERE status = 'exhausted') AS exhausted,
                    count(*) FILTER (WHERE status = 'cancelled') AS cancelled,
                    count(*) FILTER (WHERE status IN ('pending', 'retrying', 'in_flight', 'failed')) AS open
                FROM deliveries
                WHERE event_id = $1
            )
            UPDATE events e
            SET successful_deliveries = agg.delivered,
                failed_deliveries = agg.exhausted,
                status = CASE
                    WHEN agg.open > 0 THEN 'processing'
                    WHEN agg.delivered > 0 AND agg.exhausted = 0 AND agg.cancelled = 0 THEN 'delivered'
                    WHEN agg.delivered > 0 THEN 'partially_delivered'
                    ELSE 'failed'
                END,
                processed_at = CASE WHEN agg.open > 0 THEN e.processed_at ELSE now() END,
                updated_at = now()
            FROM agg
            WHERE e.id = $1
              AND (agg.delivered + agg.exhausted + agg.cancelled + agg.open) > 0
            "#,
        )
        .bind(id)
        .execute(&mut *self.db)
        .await?;

        Ok(())
    }

    // ===== Inbox queries =====

    /// Fetch pending events for pull consumers, oldest first. The offset
    /// lets the inbox page past rows hidden by outstanding receipt handles.
    #[instrument(skip(self, event_types, sources), err)]
    pub async fn fetch_pending(
        &mut self,
        event_types: Option<&[String]>,
        sources: Option<&[String]>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Event>> {
        let mut query: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT * FROM events WHERE status = 'pending'");

        if let Some(types) = event_types {
            query.push(" AND event_type = ANY(").push_bind(types.to_vec()).push(")");
        }
        if let Some(sources) = sources {
            query.push(" AND source = ANY(").push_bind(sources.to_vec()).push(")");
        }

        query
            .push(" ORDER BY created_at ASC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);

        let events = query.build_query_as::<Event>().fetch_all(&mut *self.db).await?;

        Ok(events)
    }

    /// Bump the pull-delivery counter, returning the new value.
    #[instrument(skip(self), err)]
    pub async fn increment_delivery_attempts(&mut self, id: &str) -> Result<i32> {
        let attempts = sqlx::query_scalar::<_, i32>(
            r#"
            UPDATE events
            SET delivery_attempts = delivery_attempts + 1, updated_at = now()
            WHERE id = $1
            RETURNING delivery_attempts
            "#,
        )
        .bind(id)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(attempts)
    }

    /// Acknowledge a pulled event: terminal `delivered`.
    #[instrument(skip(self), err)]
    pub async fn ack_delivered(&mut self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE events
            SET status = 'delivered',
                processed_at = now(),
                successful_deliveries = successful_deliveries + 1,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&mut *self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    // ===== Aggregates =====

    #[instrument(skip(self), err)]
    pub async fn count_by_status(&mut self) -> Result<Vec<(String, i64)>> {
        let counts = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, count(*) FROM events GROUP BY status",
        )
        .fetch_all(&mut *self.db)
        .await?;

        Ok(counts)
    }

    #[instrument(skip(self), err)]
    pub async fn oldest_pending_created_at(&mut self) -> Result<Option<DateTime<Utc>>> {
        let oldest = sqlx::query_scalar::<_, DateTime<Utc>>(
            "SELECT created_at FROM events WHERE status = 'pending' ORDER BY created_at ASC LIMIT 1",
        )
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(oldest)
    }

    #[instrument(skip(self), err)]
    pub async fn pending_counts_by_type(&mut self) -> Result<Vec<(String, i64)>> {
        let counts = sqlx::query_as::<_, (String, i64)>(
            "SELECT event_type, count(*) FROM events WHERE status = 'pending' GROUP BY event_type",
        )
        .fetch_all(&mut *self.db)
        .await?;

        Ok(counts)
    }
}
