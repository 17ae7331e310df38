//! Database repository for delivery rows.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use tracing::instrument;

use crate::db::errors::Result;
use crate::db::models::deliveries::{
    AttemptRecord, ClaimedDelivery, Delivery, DeliveryCreateDBRequest, ErrorType, ResponseSnapshot,
};

/// Stale in-flight rows become claimable again after this long. A crash
/// between claim and outcome recording self-heals on the next poll.
const IN_FLIGHT_REQUEUE_MINUTES: i32 = 5;

/// Repository for delivery operations.
pub struct Deliveries<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Deliveries<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self, request), fields(delivery_id = %request.id), err)]
    pub async fn create(&mut self, request: &DeliveryCreateDBRequest) -> Result<Delivery> {
        let delivery = sqlx::query_as::<_, Delivery>(
            r#"
            INSERT INTO deliveries (id, event_id, subscription_id, max_attempts, request_url, scheduled_at)
            VALUES ($1, $2, $3, $4, $5, now())
            RETURNING *
            "#,
        )
        .bind(&request.id)
        .bind(&request.event_id)
        .bind(&request.subscription_id)
        .bind(request.max_attempts)
        .bind(&request.request_url)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(delivery)
    }

    #[instrument(skip(self), err)]
    pub async fn get_by_id(&mut self, id: &str) -> Result<Option<Delivery>> {
        let delivery = sqlx::query_as::<_, Delivery>("SELECT * FROM deliveries WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;

        Ok(delivery)
    }

    #[instrument(skip(self), err)]
    pub async fn list_by_event(&mut self, event_id: &str) -> Result<Vec<Delivery>> {
        let deliveries = sqlx::query_as::<_, Delivery>(
            "SELECT * FROM deliveries WHERE event_id = $1 ORDER BY created_at ASC",
        )
        .bind(event_id)
        .fetch_all(&mut *self.db)
        .await?;

        Ok(deliveries)
    }

    /// Atomically claim due deliveries for execution.
    ///
    /// Picks rows in `pending`/`retrying` whose `scheduled_at` has passed
    /// (plus stale `in_flight` rows from crashed workers), flips them to
    /// `in_flight`, bumps `attempt_count`, and joins the subscription fields
    /// the sender needs. `FOR UPDATE SKIP LOCKED` guarantees no delivery is
    /// worked by two workers at once.
    #[instrument(skip(self), err)]
    pub async fn claim_due(&mut self, limit: i64) -> Result<Vec<ClaimedDelivery>> {
        let deliveries = sqlx::query_as::<_, ClaimedDelivery>(
            r#"
            WITH due AS (
                SELECT id FROM deliveries
                WHERE (status IN ('pending', 'retrying') AND scheduled_at <= now())
                   OR (status = 'in_flight' AND started_at <= now() - make_interval(mins => $2))
                ORDER BY scheduled_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            ),
            claimed AS (
                UPDATE deliveries d
                SET status = 'in_flight',
                    started_at = now(),
                    attempt_count = d.attempt_count + 1,
                    updated_at = now()
                FROM due
                WHERE d.id = due.id
                RETURNING d.id, d.event_id, d.subscription_id, d.attempt_count, d.max_attempts
            )
            SELECT c.id, c.event_id, c.subscription_id, c.attempt_count, c.max_attempts,
                   e.event_type, e.source AS event_source, e.data AS event_data,
                   e.metadata AS event_metadata, e.created_at AS event_created_at,
                   s.status AS subscription_status,
                   s.deleted_at AS subscription_deleted_at,
                   s.target_url, s.signing_secret, s.custom_headers, s.timeout_seconds,
                   s.retry_strategy, s.retry_delay_seconds, s.retry_max_delay_seconds
            FROM claimed c
            JOIN events e ON e.id = c.event_id
            LEFT JOIN subscriptions s ON s.id = c.subscription_id
            "#,
        )
        .bind(limit)
        .bind(IN_FLIGHT_REQUEUE_MINUTES)
        .fetch_all(&mut *self.db)
        .await?;

        Ok(deliveries)
    }

    /// Snapshot the outbound request on the row before the POST goes out.
    #[instrument(skip_all, fields(delivery_id = %id), err)]
    pub async fn record_request(
        &mut self,
        id: &str,
        url: &str,
        headers: &serde_json::Value,
        body: &str,
        signature: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE deliveries
            SET request_url = $2, request_headers = $3, request_body = $4, signature = $5,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(url)
        .bind(headers)
        .bind(body)
        .bind(signature)
        .execute(&mut *self.db)
        .await?;

        Ok(())
    }

    /// Record a 2xx outcome: terminal `delivered`.
    #[instrument(skip(self, response, attempt), fields(delivery_id = %id), err)]
    pub async fn record_delivered(
        &mut self,
        id: &str,
        response: &ResponseSnapshot,
        attempt: &AttemptRecord,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE deliveries
            SET status = 'delivered',
                completed_at = now(),
                response_status_code = $2,
                response_headers = $3,
                response_body = $4,
                response_time_ms = $5,
                error_type = NULL,
                error_message = NULL,
                attempt_history = attempt_history || $6::jsonb,
                updated_at = now()
            WHERE id = $1 AND status = 'in_flight'
            "#,
        )
        .bind(id)
        .bind(response.status_code)
        .bind(&response.headers)
        .bind(&response.body)
        .bind(response.response_time_ms)
        .bind(serde_json::to_value(attempt).unwrap_or_default())
        .execute(&mut *self.db)
        .await?;

        Ok(())
    }

    /// Record a failed attempt with retry budget remaining: `retrying`,
    /// rescheduled for `next_retry_at`.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip(self, error_message, response, attempt), fields(delivery_id = %id), err)]
    pub async fn record_retrying(
        &mut self,
        id: &str,
        error_type: ErrorType,
        error_message: &str,
        response: &ResponseSnapshot,
        next_retry_at: DateTime<Utc>,
        retry_delay_seconds: i32,
        attempt: &AttemptRecord,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE deliveries
            SET status = 'retrying',
                scheduled_at = $5,
                next_retry_at = $5,
                retry_delay_seconds = $6,
                response_status_code = $7,
                response_headers = $8,
                response_body = $9,
                response_time_ms = $10,
                error_type = $2,
                error_message = $3,
                attempt_history = attempt_history || $4::jsonb,
                updated_at = now()
            WHERE id = $1 AND status = 'in_flight'
            "#,
        )
        .bind(id)
        .bind(error_type.as_str())
        .bind(error_message)
        .bind(serde_json::to_value(attempt).unwrap_or_default())
        .bind(next_retry_at)
        .bind(retry_delay_seconds)
        .bind(response.status_code)
        .bind(&response.headers)
        .bind(&response.body)
        .bind(response.response_time_ms)
        .execute(&mut *self.db)
        .await?;

        Ok(())
    }

    /// Record a failed attempt with no budget left: terminal `exhausted`.
    #[instrument(skip(self, error_message, response, attempt), fields(delivery_id = %id), err)]
    pub async fn record_exhausted(
        &mut self,
        id: &str,
        error_type: ErrorType,
        error_message: &str,
        response: &ResponseSnapshot,
        attempt: &AttemptRecord,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE deliveries
            SET status = 'exhausted',
                completed_at = now(),
                response_status_code = $5,
                response_headers = $6,
                response_body = $7,
                response_time_ms = $8,
                error_type = $2,
                error_message = $3,
                attempt_history = attempt_history || $4::jsonb,
                updated_at = now()
            WHERE id = $1 AND status = 'in_flight'
            "#,
        )
        .bind(id)
        .bind(error_type.as_str())
        .bind(error_message)
        .bind(serde_json::to_value(attempt).unwrap_or_default())
        .bind(response.status_code)
        .bind(&response.headers)
        .bind(&response.body)
        .bind(response.response_time_ms)
        .execute(&mut *self.db)
        .await?;

        Ok(())
    }

    /// Cancel a delivery whose subscription is gone or no longer active.
    #[instrument(skip(self, reason), fields(delivery_id = %id), err)]
    pub async fn cancel(&mut self, id: &str, reason: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE deliveries
            SET status = 'cancelled',
                completed_at = now(),
                error_message = $2,
                updated_at = now()
            WHERE id = $1 AND status NOT IN ('delivered', 'exhausted', 'cancelled')
            "#,
        )
        .bind(id)
        .bind(reason)
        .execute(&mut *self.db)
        .await?;

        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn count_by_status(&mut self) -> Result<Vec<(String, i64)>> {
        let counts = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, count(*) FROM deliveries GROUP BY status",
        )
        .fetch_all(&mut *self.db)
        .await?;

        Ok(counts)
    }
}
