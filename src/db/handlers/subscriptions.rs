//! Database repository for webhook subscriptions.

use chrono::{DateTime, Utc};
use sqlx::{PgConnection, Postgres, QueryBuilder};
use tracing::instrument;

use crate::db::errors::Result;
use crate::db::models::subscriptions::{
    Subscription, SubscriptionCreateDBRequest, SubscriptionFilter, SubscriptionStatus,
    SubscriptionUpdateDBRequest,
};

/// Repository for subscription operations.
pub struct Subscriptions<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Subscriptions<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self, request), fields(subscription_id = %request.id), err)]
    pub async fn create(&mut self, request: &SubscriptionCreateDBRequest) -> Result<Subscription> {
        let subscription = sqlx::query_as::<_, Subscription>(
            r#"
            INSERT INTO subscriptions (
                id, name, description, target_url, signing_secret, custom_headers,
                event_types, event_sources, retry_strategy, max_retries,
                retry_delay_seconds, retry_max_delay_seconds, timeout_seconds,
                failure_threshold, credential_id, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            RETURNING *
            "#,
        )
        .bind(&request.id)
        .bind(&request.name)
        .bind(&request.description)
        .bind(&request.target_url)
        .bind(&request.signing_secret)
        .bind(&request.custom_headers)
        .bind(&request.event_types)
        .bind(&request.event_sources)
        .bind(request.retry_strategy.as_str())
        .bind(request.max_retries)
        .bind(request.retry_delay_seconds)
        .bind(request.retry_max_delay_seconds)
        .bind(request.timeout_seconds)
        .bind(request.failure_threshold)
        .bind(&request.credential_id)
        .bind(&request.metadata)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(subscription)
    }

    /// Get a subscription by id. Soft-deleted rows are invisible.
    #[instrument(skip(self), err)]
    pub async fn get_by_id(&mut self, id: &str) -> Result<Option<Subscription>> {
        let subscription = sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(subscription)
    }

    /// List subscriptions ordered `created_at DESC, id DESC` with cursor
    /// pagination (same scheme as events).
    #[instrument(skip(self, filter, cursor), err)]
    pub async fn list(
        &mut self,
        filter: &SubscriptionFilter,
        limit: i64,
        cursor: Option<(DateTime<Utc>, String)>,
    ) -> Result<Vec<Subscription>> {
        let mut query: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT * FROM subscriptions WHERE deleted_at IS NULL");

        if let Some(status) = filter.status {
            query.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(is_healthy) = filter.is_healthy {
            query.push(" AND is_healthy = ").push_bind(is_healthy);
        }
        if let Some(credential_id) = &filter.credential_id {
            query.push(" AND credential_id = ").push_bind(credential_id.clone());
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

        let subscriptions = query
            .build_query_as::<Subscription>()
            .fetch_all(&mut *self.db)
            .await?;

        Ok(subscriptions)
    }

    /// Apply a partial update. Returns `None` when the row is missing or
    /// soft-deleted. Setting `status = active` also resets the health
    /// counters, mirroring a manual re-enable.
    #[instrument(skip(self, request), err)]
    pub async fn update(
        &mut self,
        id: &str,
        request: &SubscriptionUpdateDBRequest,
    ) -> Result<Option<Subscription>> {
        let mut query: QueryBuilder<Postgres> =
            QueryBuilder::new("UPDATE subscriptions SET updated_at = now()");

        if let Some(name) = &request.name {
            query.push(", name = ").push_bind(name.clone());
        }
        if let Some(description) = &request.description {
            query.push(", description = ").push_bind(description.clone());
        }
        if let Some(target_url) = &request.target_url {
            query.push(", target_url = ").push_bind(target_url.clone());
        }
        if let Some(custom_headers) = &request.custom_headers {
            query.push(", custom_headers = ").push_bind(custom_headers.clone());
        }
        if let Some(event_types) = &request.event_types {
            query.push(", event_types = ").push_bind(event_types.clone());
        }
        if let Some(event_sources) = &request.event_sources {
            query.push(", event_sources = ").push_bind(event_sources.clone());
        }
        if let Some(status) = request.status {
            query.push(", status = ").push_bind(status.as_str());
            if status == SubscriptionStatus::Active {
                query.push(", is_healthy = true, consecutive_failures = 0");
            }
        }
        if let Some(strategy) = request.retry_strategy {
            query.push(", retry_strategy = ").push_bind(strategy.as_str());
        }
        if let Some(max_retries) = request.max_retries {
            query.push(", max_retries = ").push_bind(max_retries);
        }
        if let Some(delay) = request.retry_delay_seconds {
            query.push(", retry_delay_seconds = ").push_bind(delay);
        }
        if let Some(max_delay) = request.retry_max_delay_seconds {
            query.push(", retry_max_delay_seconds = ").push_bind(max_delay);
        }
        if let Some(timeout) = request.timeout_seconds {
            query.push(", timeout_seconds = ").push_bind(timeout);
        }
        if let Some(threshold) = request.failure_threshold {
            query.push(", failure_threshold = ").push_bind(threshold);
        }
        if let Some(metadata) = &request.metadata {
            query.push(", metadata = ").push_bind(metadata.clone());
        }

        query
            .push(" WHERE id = ")
            .push_bind(id)
            .push(" AND deleted_at IS NULL RETURNING *");

        let subscription = query
            .build_query_as::<Subscription>()
            .fetch_optional(&mut *self.db)
            .await?;

        Ok(subscription)
    }

    /// Soft delete: the row is retained for audit and filtered everywhere.
    #[instrument(skip(self), err)]
    pub async fn soft_delete(&mut self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'deleted', deleted_at = now(), updated_at = now()
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(id)
        .execute(&mut *self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Rotate the signing secret, keeping the old one verifiable until
    /// `grace_until`.
    #[instrument(skip(self, new_secret), err)]
    pub async fn rotate_secret(
        &mut self,
        id: &str,
        new_secret: &str,
        grace_until: DateTime<Utc>,
    ) -> Result<Option<Subscription>> {
        let subscription = sqlx::query_as::<_, Subscription>(
            r#"
            UPDATE subscriptions
            SET previous_signing_secret = signing_secret,
                previous_secret_valid_until = $3,
                signing_secret = $2,
                updated_at = now()
            WHERE id = $1 AND deleted_at IS NULL
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(new_secret)
        .bind(grace_until)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(subscription)
    }

    /// Candidates for fan-out: active, healthy, not deleted, creation order.
    #[instrument(skip(self), err)]
    pub async fn list_active_healthy(&mut self) -> Result<Vec<Subscription>> {
        let subscriptions = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT * FROM subscriptions
            WHERE status = 'active' AND is_healthy = true AND deleted_at IS NULL
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&mut *self.db)
        .await?;

        Ok(subscriptions)
    }

    /// Fetch a set of subscriptions by id (replay targets).
    #[instrument(skip(self, ids), err)]
    pub async fn get_many(&mut self, ids: &[String]) -> Result<Vec<Subscription>> {
        let subscriptions = sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE id = ANY($1) AND deleted_at IS NULL",
        )
        .bind(ids)
        .fetch_all(&mut *self.db)
        .await?;

        Ok(subscriptions)
    }

    /// Record a successful delivery: counters up, health restored.
    #[instrument(skip(self), err)]
    pub async fn record_success(&mut self, id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE subscriptions
            SET last_success_at = now(),
                consecutive_failures = 0,
                is_healthy = true,
                total_deliveries = total_deliveries + 1,
                successful_deliveries = successful_deliveries + 1,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&mut *self.db)
        .await?;

        Ok(())
    }

    /// Record an exhausted delivery. Crossing `failure_threshold` flips
    /// `is_healthy = false` and auto-disables the subscription.
    #[instrument(skip(self, reason), err)]
    pub async fn record_failure(&mut self, id: &str, reason: &str) -> Result<Option<Subscription>> {
        let subscription = sqlx::query_as::<_, Subscription>(
            r#"
            UPDATE subscriptions
            SET last_failure_at = now(),
                last_failure_reason = $2,
                consecutive_failures = consecutive_failures + 1,
                total_deliveries = total_deliveries + 1,
                failed_deliveries = failed_deliveries + 1,
                is_healthy = CASE
                    WHEN consecutive_failures + 1 >= failure_threshold THEN false
                    ELSE is_healthy
                END,
                status = CASE
                    WHEN consecutive_failures + 1 >= failure_threshold AND status = 'active' THEN 'disabled'
                    ELSE status
                END,
                updated_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(reason)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(subscription)
    }

    // ===== Aggregates =====

    #[instrument(skip(self), err)]
    pub async fn count_by_status(&mut self) -> Result<Vec<(String, i64)>> {
        let counts = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, count(*) FROM subscriptions WHERE deleted_at IS NULL GROUP BY status",
        )
        .fetch_all(&mut *self.db)
        .await?;

        Ok(counts)
    }

    #[instrument(skip(self), err)]
    pub async fn count_healthy(&mut self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT count(*) FROM subscriptions WHERE is_healthy = true AND deleted_at IS NULL",
        )
        .fetch_one(&mut *self.db)
        .await?;

        Ok(count)
    }
}
