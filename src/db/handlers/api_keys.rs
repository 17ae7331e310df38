//! Database repository for API credentials.

use sqlx::PgConnection;
use tracing::instrument;

use crate::db::errors::Result;
use crate::db::models::api_keys::{ApiKey, ApiKeyCreateDBRequest};

/// Repository for credential operations.
pub struct ApiKeys<'c> {
    db: &'c mut PgConnection,
}

impl<'c> ApiKeys<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self, request), fields(key_id = %request.id), err)]
    pub async fn create(&mut self, request: &ApiKeyCreateDBRequest) -> Result<ApiKey> {
        let key = sqlx::query_as::<_, ApiKey>(
            r#"
            INSERT INTO api_keys (id, name, description, key_hash, key_prefix, environment, scopes, rate_limit, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING *
            "#,
        )
        .bind(&request.id)
        .bind(&request.name)
        .bind(&request.description)
        .bind(&request.key_hash)
        .bind(&request.key_prefix)
        .bind(&request.environment)
        .bind(&request.scopes)
        .bind(request.rate_limit)
        .bind(request.expires_at)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(key)
    }

    /// Hash lookup. The hash is a fixed-length salted digest, so equality on
    /// the unique index carries no information about the raw key.
    #[instrument(skip_all, err)]
    pub async fn get_by_hash(&mut self, key_hash: &str) -> Result<Option<ApiKey>> {
        let key = sqlx::query_as::<_, ApiKey>("SELECT * FROM api_keys WHERE key_hash = $1")
            .bind(key_hash)
            .fetch_optional(&mut *self.db)
            .await?;

        Ok(key)
    }

    /// Best-effort usage stamp.
    #[instrument(skip(self), err)]
    pub async fn touch_last_used(&mut self, id: &str) -> Result<()> {
        sqlx::query("UPDATE api_keys SET last_used_at = now(), updated_at = now() WHERE id = $1")
            .bind(id)
            .execute(&mut *self.db)
            .await?;

        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn count(&mut self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT count(*) FROM api_keys")
            .fetch_one(&mut *self.db)
            .await?;

        Ok(count)
    }
}
