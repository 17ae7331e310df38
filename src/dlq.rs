//! Dead-letter queue: inspect, retry, dismiss, purge.
//!
//! The DLQ is the `queue:events:dlq` list in the fast store. Retry and
//! dismiss both hinge on a single-shot `LREM` of the exact serialized
//! entry: the loser of a concurrent race removes nothing and surfaces
//! `not_found`.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use tracing::instrument;

use crate::db::handlers::Events;
use crate::db::models::events::EventStatus;
use crate::errors::{Error, Result};
use crate::queue::{DlqMessage, FastStore};

/// A decoded DLQ entry plus its raw serialized form (needed for the exact
/// `LREM` removal).
#[derive(Debug, Clone)]
pub struct DlqItem {
    pub dlq_id: String,
    pub message: DlqMessage,
    pub raw: String,
}

/// Result of a retry.
#[derive(Debug)]
pub struct DlqRetryOutcome {
    pub event_id: String,
    pub retry_count: i32,
}

/// Per-id result of a batch retry/dismiss.
#[derive(Debug)]
pub struct DlqBatchResult {
    pub event_id: String,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug)]
pub struct DlqStats {
    pub total: i64,
    pub by_event_type: HashMap<String, i64>,
    pub by_source: HashMap<String, i64>,
    pub oldest_entry: Option<DateTime<Utc>>,
    pub newest_entry: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct DlqService {
    pool: PgPool,
    store: FastStore,
}

impl DlqService {
    pub fn new(pool: PgPool, store: FastStore) -> Self {
        Self { pool, store }
    }

    /// Decode every parseable entry, oldest-delivery-order preserved.
    async fn scan(&self) -> Result<Vec<DlqItem>> {
        let raws = self.store.dlq_items().await.map_err(queue_error)?;

        let mut items = Vec::with_capacity(raws.len());
        for (index, raw) in raws.into_iter().enumerate() {
            match serde_json::from_str::<DlqMessage>(&raw) {
                Ok(message) => {
                    let dlq_id = format!("dlq_{}_{index}", message.event_id);
                    items.push(DlqItem {
                        dlq_id,
                        message,
                        raw,
                    });
                }
                Err(e) => {
                    tracing::warn!(index, error = %e, "skipping unparseable DLQ entry");
                }
            }
        }

        Ok(items)
    }

    /// List entries with optional filters; returns the page and the
    /// filtered total.
    #[instrument(skip(self), err)]
    pub async fn list(
        &self,
        limit: usize,
        offset: usize,
        event_type: Option<&str>,
        source: Option<&str>,
    ) -> Result<(Vec<DlqItem>, usize)> {
        let items: Vec<DlqItem> = self
            .scan()
            .await?
            .into_iter()
            .filter(|item| {
                event_type.is_none_or(|t| item.message.event_type == t)
                    && source.is_none_or(|s| item.message.source == s)
            })
            .collect();

        let total = items.len();
        let page = items.into_iter().skip(offset).take(limit).collect();

        Ok((page, total))
    }

    /// First entry whose event id matches.
    #[instrument(skip(self), err)]
    pub async fn get(&self, event_id: &str) -> Result<DlqItem> {
        self.scan()
            .await?
            .into_iter()
            .find(|item| item.message.event_id == event_id)
            .ok_or_else(|| Error::NotFound {
                resource: "DLQ entry".to_string(),
                id: event_id.to_string(),
            })
    }

    /// Move an entry back onto the main queue with a bumped retry counter.
    /// Idempotent for the caller: a second retry finds nothing and 404s.
    #[instrument(skip(self, modify_payload), err)]
    pub async fn retry(
        &self,
        event_id: &str,
        modify_payload: Option<serde_json::Value>,
    ) -> Result<DlqRetryOutcome> {
        let item = self.get(event_id).await?;

        // Single-shot removal decides the race.
        let removed = self.store.remove_dlq_item(&item.raw).await.map_err(queue_error)?;
        if removed == 0 {
            return Err(Error::NotFound {
                resource: "DLQ entry".to_string(),
                id: event_id.to_string(),
            });
        }

        let mut message = item.message;
        message.retry_count += 1;
        message.retried_at = Some(Utc::now());
        let retry_count = message.retry_count;

        let mut retry_value = serde_json::to_value(&message).unwrap_or_default();
        if let (Some(target), Some(overrides)) = (
            retry_value.as_object_mut(),
            modify_payload.as_ref().and_then(|v| v.as_object()),
        ) {
            for (key, value) in overrides {
                target.insert(key.clone(), value.clone());
            }
        }

        self.store
            .requeue_raw(&retry_value.to_string())
            .await
            .map_err(queue_error)?;

        // The durable row is advisory here; a failure only logs.
        match self.pool.acquire().await {
            Ok(mut conn) => {
                let mut repo = Events::new(&mut conn);
                if let Err(e) = repo.set_status(event_id, EventStatus::Pending).await {
                    tracing::warn!(error = %e, event_id, "failed to reset event status after DLQ retry");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, event_id, "durable store unavailable after DLQ retry");
            }
        }

        tracing::info!(event_id, retry_count, "DLQ entry re-queued");

        Ok(DlqRetryOutcome {
            event_id: event_id.to_string(),
            retry_count,
        })
    }

    /// Remove an entry without re-queueing; the event becomes terminally
    /// `failed`.
    #[instrument(skip(self), err)]
    pub async fn dismiss(&self, event_id: &str) -> Result<()> {
        let item = self.get(event_id).await?;

        let removed = self.store.remove_dlq_item(&item.raw).await.map_err(queue_error)?;
        if removed == 0 {
            return Err(Error::NotFound {
                resource: "DLQ entry".to_string(),
                id: event_id.to_string(),
            });
        }

        match self.pool.acquire().await {
            Ok(mut conn) => {
                let mut repo = Events::new(&mut conn);
                if let Err(e) = repo.set_status(event_id, EventStatus::Failed).await {
                    tracing::warn!(error = %e, event_id, "failed to mark event failed after DLQ dismiss");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, event_id, "durable store unavailable after DLQ dismiss");
            }
        }

        tracing::info!(event_id, "DLQ entry dismissed");
        Ok(())
    }

    /// Retry a set of ids independently.
    pub async fn retry_batch(&self, event_ids: Vec<String>) -> Vec<DlqBatchResult> {
        let mut results = Vec::with_capacity(event_ids.len());
        for event_id in event_ids {
            let result = self.retry(&event_id, None).await;
            results.push(batch_result(event_id, result.map(|_| ())));
        }
        results
    }

    /// Dismiss a set of ids independently.
    pub async fn dismiss_batch(&self, event_ids: Vec<String>) -> Vec<DlqBatchResult> {
        let mut results = Vec::with_capacity(event_ids.len());
        for event_id in event_ids {
            let result = self.dismiss(&event_id).await;
            results.push(batch_result(event_id, result));
        }
        results
    }

    /// Delete everything; returns how many entries were purged.
    #[instrument(skip(self), err)]
    pub async fn purge(&self) -> Result<i64> {
        let purged = self.store.purge_dlq().await.map_err(queue_error)?;
        tracing::warn!(purged, "dead-letter queue purged");
        Ok(purged)
    }

    #[instrument(skip(self), err)]
    pub async fn stats(&self) -> Result<DlqStats> {
        let items = self.scan().await?;

        let mut by_event_type: HashMap<String, i64> = HashMap::new();
        let mut by_source: HashMap<String, i64> = HashMap::new();
        let mut oldest: Option<DateTime<Utc>> = None;
        let mut newest: Option<DateTime<Utc>> = None;

        for item in &items {
            *by_event_type
                .entry(item.message.event_type.clone())
                .or_default() += 1;
            *by_source.entry(item.message.source.clone()).or_default() += 1;

            if let Some(enqueued_at) = item.message.enqueued_at {
                oldest = Some(oldest.map_or(enqueued_at, |o| o.min(enqueued_at)));
                newest = Some(newest.map_or(enqueued_at, |n| n.max(enqueued_at)));
            }
        }

        Ok(DlqStats {
            total: items.len() as i64,
            by_event_type,
            by_source,
            oldest_entry: oldest,
            newest_entry: newest,
        })
    }
}

fn queue_error(e: redis::RedisError) -> Error {
    Error::QueueOperation {
        message: e.to_string(),
    }
}

fn batch_result(event_id: String, result: Result<()>) -> DlqBatchResult {
    match result {
        Ok(()) => DlqBatchResult {
            event_id,
            success: true,
            error: None,
        },
        Err(e) => DlqBatchResult {
            event_id,
            success: false,
            error: Some(e.user_message()),
        },
    }
}
