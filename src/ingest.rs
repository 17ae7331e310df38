//! Event ingestion: validation, idempotent admission, reads, and replay.
//!
//! Admission order matters: the durable event row is authoritative. The
//! fast-store enqueue and the live-stream publish happen after the insert
//! and are best-effort; the processor's pending scan catches anything the
//! queue loses.

use chrono::Utc;
use serde_json::json;
use sqlx::PgPool;
use tracing::instrument;

use crate::db::errors::DbError;
use crate::db::handlers::{Deliveries, Events, Subscriptions};
use crate::db::models::deliveries::DeliveryCreateDBRequest;
use crate::db::models::events::{Event, EventCreateDBRequest, EventFilter};
use crate::errors::{Error, Result};
use crate::matcher;
use crate::queue::{FastStore, QueueMessage};
use crate::types;

/// Admission limits.
pub const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;
pub const MAX_BATCH_ITEMS: usize = 100;
pub const MAX_BATCH_BYTES: usize = 10 * 1024 * 1024;
const MAX_NAME_LEN: usize = 255;

/// A validated-shape admission request.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub event_type: String,
    pub source: String,
    pub data: serde_json::Value,
    pub metadata: Option<serde_json::Value>,
    pub idempotency_key: Option<String>,
}

/// One item of a batch admission, with the caller's echo id.
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub reference_id: Option<String>,
    pub event: NewEvent,
}

/// Per-item batch outcome.
#[derive(Debug)]
pub struct BatchItemOutcome {
    pub index: usize,
    pub reference_id: Option<String>,
    pub success: bool,
    pub event: Option<Event>,
    pub error: Option<BatchItemError>,
}

#[derive(Debug, Clone)]
pub struct BatchItemError {
    pub code: &'static str,
    pub message: String,
    pub field: Option<&'static str>,
}

#[derive(Debug)]
pub struct BatchOutcome {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub results: Vec<BatchItemOutcome>,
}

/// Replay request options.
#[derive(Debug, Clone, Default)]
pub struct ReplayOptions {
    pub dry_run: bool,
    pub target_subscription_ids: Option<Vec<String>>,
    pub payload_override: Option<serde_json::Value>,
    pub metadata_override: Option<serde_json::Value>,
}

#[derive(Debug)]
pub struct ReplayOutcome {
    pub event_id: String,
    pub replay_event_id: Option<String>,
    pub dry_run: bool,
    pub target_subscriptions: Vec<String>,
    pub message: String,
}

/// Ingestion service over the durable and fast stores.
#[derive(Clone)]
pub struct IngestService {
    pool: PgPool,
    store: FastStore,
}

impl IngestService {
    pub fn new(pool: PgPool, store: FastStore) -> Self {
        Self { pool, store }
    }

    /// Validate an admission request's shape and size.
    pub fn validate(request: &NewEvent) -> Result<()> {
        if request.event_type.is_empty() || request.event_type.len() > MAX_NAME_LEN {
            return Err(Error::Validation {
                message: format!("event_type must be 1-{MAX_NAME_LEN} characters"),
            });
        }
        if !request
            .event_type
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return Err(Error::Validation {
                message: "event_type may only contain letters, digits, '.', '_' and '-'"
                    .to_string(),
            });
        }
        if request.source.is_empty() || request.source.len() > MAX_NAME_LEN {
            return Err(Error::Validation {
                message: format!("source must be 1-{MAX_NAME_LEN} characters"),
            });
        }
        if let Some(key) = &request.idempotency_key {
            if key.is_empty() || key.len() > MAX_NAME_LEN {
                return Err(Error::Validation {
                    message: format!("idempotency_key must be 1-{MAX_NAME_LEN} characters"),
                });
            }
        }

        let payload_size = serde_json::to_vec(&request.data).map(|v| v.len()).unwrap_or(0);
        if payload_size > MAX_PAYLOAD_BYTES {
            return Err(Error::PayloadTooLarge {
                message: format!(
                    "event data is {payload_size} bytes, maximum is {MAX_PAYLOAD_BYTES}"
                ),
            });
        }

        Ok(())
    }

    /// Admit a single event.
    ///
    /// On an idempotency-key hit the admission fails with the existing
    /// event id; the unique index backstops the fast-store cache against
    /// races and outages.
    #[instrument(skip(self, request), fields(event_type = %request.event_type), err)]
    pub async fn create_event(
        &self,
        request: NewEvent,
        credential_id: Option<&str>,
    ) -> Result<Event> {
        Self::validate(&request)?;

        if let Some(key) = &request.idempotency_key {
            match self.store.get_idempotency(key).await {
                Ok(Some(existing)) => {
                    return Err(Error::IdempotencyConflict {
                        existing_event_id: existing,
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "fast store unavailable for idempotency check, using durable index");
                    let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
                    let mut repo = Events::new(&mut conn);
                    if let Some(existing) = repo.get_by_idempotency_key(key).await? {
                        return Err(Error::IdempotencyConflict {
                            existing_event_id: existing.id,
                        });
                    }
                }
            }
        }

        let db_request = EventCreateDBRequest {
            id: types::event_id(),
            event_type: request.event_type,
            source: request.source,
            data: request.data,
            metadata: request.metadata,
            idempotency_key: request.idempotency_key.clone(),
            credential_id: credential_id.map(str::to_string),
        };

        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        let event = {
            let mut repo = Events::new(&mut conn);
            match repo.create(&db_request).await {
                Ok(event) => event,
                Err(DbError::UniqueViolation { .. }) if request.idempotency_key.is_some() => {
                    // Lost a concurrent race on the same key: surface the winner.
                    let key = request.idempotency_key.as_deref().unwrap_or_default();
                    let existing = repo.get_by_idempotency_key(key).await?;
                    return Err(match existing {
                        Some(event) => Error::IdempotencyConflict {
                            existing_event_id: event.id,
                        },
                        None => Error::Conflict {
                            message: "duplicate idempotency key".to_string(),
                        },
                    });
                }
                Err(e) => return Err(e.into()),
            }
        };
        drop(conn);

        self.post_admission(&event).await;

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            source = %event.source,
            "event admitted"
        );

        Ok(event)
    }

    /// Post-insert side effects, all best-effort: idempotency mapping,
    /// queue enqueue, live-stream publish.
    async fn post_admission(&self, event: &Event) {
        if let Some(key) = &event.idempotency_key {
            if let Err(e) = self.store.put_idempotency(key, &event.id).await {
                tracing::warn!(error = %e, event_id = %event.id, "failed to record idempotency mapping");
            }
        }

        let message = QueueMessage {
            event_id: event.id.clone(),
            event_type: event.event_type.clone(),
            source: event.source.clone(),
            created_at: Some(event.created_at),
            enqueued_at: Utc::now(),
        };
        if let Err(e) = self.store.enqueue_event(&message).await {
            // The event row is authoritative; the processor's pending scan
            // will pick it up.
            tracing::warn!(error = %e, event_id = %event.id, "failed to enqueue event");
        }

        let envelope = stream_envelope(event, None);
        if let Err(e) = self.store.publish_stream(&envelope.to_string()).await {
            tracing::warn!(error = %e, event_id = %event.id, "failed to publish event to stream");
        }
    }

    /// Admit up to 100 events independently.
    #[instrument(skip_all, fields(items = items.len(), fail_fast), err)]
    pub async fn create_events_batch(
        &self,
        items: Vec<BatchItem>,
        fail_fast: bool,
        credential_id: Option<&str>,
    ) -> Result<BatchOutcome> {
        if items.is_empty() {
            return Err(Error::Validation {
                message: "batch must contain at least one event".to_string(),
            });
        }
        if items.len() > MAX_BATCH_ITEMS {
            return Err(Error::Validation {
                message: format!("batch may contain at most {MAX_BATCH_ITEMS} events"),
            });
        }

        let total_bytes: usize = items
            .iter()
            .map(|i| serde_json::to_vec(&i.event.data).map(|v| v.len()).unwrap_or(0))
            .sum();
        if total_bytes > MAX_BATCH_BYTES {
            return Err(Error::PayloadTooLarge {
                message: format!(
                    "batch payload is {total_bytes} bytes, maximum is {MAX_BATCH_BYTES}"
                ),
            });
        }

        let total = items.len();
        let mut results = Vec::with_capacity(total);
        let mut successful = 0usize;
        let mut failed = 0usize;
        let mut items = items.into_iter().enumerate();

        while let Some((index, item)) = items.next() {
            match self.create_event(item.event, credential_id).await {
                Ok(event) => {
                    successful += 1;
                    results.push(BatchItemOutcome {
                        index,
                        reference_id: item.reference_id,
                        success: true,
                        event: Some(event),
                        error: None,
                    });
                }
                Err(e) => {
                    failed += 1;
                    results.push(BatchItemOutcome {
                        index,
                        reference_id: item.reference_id,
                        success: false,
                        event: None,
                        error: Some(batch_item_error(&e)),
                    });

                    if fail_fast {
                        for (skipped_index, skipped) in items.by_ref() {
                            failed += 1;
                            results.push(BatchItemOutcome {
                                index: skipped_index,
                                reference_id: skipped.reference_id,
                                success: false,
                                event: None,
                                error: Some(BatchItemError {
                                    code: "skipped",
                                    message: "skipped due to fail_fast mode".to_string(),
                                    field: None,
                                }),
                            });
                        }
                        break;
                    }
                }
            }
        }

        tracing::info!(total, successful, failed, "batch admission finished");

        Ok(BatchOutcome {
            total,
            successful,
            failed,
            results,
        })
    }

    #[instrument(skip(self), err)]
    pub async fn get_event(&self, id: &str) -> Result<Event> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        let mut repo = Events::new(&mut conn);
        repo.get_by_id(id).await?.ok_or_else(|| Error::NotFound {
            resource: "Event".to_string(),
            id: id.to_string(),
        })
    }

    /// List with cursor pagination. Returns the page plus the cursor pair of
    /// the next page's anchor, if any.
    #[instrument(skip_all, err)]
    pub async fn list_events(
        &self,
        filter: &EventFilter,
        limit: i64,
        cursor: Option<(chrono::DateTime<Utc>, String)>,
    ) -> Result<(Vec<Event>, Option<(chrono::DateTime<Utc>, String)>)> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        let mut repo = Events::new(&mut conn);

        let mut events = repo.list(filter, limit + 1, cursor).await?;
        let next_cursor = if events.len() as i64 > limit {
            events.truncate(limit as usize);
            events.last().map(|e| (e.created_at, e.id.clone()))
        } else {
            None
        };

        Ok((events, next_cursor))
    }

    /// Replay an event: create a fresh event row (optionally with payload
    /// and metadata overrides) and fan it out to explicit targets or to the
    /// matcher's picks.
    #[instrument(skip(self, options), err)]
    pub async fn replay_event(&self, id: &str, options: ReplayOptions) -> Result<ReplayOutcome> {
        let original = self.get_event(id).await?;

        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;

        // Resolve targets before writing anything.
        let targets = {
            let mut repo = Subscriptions::new(&mut conn);
            match &options.target_subscription_ids {
                Some(ids) if !ids.is_empty() => {
                    let found = repo.get_many(ids).await?;
                    for id in ids {
                        if !found.iter().any(|s| &s.id == id) {
                            return Err(Error::NotFound {
                                resource: "Subscription".to_string(),
                                id: id.clone(),
                            });
                        }
                    }
                    found.into_iter().filter(|s| s.is_active()).collect::<Vec<_>>()
                }
                _ => {
                    let candidates = repo.list_active_healthy().await?;
                    candidates
                        .into_iter()
                        .filter(|s| {
                            matcher::subscription_matches(s, &original.event_type, &original.source)
                        })
                        .collect()
                }
            }
        };
        let target_ids: Vec<String> = targets.iter().map(|s| s.id.clone()).collect();

        if options.dry_run {
            return Ok(ReplayOutcome {
                event_id: original.id,
                replay_event_id: None,
                dry_run: true,
                target_subscriptions: target_ids,
                message: "dry run: event would be replayed to the listed subscriptions".to_string(),
            });
        }

        let data = options.payload_override.unwrap_or_else(|| original.data.clone());
        let mut metadata = options
            .metadata_override
            .or_else(|| original.metadata.clone())
            .unwrap_or_else(|| json!({}));
        if let Some(map) = metadata.as_object_mut() {
            map.insert("replay_of".to_string(), json!(original.id));
        }

        let replay_id = types::event_id();
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;

        let replay_event = {
            let mut repo = Events::new(&mut tx);
            repo.create(&EventCreateDBRequest {
                id: replay_id.clone(),
                event_type: original.event_type.clone(),
                source: original.source.clone(),
                data,
                metadata: Some(metadata),
                idempotency_key: None,
                credential_id: original.credential_id.clone(),
            })
            .await?
        };

        if !targets.is_empty() {
            for subscription in &targets {
                let mut repo = Deliveries::new(&mut tx);
                repo.create(&DeliveryCreateDBRequest {
                    id: types::delivery_id(),
                    event_id: replay_id.clone(),
                    subscription_id: subscription.id.clone(),
                    max_attempts: subscription.max_retries + 1,
                    request_url: subscription.target_url.clone(),
                })
                .await?;
            }
            let mut repo = Events::new(&mut tx);
            repo.mark_processing(&replay_id, targets.len() as i32).await?;
        }

        tx.commit().await.map_err(DbError::from)?;

        // Targeted replays tag the envelope so stream filters can see them.
        let target_tag = (!target_ids.is_empty()).then_some(target_ids.as_slice());
        let envelope = stream_envelope(&replay_event, target_tag);
        if let Err(e) = self.store.publish_stream(&envelope.to_string()).await {
            tracing::warn!(error = %e, event_id = %replay_id, "failed to publish replay to stream");
        }

        tracing::info!(
            original_event_id = %original.id,
            replay_event_id = %replay_id,
            targets = target_ids.len(),
            "event replayed"
        );

        Ok(ReplayOutcome {
            event_id: original.id,
            replay_event_id: Some(replay_id),
            dry_run: false,
            target_subscriptions: target_ids,
            message: "event re-queued for delivery".to_string(),
        })
    }
}

/// The envelope published on the live stream topic.
pub fn stream_envelope(event: &Event, target_subscriptions: Option<&[String]>) -> serde_json::Value {
    let mut envelope = json!({
        "id": event.id,
        "event_type": event.event_type,
        "source": event.source,
        "data": event.data,
        "metadata": event.metadata,
        "status": event.status,
        "created_at": event.created_at,
    });
    if let Some(targets) = target_subscriptions {
        envelope["_target_subscriptions"] = json!(targets);
    }
    envelope
}

fn batch_item_error(error: &Error) -> BatchItemError {
    match error {
        Error::IdempotencyConflict { existing_event_id } => BatchItemError {
            code: "duplicate_idempotency_key",
            message: format!("idempotency key already used for event: {existing_event_id}"),
            field: Some("idempotency_key"),
        },
        Error::PayloadTooLarge { .. } => BatchItemError {
            code: "payload_too_large",
            message: error.user_message(),
            field: Some("data"),
        },
        Error::Validation { .. } => BatchItemError {
            code: "validation_error",
            message: error.user_message(),
            field: None,
        },
        _ => BatchItemError {
            code: "internal_error",
            message: error.user_message(),
            field: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_event(event_type: &str, source: &str) -> NewEvent {
        NewEvent {
            event_type: event_type.to_string(),
            source: source.to_string(),
            data: json!({"ok": true}),
            metadata: None,
            idempotency_key: None,
        }
    }

    #[test]
    fn test_validate_accepts_dotted_types() {
        assert!(IngestService::validate(&new_event("user.created", "auth")).is_ok());
        assert!(IngestService::validate(&new_event("a.b-c_d.E2", "svc")).is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_type_chars() {
        assert!(IngestService::validate(&new_event("user created", "auth")).is_err());
        assert!(IngestService::validate(&new_event("user/created", "auth")).is_err());
        assert!(IngestService::validate(&new_event("", "auth")).is_err());
        assert!(IngestService::validate(&new_event(&"x".repeat(256), "auth")).is_err());
    }

    #[test]
    fn test_validate_rejects_empty_source() {
        assert!(IngestService::validate(&new_event("user.created", "")).is_err());
        assert!(IngestService::validate(&new_event("user.created", &"s".repeat(256))).is_err());
    }

    #[test]
    fn test_validate_rejects_oversized_payload() {
        let mut request = new_event("user.created", "auth");
        request.data = json!({"blob": "x".repeat(MAX_PAYLOAD_BYTES)});
        let err = IngestService::validate(&request).unwrap_err();
        assert!(matches!(err, Error::PayloadTooLarge { .. }));
    }

    #[test]
    fn test_validate_rejects_empty_idempotency_key() {
        let mut request = new_event("user.created", "auth");
        request.idempotency_key = Some(String::new());
        assert!(IngestService::validate(&request).is_err());
    }

    #[test]
    fn test_batch_item_error_codes() {
        let conflict = Error::IdempotencyConflict {
            existing_event_id: "evt_x".to_string(),
        };
        assert_eq!(batch_item_error(&conflict).code, "duplicate_idempotency_key");

        let too_large = Error::PayloadTooLarge {
            message: "big".to_string(),
        };
        assert_eq!(batch_item_error(&too_large).code, "payload_too_large");

        let invalid = Error::Validation {
            message: "bad".to_string(),
        };
        assert_eq!(batch_item_error(&invalid).code, "validation_error");

        let internal = Error::Internal {
            operation: "x".to_string(),
        };
        assert_eq!(batch_item_error(&internal).code, "internal_error");
    }

    #[test]
    fn test_stream_envelope_shape() {
        let event = Event {
            id: "evt_01ABC".to_string(),
            event_type: "user.created".to_string(),
            source: "auth".to_string(),
            data: json!({"id": "u1"}),
            metadata: None,
            status: "pending".to_string(),
            idempotency_key: None,
            credential_id: None,
            delivery_attempts: 0,
            successful_deliveries: 0,
            failed_deliveries: 0,
            last_error: None,
            processed_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let plain = stream_envelope(&event, None);
        assert_eq!(plain["id"], "evt_01ABC");
        assert_eq!(plain["status"], "pending");
        assert!(plain.get("_target_subscriptions").is_none());

        let targeted = stream_envelope(&event, Some(&["sub_01".to_string()]));
        assert_eq!(targeted["_target_subscriptions"][0], "sub_01");
    }
}
