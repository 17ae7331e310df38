//! Pull-mode inbox: SQS-like fetch with receipt handles and visibility
//! timeouts.
//!
//! Fetch does not flip the event row to `processing`; visibility lives
//! entirely in the fast store. Each fetched event gets a receipt handle
//! (`inbox:receipt:{handle}`) plus a per-event hidden marker
//! (`inbox:hidden:{event_id}`, TTL = the visibility timeout) that keeps
//! other fetchers away until the marker expires or the handle is released.
//! If the fast store is unreachable the mapping is embedded in the handle
//! itself (base64url JSON), so consumers keep working.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use sqlx::PgPool;
use std::collections::HashMap;
use tracing::instrument;

use crate::db::errors::DbError;
use crate::db::handlers::Events;
use crate::db::models::events::Event;
use crate::errors::{Error, Result};
use crate::queue::{FastStore, ReceiptData};

pub const DEFAULT_VISIBILITY_TIMEOUT_SECS: i64 = 30;
pub const MAX_VISIBILITY_TIMEOUT_SECS: i64 = 43_200;
pub const MAX_FETCH_LIMIT: i64 = 100;
pub const MAX_WAIT_TIME_SECS: u64 = 20;
pub const MAX_BATCH_ACK: usize = 100;

const RECEIPT_PREFIX: &str = "rcpt_";

/// Fetch parameters after clamping.
#[derive(Debug, Clone, Default)]
pub struct FetchParams {
    pub limit: Option<i64>,
    pub visibility_timeout_secs: Option<i64>,
    pub event_types: Option<Vec<String>>,
    pub sources: Option<Vec<String>>,
    pub wait_time_secs: Option<u64>,
}

/// A fetched event plus its receipt handle.
#[derive(Debug)]
pub struct InboxItem {
    pub event: Event,
    pub receipt_handle: String,
    pub visibility_deadline: DateTime<Utc>,
    pub delivery_count: i32,
}

/// Per-handle result of a batch acknowledgment.
#[derive(Debug)]
pub struct AckResult {
    pub receipt_handle: String,
    pub success: bool,
    pub error: Option<String>,
}

/// Inbox counters.
#[derive(Debug)]
pub struct InboxStats {
    pub visible: i64,
    pub in_flight: i64,
    pub total: i64,
    pub oldest_event_at: Option<DateTime<Utc>>,
    pub by_event_type: HashMap<String, i64>,
}

/// Fallback handle payload when the fast store is down: short keys to keep
/// the handle compact.
#[derive(Debug, serde::Serialize, Deserialize)]
struct EmbeddedReceipt {
    e: String,
    d: DateTime<Utc>,
}

#[derive(Clone)]
pub struct InboxService {
    pool: PgPool,
    store: FastStore,
}

impl InboxService {
    pub fn new(pool: PgPool, store: FastStore) -> Self {
        Self { pool, store }
    }

    /// Fetch up to `limit` pending events, hiding each behind a fresh
    /// receipt handle for the visibility window. Returns the items and
    /// whether more were available.
    ///
    /// Visibility lives entirely in the fast store: the event row stays
    /// `pending`, and a per-event hidden marker (TTL = the visibility
    /// timeout) keeps other fetchers away until it expires or the handle is
    /// released.
    #[instrument(skip(self, params), err)]
    pub async fn fetch(&self, params: FetchParams) -> Result<(Vec<InboxItem>, bool)> {
        let limit = params.limit.unwrap_or(10).clamp(1, MAX_FETCH_LIMIT);
        let timeout = params
            .visibility_timeout_secs
            .unwrap_or(DEFAULT_VISIBILITY_TIMEOUT_SECS);
        if !(1..=MAX_VISIBILITY_TIMEOUT_SECS).contains(&timeout) {
            return Err(Error::Validation {
                message: format!(
                    "visibility_timeout must be between 1 and {MAX_VISIBILITY_TIMEOUT_SECS} seconds"
                ),
            });
        }

        let mut events = self.select_visible(&params, limit).await?;

        // Optional short poll: one bounded wait-and-retry when empty.
        if events.is_empty() {
            let wait = params.wait_time_secs.unwrap_or(0).min(MAX_WAIT_TIME_SECS);
            if wait > 0 {
                tokio::time::sleep(std::time::Duration::from_secs(wait)).await;
                events = self.select_visible(&params, limit).await?;
            }
        }

        let has_more = events.len() as i64 > limit;
        events.truncate(limit as usize);

        let deadline = Utc::now() + Duration::seconds(timeout);
        let mut items = Vec::with_capacity(events.len());
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;

        for event in events {
            let receipt_handle = self.issue_handle(&event.id, deadline).await;

            if let Err(e) = self
                .store
                .hide_event(&event.id, &receipt_handle, timeout as u64)
                .await
            {
                tracing::warn!(error = %e, event_id = %event.id, "failed to hide fetched event");
            }

            let mut repo = Events::new(&mut conn);
            let delivery_count = repo.increment_delivery_attempts(&event.id).await?;

            items.push(InboxItem {
                event,
                receipt_handle,
                visibility_deadline: deadline,
                delivery_count,
            });
        }

        Ok((items, has_more))
    }

    /// Collect up to `limit + 1` visible pending events, paging past rows
    /// hidden by outstanding receipt handles. The page loop is bounded so a
    /// huge hidden backlog cannot stall a fetch.
    async fn select_visible(&self, params: &FetchParams, limit: i64) -> Result<Vec<Event>> {
        const MAX_PAGES: usize = 5;

        let window = (limit + 1).max(10);
        let mut visible = Vec::new();
        let mut offset = 0;

        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;

        for _ in 0..MAX_PAGES {
            let batch = {
                let mut repo = Events::new(&mut conn);
                repo.fetch_pending(
                    params.event_types.as_deref(),
                    params.sources.as_deref(),
                    window,
                    offset,
                )
                .await?
            };
            let batch_len = batch.len() as i64;

            for event in batch {
                if visible.len() as i64 > limit {
                    break;
                }
                // A fast-store error leaves visibility unenforced rather
                // than blocking consumption.
                let hidden = self.store.is_event_hidden(&event.id).await.unwrap_or(false);
                if !hidden {
                    visible.push(event);
                }
            }

            if visible.len() as i64 > limit || batch_len < window {
                break;
            }
            offset += window;
        }

        Ok(visible)
    }

    /// Allocate a receipt handle. Prefers the fast store; embeds the
    /// mapping in the handle itself if the store is unreachable.
    async fn issue_handle(&self, event_id: &str, deadline: DateTime<Utc>) -> String {
        use rand::RngCore;

        let mut token = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut token);
        let handle = format!("{RECEIPT_PREFIX}{}", URL_SAFE_NO_PAD.encode(token));

        let data = ReceiptData {
            event_id: event_id.to_string(),
            deadline,
        };
        match self.store.put_receipt(&handle, &data).await {
            Ok(()) => handle,
            Err(e) => {
                tracing::warn!(error = %e, "fast store unavailable, embedding receipt in handle");
                let embedded = EmbeddedReceipt {
                    e: event_id.to_string(),
                    d: deadline,
                };
                let raw = serde_json::to_vec(&embedded).unwrap_or_default();
                format!("{RECEIPT_PREFIX}{}", URL_SAFE_NO_PAD.encode(raw))
            }
        }
    }

    /// Resolve a handle to its event id, if valid and unexpired.
    async fn resolve_handle(&self, receipt_handle: &str) -> Option<String> {
        if !receipt_handle.starts_with(RECEIPT_PREFIX) {
            return None;
        }

        match self.store.get_receipt(receipt_handle).await {
            Ok(Some(data)) => {
                if Utc::now() <= data.deadline {
                    return Some(data.event_id);
                }
                return None;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, "fast store unavailable for receipt lookup");
            }
        }

        // Fallback: the handle may embed its own mapping.
        let encoded = &receipt_handle[RECEIPT_PREFIX.len()..];
        let raw = URL_SAFE_NO_PAD.decode(encoded).ok()?;
        let embedded: EmbeddedReceipt = serde_json::from_slice(&raw).ok()?;
        (Utc::now() <= embedded.d).then_some(embedded.e)
    }

    /// Acknowledge: terminal `delivered`, handle deleted.
    #[instrument(skip(self, receipt_handle), err)]
    pub async fn ack(&self, receipt_handle: &str) -> Result<()> {
        let Some(event_id) = self.resolve_handle(receipt_handle).await else {
            return Err(Error::NotFound {
                resource: "Receipt handle".to_string(),
                id: receipt_handle.to_string(),
            });
        };

        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        let mut repo = Events::new(&mut conn);
        let updated = repo.ack_delivered(&event_id).await?;
        if !updated {
            return Err(Error::NotFound {
                resource: "Event".to_string(),
                id: event_id,
            });
        }

        if let Err(e) = self.store.delete_receipt(receipt_handle).await {
            tracing::warn!(error = %e, "failed to delete receipt handle");
        }
        if let Err(e) = self.store.unhide_event(&event_id).await {
            tracing::warn!(error = %e, "failed to clear visibility marker");
        }

        tracing::debug!(event_id = %event_id, "event acknowledged");
        Ok(())
    }

    /// Acknowledge up to 100 handles; duplicates collapse to one attempt.
    #[instrument(skip(self, receipt_handles), err)]
    pub async fn ack_batch(&self, receipt_handles: Vec<String>) -> Result<Vec<AckResult>> {
        if receipt_handles.len() > MAX_BATCH_ACK {
            return Err(Error::Validation {
                message: format!("at most {MAX_BATCH_ACK} receipt handles per batch"),
            });
        }

        let mut seen = std::collections::HashSet::new();
        let mut results = Vec::new();

        for handle in receipt_handles {
            if !seen.insert(handle.clone()) {
                continue;
            }
            match self.ack(&handle).await {
                Ok(()) => results.push(AckResult {
                    receipt_handle: handle,
                    success: true,
                    error: None,
                }),
                Err(e) => results.push(AckResult {
                    receipt_handle: handle,
                    success: false,
                    error: Some(e.user_message()),
                }),
            }
        }

        Ok(results)
    }

    /// Replace a handle's visibility deadline. A timeout of zero makes the
    /// event visible immediately by deleting the handle.
    #[instrument(skip(self, receipt_handle), err)]
    pub async fn change_visibility(
        &self,
        receipt_handle: &str,
        timeout_secs: i64,
    ) -> Result<DateTime<Utc>> {
        if !(0..=MAX_VISIBILITY_TIMEOUT_SECS).contains(&timeout_secs) {
            return Err(Error::Validation {
                message: format!(
                    "visibility_timeout must be between 0 and {MAX_VISIBILITY_TIMEOUT_SECS} seconds"
                ),
            });
        }

        let Some(event_id) = self.resolve_handle(receipt_handle).await else {
            return Err(Error::NotFound {
                resource: "Receipt handle".to_string(),
                id: receipt_handle.to_string(),
            });
        };

        let new_deadline = Utc::now() + Duration::seconds(timeout_secs);

        if timeout_secs == 0 {
            // Immediate re-visibility: drop both the handle and the marker.
            if let Err(e) = self.store.delete_receipt(receipt_handle).await {
                tracing::warn!(error = %e, "failed to delete receipt handle");
            }
            if let Err(e) = self.store.unhide_event(&event_id).await {
                tracing::warn!(error = %e, "failed to clear visibility marker");
            }
            return Ok(new_deadline);
        }

        let data = ReceiptData {
            event_id: event_id.clone(),
            deadline: new_deadline,
        };
        if let Err(e) = self.store.put_receipt(receipt_handle, &data).await {
            tracing::warn!(error = %e, "failed to update receipt handle");
            return Err(Error::Unavailable {
                component: "fast store".to_string(),
            });
        }
        if let Err(e) = self
            .store
            .hide_event(&event_id, receipt_handle, timeout_secs as u64)
            .await
        {
            tracing::warn!(error = %e, "failed to refresh visibility marker");
        }

        Ok(new_deadline)
    }

    /// Inbox counters grouped by status plus a pending-type breakdown.
    #[instrument(skip(self), err)]
    pub async fn stats(&self) -> Result<InboxStats> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        let mut repo = Events::new(&mut conn);

        let counts: HashMap<String, i64> = repo.count_by_status().await?.into_iter().collect();
        let oldest = repo.oldest_pending_created_at().await?;
        let by_type: HashMap<String, i64> =
            repo.pending_counts_by_type().await?.into_iter().collect();

        let visible = counts.get("pending").copied().unwrap_or(0);
        let in_flight = counts.get("processing").copied().unwrap_or(0);
        let total = counts.values().sum();

        Ok(InboxStats {
            visible,
            in_flight,
            total,
            oldest_event_at: oldest,
            by_event_type: by_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_receipt_roundtrip() {
        let embedded = EmbeddedReceipt {
            e: "evt_01ABC".to_string(),
            d: Utc::now() + Duration::seconds(30),
        };
        let raw = serde_json::to_vec(&embedded).unwrap();
        let handle = format!("{RECEIPT_PREFIX}{}", URL_SAFE_NO_PAD.encode(&raw));

        assert!(handle.starts_with("rcpt_"));
        let decoded = URL_SAFE_NO_PAD
            .decode(&handle[RECEIPT_PREFIX.len()..])
            .unwrap();
        let back: EmbeddedReceipt = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(back.e, "evt_01ABC");
    }

    #[test]
    fn test_handle_prefix_required() {
        // resolve_handle is async + store-backed, but the prefix gate is
        // what rejects garbage before any lookup happens.
        assert!(!"bogus_abc".starts_with(RECEIPT_PREFIX));
        assert!("rcpt_abc".starts_with(RECEIPT_PREFIX));
    }
}
