//! Fast store: queues, idempotency cache, receipt handles, credential
//! cache, token buckets, and the live-stream pub/sub topic.
//!
//! Everything here goes through atomic Redis primitives (list push/pop,
//! SETEX, DEL, PUBLISH, a Lua token-bucket script), so multiple replicas can
//! share one instance without coordination.
//!
//! Key layout (bit-exact wire contract):
//!
//! | key | shape |
//! |---|---|
//! | `queue:events` | list of [`QueueMessage`] JSON, left-push / right-pop |
//! | `queue:events:dlq` | list of [`DlqMessage`] JSON |
//! | `idempotency:{key}` | string event id, TTL 24 h |
//! | `inbox:receipt:{handle}` | [`ReceiptData`] JSON, TTL visibility + 60 s |
//! | `api_key:{hash}` | cached credential JSON (TTL 5 min) or `"invalid"` (60 s) |
//! | `rate_limit:tokens:{id}` / `rate_limit:ts:{id}` | numeric, TTL 1 h |
//! | `events:stream` | pub/sub topic carrying event envelopes |

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisResult, Script};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::instrument;

pub const EVENTS_QUEUE: &str = "queue:events";
pub const EVENTS_PROCESSING: &str = "queue:events:processing";
pub const EVENTS_DLQ: &str = "queue:events:dlq";
pub const EVENTS_CHANNEL: &str = "events:stream";

const IDEMPOTENCY_TTL_SECS: u64 = 86_400;
const API_KEY_CACHE_TTL_SECS: u64 = 300;
const API_KEY_NEGATIVE_TTL_SECS: u64 = 60;
const RATE_LIMIT_TTL_SECS: u64 = 3_600;

/// Negative cache marker for invalid credentials.
pub const INVALID_KEY_MARKER: &str = "invalid";

/// Message pushed to `queue:events` on admission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    pub event_id: String,
    pub event_type: String,
    pub source: String,
    pub created_at: Option<DateTime<Utc>>,
    pub enqueued_at: DateTime<Utc>,
}

/// Message parked on `queue:events:dlq` when a delivery exhausts its budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqMessage {
    pub event_id: String,
    pub event_type: String,
    pub source: String,
    pub created_at: Option<DateTime<Utc>>,
    pub enqueued_at: Option<DateTime<Utc>>,
    pub dlq_entered_at: DateTime<Utc>,
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub retry_count: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retried_at: Option<DateTime<Utc>>,
}

/// Receipt-handle mapping for pull consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiptData {
    pub event_id: String,
    pub deadline: DateTime<Utc>,
}

/// Token-bucket verdict.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Unix seconds when the bucket refills to capacity
    pub reset_at: i64,
}

impl RateLimitDecision {
    pub fn retry_after_secs(&self, now_unix: i64) -> u64 {
        (self.reset_at - now_unix).max(1) as u64
    }
}

/// Atomic token bucket. State is two SETEX'd numerics so replicas share one
/// bucket; the whole read-refill-consume step runs server-side.
static TOKEN_BUCKET_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local tokens_key = KEYS[1]
        local timestamp_key = KEYS[2]
        local rate = tonumber(ARGV[1])
        local capacity = tonumber(ARGV[2])
        local now = tonumber(ARGV[3])
        local ttl = tonumber(ARGV[4])

        local last_tokens = tonumber(redis.call('GET', tokens_key) or capacity)
        local last_time = tonumber(redis.call('GET', timestamp_key) or now)

        local elapsed = math.max(0, now - last_time)
        local current_tokens = math.min(capacity, last_tokens + elapsed * rate)

        local allowed = 0
        local new_tokens = current_tokens
        if current_tokens >= 1 then
            allowed = 1
            new_tokens = current_tokens - 1
        end

        redis.call('SETEX', tokens_key, ttl, new_tokens)
        redis.call('SETEX', timestamp_key, ttl, now)

        local reset_at = math.ceil(now + (capacity - new_tokens) / rate)

        return {allowed, math.floor(new_tokens), reset_at}
        "#,
    )
});

/// Handle to the fast store. Cheap to clone; the inner connection manager
/// multiplexes one connection and reconnects on failure.
#[derive(Clone)]
pub struct FastStore {
    manager: ConnectionManager,
    client: redis::Client,
}

impl FastStore {
    /// Connect to the fast store and verify it answers.
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self { manager, client })
    }

    /// Round-trip PING, returning the observed latency.
    pub async fn ping(&self) -> RedisResult<Duration> {
        let start = Instant::now();
        let mut conn = self.manager.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(start.elapsed())
    }

    // ===== Event queue =====

    #[instrument(skip_all, fields(event_id = %message.event_id), err)]
    pub async fn enqueue_event(&self, message: &QueueMessage) -> RedisResult<()> {
        let raw = serde_json::to_string(message).unwrap_or_default();
        let mut conn = self.manager.clone();
        conn.lpush::<_, _, ()>(EVENTS_QUEUE, raw).await
    }

    pub async fn queue_depth(&self) -> RedisResult<i64> {
        let mut conn = self.manager.clone();
        conn.llen(EVENTS_QUEUE).await
    }

    /// Age of the oldest queued message, if any.
    ///
    /// Items are left-pushed, so the right end is the oldest.
    pub async fn oldest_queue_item_age(&self) -> RedisResult<Option<f64>> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = conn.lindex(EVENTS_QUEUE, -1).await?;
        Ok(raw
            .and_then(|r| serde_json::from_str::<QueueMessage>(&r).ok())
            .map(|m| (Utc::now() - m.enqueued_at).num_milliseconds() as f64 / 1000.0))
    }

    /// Re-queue a raw message (DLQ retry path pushes the rebuilt message).
    pub async fn requeue_raw(&self, raw: &str) -> RedisResult<()> {
        let mut conn = self.manager.clone();
        conn.lpush::<_, _, ()>(EVENTS_QUEUE, raw).await
    }

    // ===== Dead-letter queue =====

    #[instrument(skip_all, fields(event_id = %message.event_id), err)]
    pub async fn push_dlq(&self, message: &DlqMessage) -> RedisResult<()> {
        let raw = serde_json::to_string(message).unwrap_or_default();
        let mut conn = self.manager.clone();
        conn.lpush::<_, _, ()>(EVENTS_DLQ, raw).await
    }

    pub async fn dlq_depth(&self) -> RedisResult<i64> {
        let mut conn = self.manager.clone();
        conn.llen(EVENTS_DLQ).await
    }

    /// Full DLQ scan. The DLQ is bounded by the retry budget, so a full
    /// LRANGE stays reasonable; filtering happens in the service layer.
    pub async fn dlq_items(&self) -> RedisResult<Vec<String>> {
        let mut conn = self.manager.clone();
        conn.lrange(EVENTS_DLQ, 0, -1).await
    }

    /// Remove exactly one occurrence of the serialized entry. The loser of a
    /// concurrent retry/dismiss race sees 0 removed.
    pub async fn remove_dlq_item(&self, raw: &str) -> RedisResult<i64> {
        let mut conn = self.manager.clone();
        conn.lrem(EVENTS_DLQ, 1, raw).await
    }

    /// Drop the whole DLQ, returning how many entries were purged.
    pub async fn purge_dlq(&self) -> RedisResult<i64> {
        let mut conn = self.manager.clone();
        let count: i64 = conn.llen(EVENTS_DLQ).await?;
        conn.del::<_, ()>(EVENTS_DLQ).await?;
        Ok(count)
    }

    // ===== Idempotency cache =====

    pub async fn get_idempotency(&self, key: &str) -> RedisResult<Option<String>> {
        let mut conn = self.manager.clone();
        conn.get(format!("idempotency:{key}")).await
    }

    pub async fn put_idempotency(&self, key: &str, event_id: &str) -> RedisResult<()> {
        let mut conn = self.manager.clone();
        conn.set_ex::<_, _, ()>(format!("idempotency:{key}"), event_id, IDEMPOTENCY_TTL_SECS)
            .await
    }

    // ===== Receipt handles =====

    pub async fn put_receipt(&self, handle: &str, data: &ReceiptData) -> RedisResult<()> {
        let ttl = ((data.deadline - Utc::now()).num_seconds().max(0) as u64) + 60;
        let raw = serde_json::to_string(data).unwrap_or_default();
        let mut conn = self.manager.clone();
        conn.set_ex::<_, _, ()>(format!("inbox:receipt:{handle}"), raw, ttl).await
    }

    pub async fn get_receipt(&self, handle: &str) -> RedisResult<Option<ReceiptData>> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = conn.get(format!("inbox:receipt:{handle}")).await?;
        Ok(raw.and_then(|r| serde_json::from_str(&r).ok()))
    }

    pub async fn delete_receipt(&self, handle: &str) -> RedisResult<()> {
        let mut conn = self.manager.clone();
        conn.del::<_, ()>(format!("inbox:receipt:{handle}")).await
    }

    /// Mark an event invisible to pull consumers for `ttl_secs`. Stored
    /// under `inbox:hidden:{event_id}` with the owning handle as the value;
    /// expiry alone restores visibility.
    pub async fn hide_event(&self, event_id: &str, handle: &str, ttl_secs: u64) -> RedisResult<()> {
        let mut conn = self.manager.clone();
        conn.set_ex::<_, _, ()>(format!("inbox:hidden:{event_id}"), handle, ttl_secs.max(1))
            .await
    }

    pub async fn is_event_hidden(&self, event_id: &str) -> RedisResult<bool> {
        let mut conn = self.manager.clone();
        let value: Option<String> = conn.get(format!("inbox:hidden:{event_id}")).await?;
        Ok(value.is_some())
    }

    pub async fn unhide_event(&self, event_id: &str) -> RedisResult<()> {
        let mut conn = self.manager.clone();
        conn.del::<_, ()>(format!("inbox:hidden:{event_id}")).await
    }

    // ===== Credential cache =====

    pub async fn get_cached_credential(&self, key_hash: &str) -> RedisResult<Option<String>> {
        let mut conn = self.manager.clone();
        conn.get(format!("api_key:{key_hash}")).await
    }

    pub async fn cache_credential(&self, key_hash: &str, json: &str) -> RedisResult<()> {
        let mut conn = self.manager.clone();
        conn.set_ex::<_, _, ()>(format!("api_key:{key_hash}"), json, API_KEY_CACHE_TTL_SECS)
            .await
    }

    pub async fn cache_invalid_credential(&self, key_hash: &str) -> RedisResult<()> {
        let mut conn = self.manager.clone();
        conn.set_ex::<_, _, ()>(
            format!("api_key:{key_hash}"),
            INVALID_KEY_MARKER,
            API_KEY_NEGATIVE_TTL_SECS,
        )
        .await
    }

    // ===== Rate limiting =====

    /// One atomic token-bucket step for `identifier` (`key:{id}` or
    /// `ip:{addr}`).
    pub async fn check_rate_limit(
        &self,
        identifier: &str,
        rate: f64,
        capacity: u64,
    ) -> RedisResult<RateLimitDecision> {
        let now = Utc::now().timestamp_millis() as f64 / 1000.0;
        let mut conn = self.manager.clone();
        let (allowed, remaining, reset_at): (i64, i64, i64) = TOKEN_BUCKET_SCRIPT
            .key(format!("rate_limit:tokens:{identifier}"))
            .key(format!("rate_limit:ts:{identifier}"))
            .arg(rate)
            .arg(capacity)
            .arg(now)
            .arg(RATE_LIMIT_TTL_SECS)
            .invoke_async(&mut conn)
            .await?;

        Ok(RateLimitDecision {
            allowed: allowed == 1,
            limit: capacity,
            remaining: remaining.max(0) as u64,
            reset_at,
        })
    }

    pub async fn reset_rate_limit(&self, identifier: &str) -> RedisResult<()> {
        let mut conn = self.manager.clone();
        conn.del::<_, ()>(vec![
            format!("rate_limit:tokens:{identifier}"),
            format!("rate_limit:ts:{identifier}"),
        ])
        .await
    }

    // ===== Live stream =====

    /// Publish a serialized event envelope on the stream topic.
    pub async fn publish_stream(&self, payload: &str) -> RedisResult<()> {
        let mut conn = self.manager.clone();
        conn.publish::<_, _, ()>(EVENTS_CHANNEL, payload).await
    }

    /// Open a dedicated pub/sub connection subscribed to the stream topic.
    /// Each SSE client gets its own; dropping it unsubscribes.
    pub async fn subscribe_stream(&self) -> RedisResult<redis::aio::PubSub> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(EVENTS_CHANNEL).await?;
        Ok(pubsub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_message_wire_shape() {
        let message = QueueMessage {
            event_id: "evt_01ABC".to_string(),
            event_type: "user.created".to_string(),
            source: "auth".to_string(),
            created_at: Some(Utc::now()),
            enqueued_at: Utc::now(),
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["event_id"], "evt_01ABC");
        assert!(json.get("created_at").is_some());
        assert!(json.get("enqueued_at").is_some());
    }

    #[test]
    fn test_dlq_message_roundtrip() {
        let message = DlqMessage {
            event_id: "evt_01ABC".to_string(),
            event_type: "user.created".to_string(),
            source: "auth".to_string(),
            created_at: None,
            enqueued_at: None,
            dlq_entered_at: Utc::now(),
            failure_reason: Some("HTTP 500".to_string()),
            retry_count: 3,
            retried_at: None,
        };
        let raw = serde_json::to_string(&message).unwrap();
        let back: DlqMessage = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.event_id, message.event_id);
        assert_eq!(back.retry_count, 3);
        // retried_at is omitted entirely until a retry happens
        assert!(!raw.contains("retried_at"));
    }

    #[test]
    fn test_dlq_message_tolerates_missing_counters() {
        // Entries written by older processes may omit retry_count
        let raw = r#"{"event_id":"evt_x","event_type":"a.b","source":"s","created_at":null,"enqueued_at":null,"dlq_entered_at":"2025-01-01T00:00:00Z","failure_reason":null}"#;
        let message: DlqMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(message.retry_count, 0);
    }

    #[test]
    fn test_rate_limit_retry_after_floor() {
        let decision = RateLimitDecision {
            allowed: false,
            limit: 10,
            remaining: 0,
            reset_at: 100,
        };
        // Already past the reset: still at least one second
        assert_eq!(decision.retry_after_secs(200), 1);
        assert_eq!(decision.retry_after_secs(95), 5);
    }
}
