//! Webhook delivery worker pool: claim, sign, send, record.
//!
//! ```text
//! dispatcher.tick()
//!   ├─ claim_and_send()
//!   │    ├─ DB: claim_due()                    // FOR UPDATE SKIP LOCKED
//!   │    │                                     // + JOIN event payload + subscription
//!   │    └─ for each claimed delivery:
//!   │         ├─ DB: cancel()                  // only if subscription gone/inactive
//!   │         ├─ CPU: sign envelope            // HMAC-SHA256
//!   │         ├─ DB: record_request()          // snapshot with secrets redacted
//!   │         └─ send_tx.try_send(request) ───────────────────────┐
//!   │                                                             │
//!   │              ┌──────────────────────────────────────────────┘
//!   │              ▼
//!   │         run_sender (spawned task):
//!   │              ├─ acquire semaphore permit (caps concurrency)
//!   │              ├─ spawn HTTP POST with per-subscription timeout
//!   │              └─ result_tx.send(result) ─────────────────────┐
//!   │                                                             │
//!   └─ drain_results()                                            │
//!        ├─ result_rx.try_recv() ◄──────────────────────────────--┘
//!        └─ 2xx → delivered  |  budget left → retrying  |  else → exhausted + DLQ
//! ```
//!
//! The sender task has no DB access and no secrets. Deliveries stuck
//! `in_flight` after a crash become claimable again after five minutes, so
//! shutdown never has to drain perfectly.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use sqlx::{PgConnection, PgPool};
use tokio::sync::{Semaphore, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::DispatcherConfig;
use crate::db::handlers::{Deliveries, Events, Subscriptions};
use crate::db::models::deliveries::{
    AttemptRecord, ClaimedDelivery, ErrorType, ResponseSnapshot,
};
use crate::db::models::subscriptions::SubscriptionStatus;
use crate::delivery::retry::{RetryPolicy, next_delay_seconds};
use crate::delivery::signing;
use crate::queue::{DlqMessage, FastStore};

/// Stored response bodies are truncated to this many bytes.
const MAX_RESPONSE_BODY_BYTES: usize = 10 * 1024;

pub const USER_AGENT: &str = concat!("fanout/", env!("CARGO_PKG_VERSION"));

// --- Channel types ---

/// Identity and policy carried from claim to result processing.
#[derive(Debug, Clone)]
struct DeliveryMeta {
    delivery_id: String,
    event_id: String,
    subscription_id: String,
    attempt_count: i32,
    max_attempts: i32,
    retry_policy: RetryPolicy,
    event_type: String,
    event_source: String,
    event_created_at: chrono::DateTime<Utc>,
}

/// A signed webhook HTTP request ready to send.
#[derive(Debug)]
struct WebhookSendRequest {
    meta: DeliveryMeta,
    url: String,
    headers: Vec<(String, String)>,
    body: String,
    timeout_secs: u64,
}

/// Outcome of a single HTTP send attempt.
#[derive(Debug)]
enum SendOutcome {
    Delivered {
        response: ResponseSnapshot,
    },
    Failed {
        error_type: ErrorType,
        message: String,
        response: ResponseSnapshot,
    },
}

/// Result of a send attempt, posted back on the result channel.
#[derive(Debug)]
struct WebhookSendResult {
    meta: DeliveryMeta,
    outcome: SendOutcome,
}

// --- Dispatcher ---

pub struct WebhookDispatcher {
    pool: PgPool,
    store: FastStore,
    config: DispatcherConfig,
    send_tx: mpsc::Sender<WebhookSendRequest>,
    result_rx: mpsc::Receiver<WebhookSendResult>,
}

impl WebhookDispatcher {
    /// Create a dispatcher and spawn its background sender task.
    pub fn spawn(
        pool: PgPool,
        store: FastStore,
        config: DispatcherConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let (send_tx, send_rx) = mpsc::channel::<WebhookSendRequest>(config.channel_capacity);
        let (result_tx, result_rx) = mpsc::channel(config.channel_capacity);

        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .expect("failed to create webhook HTTP client");

        tokio::spawn(run_sender(
            send_rx,
            result_tx,
            http_client,
            config.concurrency,
            shutdown,
        ));

        Self {
            pool,
            store,
            config,
            send_tx,
            result_rx,
        }
    }

    /// Poll loop. Stops claiming on shutdown, then gives in-flight sends a
    /// bounded grace period to report their outcomes.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let poll = Duration::from_millis(self.config.poll_interval_ms);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(poll) => self.tick().await,
            }
        }

        tracing::info!("delivery dispatcher draining in-flight sends");

        // Closing the send channel lets the sender task finish; result_rx
        // yields None once every spawned send has reported or timed out.
        let WebhookDispatcher {
            pool,
            store,
            config,
            send_tx,
            mut result_rx,
        } = self;
        drop(send_tx);

        let deadline = Instant::now() + Duration::from_secs(config.shutdown_grace_secs);
        loop {
            match tokio::time::timeout_at(deadline, result_rx.recv()).await {
                Ok(Some(result)) => match pool.acquire().await {
                    Ok(mut conn) => handle_result(&mut conn, &store, result).await,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to acquire connection during drain");
                        break;
                    }
                },
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!("shutdown grace elapsed with sends still in flight");
                    break;
                }
            }
        }

        tracing::info!("delivery dispatcher stopped");
    }

    /// Run one dispatch cycle: claim + sign + send, then process results.
    pub async fn tick(&mut self) {
        self.claim_and_send().await;
        self.drain_results().await;
    }

    /// Claim due deliveries, sign them, and push to the sender channel.
    async fn claim_and_send(&self) {
        let mut conn = match self.pool.acquire().await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "failed to acquire connection for delivery claims");
                return;
            }
        };

        let claimed = {
            let mut repo = Deliveries::new(&mut conn);
            match repo.claim_due(self.config.batch_size).await {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to claim due deliveries");
                    return;
                }
            }
        };

        if claimed.is_empty() {
            return;
        }

        counter!("fanout_deliveries_claimed_total").increment(claimed.len() as u64);
        tracing::debug!(count = claimed.len(), "claimed deliveries for sending");

        for delivery in claimed {
            if let Err(e) = self.prepare_and_send(&mut conn, delivery).await {
                tracing::warn!(error = %e, "failed to prepare delivery");
            }
        }
    }

    /// Build, snapshot, and enqueue one outbound request. Cancels the
    /// delivery if the subscription is gone or no longer active.
    async fn prepare_and_send(
        &self,
        conn: &mut PgConnection,
        delivery: ClaimedDelivery,
    ) -> crate::db::errors::Result<()> {
        let active = delivery.subscription_status.as_deref()
            == Some(SubscriptionStatus::Active.as_str())
            && delivery.subscription_deleted_at.is_none();

        let (Some(url), Some(secret)) = (&delivery.target_url, &delivery.signing_secret) else {
            tracing::warn!(
                delivery_id = %delivery.id,
                subscription_id = %delivery.subscription_id,
                "subscription not found for delivery, cancelling"
            );
            let mut repo = Deliveries::new(&mut *conn);
            repo.cancel(&delivery.id, "subscription not found").await?;
            let mut events = Events::new(&mut *conn);
            events.recompute_from_deliveries(&delivery.event_id).await?;
            return Ok(());
        };

        if !active {
            let reason = format!(
                "subscription status: {}",
                delivery.subscription_status.as_deref().unwrap_or("deleted")
            );
            tracing::debug!(
                delivery_id = %delivery.id,
                subscription_id = %delivery.subscription_id,
                "subscription no longer active, cancelling delivery"
            );
            let mut repo = Deliveries::new(&mut *conn);
            repo.cancel(&delivery.id, &reason).await?;
            let mut events = Events::new(&mut *conn);
            events.recompute_from_deliveries(&delivery.event_id).await?;
            return Ok(());
        }

        let envelope = serde_json::json!({
            "id": &delivery.event_id,
            "event_type": &delivery.event_type,
            "source": &delivery.event_source,
            "data": &delivery.event_data,
            "metadata": &delivery.event_metadata,
            "created_at": delivery.event_created_at,
        });
        let payload = envelope.to_string();

        let timestamp = Utc::now().timestamp();
        let signature = signing::sign(&payload, secret, timestamp);

        let base_headers = vec![
            ("Content-Type".to_string(), "application/json".to_string()),
            ("User-Agent".to_string(), USER_AGENT.to_string()),
            ("X-Webhook-Signature".to_string(), signature.clone()),
            ("X-Webhook-Timestamp".to_string(), timestamp.to_string()),
            ("X-Webhook-ID".to_string(), delivery.subscription_id.clone()),
        ];
        let headers = overlay_headers(base_headers, custom_header_pairs(delivery.custom_headers.as_ref()));

        {
            let mut repo = Deliveries::new(&mut *conn);
            repo.record_request(
                &delivery.id,
                url,
                &redact_headers(&headers),
                &payload,
                &signature,
            )
            .await?;
        }

        let retry_policy = RetryPolicy {
            strategy: delivery
                .retry_strategy
                .as_deref()
                .and_then(|s| s.parse().ok())
                .unwrap_or(crate::db::models::subscriptions::RetryStrategy::Exponential),
            delay_seconds: delivery.retry_delay_seconds.unwrap_or(60),
            max_delay_seconds: delivery.retry_max_delay_seconds.unwrap_or(3_600),
        };

        let request = WebhookSendRequest {
            meta: DeliveryMeta {
                delivery_id: delivery.id.clone(),
                event_id: delivery.event_id,
                subscription_id: delivery.subscription_id,
                attempt_count: delivery.attempt_count,
                max_attempts: delivery.max_attempts,
                retry_policy,
                event_type: delivery.event_type,
                event_source: delivery.event_source,
                event_created_at: delivery.event_created_at,
            },
            url: url.clone(),
            headers,
            body: payload,
            timeout_secs: delivery.timeout_seconds.unwrap_or(30).max(1) as u64,
        };

        if let Err(e) = self.send_tx.try_send(request) {
            // The claim marked the row in_flight; it becomes claimable again
            // after the stale-claim window, so dropping here is safe.
            tracing::warn!(
                delivery_id = %delivery.id,
                "failed to push to sender channel (will be re-claimed): {}",
                e
            );
        }

        Ok(())
    }

    /// Drain completed send results and advance the state machine.
    async fn drain_results(&mut self) {
        let mut conn = match self.pool.acquire().await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "failed to acquire connection for result drain");
                return;
            }
        };

        while let Ok(result) = self.result_rx.try_recv() {
            handle_result(&mut conn, &self.store, result).await;
        }
    }
}

/// Record one send outcome: delivered, retrying, or exhausted (+ DLQ).
async fn handle_result(conn: &mut PgConnection, store: &FastStore, result: WebhookSendResult) {
    let meta = &result.meta;

    match result.outcome {
        SendOutcome::Delivered { response } => {
            counter!("fanout_webhook_deliveries_total", "outcome" => "delivered").increment(1);

            let attempt = attempt_record(meta, &response, None, None);
            let mut repo = Deliveries::new(&mut *conn);
            if let Err(e) = repo.record_delivered(&meta.delivery_id, &response, &attempt).await {
                tracing::warn!(error = %e, delivery_id = %meta.delivery_id, "failed to record delivered");
            }

            let mut subs = Subscriptions::new(&mut *conn);
            if let Err(e) = subs.record_success(&meta.subscription_id).await {
                tracing::warn!(error = %e, subscription_id = %meta.subscription_id, "failed to record subscription success");
            }

            let mut events = Events::new(&mut *conn);
            if let Err(e) = events.recompute_from_deliveries(&meta.event_id).await {
                tracing::warn!(error = %e, event_id = %meta.event_id, "failed to recompute event status");
            }

            tracing::debug!(
                delivery_id = %meta.delivery_id,
                subscription_id = %meta.subscription_id,
                status = ?response.status_code,
                "webhook delivered"
            );
        }
        SendOutcome::Failed {
            error_type,
            message,
            response,
        } => {
            if meta.attempt_count < meta.max_attempts {
                counter!("fanout_webhook_deliveries_total", "outcome" => "retrying").increment(1);

                let mut delay = next_delay_seconds(&meta.retry_policy, meta.attempt_count);
                // A 429 from the receiver overrides the policy delay, still
                // capped by the subscription's maximum.
                if response.status_code == Some(429) {
                    if let Some(retry_after) = retry_after_secs(&response) {
                        delay = retry_after
                            .max(delay)
                            .min(i64::from(meta.retry_policy.max_delay_seconds));
                    }
                }
                let next_retry_at = Utc::now() + chrono::Duration::seconds(delay);
                let attempt = attempt_record(meta, &response, Some(error_type), Some(&message));

                let mut repo = Deliveries::new(&mut *conn);
                if let Err(e) = repo
                    .record_retrying(
                        &meta.delivery_id,
                        error_type,
                        &message,
                        &response,
                        next_retry_at,
                        delay as i32,
                        &attempt,
                    )
                    .await
                {
                    tracing::warn!(error = %e, delivery_id = %meta.delivery_id, "failed to record retry");
                }

                tracing::debug!(
                    delivery_id = %meta.delivery_id,
                    attempt = meta.attempt_count,
                    max_attempts = meta.max_attempts,
                    delay_secs = delay,
                    error = %message,
                    "webhook delivery failed, retry scheduled"
                );
            } else {
                counter!("fanout_webhook_deliveries_total", "outcome" => "exhausted").increment(1);

                let attempt = attempt_record(meta, &response, Some(error_type), Some(&message));
                let mut repo = Deliveries::new(&mut *conn);
                if let Err(e) = repo
                    .record_exhausted(&meta.delivery_id, error_type, &message, &response, &attempt)
                    .await
                {
                    tracing::warn!(error = %e, delivery_id = %meta.delivery_id, "failed to record exhaustion");
                }

                let mut subs = Subscriptions::new(&mut *conn);
                match subs.record_failure(&meta.subscription_id, &message).await {
                    Ok(Some(subscription)) if !subscription.is_healthy => {
                        tracing::warn!(
                            subscription_id = %meta.subscription_id,
                            consecutive_failures = subscription.consecutive_failures,
                            "subscription auto-disabled after consecutive failures"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, subscription_id = %meta.subscription_id, "failed to record subscription failure");
                    }
                }

                let mut events = Events::new(&mut *conn);
                if let Err(e) = events.set_last_error(&meta.event_id, &message).await {
                    tracing::warn!(error = %e, event_id = %meta.event_id, "failed to record event error");
                }
                if let Err(e) = events.recompute_from_deliveries(&meta.event_id).await {
                    tracing::warn!(error = %e, event_id = %meta.event_id, "failed to recompute event status");
                }

                let dlq_message = DlqMessage {
                    event_id: meta.event_id.clone(),
                    event_type: meta.event_type.clone(),
                    source: meta.event_source.clone(),
                    created_at: Some(meta.event_created_at),
                    enqueued_at: Some(meta.event_created_at),
                    dlq_entered_at: Utc::now(),
                    failure_reason: Some(message.clone()),
                    retry_count: meta.attempt_count,
                    retried_at: None,
                };
                if let Err(e) = store.push_dlq(&dlq_message).await {
                    tracing::warn!(error = %e, event_id = %meta.event_id, "failed to push DLQ entry");
                } else {
                    counter!("fanout_dlq_entries_total").increment(1);
                }

                tracing::warn!(
                    delivery_id = %meta.delivery_id,
                    subscription_id = %meta.subscription_id,
                    attempts = meta.attempt_count,
                    error = %message,
                    "webhook delivery exhausted, moved to DLQ"
                );
            }
        }
    }
}

/// Parse a numeric `Retry-After` from a stored response-header snapshot.
fn retry_after_secs(response: &ResponseSnapshot) -> Option<i64> {
    response
        .headers
        .as_ref()?
        .as_object()?
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("retry-after"))
        .and_then(|(_, value)| value.as_str())
        .and_then(|value| value.trim().parse::<i64>().ok())
        .filter(|secs| *secs > 0)
}

fn attempt_record(
    meta: &DeliveryMeta,
    response: &ResponseSnapshot,
    error_type: Option<ErrorType>,
    error_message: Option<&str>,
) -> AttemptRecord {
    AttemptRecord {
        attempt: meta.attempt_count,
        timestamp: Utc::now(),
        status_code: response.status_code,
        response_time_ms: response.response_time_ms,
        error_type: error_type.map(|t| t.as_str().to_string()),
        error_message: error_message.map(str::to_string),
    }
}

/// Custom headers from the stored JSONB object (non-strings dropped).
fn custom_header_pairs(headers: Option<&serde_json::Value>) -> Vec<(String, String)> {
    headers
        .and_then(|v| v.as_object())
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// Overlay custom headers onto the base set, replacing same-named entries
/// case-insensitively.
fn overlay_headers(
    base: Vec<(String, String)>,
    custom: Vec<(String, String)>,
) -> Vec<(String, String)> {
    let mut headers = base;
    for (name, value) in custom {
        headers.retain(|(existing, _)| !existing.eq_ignore_ascii_case(&name));
        headers.push((name, value));
    }
    headers
}

/// Headers as a JSON object with secret-bearing entries dropped.
fn redact_headers(headers: &[(String, String)]) -> serde_json::Value {
    let map: serde_json::Map<String, serde_json::Value> = headers
        .iter()
        .filter(|(name, _)| !name.to_lowercase().contains("secret"))
        .map(|(name, value)| (name.clone(), serde_json::Value::String(value.clone())))
        .collect();
    serde_json::Value::Object(map)
}

fn truncate_body(body: String) -> String {
    if body.len() <= MAX_RESPONSE_BODY_BYTES {
        return body;
    }
    let mut end = MAX_RESPONSE_BODY_BYTES;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].to_string()
}

fn response_headers_json(headers: &reqwest::header::HeaderMap) -> serde_json::Value {
    let map: serde_json::Map<String, serde_json::Value> = headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                serde_json::Value::String(value.to_str().unwrap_or("").to_string()),
            )
        })
        .collect();
    serde_json::Value::Object(map)
}

// --- Sender task ---

/// Long-lived task that receives signed requests and performs HTTP
/// delivery. No DB access, no secrets: HTTP in, result out.
async fn run_sender(
    mut rx: mpsc::Receiver<WebhookSendRequest>,
    result_tx: mpsc::Sender<WebhookSendResult>,
    http_client: reqwest::Client,
    max_concurrent_sends: usize,
    shutdown: CancellationToken,
) {
    let semaphore = Arc::new(Semaphore::new(max_concurrent_sends.max(1)));

    loop {
        let request = tokio::select! {
            req = rx.recv() => {
                match req {
                    Some(r) => r,
                    None => break,
                }
            }
            _ = shutdown.cancelled() => break,
        };

        let permit = match semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => break,
        };

        let client = http_client.clone();
        let tx = result_tx.clone();

        tokio::spawn(async move {
            let _permit = permit;

            let WebhookSendRequest {
                meta,
                url,
                headers,
                body,
                timeout_secs,
            } = request;

            tracing::debug!(
                delivery_id = %meta.delivery_id,
                url = %url,
                attempt = meta.attempt_count,
                "sending webhook HTTP request"
            );

            let started = std::time::Instant::now();
            let mut builder = client
                .post(&url)
                .timeout(Duration::from_secs(timeout_secs));
            for (name, value) in &headers {
                builder = builder.header(name, value);
            }

            let outcome = match builder.body(body).send().await {
                Ok(response) => {
                    let status = response.status();
                    let response_headers = response_headers_json(response.headers());
                    let text = response.text().await.unwrap_or_default();
                    let elapsed_ms = started.elapsed().as_millis() as i32;

                    let snapshot = ResponseSnapshot {
                        status_code: Some(status.as_u16() as i32),
                        headers: Some(response_headers),
                        body: Some(truncate_body(text)),
                        response_time_ms: Some(elapsed_ms),
                    };

                    if status.is_success() {
                        SendOutcome::Delivered { response: snapshot }
                    } else {
                        SendOutcome::Failed {
                            error_type: ErrorType::HttpError,
                            message: format!("HTTP {}", status.as_u16()),
                            response: snapshot,
                        }
                    }
                }
                Err(e) => {
                    let elapsed_ms = started.elapsed().as_millis() as i32;
                    let snapshot = ResponseSnapshot {
                        response_time_ms: Some(elapsed_ms),
                        ..Default::default()
                    };

                    let (error_type, message) = if e.is_timeout() {
                        (
                            ErrorType::Timeout,
                            format!("request timed out after {timeout_secs}s"),
                        )
                    } else if e.is_connect() {
                        (
                            ErrorType::ConnectionError,
                            format!("connection failed: {e}"),
                        )
                    } else {
                        (ErrorType::UnknownError, e.to_string())
                    };

                    SendOutcome::Failed {
                        error_type,
                        message,
                        response: snapshot,
                    }
                }
            };

            let result = WebhookSendResult { meta, outcome };
            if let Err(e) = tx.send(result).await {
                tracing::warn!("failed to post webhook send result: {}", e);
            }
        });
    }

    tracing::debug!("webhook sender task exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::subscriptions::RetryStrategy;
    use wiremock::matchers::{header, header_exists, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn meta(attempt: i32, max: i32) -> DeliveryMeta {
        DeliveryMeta {
            delivery_id: crate::types::delivery_id(),
            event_id: crate::types::event_id(),
            subscription_id: crate::types::subscription_id(),
            attempt_count: attempt,
            max_attempts: max,
            retry_policy: RetryPolicy {
                strategy: RetryStrategy::Exponential,
                delay_seconds: 1,
                max_delay_seconds: 60,
            },
            event_type: "user.created".to_string(),
            event_source: "auth".to_string(),
            event_created_at: Utc::now(),
        }
    }

    fn request(url: &str, meta: DeliveryMeta, timeout_secs: u64) -> WebhookSendRequest {
        WebhookSendRequest {
            meta,
            url: url.to_string(),
            headers: vec![
                ("Content-Type".to_string(), "application/json".to_string()),
                ("X-Webhook-Signature".to_string(), "v1=ff".to_string()),
                ("X-Webhook-Timestamp".to_string(), "0".to_string()),
            ],
            body: r#"{"test":true}"#.to_string(),
            timeout_secs,
        }
    }

    /// Start the sender and return its channels + shutdown token.
    async fn start_sender() -> (
        mpsc::Sender<WebhookSendRequest>,
        mpsc::Receiver<WebhookSendResult>,
        CancellationToken,
    ) {
        let (send_tx, send_rx) = mpsc::channel(10);
        let (result_tx, result_rx) = mpsc::channel(10);
        let shutdown = CancellationToken::new();

        tokio::spawn(run_sender(
            send_rx,
            result_tx,
            reqwest::Client::new(),
            20,
            shutdown.clone(),
        ));

        (send_tx, result_rx, shutdown)
    }

    #[tokio::test]
    async fn test_successful_delivery() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("content-type", "application/json"))
            .and(header_exists("x-webhook-signature"))
            .and(header_exists("x-webhook-timestamp"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let (send_tx, mut result_rx, shutdown) = start_sender().await;
        let m = meta(1, 6);
        let delivery_id = m.delivery_id.clone();

        send_tx.send(request(&server.uri(), m, 5)).await.unwrap();

        let result = result_rx.recv().await.unwrap();
        assert_eq!(result.meta.delivery_id, delivery_id);
        match result.outcome {
            SendOutcome::Delivered { response } => {
                assert_eq!(response.status_code, Some(200));
                assert_eq!(response.body.as_deref(), Some("ok"));
                assert!(response.response_time_ms.is_some());
            }
            other => panic!("expected Delivered, got {other:?}"),
        }

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_http_error_classification() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let (send_tx, mut result_rx, shutdown) = start_sender().await;
        send_tx.send(request(&server.uri(), meta(2, 6), 5)).await.unwrap();

        let result = result_rx.recv().await.unwrap();
        match result.outcome {
            SendOutcome::Failed {
                error_type,
                message,
                response,
            } => {
                assert_eq!(error_type, ErrorType::HttpError);
                assert_eq!(message, "HTTP 500");
                assert_eq!(response.status_code, Some(500));
            }
            other => panic!("expected Failed, got {other:?}"),
        }

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_connection_error_classification() {
        // nothing listens on port 1
        let (send_tx, mut result_rx, shutdown) = start_sender().await;
        send_tx
            .send(request("http://127.0.0.1:1", meta(1, 6), 5))
            .await
            .unwrap();

        let result = result_rx.recv().await.unwrap();
        match result.outcome {
            SendOutcome::Failed {
                error_type,
                response,
                ..
            } => {
                assert_eq!(error_type, ErrorType::ConnectionError);
                assert_eq!(response.status_code, None);
            }
            other => panic!("expected Failed, got {other:?}"),
        }

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_timeout_classification() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let (send_tx, mut result_rx, shutdown) = start_sender().await;
        send_tx.send(request(&server.uri(), meta(1, 6), 1)).await.unwrap();

        let result = result_rx.recv().await.unwrap();
        match result.outcome {
            SendOutcome::Failed {
                error_type, message, ..
            } => {
                assert_eq!(error_type, ErrorType::Timeout);
                assert!(message.contains("timed out after 1s"));
            }
            other => panic!("expected Failed, got {other:?}"),
        }

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_response_body_truncated_to_10_kib() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(50_000)))
            .mount(&server)
            .await;

        let (send_tx, mut result_rx, shutdown) = start_sender().await;
        send_tx.send(request(&server.uri(), meta(1, 6), 5)).await.unwrap();

        let result = result_rx.recv().await.unwrap();
        match result.outcome {
            SendOutcome::Delivered { response } => {
                assert_eq!(response.body.unwrap().len(), MAX_RESPONSE_BODY_BYTES);
            }
            other => panic!("expected Delivered, got {other:?}"),
        }

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_sender_exits_on_channel_close() {
        let (send_tx, send_rx) = mpsc::channel(10);
        let (result_tx, _result_rx) = mpsc::channel(10);
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(run_sender(
            send_rx,
            result_tx,
            reqwest::Client::new(),
            20,
            shutdown,
        ));

        drop(send_tx);

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sender should exit when channel closes")
            .expect("sender should not panic");
    }

    #[test]
    fn test_overlay_headers_replaces_case_insensitively() {
        let base = vec![
            ("Content-Type".to_string(), "application/json".to_string()),
            ("User-Agent".to_string(), USER_AGENT.to_string()),
        ];
        let custom = vec![
            ("user-agent".to_string(), "custom/1".to_string()),
            ("X-Env".to_string(), "staging".to_string()),
        ];
        let merged = overlay_headers(base, custom);
        assert_eq!(merged.len(), 3);
        assert!(merged.iter().any(|(n, v)| n == "user-agent" && v == "custom/1"));
        assert!(!merged.iter().any(|(n, _)| n == "User-Agent"));
    }

    #[test]
    fn test_redact_headers_drops_secret_entries() {
        let headers = vec![
            ("Content-Type".to_string(), "application/json".to_string()),
            ("X-Client-Secret".to_string(), "hunter2".to_string()),
        ];
        let json = redact_headers(&headers);
        assert!(json.get("Content-Type").is_some());
        assert!(json.get("X-Client-Secret").is_none());
    }

    #[test]
    fn test_retry_after_parsing() {
        let with_header = ResponseSnapshot {
            status_code: Some(429),
            headers: Some(serde_json::json!({"Retry-After": "120"})),
            ..Default::default()
        };
        assert_eq!(retry_after_secs(&with_header), Some(120));

        let lowercase = ResponseSnapshot {
            headers: Some(serde_json::json!({"retry-after": "5"})),
            ..Default::default()
        };
        assert_eq!(retry_after_secs(&lowercase), Some(5));

        // HTTP-date form and garbage are ignored
        let date_form = ResponseSnapshot {
            headers: Some(serde_json::json!({"Retry-After": "Wed, 21 Oct 2026 07:28:00 GMT"})),
            ..Default::default()
        };
        assert_eq!(retry_after_secs(&date_form), None);

        assert_eq!(retry_after_secs(&ResponseSnapshot::default()), None);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let body = "é".repeat(MAX_RESPONSE_BODY_BYTES); // 2 bytes per char
        let truncated = truncate_body(body);
        assert!(truncated.len() <= MAX_RESPONSE_BODY_BYTES);
        assert!(truncated.chars().all(|c| c == 'é'));
    }
}
