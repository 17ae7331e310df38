//! Real-time event stream over SSE.
//!
//! Every admission publishes the event envelope on the fast store's
//! `events:stream` topic. Each SSE client gets a dedicated pub/sub
//! connection and a relay task that filters envelopes, emits a `connected`
//! event up front, and a `heartbeat` on every idle interval. Delivery is
//! best-effort: the stream is not durable and never back-pressures
//! ingestion.

use axum::response::sse::Event as SseEvent;
use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::matcher;
use crate::queue::FastStore;

/// Per-connection filters, echoed back in the `connected` event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamFilters {
    pub event_types: Option<Vec<String>>,
    pub sources: Option<Vec<String>>,
    pub subscription_id: Option<String>,
}

/// Does an envelope pass the connection's filters?
///
/// Types and sources use the matcher's pattern grammar. The subscription
/// filter matches when the envelope's `_target_subscriptions` lists the id,
/// or `metadata.subscription_id` equals it.
pub fn envelope_matches(envelope: &serde_json::Value, filters: &StreamFilters) -> bool {
    if let Some(types) = &filters.event_types {
        let event_type = envelope["event_type"].as_str().unwrap_or_default();
        if !matcher::matches_any_pattern(event_type, types) {
            return false;
        }
    }

    if let Some(sources) = &filters.sources {
        let source = envelope["source"].as_str().unwrap_or_default();
        if !matcher::matches_any_pattern(source, sources) {
            return false;
        }
    }

    if let Some(subscription_id) = &filters.subscription_id {
        let targeted = envelope["_target_subscriptions"]
            .as_array()
            .is_some_and(|targets| {
                targets.iter().any(|t| t.as_str() == Some(subscription_id))
            });
        let in_metadata =
            envelope["metadata"]["subscription_id"].as_str() == Some(subscription_id);
        if !targeted && !in_metadata {
            return false;
        }
    }

    true
}

fn connected_event(filters: &StreamFilters) -> SseEvent {
    let data = json!({
        "message": "connected to event stream",
        "timestamp": Utc::now(),
        "filters": filters,
    });
    SseEvent::default().event("connected").data(data.to_string())
}

fn heartbeat_event() -> SseEvent {
    let data = json!({ "timestamp": Utc::now() });
    SseEvent::default().event("heartbeat").data(data.to_string())
}

fn error_event() -> SseEvent {
    let data = json!({
        "message": "stream interrupted",
        "timestamp": Utc::now(),
    });
    SseEvent::default().event("error").data(data.to_string())
}

/// Open a filtered relay for one SSE connection.
///
/// The relay task owns its pub/sub connection; when the client goes away
/// the next send fails (at the latest at the heartbeat boundary) and the
/// task exits, dropping the subscription.
pub fn relay(
    store: FastStore,
    filters: StreamFilters,
    heartbeat_interval: Duration,
) -> ReceiverStream<SseEvent> {
    let (tx, rx) = mpsc::channel::<SseEvent>(64);

    tokio::spawn(async move {
        if tx.send(connected_event(&filters)).await.is_err() {
            return;
        }

        let mut pubsub = match store.subscribe_stream().await {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "failed to subscribe to event stream");
                let _ = tx.send(error_event()).await;
                return;
            }
        };

        tracing::debug!(?filters, "SSE stream started");
        let mut messages = pubsub.on_message();

        loop {
            match tokio::time::timeout(heartbeat_interval, messages.next()).await {
                Ok(Some(message)) => {
                    let payload: String = message.get_payload().unwrap_or_default();
                    let Ok(envelope) = serde_json::from_str::<serde_json::Value>(&payload) else {
                        tracing::warn!("invalid JSON on event stream topic");
                        continue;
                    };
                    if !envelope_matches(&envelope, &filters) {
                        continue;
                    }

                    let id = envelope["id"].as_str().unwrap_or_default().to_string();
                    let event = SseEvent::default().event("event").id(id).data(payload);
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    // pub/sub connection dropped; tell the client and end
                    let _ = tx.send(error_event()).await;
                    break;
                }
                Err(_) => {
                    if tx.send(heartbeat_event()).await.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::debug!("SSE stream closed");
    });

    ReceiverStream::new(rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(event_type: &str, source: &str) -> serde_json::Value {
        json!({
            "id": "evt_01ABC",
            "event_type": event_type,
            "source": source,
            "data": {},
            "metadata": null,
        })
    }

    fn type_filter(patterns: &[&str]) -> StreamFilters {
        StreamFilters {
            event_types: Some(patterns.iter().map(|s| s.to_string()).collect()),
            ..Default::default()
        }
    }

    #[test]
    fn test_no_filters_match_everything() {
        assert!(envelope_matches(
            &envelope("user.created", "auth"),
            &StreamFilters::default()
        ));
    }

    #[test]
    fn test_type_patterns() {
        let filters = type_filter(&["user.*"]);
        assert!(envelope_matches(&envelope("user.created", "auth"), &filters));
        assert!(!envelope_matches(&envelope("order.paid", "billing"), &filters));
    }

    #[test]
    fn test_source_patterns() {
        let filters = StreamFilters {
            sources: Some(vec!["billing-service".to_string()]),
            ..Default::default()
        };
        assert!(envelope_matches(
            &envelope("order.paid", "billing-service"),
            &filters
        ));
        assert!(!envelope_matches(&envelope("user.created", "auth"), &filters));
    }

    #[test]
    fn test_subscription_filter_via_targets() {
        let filters = StreamFilters {
            subscription_id: Some("sub_01".to_string()),
            ..Default::default()
        };

        let mut targeted = envelope("user.created", "auth");
        targeted["_target_subscriptions"] = json!(["sub_01", "sub_02"]);
        assert!(envelope_matches(&targeted, &filters));

        let untargeted = envelope("user.created", "auth");
        assert!(!envelope_matches(&untargeted, &filters));
    }

    #[test]
    fn test_subscription_filter_via_metadata() {
        let filters = StreamFilters {
            subscription_id: Some("sub_01".to_string()),
            ..Default::default()
        };

        let mut tagged = envelope("user.created", "auth");
        tagged["metadata"] = json!({"subscription_id": "sub_01"});
        assert!(envelope_matches(&tagged, &filters));

        let mut other = envelope("user.created", "auth");
        other["metadata"] = json!({"subscription_id": "sub_99"});
        assert!(!envelope_matches(&other, &filters));
    }

    #[test]
    fn test_combined_filters_all_must_pass() {
        let filters = StreamFilters {
            event_types: Some(vec!["user.*".to_string()]),
            sources: Some(vec!["auth".to_string()]),
            subscription_id: None,
        };
        assert!(envelope_matches(&envelope("user.created", "auth"), &filters));
        assert!(!envelope_matches(&envelope("user.created", "billing"), &filters));
        assert!(!envelope_matches(&envelope("order.paid", "auth"), &filters));
    }
}
