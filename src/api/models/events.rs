//! API models for event endpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::db::models::events::{Event, EventFilter, EventStatus};
use crate::ingest::{
    BatchItem, BatchItemOutcome, BatchOutcome, NewEvent, ReplayOptions, ReplayOutcome,
};

/// Request body for single-event admission.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CreateEventRequest {
    /// Dotted event type, e.g. `user.created`
    pub event_type: String,
    /// Originating system, e.g. `auth-service`
    pub source: String,
    /// Structured payload (up to 1 MiB serialized)
    pub data: serde_json::Value,
    pub metadata: Option<serde_json::Value>,
    /// Collapses repeated admissions to one event
    pub idempotency_key: Option<String>,
}

impl From<CreateEventRequest> for NewEvent {
    fn from(request: CreateEventRequest) -> Self {
        NewEvent {
            event_type: request.event_type,
            source: request.source,
            data: request.data,
            metadata: request.metadata,
            idempotency_key: request.idempotency_key,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct EventResponse {
    pub id: String,
    pub event_type: String,
    pub source: String,
    pub data: serde_json::Value,
    pub metadata: Option<serde_json::Value>,
    pub status: String,
    pub idempotency_key: Option<String>,
    pub delivery_attempts: i32,
    pub successful_deliveries: i32,
    pub failed_deliveries: i32,
    pub last_error: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Event> for EventResponse {
    fn from(event: Event) -> Self {
        Self {
            id: event.id,
            event_type: event.event_type,
            source: event.source,
            data: event.data,
            metadata: event.metadata,
            status: event.status,
            idempotency_key: event.idempotency_key,
            delivery_attempts: event.delivery_attempts,
            successful_deliveries: event.successful_deliveries,
            failed_deliveries: event.failed_deliveries,
            last_error: event.last_error,
            processed_at: event.processed_at,
            created_at: event.created_at,
            updated_at: event.updated_at,
        }
    }
}

/// Filters for `GET /events` (in addition to the cursor parameters).
#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct ListEventsQuery {
    pub event_type: Option<String>,
    pub source: Option<String>,
    pub status: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl ListEventsQuery {
    pub fn to_filter(&self) -> Result<EventFilter, crate::errors::Error> {
        let status = match &self.status {
            Some(s) => Some(s.parse::<EventStatus>().map_err(|e| {
                crate::errors::Error::Validation { message: e }
            })?),
            None => None,
        };

        Ok(EventFilter {
            event_type: self.event_type.clone(),
            source: self.source.clone(),
            status,
            since: self.since,
            until: self.until,
        })
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct EventListResponse {
    pub data: Vec<EventResponse>,
    /// Cursor for the next page, absent on the last page
    pub next_cursor: Option<String>,
}

// ===== Batch admission =====

#[derive(Debug, Deserialize, ToSchema)]
pub struct BatchEventItem {
    /// Caller-chosen id echoed back in the per-item result
    pub reference_id: Option<String>,
    pub event_type: String,
    pub source: String,
    pub data: serde_json::Value,
    pub metadata: Option<serde_json::Value>,
    pub idempotency_key: Option<String>,
}

impl From<BatchEventItem> for BatchItem {
    fn from(item: BatchEventItem) -> Self {
        BatchItem {
            reference_id: item.reference_id,
            event: NewEvent {
                event_type: item.event_type,
                source: item.source,
                data: item.data,
                metadata: item.metadata,
                idempotency_key: item.idempotency_key,
            },
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct BatchCreateEventRequest {
    pub events: Vec<BatchEventItem>,
    /// Stop at the first failure and mark the rest skipped
    #[serde(default)]
    pub fail_fast: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct BatchEventError {
    pub code: String,
    pub message: String,
    pub field: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct BatchEventResultItem {
    pub index: usize,
    pub reference_id: Option<String>,
    pub success: bool,
    pub event: Option<EventResponse>,
    pub error: Option<BatchEventError>,
}

impl From<BatchItemOutcome> for BatchEventResultItem {
    fn from(outcome: BatchItemOutcome) -> Self {
        Self {
            index: outcome.index,
            reference_id: outcome.reference_id,
            success: outcome.success,
            event: outcome.event.map(Into::into),
            error: outcome.error.map(|e| BatchEventError {
                code: e.code.to_string(),
                message: e.message,
                field: e.field.map(str::to_string),
            }),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct BatchCreateEventResponse {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub results: Vec<BatchEventResultItem>,
}

impl From<BatchOutcome> for BatchCreateEventResponse {
    fn from(outcome: BatchOutcome) -> Self {
        Self {
            total: outcome.total,
            successful: outcome.successful,
            failed: outcome.failed,
            results: outcome.results.into_iter().map(Into::into).collect(),
        }
    }
}

// ===== Replay =====

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct ReplayEventRequest {
    #[serde(default)]
    pub dry_run: bool,
    pub target_subscription_ids: Option<Vec<String>>,
    pub payload_override: Option<serde_json::Value>,
    pub metadata_override: Option<serde_json::Value>,
}

impl From<ReplayEventRequest> for ReplayOptions {
    fn from(request: ReplayEventRequest) -> Self {
        ReplayOptions {
            dry_run: request.dry_run,
            target_subscription_ids: request.target_subscription_ids,
            payload_override: request.payload_override,
            metadata_override: request.metadata_override,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ReplayEventResponse {
    pub success: bool,
    pub event_id: String,
    pub replay_event_id: Option<String>,
    pub dry_run: bool,
    pub target_subscriptions: Vec<String>,
    pub message: String,
}

impl From<ReplayOutcome> for ReplayEventResponse {
    fn from(outcome: ReplayOutcome) -> Self {
        Self {
            success: true,
            event_id: outcome.event_id,
            replay_event_id: outcome.replay_event_id,
            dry_run: outcome.dry_run,
            target_subscriptions: outcome.target_subscriptions,
            message: outcome.message,
        }
    }
}
