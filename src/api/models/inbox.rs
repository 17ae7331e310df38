//! API models for the pull-mode inbox.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use utoipa::{IntoParams, ToSchema};

use crate::inbox::{AckResult, FetchParams, InboxItem, InboxStats};

/// Query parameters for `GET /inbox`. List filters are comma-separated.
#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct InboxFetchQuery {
    /// Maximum events to fetch (1-100, default 10)
    pub limit: Option<i64>,
    /// Seconds the fetched events stay hidden (1-43200, default 30)
    pub visibility_timeout: Option<i64>,
    /// Comma-separated event types
    pub event_types: Option<String>,
    /// Comma-separated sources
    pub sources: Option<String>,
    /// Short-poll wait when the inbox is empty (0-20 seconds)
    pub wait_time: Option<u64>,
}

fn split_csv(value: &Option<String>) -> Option<Vec<String>> {
    value.as_ref().map(|v| {
        v.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    })
}

impl From<InboxFetchQuery> for FetchParams {
    fn from(query: InboxFetchQuery) -> Self {
        FetchParams {
            limit: query.limit,
            visibility_timeout_secs: query.visibility_timeout,
            event_types: split_csv(&query.event_types),
            sources: split_csv(&query.sources),
            wait_time_secs: query.wait_time,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct InboxItemResponse {
    pub id: String,
    pub event_type: String,
    pub source: String,
    pub data: serde_json::Value,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub receipt_handle: String,
    /// Deadline after which the event becomes visible again
    pub visibility_timeout: DateTime<Utc>,
    pub delivery_count: i32,
}

impl From<InboxItem> for InboxItemResponse {
    fn from(item: InboxItem) -> Self {
        Self {
            id: item.event.id,
            event_type: item.event.event_type,
            source: item.event.source,
            data: item.event.data,
            metadata: item.event.metadata,
            created_at: item.event.created_at,
            receipt_handle: item.receipt_handle,
            visibility_timeout: item.visibility_deadline,
            delivery_count: item.delivery_count,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct InboxFetchResponse {
    pub items: Vec<InboxItemResponse>,
    pub has_more: bool,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AckRequest {
    pub receipt_handle: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AckBatchRequest {
    pub receipt_handles: Vec<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AckResultItem {
    pub receipt_handle: String,
    pub success: bool,
    pub error: Option<String>,
}

impl From<AckResult> for AckResultItem {
    fn from(result: AckResult) -> Self {
        Self {
            receipt_handle: result.receipt_handle,
            success: result.success,
            error: result.error,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AckBatchResponse {
    pub results: Vec<AckResultItem>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ChangeVisibilityRequest {
    pub receipt_handle: String,
    /// New timeout in seconds; 0 makes the event visible immediately
    pub visibility_timeout: i64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ChangeVisibilityResponse {
    pub visibility_timeout: DateTime<Utc>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct InboxStatsResponse {
    pub visible: i64,
    pub in_flight: i64,
    pub total: i64,
    pub oldest_event_at: Option<DateTime<Utc>>,
    pub by_event_type: HashMap<String, i64>,
}

impl From<InboxStats> for InboxStatsResponse {
    fn from(stats: InboxStats) -> Self {
        Self {
            visible: stats.visible,
            in_flight: stats.in_flight,
            total: stats.total,
            oldest_event_at: stats.oldest_event_at,
            by_event_type: stats.by_event_type,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csv_splitting() {
        let query = InboxFetchQuery {
            event_types: Some("user.created, order.*,".to_string()),
            ..Default::default()
        };
        let params = FetchParams::from(query);
        assert_eq!(
            params.event_types,
            Some(vec!["user.created".to_string(), "order.*".to_string()])
        );
        assert_eq!(params.sources, None);
    }
}
