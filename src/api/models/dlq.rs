//! API models for the dead-letter queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use utoipa::{IntoParams, ToSchema};

use crate::dlq::{DlqBatchResult, DlqItem, DlqStats};

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct DlqListQuery {
    /// Maximum entries to return (default 100)
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub event_type: Option<String>,
    pub source: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DlqItemResponse {
    pub dlq_id: String,
    pub event_id: String,
    pub event_type: String,
    pub source: String,
    pub created_at: Option<DateTime<Utc>>,
    pub enqueued_at: Option<DateTime<Utc>>,
    pub dlq_entered_at: DateTime<Utc>,
    pub failure_reason: Option<String>,
    pub retry_count: i32,
}

impl From<DlqItem> for DlqItemResponse {
    fn from(item: DlqItem) -> Self {
        Self {
            dlq_id: item.dlq_id,
            event_id: item.message.event_id,
            event_type: item.message.event_type,
            source: item.message.source,
            created_at: item.message.created_at,
            enqueued_at: item.message.enqueued_at,
            dlq_entered_at: item.message.dlq_entered_at,
            failure_reason: item.message.failure_reason,
            retry_count: item.message.retry_count,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DlqListResponse {
    pub items: Vec<DlqItemResponse>,
    /// Total after filtering, before pagination
    pub total: usize,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct DlqRetryRequest {
    /// Optional fields merged into the re-queued message
    pub modify_payload: Option<serde_json::Value>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DlqRetryResponse {
    pub success: bool,
    pub event_id: String,
    pub retry_count: i32,
    pub message: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct DlqBatchRequest {
    pub event_ids: Vec<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DlqBatchResultItem {
    pub event_id: String,
    pub success: bool,
    pub error: Option<String>,
}

impl From<DlqBatchResult> for DlqBatchResultItem {
    fn from(result: DlqBatchResult) -> Self {
        Self {
            event_id: result.event_id,
            success: result.success,
            error: result.error,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DlqBatchResponse {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub results: Vec<DlqBatchResultItem>,
}

impl DlqBatchResponse {
    pub fn from_results(results: Vec<DlqBatchResult>) -> Self {
        let successful = results.iter().filter(|r| r.success).count();
        Self {
            total: results.len(),
            successful,
            failed: results.len() - successful,
            results: results.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct DlqPurgeQuery {
    /// Must be true; purging is irreversible
    #[serde(default)]
    pub confirm: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DlqPurgeResponse {
    pub success: bool,
    pub purged_count: i64,
    pub message: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DlqStatsResponse {
    pub total: i64,
    pub by_event_type: HashMap<String, i64>,
    pub by_source: HashMap<String, i64>,
    pub oldest_entry: Option<DateTime<Utc>>,
    pub newest_entry: Option<DateTime<Utc>>,
}

impl From<DlqStats> for DlqStatsResponse {
    fn from(stats: DlqStats) -> Self {
        Self {
            total: stats.total,
            by_event_type: stats.by_event_type,
            by_source: stats.by_source,
            oldest_entry: stats.oldest_entry,
            newest_entry: stats.newest_entry,
        }
    }
}
