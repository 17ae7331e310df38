//! Database models for webhook subscriptions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Receiving events
    Active,
    /// Temporarily paused by the caller
    Paused,
    /// Auto-disabled after hitting the failure threshold
    Disabled,
    /// Soft deleted (row retained for audit)
    Deleted,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Disabled => "disabled",
            Self::Deleted => "deleted",
        }
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "disabled" => Ok(Self::Disabled),
            "deleted" => Ok(Self::Deleted),
            _ => Err(format!("unknown subscription status: {s}")),
        }
    }
}

/// Backoff strategy for failed deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    Exponential,
    Linear,
    Fixed,
}

impl RetryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exponential => "exponential",
            Self::Linear => "linear",
            Self::Fixed => "fixed",
        }
    }
}

impl std::str::FromStr for RetryStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exponential" => Ok(Self::Exponential),
            "linear" => Ok(Self::Linear),
            "fixed" => Ok(Self::Fixed),
            _ => Err(format!("unknown retry strategy: {s}")),
        }
    }
}

/// Webhook endpoint + filter + retry policy.
#[derive(Debug, Clone, FromRow)]
pub struct Subscription {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub target_url: String,
    pub signing_secret: String,
    pub previous_signing_secret: Option<String>,
    pub previous_secret_valid_until: Option<DateTime<Utc>>,
    pub custom_headers: Option<serde_json::Value>,
    pub event_types: Option<Vec<String>>,
    pub event_sources: Option<Vec<String>>,
    pub status: String,
    pub retry_strategy: String,
    pub max_retries: i32,
    pub retry_delay_seconds: i32,
    pub retry_max_delay_seconds: i32,
    pub timeout_seconds: i32,
    pub credential_id: Option<String>,
    pub is_healthy: bool,
    pub consecutive_failures: i32,
    pub failure_threshold: i32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_failure_reason: Option<String>,
    pub total_deliveries: i32,
    pub successful_deliveries: i32,
    pub failed_deliveries: i32,
    pub metadata: Option<serde_json::Value>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub fn subscription_status(&self) -> SubscriptionStatus {
        self.status.parse().unwrap_or(SubscriptionStatus::Disabled)
    }

    pub fn strategy(&self) -> RetryStrategy {
        self.retry_strategy
            .parse()
            .unwrap_or(RetryStrategy::Exponential)
    }

    /// "Active" is a derived property: status says active and the row is not
    /// soft-deleted. Never stored as its own column.
    pub fn is_active(&self) -> bool {
        self.subscription_status() == SubscriptionStatus::Active && self.deleted_at.is_none()
    }

    /// Custom headers as string pairs (non-string values are dropped).
    pub fn custom_header_pairs(&self) -> Vec<(String, String)> {
        self.custom_headers
            .as_ref()
            .and_then(|v| v.as_object())
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Request to insert a subscription row.
#[derive(Debug, Clone)]
pub struct SubscriptionCreateDBRequest {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub target_url: String,
    pub signing_secret: String,
    pub custom_headers: Option<serde_json::Value>,
    pub event_types: Option<Vec<String>>,
    pub event_sources: Option<Vec<String>>,
    pub retry_strategy: RetryStrategy,
    pub max_retries: i32,
    pub retry_delay_seconds: i32,
    pub retry_max_delay_seconds: i32,
    pub timeout_seconds: i32,
    pub failure_threshold: i32,
    pub credential_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// Partial update. The nested `Option<Option<_>>` distinguishes "leave
/// unchanged" (outer `None`) from "set to NULL" (inner `None`).
#[derive(Debug, Clone, Default)]
pub struct SubscriptionUpdateDBRequest {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub target_url: Option<String>,
    pub custom_headers: Option<Option<serde_json::Value>>,
    pub event_types: Option<Option<Vec<String>>>,
    pub event_sources: Option<Option<Vec<String>>>,
    pub status: Option<SubscriptionStatus>,
    pub retry_strategy: Option<RetryStrategy>,
    pub max_retries: Option<i32>,
    pub retry_delay_seconds: Option<i32>,
    pub retry_max_delay_seconds: Option<i32>,
    pub timeout_seconds: Option<i32>,
    pub failure_threshold: Option<i32>,
    pub metadata: Option<Option<serde_json::Value>>,
}

/// Filters for listing subscriptions.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilter {
    pub status: Option<SubscriptionStatus>,
    pub is_healthy: Option<bool>,
    pub credential_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn subscription(status: &str, deleted: bool) -> Subscription {
        Subscription {
            id: "sub_01TEST".to_string(),
            name: "test".to_string(),
            description: None,
            target_url: "https://example.com/hook".to_string(),
            signing_secret: "s".repeat(64),
            previous_signing_secret: None,
            previous_secret_valid_until: None,
            custom_headers: None,
            event_types: None,
            event_sources: None,
            status: status.to_string(),
            retry_strategy: "exponential".to_string(),
            max_retries: 5,
            retry_delay_seconds: 60,
            retry_max_delay_seconds: 3600,
            timeout_seconds: 30,
            credential_id: None,
            is_healthy: true,
            consecutive_failures: 0,
            failure_threshold: 10,
            last_success_at: None,
            last_failure_at: None,
            last_failure_reason: None,
            total_deliveries: 0,
            successful_deliveries: 0,
            failed_deliveries: 0,
            metadata: None,
            deleted_at: deleted.then(Utc::now),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_is_active_requires_status_and_not_deleted() {
        assert!(subscription("active", false).is_active());
        assert!(!subscription("paused", false).is_active());
        assert!(!subscription("disabled", false).is_active());
        assert!(!subscription("active", true).is_active());
    }

    #[test]
    fn test_custom_header_pairs_skips_non_strings() {
        let mut sub = subscription("active", false);
        sub.custom_headers = Some(serde_json::json!({
            "X-Env": "staging",
            "X-Count": 3,
        }));
        let pairs = sub.custom_header_pairs();
        assert_eq!(pairs, vec![("X-Env".to_string(), "staging".to_string())]);
    }
}
