//! API models and validation for subscription endpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use utoipa::{IntoParams, ToSchema};

use crate::db::models::subscriptions::{
    RetryStrategy, Subscription, SubscriptionCreateDBRequest, SubscriptionStatus,
    SubscriptionUpdateDBRequest,
};
use crate::errors::{Error, Result};

/// Header names a subscription may never override.
const FORBIDDEN_HEADERS: &[&str] = &[
    "content-type",
    "content-length",
    "host",
    "authorization",
    "x-webhook-signature",
    "x-webhook-timestamp",
];
const MAX_CUSTOM_HEADERS: usize = 20;
const MAX_RETRIES_LIMIT: i32 = 20;
const TIMEOUT_RANGE: std::ops::RangeInclusive<i32> = 1..=300;

/// Retry/timeout policy block, with the original defaults.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(default)]
pub struct WebhookPolicy {
    pub retry_strategy: RetryStrategy,
    pub max_retries: i32,
    pub retry_delay_seconds: i32,
    pub retry_max_delay_seconds: i32,
    pub timeout_seconds: i32,
}

impl Default for WebhookPolicy {
    fn default() -> Self {
        Self {
            retry_strategy: RetryStrategy::Exponential,
            max_retries: 5,
            retry_delay_seconds: 60,
            retry_max_delay_seconds: 3_600,
            timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateSubscriptionRequest {
    pub name: String,
    pub description: Option<String>,
    /// Webhook URL; https required except for loopback hosts
    pub target_url: String,
    /// Event type patterns (`*` and `prefix.*` allowed); null = all
    pub event_types: Option<Vec<String>>,
    /// Literal source filter; null = all
    pub event_sources: Option<Vec<String>>,
    pub custom_headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub webhook_policy: WebhookPolicy,
    /// Consecutive failures before auto-disable
    pub failure_threshold: Option<i32>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct UpdateSubscriptionRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub target_url: Option<String>,
    pub event_types: Option<Vec<String>>,
    pub event_sources: Option<Vec<String>>,
    pub custom_headers: Option<HashMap<String, String>>,
    /// `active` or `paused` (other transitions are automatic)
    pub status: Option<String>,
    pub webhook_policy: Option<WebhookPolicy>,
    pub failure_threshold: Option<i32>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct ListSubscriptionsQuery {
    pub status: Option<String>,
    pub is_healthy: Option<bool>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SubscriptionResponse {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub target_url: String,
    pub event_types: Option<Vec<String>>,
    pub event_sources: Option<Vec<String>>,
    pub custom_headers: Option<serde_json::Value>,
    pub status: String,
    pub retry_strategy: String,
    pub max_retries: i32,
    pub retry_delay_seconds: i32,
    pub retry_max_delay_seconds: i32,
    pub timeout_seconds: i32,
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
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Subscription> for SubscriptionResponse {
    fn from(sub: Subscription) -> Self {
        Self {
            id: sub.id,
            name: sub.name,
            description: sub.description,
            target_url: sub.target_url,
            event_types: sub.event_types,
            event_sources: sub.event_sources,
            custom_headers: sub.custom_headers,
            status: sub.status,
            retry_strategy: sub.retry_strategy,
            max_retries: sub.max_retries,
            retry_delay_seconds: sub.retry_delay_seconds,
            retry_max_delay_seconds: sub.retry_max_delay_seconds,
            timeout_seconds: sub.timeout_seconds,
            is_healthy: sub.is_healthy,
            consecutive_failures: sub.consecutive_failures,
            failure_threshold: sub.failure_threshold,
            last_success_at: sub.last_success_at,
            last_failure_at: sub.last_failure_at,
            last_failure_reason: sub.last_failure_reason,
            total_deliveries: sub.total_deliveries,
            successful_deliveries: sub.successful_deliveries,
            failed_deliveries: sub.failed_deliveries,
            metadata: sub.metadata,
            created_at: sub.created_at,
            updated_at: sub.updated_at,
        }
    }
}

/// Creation response: the only time the signing secret is returned.
#[derive(Debug, Serialize, ToSchema)]
pub struct SubscriptionWithSecretResponse {
    #[serde(flatten)]
    pub subscription: SubscriptionResponse,
    pub signing_secret: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RotateSecretResponse {
    pub id: String,
    /// The new secret; shown once
    pub signing_secret: String,
    /// Until when the previous secret keeps verifying
    pub previous_secret_valid_until: DateTime<Utc>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SubscriptionListResponse {
    pub data: Vec<SubscriptionResponse>,
    pub next_cursor: Option<String>,
}

// ===== Validation =====

fn validate_target_url(url: &str) -> Result<()> {
    let parsed = url::Url::parse(url).map_err(|e| Error::Validation {
        message: format!("invalid target_url: {e}"),
    })?;

    match parsed.scheme() {
        "https" => Ok(()),
        "http" => {
            let host = parsed.host_str().unwrap_or_default();
            if host == "localhost" || host == "127.0.0.1" || host == "[::1]" || host == "::1" {
                Ok(())
            } else {
                Err(Error::Validation {
                    message: "target_url must use https (http is allowed for loopback only)"
                        .to_string(),
                })
            }
        }
        other => Err(Error::Validation {
            message: format!("unsupported target_url scheme: {other}"),
        }),
    }
}

fn validate_custom_headers(headers: &HashMap<String, String>) -> Result<()> {
    if headers.len() > MAX_CUSTOM_HEADERS {
        return Err(Error::Validation {
            message: format!("at most {MAX_CUSTOM_HEADERS} custom headers"),
        });
    }
    for name in headers.keys() {
        if FORBIDDEN_HEADERS.contains(&name.to_lowercase().as_str()) {
            return Err(Error::Validation {
                message: format!("custom header '{name}' is not allowed"),
            });
        }
    }
    Ok(())
}

fn validate_patterns(patterns: &[String]) -> Result<()> {
    for pattern in patterns {
        if pattern.is_empty() || pattern.len() > 255 {
            return Err(Error::Validation {
                message: "event type patterns must be 1-255 characters".to_string(),
            });
        }
        if !pattern
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '*'))
        {
            return Err(Error::Validation {
                message: format!("invalid event type pattern: {pattern}"),
            });
        }
    }
    Ok(())
}

fn validate_policy(policy: &WebhookPolicy) -> Result<()> {
    if !(0..=MAX_RETRIES_LIMIT).contains(&policy.max_retries) {
        return Err(Error::Validation {
            message: format!("max_retries must be between 0 and {MAX_RETRIES_LIMIT}"),
        });
    }
    if policy.retry_delay_seconds < 1 || policy.retry_max_delay_seconds < 1 {
        return Err(Error::Validation {
            message: "retry delays must be at least 1 second".to_string(),
        });
    }
    if policy.retry_max_delay_seconds < policy.retry_delay_seconds {
        return Err(Error::Validation {
            message: "retry_max_delay_seconds must be >= retry_delay_seconds".to_string(),
        });
    }
    if !TIMEOUT_RANGE.contains(&policy.timeout_seconds) {
        return Err(Error::Validation {
            message: "timeout_seconds must be between 1 and 300".to_string(),
        });
    }
    Ok(())
}

impl CreateSubscriptionRequest {
    /// Validate and convert into a DB insert request.
    pub fn into_db_request(
        self,
        id: String,
        signing_secret: String,
        credential_id: Option<String>,
    ) -> Result<SubscriptionCreateDBRequest> {
        if self.name.is_empty() || self.name.len() > 255 {
            return Err(Error::Validation {
                message: "name must be 1-255 characters".to_string(),
            });
        }
        validate_target_url(&self.target_url)?;
        if let Some(headers) = &self.custom_headers {
            validate_custom_headers(headers)?;
        }
        if let Some(types) = &self.event_types {
            validate_patterns(types)?;
        }
        validate_policy(&self.webhook_policy)?;

        let failure_threshold = self.failure_threshold.unwrap_or(10);
        if !(1..=100).contains(&failure_threshold) {
            return Err(Error::Validation {
                message: "failure_threshold must be between 1 and 100".to_string(),
            });
        }

        Ok(SubscriptionCreateDBRequest {
            id,
            name: self.name,
            description: self.description,
            target_url: self.target_url,
            signing_secret,
            custom_headers: self
                .custom_headers
                .map(|h| serde_json::to_value(h).unwrap_or_default()),
            event_types: self.event_types,
            event_sources: self.event_sources,
            retry_strategy: self.webhook_policy.retry_strategy,
            max_retries: self.webhook_policy.max_retries,
            retry_delay_seconds: self.webhook_policy.retry_delay_seconds,
            retry_max_delay_seconds: self.webhook_policy.retry_max_delay_seconds,
            timeout_seconds: self.webhook_policy.timeout_seconds,
            failure_threshold,
            credential_id,
            metadata: self.metadata,
        })
    }
}

impl UpdateSubscriptionRequest {
    /// Validate and convert into a DB update request.
    pub fn into_db_request(self) -> Result<SubscriptionUpdateDBRequest> {
        if let Some(name) = &self.name {
            if name.is_empty() || name.len() > 255 {
                return Err(Error::Validation {
                    message: "name must be 1-255 characters".to_string(),
                });
            }
        }
        if let Some(url) = &self.target_url {
            validate_target_url(url)?;
        }
        if let Some(headers) = &self.custom_headers {
            validate_custom_headers(headers)?;
        }
        if let Some(types) = &self.event_types {
            validate_patterns(types)?;
        }
        if let Some(policy) = &self.webhook_policy {
            validate_policy(policy)?;
        }

        let status = match self.status.as_deref() {
            None => None,
            Some("active") => Some(SubscriptionStatus::Active),
            Some("paused") => Some(SubscriptionStatus::Paused),
            Some(other) => {
                return Err(Error::Validation {
                    message: format!("status may only be set to active or paused, got {other}"),
                });
            }
        };

        if let Some(threshold) = self.failure_threshold {
            if !(1..=100).contains(&threshold) {
                return Err(Error::Validation {
                    message: "failure_threshold must be between 1 and 100".to_string(),
                });
            }
        }

        Ok(SubscriptionUpdateDBRequest {
            name: self.name,
            description: self.description.map(Some),
            target_url: self.target_url,
            custom_headers: self
                .custom_headers
                .map(|h| Some(serde_json::to_value(h).unwrap_or_default())),
            event_types: self.event_types.map(Some),
            event_sources: self.event_sources.map(Some),
            status,
            retry_strategy: self.webhook_policy.as_ref().map(|p| p.retry_strategy),
            max_retries: self.webhook_policy.as_ref().map(|p| p.max_retries),
            retry_delay_seconds: self.webhook_policy.as_ref().map(|p| p.retry_delay_seconds),
            retry_max_delay_seconds: self
                .webhook_policy
                .as_ref()
                .map(|p| p.retry_max_delay_seconds),
            timeout_seconds: self.webhook_policy.as_ref().map(|p| p.timeout_seconds),
            failure_threshold: self.failure_threshold,
            metadata: self.metadata.map(Some),
        })
    }
}

impl ListSubscriptionsQuery {
    pub fn parsed_status(&self) -> Result<Option<SubscriptionStatus>> {
        match &self.status {
            None => Ok(None),
            Some(s) => s
                .parse::<SubscriptionStatus>()
                .map(Some)
                .map_err(|e| Error::Validation { message: e }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_request(target_url: &str) -> CreateSubscriptionRequest {
        CreateSubscriptionRequest {
            name: "orders".to_string(),
            description: None,
            target_url: target_url.to_string(),
            event_types: None,
            event_sources: None,
            custom_headers: None,
            webhook_policy: WebhookPolicy::default(),
            failure_threshold: None,
            metadata: None,
        }
    }

    fn into_db(request: CreateSubscriptionRequest) -> Result<SubscriptionCreateDBRequest> {
        request.into_db_request("sub_01".to_string(), "secret".to_string(), None)
    }

    #[test]
    fn test_https_required_except_loopback() {
        assert!(into_db(create_request("https://example.com/hook")).is_ok());
        assert!(into_db(create_request("http://localhost:8080/hook")).is_ok());
        assert!(into_db(create_request("http://127.0.0.1/hook")).is_ok());
        assert!(into_db(create_request("http://example.com/hook")).is_err());
        assert!(into_db(create_request("ftp://example.com/hook")).is_err());
        assert!(into_db(create_request("not a url")).is_err());
    }

    #[test]
    fn test_forbidden_custom_headers() {
        let mut request = create_request("https://example.com/hook");
        request.custom_headers = Some(HashMap::from([(
            "Authorization".to_string(),
            "Bearer x".to_string(),
        )]));
        assert!(into_db(request).is_err());

        let mut request = create_request("https://example.com/hook");
        request.custom_headers = Some(HashMap::from([(
            "X-Webhook-Signature".to_string(),
            "spoof".to_string(),
        )]));
        assert!(into_db(request).is_err());

        let mut request = create_request("https://example.com/hook");
        request.custom_headers = Some(HashMap::from([(
            "X-Env".to_string(),
            "staging".to_string(),
        )]));
        assert!(into_db(request).is_ok());
    }

    #[test]
    fn test_too_many_custom_headers() {
        let mut request = create_request("https://example.com/hook");
        let headers: HashMap<String, String> = (0..21)
            .map(|i| (format!("X-Header-{i}"), "v".to_string()))
            .collect();
        request.custom_headers = Some(headers);
        assert!(into_db(request).is_err());
    }

    #[test]
    fn test_pattern_validation() {
        let mut request = create_request("https://example.com/hook");
        request.event_types = Some(vec!["user.*".to_string(), "order.paid".to_string()]);
        assert!(into_db(request).is_ok());

        let mut request = create_request("https://example.com/hook");
        request.event_types = Some(vec!["user created".to_string()]);
        assert!(into_db(request).is_err());
    }

    #[test]
    fn test_policy_bounds() {
        let mut request = create_request("https://example.com/hook");
        request.webhook_policy.max_retries = 21;
        assert!(into_db(request).is_err());

        let mut request = create_request("https://example.com/hook");
        request.webhook_policy.retry_max_delay_seconds = 1;
        request.webhook_policy.retry_delay_seconds = 60;
        assert!(into_db(request).is_err());

        let mut request = create_request("https://example.com/hook");
        request.webhook_policy.timeout_seconds = 0;
        assert!(into_db(request).is_err());
    }

    #[test]
    fn test_update_status_restricted() {
        let request = UpdateSubscriptionRequest {
            status: Some("disabled".to_string()),
            ..Default::default()
        };
        assert!(request.into_db_request().is_err());

        let request = UpdateSubscriptionRequest {
            status: Some("paused".to_string()),
            ..Default::default()
        };
        let db = request.into_db_request().unwrap();
        assert_eq!(db.status, Some(SubscriptionStatus::Paused));
    }
}
