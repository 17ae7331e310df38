//! Database models for delivery attempt groups.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Delivery state machine status.
///
/// `delivered`, `exhausted`, and `cancelled` are terminal and absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    InFlight,
    Delivered,
    Failed,
    Retrying,
    Exhausted,
    Cancelled,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
            Self::Exhausted => "exhausted",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Exhausted | Self::Cancelled)
    }
}

impl std::str::FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_flight" => Ok(Self::InFlight),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            "retrying" => Ok(Self::Retrying),
            "exhausted" => Ok(Self::Exhausted),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("unknown delivery status: {s}")),
        }
    }
}

/// Classification of a failed send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    /// Response received with status >= 300
    HttpError,
    /// Request exceeded the subscription timeout
    Timeout,
    /// Transport failure before a response arrived
    ConnectionError,
    /// Any other fault while sending
    UnknownError,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HttpError => "http_error",
            Self::Timeout => "timeout",
            Self::ConnectionError => "connection_error",
            Self::UnknownError => "unknown_error",
        }
    }
}

/// One attempt group for (event, subscription).
#[derive(Debug, Clone, FromRow)]
pub struct Delivery {
    pub id: String,
    pub event_id: String,
    pub subscription_id: String,
    pub status: String,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub retry_delay_seconds: Option<i32>,
    pub request_url: Option<String>,
    pub request_headers: Option<serde_json::Value>,
    pub request_body: Option<String>,
    pub signature: Option<String>,
    pub response_status_code: Option<i32>,
    pub response_headers: Option<serde_json::Value>,
    pub response_body: Option<String>,
    pub response_time_ms: Option<i32>,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    pub attempt_history: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Delivery {
    pub fn delivery_status(&self) -> DeliveryStatus {
        self.status.parse().unwrap_or(DeliveryStatus::Pending)
    }
}

/// Request to insert a delivery row.
#[derive(Debug, Clone)]
pub struct DeliveryCreateDBRequest {
    pub id: String,
    pub event_id: String,
    pub subscription_id: String,
    pub max_attempts: i32,
    pub request_url: String,
}

/// A delivery claimed for execution, joined with the event payload and the
/// subscription fields the sender needs. The subscription columns are
/// nullable because of the LEFT JOIN; a missing or inactive subscription
/// cancels the delivery.
#[derive(Debug, Clone, FromRow)]
pub struct ClaimedDelivery {
    pub id: String,
    pub event_id: String,
    pub subscription_id: String,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub event_type: String,
    pub event_source: String,
    pub event_data: serde_json::Value,
    pub event_metadata: Option<serde_json::Value>,
    pub event_created_at: DateTime<Utc>,
    pub subscription_status: Option<String>,
    pub subscription_deleted_at: Option<DateTime<Utc>>,
    pub target_url: Option<String>,
    pub signing_secret: Option<String>,
    pub custom_headers: Option<serde_json::Value>,
    pub timeout_seconds: Option<i32>,
    pub retry_strategy: Option<String>,
    pub retry_delay_seconds: Option<i32>,
    pub retry_max_delay_seconds: Option<i32>,
}

/// Summary appended to `attempt_history` after each attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: i32,
    pub timestamp: DateTime<Utc>,
    pub status_code: Option<i32>,
    pub response_time_ms: Option<i32>,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
}

/// Response snapshot recorded on the delivery row after a send.
#[derive(Debug, Clone, Default)]
pub struct ResponseSnapshot {
    pub status_code: Option<i32>,
    pub headers: Option<serde_json::Value>,
    pub body: Option<String>,
    pub response_time_ms: Option<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            DeliveryStatus::Pending,
            DeliveryStatus::InFlight,
            DeliveryStatus::Delivered,
            DeliveryStatus::Failed,
            DeliveryStatus::Retrying,
            DeliveryStatus::Exhausted,
            DeliveryStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<DeliveryStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(DeliveryStatus::Delivered.is_terminal());
        assert!(DeliveryStatus::Exhausted.is_terminal());
        assert!(DeliveryStatus::Cancelled.is_terminal());
        assert!(!DeliveryStatus::Pending.is_terminal());
        assert!(!DeliveryStatus::InFlight.is_terminal());
        assert!(!DeliveryStatus::Retrying.is_terminal());
    }

    #[test]
    fn test_attempt_record_serializes_snake_case() {
        let record = AttemptRecord {
            attempt: 1,
            timestamp: Utc::now(),
            status_code: Some(500),
            response_time_ms: Some(12),
            error_type: Some("http_error".to_string()),
            error_message: Some("HTTP 500".to_string()),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["attempt"], 1);
        assert_eq!(json["status_code"], 500);
        assert_eq!(json["error_type"], "http_error");
    }
}
