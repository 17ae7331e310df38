//! Database models for events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Event lifecycle status.
///
/// Terminal statuses (`delivered`, `partially_delivered`, `failed`,
/// `expired`) always carry a `processed_at` timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Processing,
    Delivered,
    PartiallyDelivered,
    Failed,
    Expired,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Delivered => "delivered",
            Self::PartiallyDelivered => "partially_delivered",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Delivered | Self::PartiallyDelivered | Self::Failed | Self::Expired
        )
    }
}

impl std::str::FromStr for EventStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "delivered" => Ok(Self::Delivered),
            "partially_delivered" => Ok(Self::PartiallyDelivered),
            "failed" => Ok(Self::Failed),
            "expired" => Ok(Self::Expired),
            _ => Err(format!("unknown event status: {s}")),
        }
    }
}

/// Immutable record of an inbound signal.
#[derive(Debug, Clone, FromRow)]
pub struct Event {
    pub id: String,
    pub event_type: String,
    pub source: String,
    pub data: serde_json::Value,
    pub metadata: Option<serde_json::Value>,
    pub status: String,
    pub idempotency_key: Option<String>,
    pub credential_id: Option<String>,
    pub delivery_attempts: i32,
    pub successful_deliveries: i32,
    pub failed_deliveries: i32,
    pub last_error: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Event {
    pub fn event_status(&self) -> EventStatus {
        self.status.parse().unwrap_or(EventStatus::Pending)
    }
}

/// Request to insert an event row.
#[derive(Debug, Clone)]
pub struct EventCreateDBRequest {
    pub id: String,
    pub event_type: String,
    pub source: String,
    pub data: serde_json::Value,
    pub metadata: Option<serde_json::Value>,
    pub idempotency_key: Option<String>,
    pub credential_id: Option<String>,
}

/// Filters for listing events.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub event_type: Option<String>,
    pub source: Option<String>,
    pub status: Option<EventStatus>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            EventStatus::Pending,
            EventStatus::Processing,
            EventStatus::Delivered,
            EventStatus::PartiallyDelivered,
            EventStatus::Failed,
            EventStatus::Expired,
        ] {
            assert_eq!(status.as_str().parse::<EventStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!EventStatus::Pending.is_terminal());
        assert!(!EventStatus::Processing.is_terminal());
        assert!(EventStatus::Delivered.is_terminal());
        assert!(EventStatus::PartiallyDelivered.is_terminal());
        assert!(EventStatus::Failed.is_terminal());
        assert!(EventStatus::Expired.is_terminal());
    }
}
