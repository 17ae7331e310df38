//! Database models for API credentials.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Permission scopes. `admin` implies all others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scope {
    #[serde(rename = "events:write")]
    EventsWrite,
    #[serde(rename = "events:read")]
    EventsRead,
    #[serde(rename = "subscriptions:write")]
    SubscriptionsWrite,
    #[serde(rename = "subscriptions:read")]
    SubscriptionsRead,
    #[serde(rename = "subscriptions:delete")]
    SubscriptionsDelete,
    #[serde(rename = "inbox:read")]
    InboxRead,
    #[serde(rename = "dlq:read")]
    DlqRead,
    #[serde(rename = "dlq:write")]
    DlqWrite,
    #[serde(rename = "admin")]
    Admin,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EventsWrite => "events:write",
            Self::EventsRead => "events:read",
            Self::SubscriptionsWrite => "subscriptions:write",
            Self::SubscriptionsRead => "subscriptions:read",
            Self::SubscriptionsDelete => "subscriptions:delete",
            Self::InboxRead => "inbox:read",
            Self::DlqRead => "dlq:read",
            Self::DlqWrite => "dlq:write",
            Self::Admin => "admin",
        }
    }
}

/// Hashed credential with scopes and optional rate-limit override.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub key_hash: String,
    pub key_prefix: String,
    pub environment: String,
    pub scopes: Vec<String>,
    pub is_active: bool,
    pub rate_limit: Option<i32>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revoked_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApiKey {
    /// Valid iff active, not revoked, and not expired.
    pub fn is_valid(&self) -> bool {
        self.is_active && self.revoked_at.is_none() && self.expires_at.is_none_or(|t| t > Utc::now())
    }

    pub fn has_scope(&self, scope: Scope) -> bool {
        if self.scopes.iter().any(|s| s == Scope::Admin.as_str()) {
            return true;
        }
        self.scopes.iter().any(|s| s == scope.as_str())
    }
}

/// Request to insert a credential row.
#[derive(Debug, Clone)]
pub struct ApiKeyCreateDBRequest {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub key_hash: String,
    pub key_prefix: String,
    pub environment: String,
    pub scopes: Vec<String>,
    pub rate_limit: Option<i32>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn key(scopes: &[&str]) -> ApiKey {
        ApiKey {
            id: "key_01TEST".to_string(),
            name: "test".to_string(),
            description: None,
            key_hash: "h".repeat(64),
            key_prefix: "sk_test_abcd".to_string(),
            environment: "test".to_string(),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            is_active: true,
            rate_limit: None,
            last_used_at: None,
            expires_at: None,
            revoked_at: None,
            revoked_reason: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_admin_implies_all() {
        let k = key(&["admin"]);
        assert!(k.has_scope(Scope::EventsWrite));
        assert!(k.has_scope(Scope::DlqWrite));
        assert!(k.has_scope(Scope::SubscriptionsDelete));
    }

    #[test]
    fn test_scope_membership() {
        let k = key(&["events:write", "inbox:read"]);
        assert!(k.has_scope(Scope::EventsWrite));
        assert!(k.has_scope(Scope::InboxRead));
        assert!(!k.has_scope(Scope::SubscriptionsWrite));
    }

    #[test]
    fn test_validity_window() {
        let mut k = key(&["admin"]);
        assert!(k.is_valid());

        k.expires_at = Some(Utc::now() - Duration::minutes(1));
        assert!(!k.is_valid());

        k.expires_at = Some(Utc::now() + Duration::minutes(5));
        assert!(k.is_valid());

        k.revoked_at = Some(Utc::now());
        assert!(!k.is_valid());

        k.revoked_at = None;
        k.is_active = false;
        assert!(!k.is_valid());
    }
}
