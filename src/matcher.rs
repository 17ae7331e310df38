//! Subscription matching.
//!
//! An event reaches a subscription when the subscription is active (status
//! `active`, not soft-deleted) and both filters accept it:
//!
//! - `event_types`: nil means all; otherwise some pattern must match, where
//!   a pattern is a literal, `*`, or `prefix.*` (prefix, a dot, any suffix).
//! - `event_sources`: nil means all; otherwise literal membership.
//!
//! The live stream reuses the same pattern grammar for both fields.

use crate::db::models::subscriptions::Subscription;

/// Match a single pattern against a value.
pub fn pattern_matches(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(".*") {
        return value
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.'));
    }
    pattern == value
}

/// True when any pattern in the list matches.
pub fn matches_any_pattern(value: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|p| pattern_matches(p, value))
}

/// Would this subscription receive an event of the given type and source?
pub fn subscription_matches(subscription: &Subscription, event_type: &str, source: &str) -> bool {
    if !subscription.is_active() {
        return false;
    }

    if let Some(types) = &subscription.event_types {
        if !matches_any_pattern(event_type, types) {
            return false;
        }
    }

    if let Some(sources) = &subscription.event_sources {
        if !sources.iter().any(|s| s == source) {
            return false;
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn subscription(
        event_types: Option<Vec<&str>>,
        event_sources: Option<Vec<&str>>,
    ) -> Subscription {
        Subscription {
            id: "sub_01TEST".to_string(),
            name: "match-test".to_string(),
            description: None,
            target_url: "https://example.com/hook".to_string(),
            signing_secret: "s".repeat(64),
            previous_signing_secret: None,
            previous_secret_valid_until: None,
            custom_headers: None,
            event_types: event_types.map(|v| v.into_iter().map(String::from).collect()),
            event_sources: event_sources.map(|v| v.into_iter().map(String::from).collect()),
            status: "active".to_string(),
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
            deleted_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_literal_pattern() {
        assert!(pattern_matches("user.created", "user.created"));
        assert!(!pattern_matches("user.created", "user.deleted"));
    }

    #[test]
    fn test_star_matches_everything() {
        assert!(pattern_matches("*", "user.created"));
        assert!(pattern_matches("*", "anything"));
    }

    #[test]
    fn test_prefix_wildcard() {
        assert!(pattern_matches("user.*", "user.created"));
        assert!(pattern_matches("user.*", "user.profile.updated"));
        assert!(!pattern_matches("user.*", "userx.created"));
        // the bare prefix itself has no dot-suffix
        assert!(!pattern_matches("user.*", "user"));
        assert!(!pattern_matches("order.*", "user.created"));
    }

    #[test]
    fn test_nil_filters_match_all() {
        let sub = subscription(None, None);
        assert!(subscription_matches(&sub, "user.created", "auth"));
        assert!(subscription_matches(&sub, "order.paid", "billing"));
    }

    #[test]
    fn test_type_patterns_with_literal_sources() {
        let sub = subscription(Some(vec!["user.*", "order.paid"]), Some(vec!["auth"]));
        assert!(subscription_matches(&sub, "user.created", "auth"));
        assert!(subscription_matches(&sub, "order.paid", "auth"));
        assert!(!subscription_matches(&sub, "order.cancelled", "auth"));
        // sources are literal: no pattern expansion
        assert!(!subscription_matches(&sub, "user.created", "auth-service"));
    }

    #[test]
    fn test_inactive_subscription_never_matches() {
        let mut sub = subscription(None, None);
        sub.status = "paused".to_string();
        assert!(!subscription_matches(&sub, "user.created", "auth"));

        let mut sub = subscription(None, None);
        sub.deleted_at = Some(Utc::now());
        assert!(!subscription_matches(&sub, "user.created", "auth"));
    }
}
