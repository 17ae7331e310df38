//! Prefixed, lexicographically sortable identifiers.
//!
//! Every entity id is a short prefix plus a 26-character Crockford-base-32
//! ULID, e.g. `evt_01J9ZK3V5N8Q4R6T8W0Y2A4C6E`. ULIDs embed a millisecond
//! timestamp in their high bits, so ids sort by creation time.

use ulid::Ulid;

pub const EVENT_PREFIX: &str = "evt";
pub const SUBSCRIPTION_PREFIX: &str = "sub";
pub const DELIVERY_PREFIX: &str = "del";
pub const API_KEY_PREFIX: &str = "key";

/// Generate a prefixed ULID, e.g. `generate_id("evt")`.
pub fn generate_id(prefix: &str) -> String {
    format!("{prefix}_{}", Ulid::new())
}

pub fn event_id() -> String {
    generate_id(EVENT_PREFIX)
}

pub fn subscription_id() -> String {
    generate_id(SUBSCRIPTION_PREFIX)
}

pub fn delivery_id() -> String {
    generate_id(DELIVERY_PREFIX)
}

pub fn api_key_id() -> String {
    generate_id(API_KEY_PREFIX)
}

/// Check that an id carries the expected prefix and a parseable ULID tail.
pub fn is_valid_id(id: &str, prefix: &str) -> bool {
    match id.strip_prefix(prefix).and_then(|rest| rest.strip_prefix('_')) {
        Some(tail) => tail.parse::<Ulid>().is_ok(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_id_shape() {
        let id = event_id();
        assert!(id.starts_with("evt_"));
        // prefix + underscore + 26-char ULID
        assert_eq!(id.len(), 4 + 26);
        assert!(is_valid_id(&id, EVENT_PREFIX));
    }

    #[test]
    fn test_ids_sort_by_creation_time() {
        let first = event_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = event_id();
        assert!(second > first);
    }

    #[test]
    fn test_rejects_wrong_prefix() {
        let id = subscription_id();
        assert!(is_valid_id(&id, SUBSCRIPTION_PREFIX));
        assert!(!is_valid_id(&id, EVENT_PREFIX));
        assert!(!is_valid_id("evt_not-a-ulid", EVENT_PREFIX));
        assert!(!is_valid_id("evt", EVENT_PREFIX));
    }
}
