//! Cursor pagination shared by the list endpoints.
//!
//! Cursors encode the `(id, created_at)` pair of the last row of a page as
//! URL-safe base64 JSON; listing orders by `created_at DESC, id DESC` and
//! resumes strictly after the encoded pair. Encoding both fields keeps
//! pagination stable even under clock skew between id allocation and row
//! insertion.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::IntoParams;

/// Cursor query parameters.
#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct CursorPagination {
    /// Maximum items to return
    pub limit: Option<i64>,
    /// Opaque cursor from a previous page
    pub cursor: Option<String>,
}

impl CursorPagination {
    /// Clamped limit with per-endpoint default and maximum.
    pub fn limit(&self, default: i64, max: i64) -> i64 {
        self.limit.unwrap_or(default).clamp(1, max)
    }

    /// Decode the cursor, ignoring garbage (treated as page one).
    pub fn decoded(&self) -> Option<(DateTime<Utc>, String)> {
        self.cursor.as_deref().and_then(decode_cursor)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CursorPayload {
    id: String,
    created_at: DateTime<Utc>,
}

pub fn encode_cursor(created_at: DateTime<Utc>, id: &str) -> String {
    let payload = CursorPayload {
        id: id.to_string(),
        created_at,
    };
    URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload).unwrap_or_default())
}

pub fn decode_cursor(cursor: &str) -> Option<(DateTime<Utc>, String)> {
    let raw = URL_SAFE_NO_PAD.decode(cursor).ok()?;
    let payload: CursorPayload = serde_json::from_slice(&raw).ok()?;
    Some((payload.created_at, payload.id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_roundtrip() {
        let now = Utc::now();
        let cursor = encode_cursor(now, "evt_01ABC");
        let (created_at, id) = decode_cursor(&cursor).unwrap();
        assert_eq!(id, "evt_01ABC");
        assert_eq!(created_at, now);
    }

    #[test]
    fn test_invalid_cursor_is_ignored() {
        assert!(decode_cursor("not-base64!").is_none());
        assert!(decode_cursor("bm90LWpzb24").is_none());

        let pagination = CursorPagination {
            limit: None,
            cursor: Some("garbage".to_string()),
        };
        assert!(pagination.decoded().is_none());
    }

    #[test]
    fn test_limit_clamping() {
        let pagination = CursorPagination {
            limit: Some(5_000),
            cursor: None,
        };
        assert_eq!(pagination.limit(100, 1_000), 1_000);

        let pagination = CursorPagination {
            limit: Some(0),
            cursor: None,
        };
        assert_eq!(pagination.limit(100, 1_000), 1);

        let pagination = CursorPagination::default();
        assert_eq!(pagination.limit(100, 1_000), 100);
    }
}
