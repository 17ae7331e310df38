//! HMAC-SHA256 webhook signing.
//!
//! The signed message is the literal `"{timestamp}.{payload}"` and the
//! signature header value is `v1=<hex hmac>`. Receivers verify within a
//! ±300 s skew window; after a secret rotation the previous secret keeps
//! verifying until its grace deadline.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Signature scheme prefix.
pub const SIGNATURE_PREFIX: &str = "v1=";

/// Recommended receiver-side clock skew tolerance.
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

/// Generate a fresh signing secret: 32 random bytes, hex-encoded.
pub fn generate_signing_secret() -> String {
    use rand::RngCore;

    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Sign a payload: `v1=` + hex(HMAC-SHA256(secret, "{ts}.{payload}")).
pub fn sign(payload: &str, secret: &str, timestamp: i64) -> String {
    let message = format!("{timestamp}.{payload}");
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(message.as_bytes());
    format!("{SIGNATURE_PREFIX}{}", hex::encode(mac.finalize().into_bytes()))
}

/// Verify a signature against one secret.
///
/// Rejects timestamps outside `tolerance_secs` of now, then compares the
/// decoded signature bytes in constant time (`Mac::verify_slice`).
pub fn verify(
    payload: &str,
    signature: &str,
    timestamp: i64,
    secret: &str,
    tolerance_secs: i64,
) -> bool {
    let now = Utc::now().timestamp();
    if (now - timestamp).abs() > tolerance_secs {
        return false;
    }

    let hex_sig = signature.strip_prefix(SIGNATURE_PREFIX).unwrap_or(signature);
    let Ok(sig_bytes) = hex::decode(hex_sig) else {
        return false;
    };

    let message = format!("{timestamp}.{payload}");
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(message.as_bytes());
    mac.verify_slice(&sig_bytes).is_ok()
}

/// Verify against the current secret, falling back to the previous one while
/// its rotation grace window is open.
pub fn verify_with_rotation(
    payload: &str,
    signature: &str,
    timestamp: i64,
    secret: &str,
    previous_secret: Option<&str>,
    previous_valid_until: Option<DateTime<Utc>>,
    tolerance_secs: i64,
) -> bool {
    if verify(payload, signature, timestamp, secret, tolerance_secs) {
        return true;
    }

    match (previous_secret, previous_valid_until) {
        (Some(prev), Some(until)) if Utc::now() <= until => {
            verify(payload, signature, timestamp, prev, tolerance_secs)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_generated_secret_is_64_hex_chars() {
        let secret = generate_signing_secret();
        assert_eq!(secret.len(), 64);
        assert!(hex::decode(&secret).is_ok());
        assert_ne!(secret, generate_signing_secret());
    }

    #[test]
    fn test_sign_is_deterministic() {
        let payload = r#"{"id":"evt_01","data":{"n":1}}"#;
        let ts = 1_704_067_200;
        let sig1 = sign(payload, "topsecret", ts);
        let sig2 = sign(payload, "topsecret", ts);
        assert_eq!(sig1, sig2);
        assert!(sig1.starts_with("v1="));
        // hex HMAC-SHA256 is 64 chars
        assert_eq!(sig1.len(), 3 + 64);
    }

    #[test]
    fn test_roundtrip_verifies() {
        let payload = r#"{"hello":"world"}"#;
        let ts = Utc::now().timestamp();
        let sig = sign(payload, "k1", ts);
        assert!(verify(payload, &sig, ts, "k1", DEFAULT_TOLERANCE_SECS));
    }

    #[test]
    fn test_any_bit_flip_fails() {
        let payload = r#"{"hello":"world"}"#;
        let ts = Utc::now().timestamp();
        let sig = sign(payload, "k1", ts);

        // tampered body
        assert!(!verify(r#"{"hello":"world!"}"#, &sig, ts, "k1", DEFAULT_TOLERANCE_SECS));
        // tampered timestamp
        assert!(!verify(payload, &sig, ts + 1, "k1", DEFAULT_TOLERANCE_SECS));
        // tampered signature
        let mut tampered = sig.clone().into_bytes();
        let last = tampered.len() - 1;
        tampered[last] = if tampered[last] == b'0' { b'1' } else { b'0' };
        let tampered = String::from_utf8(tampered).unwrap();
        assert!(!verify(payload, &tampered, ts, "k1", DEFAULT_TOLERANCE_SECS));
        // wrong secret
        assert!(!verify(payload, &sig, ts, "k2", DEFAULT_TOLERANCE_SECS));
    }

    #[test]
    fn test_skewed_timestamp_rejected() {
        let payload = "{}";
        let old_ts = Utc::now().timestamp() - 301;
        let sig = sign(payload, "k1", old_ts);
        assert!(!verify(payload, &sig, old_ts, "k1", DEFAULT_TOLERANCE_SECS));
        // generous tolerance accepts it again
        assert!(verify(payload, &sig, old_ts, "k1", 600));
    }

    #[test]
    fn test_garbage_signature_rejected() {
        let ts = Utc::now().timestamp();
        assert!(!verify("{}", "v1=not-hex!!", ts, "k1", DEFAULT_TOLERANCE_SECS));
        assert!(!verify("{}", "", ts, "k1", DEFAULT_TOLERANCE_SECS));
    }

    #[test]
    fn test_rotation_grace_window() {
        let payload = "{}";
        let ts = Utc::now().timestamp();
        let old_sig = sign(payload, "old-secret", ts);

        // inside the grace window the old secret still verifies
        assert!(verify_with_rotation(
            payload,
            &old_sig,
            ts,
            "new-secret",
            Some("old-secret"),
            Some(Utc::now() + Duration::hours(1)),
            DEFAULT_TOLERANCE_SECS,
        ));

        // window closed
        assert!(!verify_with_rotation(
            payload,
            &old_sig,
            ts,
            "new-secret",
            Some("old-secret"),
            Some(Utc::now() - Duration::hours(1)),
            DEFAULT_TOLERANCE_SECS,
        ));

        // no previous secret at all
        assert!(!verify_with_rotation(
            payload,
            &old_sig,
            ts,
            "new-secret",
            None,
            None,
            DEFAULT_TOLERANCE_SECS,
        ));

        // the current secret always verifies
        let new_sig = sign(payload, "new-secret", ts);
        assert!(verify_with_rotation(
            payload, &new_sig, ts, "new-secret", None, None, DEFAULT_TOLERANCE_SECS,
        ));
    }
}
