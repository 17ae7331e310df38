//! Token-bucket rate limiting middleware.
//!
//! Buckets are keyed `key:{credential_id}` for authenticated requests and
//! `ip:{address}` otherwise, and live in the fast store so every replica
//! draws from the same budget. Credentials may carry a per-minute override;
//! its burst is a tenth of the limit (minimum 10).
//!
//! All responses carry `X-RateLimit-Limit` / `-Remaining` / `-Reset`;
//! rejections add `Retry-After`. A fast-store outage fails open with a
//! warning — authentication has already run by this point.

use axum::{
    extract::{Request, State},
    http::HeaderValue,
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::Utc;

use crate::AppState;
use crate::auth::CurrentCredential;
use crate::errors::Error;
use crate::queue::RateLimitDecision;

/// Bucket parameters for one request.
#[derive(Debug, Clone, Copy)]
struct BucketParams {
    rate_per_sec: f64,
    capacity: u64,
}

fn bucket_params(state: &AppState, credential: Option<&CurrentCredential>) -> BucketParams {
    if let Some(limit) = credential.and_then(|c| c.key.rate_limit) {
        let limit = limit.max(1) as u64;
        return BucketParams {
            rate_per_sec: limit as f64 / 60.0,
            capacity: (limit / 10).max(10),
        };
    }

    BucketParams {
        rate_per_sec: f64::from(state.config.rate_limit.requests_per_minute.max(1)) / 60.0,
        capacity: u64::from(state.config.rate_limit.burst.max(1)),
    }
}

fn identifier(request: &Request, credential: Option<&CurrentCredential>) -> String {
    if let Some(credential) = credential {
        return format!("key:{}", credential.id());
    }

    let ip = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .or_else(|| {
            request
                .extensions()
                .get::<axum::extract::ConnectInfo<std::net::SocketAddr>>()
                .map(|info| info.0.ip().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string());

    format!("ip:{ip}")
}

fn apply_headers(response: &mut Response, decision: &RateLimitDecision) {
    let headers = response.headers_mut();
    headers.insert(
        "x-ratelimit-limit",
        HeaderValue::from_str(&decision.limit.to_string()).unwrap_or(HeaderValue::from_static("0")),
    );
    headers.insert(
        "x-ratelimit-remaining",
        HeaderValue::from_str(&decision.remaining.to_string())
            .unwrap_or(HeaderValue::from_static("0")),
    );
    headers.insert(
        "x-ratelimit-reset",
        HeaderValue::from_str(&decision.reset_at.to_string())
            .unwrap_or(HeaderValue::from_static("0")),
    );
}

/// Rate limit middleware; layer it after authentication.
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if !state.config.rate_limit.enabled {
        return next.run(request).await;
    }

    let credential = request.extensions().get::<CurrentCredential>().cloned();
    let id = identifier(&request, credential.as_ref());
    let params = bucket_params(&state, credential.as_ref());

    let decision = match state
        .store
        .check_rate_limit(&id, params.rate_per_sec, params.capacity)
        .await
    {
        Ok(d) => d,
        Err(e) => {
            // Fail open: the admission path stays available when the fast
            // store is down, and auth has already run.
            tracing::warn!(error = %e, "rate limiter unavailable, allowing request");
            return next.run(request).await;
        }
    };

    if !decision.allowed {
        let retry_after = decision.retry_after_secs(Utc::now().timestamp());
        let mut response = Error::RateLimited {
            retry_after_secs: retry_after,
        }
        .into_response();
        apply_headers(&mut response, &decision);
        return response;
    }

    let mut response = next.run(request).await;
    apply_headers(&mut response, &decision);
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_custom_limit_burst_is_tenth_with_floor() {
        // The arithmetic for credential overrides, without a live store.
        let limit = 600u64;
        assert_eq!((limit / 10).max(10), 60);
        let small = 30u64;
        assert_eq!((small / 10).max(10), 10);
    }

    #[test]
    fn test_decision_headers_values() {
        let decision = RateLimitDecision {
            allowed: true,
            limit: 20,
            remaining: 19,
            reset_at: 1_700_000_000,
        };
        let mut response = axum::response::Response::new(axum::body::Body::empty());
        apply_headers(&mut response, &decision);
        assert_eq!(response.headers()["x-ratelimit-limit"], "20");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "19");
        assert_eq!(response.headers()["x-ratelimit-reset"], "1700000000");
    }
}
