//! API key checks and per-key rate limiting for the read endpoints.
//!
//! Clients pass their key as the `key` query parameter. Exempt keys are
//! accepted without counting against any limit.

use compact_str::CompactString;
use dashmap::DashMap;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;
use warp::Filter;
use warp::http::StatusCode;
use warp::http::header::CACHE_CONTROL;
use warp::reject::{MethodNotAllowed, Reject, Rejection};
use warp::reply::{Reply, Response};

use crate::caching::NO_STORE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDenied {
    MissingKey,
    InvalidKey,
    RateLimited,
}

impl Reject for AccessDenied {}

#[derive(Debug, Clone)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket per key: a full second of requests may burst, then tokens
/// refill at the configured rate.
pub struct RateLimiter {
    buckets: DashMap<CompactString, Bucket>,
    per_second: f64,
}

impl RateLimiter {
    pub fn new(per_second: i64) -> Self {
        Self {
            buckets: DashMap::new(),
            per_second: per_second.max(1) as f64,
        }
    }

    pub fn allow(&self, key: &str) -> bool {
        self.allow_at(key, Instant::now())
    }

    fn allow_at(&self, key: &str, now: Instant) -> bool {
        let mut bucket = self
            .buckets
            .entry(CompactString::from(key))
            .or_insert_with(|| Bucket {
                tokens: self.per_second,
                last_refill: now,
            });
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.last_refill = now;
        bucket.tokens = (bucket.tokens + elapsed * self.per_second).min(self.per_second);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

pub struct ApiKeys {
    keys: HashSet<String>,
    exempt: HashSet<String>,
    limiter: RateLimiter,
}

impl ApiKeys {
    pub fn new(keys: &[String], exempt: &[String], rate_limit: i64) -> Self {
        Self {
            keys: keys.iter().cloned().collect(),
            exempt: exempt.iter().cloned().collect(),
            limiter: RateLimiter::new(rate_limit),
        }
    }

    pub fn check(&self, key: Option<&str>) -> Result<(), AccessDenied> {
        let key = key.filter(|k| !k.is_empty()).ok_or(AccessDenied::MissingKey)?;
        if self.exempt.contains(key) {
            return Ok(());
        }
        if !self.keys.contains(key) {
            return Err(AccessDenied::InvalidKey);
        }
        if !self.limiter.allow(key) {
            debug!(key, "rate limit exceeded");
            return Err(AccessDenied::RateLimited);
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct KeyQuery {
    key: Option<String>,
}

/// Rejects the request unless it carries an accepted key within its limit.
pub fn require_key(keys: Arc<ApiKeys>) -> impl Filter<Extract = (), Error = Rejection> + Clone {
    warp::query::<KeyQuery>()
        .and_then(move |query: KeyQuery| {
            let keys = keys.clone();
            async move {
                keys.check(query.key.as_deref())
                    .map_err(warp::reject::custom)
            }
        })
        .untuple_one()
}

/// Turns rejections into uncacheable error responses.
pub async fn handle_rejection(err: Rejection) -> Result<Response, Rejection> {
    let (status, message) = match err.find::<AccessDenied>() {
        Some(AccessDenied::MissingKey) => (StatusCode::UNAUTHORIZED, "missing API key"),
        Some(AccessDenied::InvalidKey) => (StatusCode::UNAUTHORIZED, "invalid API key"),
        Some(AccessDenied::RateLimited) => (StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded"),
        None if err.find::<MethodNotAllowed>().is_some() => {
            (StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
        }
        None => (StatusCode::NOT_FOUND, "not found"),
    };
    let mut response = warp::reply::with_status(message, status).into_response();
    response
        .headers_mut()
        .insert(CACHE_CONTROL, warp::http::HeaderValue::from_static(NO_STORE));
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn keys(rate_limit: i64) -> ApiKeys {
        ApiKeys::new(
            &["test".to_string()],
            &["org.onebusaway.iphone".to_string()],
            rate_limit,
        )
    }

    #[test]
    fn test_key_checks() {
        let keys = keys(100);
        assert_eq!(keys.check(None), Err(AccessDenied::MissingKey));
        assert_eq!(keys.check(Some("")), Err(AccessDenied::MissingKey));
        assert_eq!(keys.check(Some("nope")), Err(AccessDenied::InvalidKey));
        assert_eq!(keys.check(Some("test")), Ok(()));
        assert_eq!(keys.check(Some("org.onebusaway.iphone")), Ok(()));
    }

    #[test]
    fn test_bucket_refills_over_time() {
        let limiter = RateLimiter::new(2);
        let start = Instant::now();

        assert!(limiter.allow_at("a", start));
        assert!(limiter.allow_at("a", start));
        assert!(!limiter.allow_at("a", start));
        // Keys are limited independently.
        assert!(limiter.allow_at("b", start));

        assert!(limiter.allow_at("a", start + Duration::from_millis(500)));
        assert!(!limiter.allow_at("a", start + Duration::from_millis(500)));
        // Never refills past one second of burst.
        let later = start + Duration::from_secs(10);
        assert!(limiter.allow_at("a", later));
        assert!(limiter.allow_at("a", later));
        assert!(!limiter.allow_at("a", later));
    }

    #[test]
    fn test_exempt_keys_are_never_limited() {
        let keys = keys(1);
        assert_eq!(keys.check(Some("test")), Ok(()));
        assert_eq!(keys.check(Some("test")), Err(AccessDenied::RateLimited));
        for _ in 0..50 {
            assert_eq!(keys.check(Some("org.onebusaway.iphone")), Ok(()));
        }
    }

    #[tokio::test]
    async fn test_filter_rejections_become_responses() {
        let route = warp::path("x")
            .and(require_key(Arc::new(keys(1))))
            .map(|| "ok")
            .recover(handle_rejection);

        let res = warp::test::request().path("/x?key=test").reply(&route).await;
        assert_eq!(res.status(), StatusCode::OK);

        let res = warp::test::request().path("/x?key=test").reply(&route).await;
        assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(res.headers()["cache-control"], NO_STORE);

        let res = warp::test::request().path("/x?key=bad").reply(&route).await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        let res = warp::test::request().path("/x").reply(&route).await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        let res = warp::test::request().path("/elsewhere").reply(&route).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }
}
