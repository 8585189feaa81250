//! Conditional-request and Cache-Control handling for read endpoints.
//!
//! Both behaviors only decide header values and short-circuit; neither
//! looks at a response body. Headers are fixed on the finished response
//! exactly once, so there is no later write that could re-decide them.

use std::convert::Infallible;
use tracing::debug;
use warp::Filter;
use warp::http::header::{CACHE_CONTROL, ETAG, IF_NONE_MATCH};
use warp::http::{HeaderMap, HeaderValue, StatusCode};
use warp::reply::{Reply, Response};

pub const NO_STORE: &str = "no-cache, no-store, must-revalidate";

/// Cache-Control tiering for one class of endpoint.
#[derive(Clone, Debug)]
pub struct CacheControl {
    cacheable: HeaderValue,
}

impl CacheControl {
    /// `duration_seconds <= 0` marks every response uncacheable.
    pub fn new(duration_seconds: i64) -> Self {
        let cacheable = if duration_seconds > 0 {
            HeaderValue::from_str(&format!("public, max-age={duration_seconds}"))
                .unwrap_or_else(|_| HeaderValue::from_static(NO_STORE))
        } else {
            HeaderValue::from_static(NO_STORE)
        };
        Self { cacheable }
    }

    pub fn value_for(&self, status: StatusCode) -> HeaderValue {
        // 304 Not Modified keeps the cache lifetime of the representation.
        if status.is_success() || status == StatusCode::NOT_MODIFIED {
            self.cacheable.clone()
        } else {
            HeaderValue::from_static(NO_STORE)
        }
    }

    pub fn apply(&self, mut response: Response) -> Response {
        let value = self.value_for(response.status());
        response.headers_mut().insert(CACHE_CONTROL, value);
        response
    }
}

/// Outcome of comparing `If-None-Match` with the current ETag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Conditional {
    /// No ETag is available yet; the inner handler runs untouched.
    Unversioned,
    /// The client's copy is current.
    NotModified(String),
    /// The inner handler runs and the response carries this ETag.
    Fresh(String),
}

pub fn evaluate(current: Option<String>, if_none_match: Option<&str>) -> Conditional {
    let Some(etag) = current.filter(|e| !e.is_empty()) else {
        return Conditional::Unversioned;
    };
    match if_none_match {
        Some("*") => Conditional::NotModified(etag),
        Some(list) if list.split(',').any(|candidate| candidate.trim() == etag) => {
            Conditional::NotModified(etag)
        }
        _ => Conditional::Fresh(etag),
    }
}

impl Conditional {
    pub fn from_headers(current: Option<String>, headers: &HeaderMap) -> Self {
        let if_none_match = headers.get(IF_NONE_MATCH).and_then(|v| v.to_str().ok());
        evaluate(current, if_none_match)
    }

    /// Builds the response, invoking `inner` only when the client copy is stale.
    pub fn respond<R: Reply>(self, inner: impl FnOnce() -> R) -> Response {
        match self {
            Conditional::NotModified(etag) => not_modified(&etag),
            Conditional::Fresh(etag) => with_etag(inner().into_response(), &etag),
            Conditional::Unversioned => inner().into_response(),
        }
    }
}

/// Extracts the conditional decision for the request, reading the ETag
/// from `current_etag` once per request.
pub fn conditional<F>(
    current_etag: F,
) -> impl Filter<Extract = (Conditional,), Error = Infallible> + Clone
where
    F: Fn() -> Option<String> + Clone + Send + Sync + 'static,
{
    warp::header::headers_cloned()
        .map(move |headers: HeaderMap| Conditional::from_headers(current_etag(), &headers))
}

fn etag_value(etag: &str) -> Option<HeaderValue> {
    match HeaderValue::from_str(etag) {
        Ok(v) => Some(v),
        Err(_) => {
            debug!(etag, "etag is not a valid header value");
            None
        }
    }
}

fn not_modified(etag: &str) -> Response {
    let mut response = warp::reply::with_status(warp::reply(), StatusCode::NOT_MODIFIED).into_response();
    if let Some(value) = etag_value(etag) {
        response.headers_mut().insert(ETAG, value);
    }
    response
}

fn with_etag(mut response: Response, etag: &str) -> Response {
    if let Some(value) = etag_value(etag) {
        // A handler that set its own validator keeps it.
        response.headers_mut().entry(ETAG).or_insert(value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const ETAG_ABC: &str = "\"abc\"";

    fn etag_abc() -> Option<String> {
        Some(ETAG_ABC.to_string())
    }

    /// Cache-Control outside the conditional layer.
    fn cached_route(
        etag: fn() -> Option<String>,
        status: StatusCode,
        max_age: i64,
        calls: Arc<AtomicUsize>,
    ) -> impl Filter<Extract = (Response,), Error = Infallible> + Clone {
        let cache = CacheControl::new(max_age);
        conditional(etag)
            .map(move |c: Conditional| {
                c.respond(|| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    warp::reply::with_status("body", status)
                })
            })
            .map(move |response: Response| cache.apply(response))
    }

    #[test]
    fn test_evaluate_matching_rules() {
        assert_eq!(evaluate(None, Some("*")), Conditional::Unversioned);
        assert_eq!(evaluate(Some(String::new()), Some("*")), Conditional::Unversioned);
        assert_eq!(evaluate(etag_abc(), None), Conditional::Fresh(ETAG_ABC.into()));
        assert_eq!(evaluate(etag_abc(), Some("*")), Conditional::NotModified(ETAG_ABC.into()));
        assert_eq!(
            evaluate(etag_abc(), Some(ETAG_ABC)),
            Conditional::NotModified(ETAG_ABC.into())
        );
        assert_eq!(
            evaluate(etag_abc(), Some("\"x\" ,  \"abc\" , \"y\"")),
            Conditional::NotModified(ETAG_ABC.into())
        );
        assert_eq!(evaluate(etag_abc(), Some("\"abcd\"")), Conditional::Fresh(ETAG_ABC.into()));
        // Weak comparison is not performed.
        assert_eq!(evaluate(etag_abc(), Some("W/\"abc\"")), Conditional::Fresh(ETAG_ABC.into()));
    }

    #[test]
    fn test_cache_control_tiers() {
        let cache = CacheControl::new(60);
        assert_eq!(cache.value_for(StatusCode::OK), "public, max-age=60");
        assert_eq!(cache.value_for(StatusCode::NO_CONTENT), "public, max-age=60");
        assert_eq!(cache.value_for(StatusCode::NOT_MODIFIED), "public, max-age=60");
        assert_eq!(cache.value_for(StatusCode::NOT_FOUND), NO_STORE);
        assert_eq!(cache.value_for(StatusCode::INTERNAL_SERVER_ERROR), NO_STORE);
        assert_eq!(cache.value_for(StatusCode::MOVED_PERMANENTLY), NO_STORE);

        for max_age in [0, -10] {
            let cache = CacheControl::new(max_age);
            assert_eq!(cache.value_for(StatusCode::OK), NO_STORE);
            assert_eq!(cache.value_for(StatusCode::NOT_MODIFIED), NO_STORE);
        }
    }

    #[tokio::test]
    async fn test_matching_etag_short_circuits() {
        let calls = Arc::new(AtomicUsize::new(0));
        let route = cached_route(etag_abc, StatusCode::OK, 30, calls.clone());

        let res = warp::test::request()
            .header("if-none-match", ETAG_ABC)
            .reply(&route)
            .await;

        assert_eq!(res.status(), StatusCode::NOT_MODIFIED);
        assert_eq!(res.headers()["etag"], ETAG_ABC);
        assert_eq!(res.headers()["cache-control"], "public, max-age=30");
        assert!(res.body().is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_wildcard_short_circuits() {
        let calls = Arc::new(AtomicUsize::new(0));
        let route = cached_route(etag_abc, StatusCode::OK, 30, calls.clone());

        let res = warp::test::request().header("if-none-match", "*").reply(&route).await;

        assert_eq!(res.status(), StatusCode::NOT_MODIFIED);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unconditional_request_gets_body_and_headers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let route = cached_route(etag_abc, StatusCode::OK, 45, calls.clone());

        let res = warp::test::request().reply(&route).await;

        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.body().as_ref(), b"body");
        assert_eq!(res.headers()["etag"], ETAG_ABC);
        assert_eq!(res.headers()["cache-control"], "public, max-age=45");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_etag_gets_fresh_response() {
        let calls = Arc::new(AtomicUsize::new(0));
        let route = cached_route(etag_abc, StatusCode::OK, 45, calls.clone());

        let res = warp::test::request()
            .header("if-none-match", "\"old\"")
            .reply(&route)
            .await;

        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()["etag"], ETAG_ABC);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_error_status_is_never_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let route = cached_route(etag_abc, StatusCode::NOT_FOUND, 3600, calls.clone());

        let res = warp::test::request().reply(&route).await;

        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert_eq!(res.headers()["cache-control"], NO_STORE);
        assert_eq!(res.headers()["etag"], ETAG_ABC);
    }

    #[tokio::test]
    async fn test_without_etag_inner_runs_unchanged() {
        let calls = Arc::new(AtomicUsize::new(0));
        let route = cached_route(|| None, StatusCode::OK, 30, calls.clone());

        let res = warp::test::request().header("if-none-match", "*").reply(&route).await;

        assert_eq!(res.status(), StatusCode::OK);
        assert!(res.headers().get("etag").is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cache_control_inside_conditional() {
        // Reverse composition: the 304 never reaches the Cache-Control layer.
        let cache = CacheControl::new(30);
        let route = conditional(etag_abc).map(move |c: Conditional| {
            c.respond(|| cache.apply(warp::reply::with_status("body", StatusCode::OK).into_response()))
        });

        let res = warp::test::request()
            .header("if-none-match", ETAG_ABC)
            .reply(&route)
            .await;
        assert_eq!(res.status(), StatusCode::NOT_MODIFIED);
        assert!(res.headers().get("cache-control").is_none());

        let res = warp::test::request().reply(&route).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()["cache-control"], "public, max-age=30");
        assert_eq!(res.headers()["etag"], ETAG_ABC);
    }
}
