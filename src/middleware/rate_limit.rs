use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use axum::extract::{MatchedPath, Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");

/// Token bucket: capacity `burst`, refilled at `requests_per_second`.
/// `allow` never blocks; a request that finds no token is rejected.
pub struct RateLimiter {
    requests_per_second: u32,
    burst: u32,
    bucket: Mutex<TokenBucket>,
}

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(requests_per_second: u32, burst: u32) -> Self {
        Self {
            requests_per_second,
            burst,
            bucket: Mutex::new(TokenBucket {
                tokens: burst as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn allow(&self) -> bool {
        let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());

        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens =
            (bucket.tokens + elapsed * self.requests_per_second as f64).min(self.burst as f64);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn limit(&self) -> u32 {
        self.requests_per_second
    }

    pub fn burst(&self) -> u32 {
        self.burst
    }
}

/// Process-wide limiter handle. The limiter itself is thread-safe; the
/// outer lock exists so it can be swapped for one with new settings
/// without rebuilding the middleware chain.
#[derive(Clone)]
pub struct RateLimitState {
    limiter: Arc<RwLock<RateLimiter>>,
}

impl RateLimitState {
    pub fn new(limiter: RateLimiter) -> Self {
        Self {
            limiter: Arc::new(RwLock::new(limiter)),
        }
    }

    pub fn replace(&self, limiter: RateLimiter) {
        if let Ok(mut current) = self.limiter.write() {
            *current = limiter;
        }
    }

    fn check(&self) -> (bool, u32) {
        match self.limiter.read() {
            Ok(limiter) => (limiter.allow(), limiter.limit()),
            Err(_) => (true, 0),
        }
    }
}

pub async fn rate_limit_middleware(
    State(state): State<RateLimitState>,
    request: Request,
    next: Next,
) -> Response {
    let (allowed, limit) = state.check();
    if !allowed {
        return rejected(limit);
    }
    next.run(request).await
}

fn rejected(limit: u32) -> Response {
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({ "error": "Rate limit exceeded" })),
    )
        .into_response();
    response
        .headers_mut()
        .insert(X_RATELIMIT_LIMIT, HeaderValue::from(limit));
    response
        .headers_mut()
        .insert(X_RATELIMIT_REMAINING, HeaderValue::from_static("0"));
    response
}

/// One limiter per route pattern. Available for routes carrying their own
/// `rate_limit` setting; the default chain installs only the global one.
#[derive(Default)]
pub struct PerRouteRateLimiter {
    limiters: RwLock<HashMap<String, RateLimiter>>,
}

impl PerRouteRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_route(&self, path: &str, requests_per_second: u32, burst: u32) {
        if let Ok(mut limiters) = self.limiters.write() {
            limiters.insert(path.to_string(), RateLimiter::new(requests_per_second, burst));
        }
    }

    /// Routes without a limiter are always allowed.
    pub fn allow(&self, path: &str) -> bool {
        match self.limiters.read() {
            Ok(limiters) => limiters.get(path).map(RateLimiter::allow).unwrap_or(true),
            Err(_) => true,
        }
    }
}

pub async fn per_route_rate_limit_middleware(
    State(limiters): State<Arc<PerRouteRateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    // Match on the route pattern, not the concrete path, so every request
    // under a catch-all shares its route's bucket.
    let pattern = request
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    if !limiters.allow(&pattern) {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({ "error": "Rate limit exceeded for this route" })),
        )
            .into_response();
    }

    next.run(request).await
}
