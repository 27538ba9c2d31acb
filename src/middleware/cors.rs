use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

/// 24 hours.
const MAX_AGE: HeaderValue = HeaderValue::from_static("86400");

/// Resolved CORS settings. The method and header lists are joined once at
/// construction since they never vary per request.
#[derive(Debug)]
pub struct CorsPolicy {
    allowed_origins: Vec<String>,
    allow_methods: HeaderValue,
    allow_headers: HeaderValue,
}

impl CorsPolicy {
    pub fn new(origins: Vec<String>, methods: Vec<String>, headers: Vec<String>) -> Self {
        let origins = if origins.is_empty() {
            vec!["*".to_string()]
        } else {
            origins
        };
        let methods = if methods.is_empty() {
            ["GET", "POST", "PUT", "DELETE", "OPTIONS"]
                .map(String::from)
                .to_vec()
        } else {
            methods
        };
        let headers = if headers.is_empty() {
            ["Origin", "Content-Type", "Accept", "Authorization"]
                .map(String::from)
                .to_vec()
        } else {
            headers
        };

        Self {
            allowed_origins: origins,
            allow_methods: HeaderValue::from_str(&methods.join(", "))
                .unwrap_or_else(|_| HeaderValue::from_static("GET, POST, PUT, DELETE, OPTIONS")),
            allow_headers: HeaderValue::from_str(&headers.join(", "))
                .unwrap_or_else(|_| HeaderValue::from_static("Content-Type")),
        }
    }

    /// Echo the request origin when it is in the allowed list, fall back
    /// to the first configured origin otherwise, and to `*` when the list
    /// is the wildcard.
    fn allow_origin(&self, origin: Option<&str>) -> HeaderValue {
        if self.allowed_origins.first().map(String::as_str) == Some("*") {
            return HeaderValue::from_static("*");
        }

        let allowed = origin
            .filter(|origin| self.allowed_origins.iter().any(|o| o == "*" || o == origin))
            .unwrap_or(self.allowed_origins[0].as_str());

        HeaderValue::from_str(allowed).unwrap_or_else(|_| HeaderValue::from_static("*"))
    }

    fn apply(&self, response: &mut Response, allow_origin: HeaderValue) {
        let headers = response.headers_mut();
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, allow_origin);
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            self.allow_methods.clone(),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            self.allow_headers.clone(),
        );
        headers.insert(header::ACCESS_CONTROL_MAX_AGE, MAX_AGE);
    }
}

/// Preflight OPTIONS requests terminate here with 204; everything else
/// continues downstream and gets the CORS headers stamped on the way out.
pub async fn cors_middleware(
    State(policy): State<Arc<CorsPolicy>>,
    request: Request,
    next: Next,
) -> Response {
    let origin = request
        .headers()
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    let allow_origin = policy.allow_origin(origin.as_deref());

    if request.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        policy.apply(&mut response, allow_origin);
        return response;
    }

    let mut response = next.run(request).await;
    policy.apply(&mut response, allow_origin);
    response
}
