use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode, Uri};
use axum::response::IntoResponse;
use axum::Json;
use futures::TryStreamExt;
use serde_json::json;
use tracing::{error, warn};
use url::Url;

use crate::proxy::balancer::LoadBalancer;

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_REAL_IP: HeaderName = HeaderName::from_static("x-real-ip");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

/// The backend URL chosen for a request, published as a response
/// extension so the logging middleware can record it.
#[derive(Debug, Clone)]
pub struct ChosenBackend(pub String);

/// Forwards one request to a backend picked by the balancer and streams
/// the upstream response back. One connection pool per handler.
pub struct ProxyHandler {
    balancer: Arc<dyn LoadBalancer>,
    client: reqwest::Client,
    timeout: Duration,
}

impl ProxyHandler {
    /// Redirects are passed through verbatim rather than followed; the
    /// pool keeps at most 100 idle connections per host for 90 seconds.
    pub fn new(balancer: Arc<dyn LoadBalancer>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(100)
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(Duration::from_secs(10))
            .tcp_keepalive(Duration::from_secs(30))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("failed to build proxy client");

        Self {
            balancer,
            client,
            timeout,
        }
    }

    pub async fn handle(&self, request: Request<Body>) -> Response<Body> {
        let backend = match self.balancer.next_backend() {
            Ok(backend) => backend,
            Err(error) => {
                warn!("{}", error);
                return error_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "No backend servers available",
                );
            }
        };

        let backend_url = backend.url().to_string();
        let mut response = self.forward(backend.url(), request).await;
        response
            .extensions_mut()
            .insert(ChosenBackend(backend_url));
        response
    }

    async fn forward(&self, backend_url: &Url, request: Request<Body>) -> Response<Body> {
        let peer = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0);
        let (parts, body) = request.into_parts();

        let target = build_target_url(backend_url, &parts.uri);

        let body = match axum::body::to_bytes(body, usize::MAX).await {
            Ok(bytes) => bytes,
            Err(error) => {
                error!("failed to read request body: {}", error);
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to create proxy request",
                );
            }
        };

        let outbound = self
            .client
            .request(parts.method.clone(), target)
            .headers(outbound_headers(&parts, peer))
            .body(body)
            .timeout(self.timeout)
            .build();

        let outbound = match outbound {
            Ok(outbound) => outbound,
            Err(error) => {
                error!("failed to create proxy request for {}: {}", backend_url, error);
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to create proxy request",
                );
            }
        };

        // Dropping this future (client disconnect) cancels the upstream
        // call and releases the connection.
        let upstream = match self.client.execute(outbound).await {
            Ok(upstream) => upstream,
            Err(error) => {
                warn!("proxy request failed for backend {}: {}", backend_url, error);
                return error_response(StatusCode::BAD_GATEWAY, "Backend request failed");
            }
        };

        let mut builder = Response::builder().status(upstream.status());
        if let Some(headers) = builder.headers_mut() {
            *headers = upstream.headers().clone();
        }

        let body = Body::from_stream(upstream.bytes_stream().inspect_err(|error| {
            warn!("failed to stream response body: {}", error);
        }));

        builder
            .body(body)
            .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
    }
}

/// Backend URL with the incoming path and query swapped in. The backend's
/// own path is overwritten, not joined, and any fragment is dropped.
fn build_target_url(backend_url: &Url, uri: &Uri) -> Url {
    let mut target = backend_url.clone();
    target.set_path(uri.path());
    target.set_query(uri.query());
    target.set_fragment(None);
    target
}

/// Copies the inbound headers minus the hop-by-hop set (and `Host`, which
/// the outbound client derives from the target), then sets the
/// forwarding headers.
fn outbound_headers(parts: &Parts, peer: Option<SocketAddr>) -> HeaderMap {
    let mut outbound = HeaderMap::new();
    for (name, value) in &parts.headers {
        if is_hop_by_hop(name) || name == header::HOST {
            continue;
        }
        outbound.append(name.clone(), value.clone());
    }

    let client = client_ip(&parts.headers, peer);

    let prior: Vec<&str> = parts
        .headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect();
    let forwarded_for = if prior.is_empty() {
        client.clone()
    } else {
        format!("{}, {}", prior.join(", "), client)
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        outbound.insert(X_FORWARDED_FOR, value);
    }

    if let Ok(value) = HeaderValue::from_str(&client) {
        outbound.insert(X_REAL_IP, value);
    }

    let proto = if parts.uri.scheme_str() == Some("https") {
        "https"
    } else {
        "http"
    };
    outbound.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));

    if let Some(host) = parts.headers.get(header::HOST) {
        outbound.insert(X_FORWARDED_HOST, host.clone());
    } else if let Some(authority) = parts.uri.authority() {
        if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
            outbound.insert(X_FORWARDED_HOST, value);
        }
    }

    outbound
}

/// First element of `X-Forwarded-For`, else `X-Real-IP`, else the peer
/// address without its port.
pub(crate) fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(forwarded) = headers
        .get(X_FORWARDED_FOR)
        .and_then(|value| value.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }

    if let Some(real_ip) = headers.get(X_REAL_IP).and_then(|value| value.to_str().ok()) {
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }

    peer.map(|addr| addr.ip().to_string()).unwrap_or_default()
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn error_response(status: StatusCode, message: &str) -> Response<Body> {
    (status, Json(json!({ "error": message }))).into_response()
}
