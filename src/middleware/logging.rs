use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use chrono::Utc;
use tracing::{error, info, warn};

use crate::proxy::handler::{client_ip, ChosenBackend};
use crate::storage::writer::LogWriter;
use crate::storage::RequestLogRecord;

pub const LOG_SOURCE: &str = "apigateway";

/// Log level derived from the response status the client observed.
pub fn level_for(status: StatusCode) -> &'static str {
    match status.as_u16() {
        500.. => "ERROR",
        400.. => "WARN",
        _ => "INFO",
    }
}

#[derive(Clone)]
pub struct RequestLogState {
    pub writer: Arc<LogWriter>,
}

/// Builds one `RequestLogRecord` per request after the rest of the chain
/// has run, hands it to the writer without waiting on persistence, and
/// emits a one-line summary to the process log.
pub async fn logging_middleware(
    State(state): State<RequestLogState>,
    request: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    let timestamp = Utc::now();

    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let user_agent = request
        .headers()
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let client = client_ip(request.headers(), peer);

    let response = next.run(request).await;

    let latency = started.elapsed();
    let status = response.status();
    let backend = response
        .extensions()
        .get::<ChosenBackend>()
        .map(|chosen| chosen.0.clone())
        .unwrap_or_default();
    let level = level_for(status);

    match level {
        "ERROR" => error!(
            "{} {} - {} ({:?}) - backend: {}",
            method, path, status.as_u16(), latency, backend
        ),
        "WARN" => warn!(
            "{} {} - {} ({:?}) - backend: {}",
            method, path, status.as_u16(), latency, backend
        ),
        _ => info!(
            "{} {} - {} ({:?}) - backend: {}",
            method, path, status.as_u16(), latency, backend
        ),
    }

    state.writer.enqueue(RequestLogRecord {
        source: LOG_SOURCE.to_string(),
        level: level.to_string(),
        message: format!("{} {} completed in {:?}", method, path, latency),
        timestamp,
        method,
        path,
        status_code: status.as_u16(),
        latency,
        client_ip: client,
        user_agent,
        backend,
    });

    response
}
