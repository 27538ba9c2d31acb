use std::any::Any;
use std::backtrace::Backtrace;

use axum::http::{header, Response, StatusCode};
use bytes::Bytes;
use http_body_util::Full;
use serde_json::json;
use tower_http::catch_panic::CatchPanicLayer;
use tracing::error;

type PanicPayload = Box<dyn Any + Send + 'static>;

/// Outermost layer of the chain: traps panics from anything below, logs
/// them with a stack, and answers 500 so the server keeps serving.
pub fn recovery_layer() -> CatchPanicLayer<fn(PanicPayload) -> Response<Full<Bytes>>> {
    CatchPanicLayer::custom(handle_panic)
}

fn handle_panic(payload: PanicPayload) -> Response<Full<Bytes>> {
    let detail = if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else {
        "unknown panic".to_string()
    };

    error!(
        "PANIC recovered: {}\n{}",
        detail,
        Backtrace::force_capture()
    );

    let body = json!({
        "error": "Internal server error",
        "message": format!("Panic: {}", detail),
    });

    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Full::from(body.to_string()))
        .unwrap_or_else(|_| Response::new(Full::from("")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    async fn boom() -> &'static str {
        panic!("kaboom")
    }

    fn panicking_router() -> Router {
        Router::new()
            .route("/boom", get(boom))
            .route("/ok", get(|| async { "fine" }))
            .layer(recovery_layer())
    }

    #[tokio::test]
    async fn panic_becomes_a_500_with_the_panic_message() {
        let response = panicking_router()
            .oneshot(Request::builder().uri("/boom").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error"], "Internal server error");
        assert_eq!(body["message"], "Panic: kaboom");
    }

    #[tokio::test]
    async fn server_keeps_serving_after_a_panic() {
        let router = panicking_router();

        let response = router
            .clone()
            .oneshot(Request::builder().uri("/boom").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let response = router
            .oneshot(Request::builder().uri("/ok").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
