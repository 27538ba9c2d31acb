mod common;

use common::{gateway_config, route_to, upstream, TestGateway};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn body_of(response: reqwest::Response) -> String {
    response.text().await.unwrap()
}

#[tokio::test]
async fn forwards_requests_to_the_configured_backend() {
    let backend = upstream("users-service").await;
    let gateway = TestGateway::start(gateway_config(vec![route_to(
        "/api/users/{*rest}",
        &[(&backend.uri(), 1)],
    )]))
    .await;

    let response = reqwest::get(gateway.url("/api/users/42")).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(body_of(response).await, "users-service");

    gateway.shutdown().await;
}

#[tokio::test]
async fn upstream_receives_path_query_and_forwarding_headers() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&backend)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/users/7"))
        .and(wiremock::matchers::query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&backend)
        .await;

    let gateway = TestGateway::start(gateway_config(vec![route_to(
        "/api/users/{*rest}",
        &[(&backend.uri(), 1)],
    )]))
    .await;

    let response = reqwest::get(gateway.url("/api/users/7?page=2")).await.unwrap();
    assert_eq!(response.status(), 200);

    let received = backend.received_requests().await.unwrap();
    let proxied = received
        .iter()
        .find(|request| request.url.path() == "/api/users/7")
        .unwrap();
    assert_eq!(
        proxied.headers.get("x-forwarded-for").unwrap(),
        "127.0.0.1"
    );
    assert_eq!(proxied.headers.get("x-real-ip").unwrap(), "127.0.0.1");
    assert_eq!(proxied.headers.get("x-forwarded-proto").unwrap(), "http");
    assert!(proxied.headers.get("x-forwarded-host").is_some());

    gateway.shutdown().await;
}

#[tokio::test]
async fn equal_weights_alternate_between_backends() {
    let a = upstream("A").await;
    let b = upstream("B").await;
    let gateway = TestGateway::start(gateway_config(vec![route_to(
        "/api/users/{*rest}",
        &[(&a.uri(), 1), (&b.uri(), 1)],
    )]))
    .await;

    let mut replies = Vec::new();
    for _ in 0..4 {
        let response = reqwest::get(gateway.url("/api/users/1")).await.unwrap();
        replies.push(body_of(response).await);
    }
    assert_eq!(replies, vec!["A", "B", "A", "B"]);

    gateway.shutdown().await;
}

#[tokio::test]
async fn weighted_backends_repeat_by_weight() {
    let a = upstream("A").await;
    let b = upstream("B").await;
    let gateway = TestGateway::start(gateway_config(vec![route_to(
        "/api/users/{*rest}",
        &[(&a.uri(), 2), (&b.uri(), 1)],
    )]))
    .await;

    let mut replies = Vec::new();
    for _ in 0..6 {
        let response = reqwest::get(gateway.url("/api/users/1")).await.unwrap();
        replies.push(body_of(response).await);
    }
    assert_eq!(replies, vec!["A", "A", "B", "A", "A", "B"]);

    gateway.shutdown().await;
}

#[tokio::test]
async fn catch_all_routes_match_trailing_slash_but_not_the_bare_prefix() {
    let backend = upstream("hit").await;
    let gateway = TestGateway::start(gateway_config(vec![route_to(
        "/api/users/{*rest}",
        &[(&backend.uri(), 1)],
    )]))
    .await;

    let deep = reqwest::get(gateway.url("/api/users/1")).await.unwrap();
    assert_eq!(deep.status(), 200);

    let slash = reqwest::get(gateway.url("/api/users/")).await.unwrap();
    assert_eq!(slash.status(), 200);

    let bare = reqwest::get(gateway.url("/api/users")).await.unwrap();
    assert_eq!(bare.status(), 404);

    gateway.shutdown().await;
}

#[tokio::test]
async fn methods_outside_the_route_list_are_rejected() {
    let backend = upstream("hit").await;
    let mut route = route_to("/api/users/{*rest}", &[(&backend.uri(), 1)]);
    route.methods = vec!["GET".to_string()];
    let gateway = TestGateway::start(gateway_config(vec![route])).await;

    let client = reqwest::Client::new();
    let get = client
        .get(gateway.url("/api/users/1"))
        .send()
        .await
        .unwrap();
    assert_eq!(get.status(), 200);

    let post = client
        .post(gateway.url("/api/users/1"))
        .send()
        .await
        .unwrap();
    assert_eq!(post.status(), 405);

    gateway.shutdown().await;
}

#[tokio::test]
async fn dead_backend_maps_to_502_before_it_is_demoted() {
    // One failed probe leaves the backend in rotation (threshold is 3),
    // so the request reaches it and fails at the transport level.
    let gateway = TestGateway::start(gateway_config(vec![route_to(
        "/api/users/{*rest}",
        &[("http://127.0.0.1:1", 1)],
    )]))
    .await;

    let response = reqwest::get(gateway.url("/api/users/1")).await.unwrap();
    assert_eq!(response.status(), 502);
    assert_eq!(body_of(response).await, r#"{"error":"Backend request failed"}"#);

    gateway.shutdown().await;
}

#[tokio::test]
async fn upstream_statuses_and_headers_pass_through() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&backend)
        .await;
    Mock::given(wiremock::matchers::any())
        .respond_with(
            ResponseTemplate::new(418)
                .insert_header("x-upstream-header", "teapot")
                .set_body_string("short and stout"),
        )
        .mount(&backend)
        .await;

    let gateway = TestGateway::start(gateway_config(vec![route_to(
        "/api/{*rest}",
        &[(&backend.uri(), 1)],
    )]))
    .await;

    let response = reqwest::get(gateway.url("/api/teapot")).await.unwrap();
    assert_eq!(response.status(), 418);
    assert_eq!(response.headers().get("x-upstream-header").unwrap(), "teapot");
    assert_eq!(body_of(response).await, "short and stout");

    gateway.shutdown().await;
}

#[tokio::test]
async fn health_endpoint_reports_status_and_time() {
    let backend = upstream("hit").await;
    let gateway = TestGateway::start(gateway_config(vec![route_to(
        "/api/{*rest}",
        &[(&backend.uri(), 1)],
    )]))
    .await;

    let response = reqwest::get(gateway.url("/health")).await.unwrap();
    assert_eq!(response.status(), 200);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert!(body["time"].as_str().unwrap().contains('T'));

    gateway.shutdown().await;
}

#[tokio::test]
async fn admin_endpoint_lists_backends_per_route() {
    let a = upstream("A").await;
    let b = upstream("B").await;
    let gateway = TestGateway::start(gateway_config(vec![route_to(
        "/api/users/{*rest}",
        &[(&a.uri(), 2), (&b.uri(), 1)],
    )]))
    .await;

    let response = reqwest::get(gateway.url("/admin/backends")).await.unwrap();
    assert_eq!(response.status(), 200);

    let body: serde_json::Value = response.json().await.unwrap();
    let backends = &body["backends"]["/api/users/{*rest}"];
    assert_eq!(backends.as_array().unwrap().len(), 2);
    assert_eq!(backends[0]["weight"], 2);
    assert_eq!(backends[0]["healthy"], true);
    assert!(backends[0]["url"].as_str().unwrap().starts_with("http://"));

    gateway.shutdown().await;
}

#[tokio::test]
async fn responses_carry_a_request_id() {
    let backend = upstream("hit").await;
    let gateway = TestGateway::start(gateway_config(vec![route_to(
        "/api/{*rest}",
        &[(&backend.uri(), 1)],
    )]))
    .await;

    let response = reqwest::get(gateway.url("/health")).await.unwrap();
    assert!(!response
        .headers()
        .get("x-request-id")
        .unwrap()
        .to_str()
        .unwrap()
        .is_empty());

    gateway.shutdown().await;
}
