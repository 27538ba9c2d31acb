#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use portcullis::config::{BackendConfig, Config, RouteConfig};
use portcullis::server::Server;
use portcullis::storage::sqlite::SqliteLogStore;
use portcullis::storage::{LogSink, RequestLogRecord};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use wiremock::matchers::{any, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// A gateway bound to an ephemeral port, backed by an in-memory log
/// store, running until `shutdown` is called.
pub struct TestGateway {
    pub addr: SocketAddr,
    pub store: Arc<SqliteLogStore>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl TestGateway {
    pub async fn start(config: Config) -> Self {
        let store = Arc::new(SqliteLogStore::in_memory().await.unwrap());
        let sink: Arc<dyn LogSink> = Arc::clone(&store) as Arc<dyn LogSink>;
        let server = Server::new(config, sink).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            server
                .serve(listener, async {
                    let _ = shutdown_rx.await;
                })
                .await
                .unwrap();
        });

        Self {
            addr,
            store,
            shutdown: Some(shutdown_tx),
            handle,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Triggers graceful shutdown and waits for the server to stop.
    pub async fn shutdown(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let _ = self.handle.await;
    }

    /// Polls the log store until a record matching the predicate shows up
    /// or the deadline passes; persistence is asynchronous.
    pub async fn wait_for_record(
        &self,
        predicate: impl Fn(&RequestLogRecord) -> bool,
    ) -> Option<RequestLogRecord> {
        for _ in 0..50 {
            let records = self.store.query_logs(100).await.unwrap();
            if let Some(record) = records.into_iter().find(&predicate) {
                return Some(record);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        None
    }
}

pub fn route_to(route_path: &str, backends: &[(&str, i32)]) -> RouteConfig {
    RouteConfig {
        path: route_path.to_string(),
        backends: backends
            .iter()
            .map(|(url, weight)| BackendConfig {
                url: url.to_string(),
                weight: *weight,
            })
            .collect(),
        methods: Vec::new(),
        rate_limit: 0,
    }
}

pub fn gateway_config(routes: Vec<RouteConfig>) -> Config {
    Config {
        routes,
        ..Config::default()
    }
}

/// A mock upstream answering 200 on `/health` and a fixed body on
/// everything else, so round-robin order is observable from the outside.
pub async fn upstream(reply: &str) -> MockServer {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    Mock::given(any())
        .respond_with(ResponseTemplate::new(200).set_body_string(reply.to_string()))
        .mount(&server)
        .await;

    server
}
