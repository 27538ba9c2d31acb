use std::collections::BTreeMap;
use std::future::{Future, IntoFuture};
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::from_fn_with_state;
use axum::response::IntoResponse;
use axum::routing::{get, on, MethodFilter, MethodRouter};
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::{Config, ConfigError};
use crate::middleware::cors::{cors_middleware, CorsPolicy};
use crate::middleware::logging::{logging_middleware, RequestLogState};
use crate::middleware::rate_limit::{rate_limit_middleware, RateLimitState, RateLimiter};
use crate::middleware::recovery::recovery_layer;
use crate::proxy::route::{RouteError, RouteProxy};
use crate::request_id::{GatewayRequestId, X_REQUEST_ID};
use crate::storage::writer::LogWriter;
use crate::storage::LogSink;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to create proxy for route {path}: {source}")]
    Route { path: String, source: RouteError },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Serve(std::io::Error),
}

/// The gateway: route table, middleware chain, and lifecycle. Owns one
/// `RouteProxy` per configured route.
pub struct Server {
    config: Config,
    routes: Vec<(String, Arc<RouteProxy>)>,
    router: Router,
}

#[derive(Clone)]
struct AdminState {
    routes: Vec<(String, Arc<RouteProxy>)>,
}

#[derive(Serialize)]
struct BackendStatus {
    url: String,
    healthy: bool,
    weight: u32,
}

impl Server {
    /// Validates the configuration and builds the full router. Fails
    /// before anything listens when a route is unbuildable.
    pub fn new(mut config: Config, sink: Arc<dyn LogSink>) -> Result<Self, GatewayError> {
        config.validate()?;

        let write_timeout = config.server.write_timeout();
        let mut routes = Vec::with_capacity(config.routes.len());
        for route_config in &config.routes {
            let proxy = RouteProxy::new(&route_config.backends, write_timeout).map_err(|source| {
                GatewayError::Route {
                    path: route_config.path.clone(),
                    source,
                }
            })?;
            routes.push((route_config.path.clone(), Arc::new(proxy)));
            info!(
                "registered route {} -> {} backend(s)",
                route_config.path,
                route_config.backends.len()
            );
        }

        let writer = Arc::new(LogWriter::new(sink));
        let router = build_router(&config, &routes, writer);

        Ok(Self {
            config,
            routes,
            router,
        })
    }

    /// The assembled router, mainly for in-process testing.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Binds the configured address and serves until an OS shutdown
    /// signal arrives.
    pub async fn run(self) -> Result<(), GatewayError> {
        let addr = format!("{}:{}", self.config.server.host, self.config.server.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| GatewayError::Bind {
                addr: addr.clone(),
                source,
            })?;

        info!("starting API gateway on {}", addr);
        self.serve(listener, crate::shutdown::shutdown_signal()).await
    }

    /// Serves on an already-bound listener until `shutdown` resolves,
    /// then stops the health loops, drains in-flight requests within the
    /// configured deadline, and force-terminates past it.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), GatewayError> {
        // First health round completes before the listener accepts, so
        // initial routing decisions reflect real backend state.
        for (_, proxy) in &self.routes {
            proxy.start().await;
        }

        let shutdown_timeout = self.config.server.shutdown_timeout();
        let routes = self.routes.clone();
        let (draining_tx, draining_rx) = watch::channel(false);

        let graceful = async move {
            shutdown.await;
            info!("shutting down API gateway");
            for (_, proxy) in &routes {
                proxy.stop();
            }
            let _ = draining_tx.send(true);
        };

        let serve = axum::serve(
            listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(graceful)
        .into_future();

        let mut draining_rx = draining_rx;
        let deadline = async move {
            while !*draining_rx.borrow() {
                if draining_rx.changed().await.is_err() {
                    // Drain never started; park forever and let the serve
                    // arm finish the select.
                    std::future::pending::<()>().await;
                }
            }
            tokio::time::sleep(shutdown_timeout).await;
        };

        tokio::select! {
            result = serve => result.map_err(GatewayError::Serve)?,
            _ = deadline => {
                warn!("shutdown deadline exceeded, aborting in-flight requests");
            }
        }

        info!("API gateway stopped");
        Ok(())
    }
}

fn build_router(
    config: &Config,
    routes: &[(String, Arc<RouteProxy>)],
    writer: Arc<LogWriter>,
) -> Router {
    let admin = AdminState {
        routes: routes.to_vec(),
    };

    let mut router = Router::new()
        .route("/health", get(health))
        .route("/admin/backends", get(admin_backends).with_state(admin));

    for (route_config, (path, proxy)) in config.routes.iter().zip(routes) {
        let filter = method_filter(&route_config.methods);
        router = router.route(path, proxy_method_router(proxy, filter));
        // `/p/{*rest}` does not match `/p/`; registering the bare
        // trailing-slash base keeps both forms routable while `/p`
        // stays a 404.
        if let Some(base) = catch_all_base(path) {
            router = router.route(&base, proxy_method_router(proxy, filter));
        }
    }

    // Layers run innermost-first here, so from the outside the chain
    // reads: recovery, CORS, logging, rate limit.
    if config.rate_limiting.enabled {
        let limiter = RateLimiter::new(
            config.rate_limiting.requests_per_second,
            config.rate_limiting.burst,
        );
        router = router.layer(from_fn_with_state(
            RateLimitState::new(limiter),
            rate_limit_middleware,
        ));
    }

    router = router.layer(from_fn_with_state(
        RequestLogState { writer },
        logging_middleware,
    ));

    if config.cors.enabled {
        let policy = Arc::new(CorsPolicy::new(
            config.cors.allowed_origins.clone(),
            config.cors.allowed_methods.clone(),
            config.cors.allowed_headers.clone(),
        ));
        router = router.layer(from_fn_with_state(policy, cors_middleware));
    }

    router
        .layer(recovery_layer())
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::new(X_REQUEST_ID))
        .layer(SetRequestIdLayer::new(X_REQUEST_ID, GatewayRequestId::default()))
}

fn proxy_method_router(proxy: &Arc<RouteProxy>, filter: MethodFilter) -> MethodRouter {
    let handler = proxy.handler();
    on(filter, move |request: Request| {
        let handler = Arc::clone(&handler);
        async move { handler.handle(request).await }
    })
}

fn method_filter(methods: &[String]) -> MethodFilter {
    let mut filter: Option<MethodFilter> = None;
    for method in methods {
        let next = match method.to_ascii_uppercase().as_str() {
            "GET" => MethodFilter::GET,
            "POST" => MethodFilter::POST,
            "PUT" => MethodFilter::PUT,
            "DELETE" => MethodFilter::DELETE,
            "PATCH" => MethodFilter::PATCH,
            "HEAD" => MethodFilter::HEAD,
            "OPTIONS" => MethodFilter::OPTIONS,
            other => {
                warn!("ignoring unsupported route method {}", other);
                continue;
            }
        };
        filter = Some(match filter {
            Some(filter) => filter.or(next),
            None => next,
        });
    }

    filter.unwrap_or(
        MethodFilter::GET
            .or(MethodFilter::POST)
            .or(MethodFilter::PUT)
            .or(MethodFilter::DELETE)
            .or(MethodFilter::PATCH),
    )
}

/// For `/p/{*rest}` returns `/p/`; `None` when the path has no catch-all.
fn catch_all_base(path: &str) -> Option<String> {
    let index = path.find("/{*")?;
    path.ends_with('}').then(|| path[..index + 1].to_string())
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "time": Utc::now().to_rfc3339(),
    }))
}

async fn admin_backends(State(state): State<AdminState>) -> impl IntoResponse {
    let mut backends = BTreeMap::new();
    for (path, proxy) in &state.routes {
        let statuses: Vec<BackendStatus> = proxy
            .pool()
            .all_backends()
            .iter()
            .map(|backend| BackendStatus {
                url: backend.url().to_string(),
                healthy: backend.is_healthy(),
                weight: backend.weight(),
            })
            .collect();
        backends.insert(path.clone(), statuses);
    }

    (StatusCode::OK, Json(json!({ "backends": backends })))
}
