use axum::extract::State;
use axum::http::Uri;
use axum::response::IntoResponse;
use axum::routing::{any, get};
use axum::{Json, Router};
use clap::Parser;
use serde_json::json;
use tracing::info;

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(short, long)]
    port: u16,

    /// Answer health probes with this status instead of 200, to drill
    /// failover by hand.
    #[arg(long, default_value_t = 200)]
    health_status: u16,
}

async fn health(State(args): State<Args>) -> impl IntoResponse {
    axum::http::StatusCode::from_u16(args.health_status)
        .unwrap_or(axum::http::StatusCode::OK)
}

async fn echo(State(args): State<Args>, uri: Uri) -> impl IntoResponse {
    info!("request for {}", uri.path());
    Json(json!({
        "served_by": format!("dummy-backend:{}", args.port),
        "path": uri.path(),
    }))
}

fn router(args: Args) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/", any(echo))
        .route("/{*path}", any(echo))
        .with_state(args)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", args.port))
        .await
        .unwrap();

    info!("dummy backend listening on port {}", args.port);
    axum::serve(listener, router(args)).await.unwrap();
}
