pub mod sqlite;
pub mod writer;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid timestamp in log row: {0}")]
    InvalidTimestamp(#[from] chrono::ParseError),
}

/// One request as seen by the logging middleware: what came in, what went
/// out, how long it took, and which backend served it.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestLogRecord {
    pub source: String,
    pub level: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub path: String,
    pub status_code: u16,
    pub latency: Duration,
    pub client_ip: String,
    pub user_agent: String,
    pub backend: String,
}

/// Persistence seam for request logs. Implementations must be callable
/// from any task; errors are logged by the caller and never reach the
/// response path.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn save(&self, records: &[RequestLogRecord]) -> Result<(), StorageError>;

    async fn query_logs(&self, limit: i64) -> Result<Vec<RequestLogRecord>, StorageError>;
}
