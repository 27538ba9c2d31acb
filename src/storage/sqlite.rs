use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::storage::{LogSink, RequestLogRecord, StorageError};

const CREATE_LOGS_TABLE: &str = "CREATE TABLE IF NOT EXISTS logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source TEXT,
    level TEXT,
    message TEXT,
    timestamp TEXT,
    method TEXT,
    path TEXT,
    status_code INTEGER,
    latency_ms INTEGER,
    client_ip TEXT,
    user_agent TEXT,
    backend TEXT
)";

const INSERT_LOG: &str = "INSERT INTO logs
    (source, level, message, timestamp, method, path, status_code, latency_ms, client_ip, user_agent, backend)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

const SELECT_LOGS: &str = "SELECT source, level, message, timestamp, method, path, status_code, latency_ms, client_ip, user_agent, backend
    FROM logs ORDER BY timestamp DESC LIMIT ?";

pub struct SqliteLogStore {
    pool: SqlitePool,
}

impl SqliteLogStore {
    /// Opens (creating if missing) the database file and ensures the
    /// `logs` table exists.
    pub async fn connect(database: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", database))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Self::init(pool).await
    }

    /// In-memory store, mainly for tests. A single connection keeps every
    /// query on the same database.
    pub async fn in_memory() -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::init(pool).await
    }

    async fn init(pool: SqlitePool) -> Result<Self, StorageError> {
        sqlx::query(CREATE_LOGS_TABLE).execute(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl LogSink for SqliteLogStore {
    async fn save(&self, records: &[RequestLogRecord]) -> Result<(), StorageError> {
        for record in records {
            sqlx::query(INSERT_LOG)
                .bind(&record.source)
                .bind(&record.level)
                .bind(&record.message)
                .bind(record.timestamp.to_rfc3339())
                .bind(&record.method)
                .bind(&record.path)
                .bind(record.status_code as i64)
                .bind(record.latency.as_millis() as i64)
                .bind(&record.client_ip)
                .bind(&record.user_agent)
                .bind(&record.backend)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn query_logs(&self, limit: i64) -> Result<Vec<RequestLogRecord>, StorageError> {
        let rows = sqlx::query(SELECT_LOGS)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let timestamp: String = row.get("timestamp");
            let status_code: i64 = row.get("status_code");
            let latency_ms: i64 = row.get("latency_ms");

            records.push(RequestLogRecord {
                source: row.get("source"),
                level: row.get("level"),
                message: row.get("message"),
                timestamp: DateTime::parse_from_rfc3339(&timestamp)?.with_timezone(&Utc),
                method: row.get("method"),
                path: row.get("path"),
                status_code: status_code as u16,
                latency: Duration::from_millis(latency_ms.max(0) as u64),
                client_ip: row.get("client_ip"),
                user_agent: row.get("user_agent"),
                backend: row.get("backend"),
            });
        }
        Ok(records)
    }
}
