//! Append-only request log.
//!
//! Entries feed the trailing-window request-rate measurement and nothing
//! else in this layer. Rows are never updated; retention/pruning is an
//! external job's responsibility.

use crate::error::TenancyResult;
use crate::tenant::TenantId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use std::time::Duration;

/// One recorded request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLogEntry {
    /// Tenant the request was admitted for
    pub tenant_id: TenantId,
    /// Request method
    pub method: String,
    /// Request path
    pub path: String,
    /// Wall-clock duration in milliseconds
    pub duration_ms: i64,
    /// Response status code
    pub status_code: i16,
    /// Response content length in bytes
    pub content_length: i64,
    /// When the request completed
    pub timestamp: DateTime<Utc>,
}

impl RequestLogEntry {
    /// Create an entry stamped with the current time
    pub fn new(tenant_id: TenantId, method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            tenant_id,
            method: method.into(),
            path: path.into(),
            duration_ms: 0,
            status_code: 0,
            content_length: 0,
            timestamp: Utc::now(),
        }
    }

    /// Set the request duration
    pub fn with_duration_ms(mut self, duration_ms: i64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// Set the response status
    pub fn with_status(mut self, status_code: i16) -> Self {
        self.status_code = status_code;
        self
    }

    /// Set the response content length
    pub fn with_content_length(mut self, content_length: i64) -> Self {
        self.content_length = content_length;
        self
    }
}

/// Append-only store for request log entries
#[async_trait]
pub trait RequestLogStore: Send + Sync {
    /// Append one entry
    async fn append(&self, entry: &RequestLogEntry) -> TenancyResult<()>;

    /// Count entries for the tenant within the trailing window
    async fn count_window(&self, tenant: &TenantId, window: Duration) -> TenancyResult<i64>;
}

/// Request log backed by the `request_logs` table in the default schema
pub struct PgRequestLogStore {
    pool: PgPool,
}

impl PgRequestLogStore {
    /// Create a store over the system/default pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RequestLogStore for PgRequestLogStore {
    async fn append(&self, entry: &RequestLogEntry) -> TenancyResult<()> {
        sqlx::query(
            "INSERT INTO request_logs \
                (tenant_id, path, method, duration_ms, status_code, content_length, timestamp) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(entry.tenant_id.as_str())
        .bind(&entry.path)
        .bind(&entry.method)
        .bind(entry.duration_ms)
        .bind(entry.status_code)
        .bind(entry.content_length)
        .bind(entry.timestamp)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn count_window(&self, tenant: &TenantId, window: Duration) -> TenancyResult<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS requests FROM request_logs \
             WHERE tenant_id = $1 AND timestamp > now() - ($2 * INTERVAL '1 second')",
        )
        .bind(tenant.as_str())
        .bind(window.as_secs() as f64)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("requests")?)
    }
}

/// In-memory request log for testing
#[derive(Debug, Default)]
pub struct InMemoryRequestLogStore {
    entries: parking_lot::RwLock<Vec<RequestLogEntry>>,
}

impl InMemoryRequestLogStore {
    /// Create a new in-memory log
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded entries
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the log is empty
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl RequestLogStore for InMemoryRequestLogStore {
    async fn append(&self, entry: &RequestLogEntry) -> TenancyResult<()> {
        self.entries.write().push(entry.clone());
        Ok(())
    }

    async fn count_window(&self, tenant: &TenantId, window: Duration) -> TenancyResult<i64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(window)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        Ok(self
            .entries
            .read()
            .iter()
            .filter(|e| &e.tenant_id == tenant && e.timestamp > cutoff)
            .count() as i64)
    }
}
