//! Live resource-usage measurement.
//!
//! Answers "how much of quota X has tenant T consumed right now?" with a
//! best-effort, eventually-consistent snapshot. The three measurements are
//! independent; a failure in one never blocks the others. Callers treat a
//! failed dimension as "allow"; fail-open is a deliberate
//! availability-over-strict-enforcement policy, not a bug.

use crate::error::TenancyResult;
use crate::tenant::TenantId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::request_log::{InMemoryRequestLogStore, PgRequestLogStore, RequestLogStore};

/// Trailing window used for the request-rate measurement
pub const RATE_WINDOW: Duration = Duration::from_secs(60);

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Point-in-time usage sample for one tenant.
///
/// Computed on demand; never persisted by this layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// On-disk size across the tenant's tables, in GB
    pub storage_gb: f64,
    /// On-disk size per table, in bytes
    pub storage_by_table: HashMap<String, i64>,
    /// Currently open connections tagged with the tenant's application name
    pub active_connections: i64,
    /// Requests recorded within the trailing 60-second window
    pub requests_last_minute: i64,
    /// When the sample was taken
    pub sampled_at: Option<DateTime<Utc>>,
}

/// Computes current resource consumption for a tenant
#[async_trait]
pub trait UsageAccountant: Send + Sync {
    /// On-disk size of the tenant's schema in GB
    async fn storage_gb(&self, tenant: &TenantId) -> TenancyResult<f64>;

    /// Count of currently open connections for the tenant
    async fn active_connections(&self, tenant: &TenantId) -> TenancyResult<i64>;

    /// Count of requests in the trailing 60-second window
    async fn requests_last_minute(&self, tenant: &TenantId) -> TenancyResult<i64>;

    /// Full usage snapshot.
    ///
    /// Each dimension is measured independently; a failed measurement is
    /// logged and reported as zero rather than failing the snapshot.
    async fn snapshot(&self, tenant: &TenantId) -> ResourceUsage {
        let storage_gb = match self.storage_gb(tenant).await {
            Ok(gb) => gb,
            Err(e) => {
                warn!(tenant = %tenant, error = %e, "storage measurement failed");
                0.0
            }
        };
        let active_connections = match self.active_connections(tenant).await {
            Ok(count) => count,
            Err(e) => {
                warn!(tenant = %tenant, error = %e, "connection count failed");
                0
            }
        };
        let requests_last_minute = match self.requests_last_minute(tenant).await {
            Ok(count) => count,
            Err(e) => {
                warn!(tenant = %tenant, error = %e, "request rate measurement failed");
                0
            }
        };

        ResourceUsage {
            storage_gb,
            storage_by_table: HashMap::new(),
            active_connections,
            requests_last_minute,
            sampled_at: Some(Utc::now()),
        }
    }
}

/// Usage accountant backed by Postgres catalog views and the request log
pub struct PgUsageAccountant {
    pool: PgPool,
}

impl PgUsageAccountant {
    /// Create an accountant over the system/default pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// On-disk size per table in the tenant's schema, in bytes
    pub async fn storage_by_table(
        &self,
        tenant: &TenantId,
    ) -> TenancyResult<HashMap<String, i64>> {
        let rows = sqlx::query(
            "SELECT c.relname AS table_name, pg_total_relation_size(c.oid) AS total_bytes \
             FROM pg_class c \
             JOIN pg_namespace n ON n.oid = c.relnamespace \
             WHERE n.nspname = $1 AND c.relkind = 'r'",
        )
        .bind(tenant.schema_name())
        .fetch_all(&self.pool)
        .await?;

        let mut sizes = HashMap::new();
        for row in rows {
            let name: String = row.try_get("table_name")?;
            let bytes: i64 = row.try_get("total_bytes")?;
            sizes.insert(name, bytes);
        }
        Ok(sizes)
    }
}

#[async_trait]
impl UsageAccountant for PgUsageAccountant {
    async fn storage_gb(&self, tenant: &TenantId) -> TenancyResult<f64> {
        let sizes = self.storage_by_table(tenant).await?;
        let total: i64 = sizes.values().sum();
        Ok(total as f64 / BYTES_PER_GB)
    }

    async fn active_connections(&self, tenant: &TenantId) -> TenancyResult<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS connections FROM pg_stat_activity \
             WHERE application_name = $1",
        )
        .bind(tenant.application_name())
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("connections")?)
    }

    async fn requests_last_minute(&self, tenant: &TenantId) -> TenancyResult<i64> {
        PgRequestLogStore::new(self.pool.clone())
            .count_window(tenant, RATE_WINDOW)
            .await
    }

    async fn snapshot(&self, tenant: &TenantId) -> ResourceUsage {
        let (storage_gb, storage_by_table) = match self.storage_by_table(tenant).await {
            Ok(sizes) => {
                let total: i64 = sizes.values().sum();
                (total as f64 / BYTES_PER_GB, sizes)
            }
            Err(e) => {
                warn!(tenant = %tenant, error = %e, "storage measurement failed");
                (0.0, HashMap::new())
            }
        };
        let active_connections = match self.active_connections(tenant).await {
            Ok(count) => count,
            Err(e) => {
                warn!(tenant = %tenant, error = %e, "connection count failed");
                0
            }
        };
        let requests_last_minute = match self.requests_last_minute(tenant).await {
            Ok(count) => count,
            Err(e) => {
                warn!(tenant = %tenant, error = %e, "request rate measurement failed");
                0
            }
        };

        ResourceUsage {
            storage_gb,
            storage_by_table,
            active_connections,
            requests_last_minute,
            sampled_at: Some(Utc::now()),
        }
    }
}

/// In-memory usage accountant for testing.
///
/// Storage and connection figures are set explicitly; the request rate is
/// derived from a shared in-memory request log so admission tests exercise
/// the same read path the gate uses in production.
#[derive(Default)]
pub struct InMemoryUsageAccountant {
    storage: parking_lot::RwLock<HashMap<TenantId, f64>>,
    connections: parking_lot::RwLock<HashMap<TenantId, i64>>,
    log: Option<Arc<InMemoryRequestLogStore>>,
}

impl InMemoryUsageAccountant {
    /// Create an accountant with all figures at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive the request rate from a shared in-memory log
    pub fn with_request_log(mut self, log: Arc<InMemoryRequestLogStore>) -> Self {
        self.log = Some(log);
        self
    }

    /// Set the reported storage figure for a tenant
    pub fn set_storage_gb(&self, tenant: &TenantId, gb: f64) {
        self.storage.write().insert(tenant.clone(), gb);
    }

    /// Set the reported connection count for a tenant
    pub fn set_connections(&self, tenant: &TenantId, connections: i64) {
        self.connections.write().insert(tenant.clone(), connections);
    }
}

#[async_trait]
impl UsageAccountant for InMemoryUsageAccountant {
    async fn storage_gb(&self, tenant: &TenantId) -> TenancyResult<f64> {
        Ok(self.storage.read().get(tenant).copied().unwrap_or(0.0))
    }

    async fn active_connections(&self, tenant: &TenantId) -> TenancyResult<i64> {
        Ok(self.connections.read().get(tenant).copied().unwrap_or(0))
    }

    async fn requests_last_minute(&self, tenant: &TenantId) -> TenancyResult<i64> {
        match &self.log {
            Some(log) => log.count_window(tenant, RATE_WINDOW).await,
            None => Ok(0),
        }
    }
}
