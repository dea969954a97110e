//! Per-tenant resource limits.
//!
//! Limits live in the `tenant_quotas` table in the default schema. A tenant
//! with no quota row behaves as if the default limits apply; defaults are
//! computed at read time, never written back as rows.

use crate::error::TenancyResult;
use crate::tenant::TenantId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use std::collections::HashMap;

/// Default storage ceiling in GB
pub const DEFAULT_MAX_STORAGE_GB: f64 = 100.0;
/// Default requests per trailing minute
pub const DEFAULT_MAX_REQUESTS_PER_MINUTE: i64 = 1000;
/// Default concurrent connection ceiling
pub const DEFAULT_MAX_CONCURRENT_CONNECTIONS: i64 = 100;
/// Default query timeout in milliseconds
pub const DEFAULT_MAX_QUERY_TIMEOUT_MS: i64 = 30_000;

/// Resource limits for one tenant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Maximum on-disk storage in GB
    pub max_storage_gb: f64,
    /// Maximum requests in the trailing 60-second window
    pub max_requests_per_minute: i64,
    /// Maximum concurrently open connections
    pub max_concurrent_connections: i64,
    /// Maximum query duration in milliseconds, applied as the
    /// `statement_timeout` on tenant-scoped connections
    pub max_query_timeout_ms: i64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_storage_gb: DEFAULT_MAX_STORAGE_GB,
            max_requests_per_minute: DEFAULT_MAX_REQUESTS_PER_MINUTE,
            max_concurrent_connections: DEFAULT_MAX_CONCURRENT_CONNECTIONS,
            max_query_timeout_ms: DEFAULT_MAX_QUERY_TIMEOUT_MS,
        }
    }
}

impl ResourceLimits {
    /// Set the storage ceiling
    pub fn with_storage_gb(mut self, gb: f64) -> Self {
        self.max_storage_gb = gb;
        self
    }

    /// Set the request-rate ceiling
    pub fn with_requests_per_minute(mut self, rpm: i64) -> Self {
        self.max_requests_per_minute = rpm;
        self
    }

    /// Set the connection ceiling
    pub fn with_concurrent_connections(mut self, connections: i64) -> Self {
        self.max_concurrent_connections = connections;
        self
    }

    /// Set the query timeout
    pub fn with_query_timeout_ms(mut self, timeout_ms: i64) -> Self {
        self.max_query_timeout_ms = timeout_ms;
        self
    }
}

/// Durable storage and retrieval of per-tenant limits
#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Stored limits for the tenant, or the defaults when no row exists.
    ///
    /// Never writes; defaults are computed, not materialized.
    async fn get_limits(&self, tenant: &TenantId) -> TenancyResult<ResourceLimits>;

    /// Upsert limits for the tenant; a repeated call overwrites rather than
    /// duplicates
    async fn set_limits(&self, tenant: &TenantId, limits: &ResourceLimits) -> TenancyResult<()>;
}

/// Quota store backed by the `tenant_quotas` table in the default schema
pub struct PgQuotaStore {
    pool: PgPool,
    defaults: ResourceLimits,
}

impl PgQuotaStore {
    /// Create a store over the system/default pool
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            defaults: ResourceLimits::default(),
        }
    }

    /// Override the computed defaults (e.g. from environment configuration)
    pub fn with_defaults(mut self, defaults: ResourceLimits) -> Self {
        self.defaults = defaults;
        self
    }
}

#[async_trait]
impl QuotaStore for PgQuotaStore {
    async fn get_limits(&self, tenant: &TenantId) -> TenancyResult<ResourceLimits> {
        let row = sqlx::query(
            "SELECT max_storage_gb, max_requests_per_minute, \
                    max_concurrent_connections, max_query_timeout \
             FROM tenant_quotas WHERE tenant_id = $1",
        )
        .bind(tenant.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(ResourceLimits {
                max_storage_gb: row.try_get("max_storage_gb")?,
                max_requests_per_minute: row.try_get("max_requests_per_minute")?,
                max_concurrent_connections: row.try_get("max_concurrent_connections")?,
                max_query_timeout_ms: row.try_get("max_query_timeout")?,
            }),
            None => Ok(self.defaults.clone()),
        }
    }

    async fn set_limits(&self, tenant: &TenantId, limits: &ResourceLimits) -> TenancyResult<()> {
        sqlx::query(
            "INSERT INTO tenant_quotas \
                (tenant_id, max_storage_gb, max_requests_per_minute, \
                 max_concurrent_connections, max_query_timeout) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (tenant_id) DO UPDATE SET \
                max_storage_gb = EXCLUDED.max_storage_gb, \
                max_requests_per_minute = EXCLUDED.max_requests_per_minute, \
                max_concurrent_connections = EXCLUDED.max_concurrent_connections, \
                max_query_timeout = EXCLUDED.max_query_timeout, \
                updated_at = now()",
        )
        .bind(tenant.as_str())
        .bind(limits.max_storage_gb)
        .bind(limits.max_requests_per_minute)
        .bind(limits.max_concurrent_connections)
        .bind(limits.max_query_timeout_ms)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// In-memory quota store for testing
#[derive(Debug, Default)]
pub struct InMemoryQuotaStore {
    limits: parking_lot::RwLock<HashMap<TenantId, ResourceLimits>>,
    defaults: ResourceLimits,
}

impl InMemoryQuotaStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the computed defaults
    pub fn with_defaults(mut self, defaults: ResourceLimits) -> Self {
        self.defaults = defaults;
        self
    }
}

#[async_trait]
impl QuotaStore for InMemoryQuotaStore {
    async fn get_limits(&self, tenant: &TenantId) -> TenancyResult<ResourceLimits> {
        Ok(self
            .limits
            .read()
            .get(tenant)
            .cloned()
            .unwrap_or_else(|| self.defaults.clone()))
    }

    async fn set_limits(&self, tenant: &TenantId, limits: &ResourceLimits) -> TenancyResult<()> {
        self.limits.write().insert(tenant.clone(), limits.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(id: &str) -> TenantId {
        TenantId::new(id).unwrap()
    }

    #[tokio::test]
    async fn test_defaults_when_no_row() {
        let store = InMemoryQuotaStore::new();
        let limits = store.get_limits(&tenant("acme")).await.unwrap();

        assert_eq!(limits.max_storage_gb, 100.0);
        assert_eq!(limits.max_requests_per_minute, 1000);
        assert_eq!(limits.max_concurrent_connections, 100);
        assert_eq!(limits.max_query_timeout_ms, 30_000);
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let store = InMemoryQuotaStore::new();
        let id = tenant("acme");
        let limits = ResourceLimits::default()
            .with_requests_per_minute(60)
            .with_storage_gb(5.0);

        store.set_limits(&id, &limits).await.unwrap();
        assert_eq!(store.get_limits(&id).await.unwrap(), limits);
    }

    #[tokio::test]
    async fn test_set_overwrites() {
        let store = InMemoryQuotaStore::new();
        let id = tenant("acme");

        store
            .set_limits(&id, &ResourceLimits::default().with_requests_per_minute(60))
            .await
            .unwrap();
        store
            .set_limits(&id, &ResourceLimits::default().with_requests_per_minute(120))
            .await
            .unwrap();

        let limits = store.get_limits(&id).await.unwrap();
        assert_eq!(limits.max_requests_per_minute, 120);
    }

    #[tokio::test]
    async fn test_custom_defaults() {
        let store =
            InMemoryQuotaStore::new().with_defaults(ResourceLimits::default().with_storage_gb(1.0));
        let limits = store.get_limits(&tenant("small")).await.unwrap();
        assert_eq!(limits.max_storage_gb, 1.0);
    }
}
