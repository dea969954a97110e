//! Schema provisioning.
//!
//! Brings a tenant's namespace to the expected structural state. Every
//! statement uses `IF NOT EXISTS` semantics and the whole set runs inside a
//! single transaction, so re-invocation is a no-op and a failure midway
//! leaves no partially-created namespace behind.

use crate::error::{TenancyError, TenancyResult};
use crate::tenant::TenantId;
use async_trait::async_trait;
use sqlx::PgPool;
use tracing::info;

/// Brings a tenant's namespace to the expected structural state
#[async_trait]
pub trait SchemaProvisioner: Send + Sync {
    /// Pool type the provisioner operates on
    type Pool: Send + Sync;

    /// Create the namespace and owned tables if absent.
    ///
    /// Must be idempotent: a second call for the same tenant is a no-op and
    /// produces no error. Errors are fatal to the triggering request and are
    /// not retried here.
    async fn ensure_schema(&self, pool: &Self::Pool, tenant: &TenantId) -> TenancyResult<()>;
}

/// The full statement set that provisions one tenant's namespace.
///
/// Exposed as a pure function so structure and idempotence can be inspected
/// without a database.
pub fn provisioning_statements(tenant: &TenantId) -> Vec<String> {
    let schema = format!("\"{}\"", tenant.schema_name());
    vec![
        format!("CREATE SCHEMA IF NOT EXISTS {schema}"),
        format!(
            "CREATE TABLE IF NOT EXISTS {schema}.pages (\
                id BIGSERIAL PRIMARY KEY, \
                slug TEXT NOT NULL, \
                title TEXT NOT NULL, \
                body JSONB NOT NULL DEFAULT '{{}}'::jsonb, \
                published BOOLEAN NOT NULL DEFAULT FALSE, \
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(), \
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now())"
        ),
        format!("CREATE UNIQUE INDEX IF NOT EXISTS pages_slug_idx ON {schema}.pages (slug)"),
        format!(
            "CREATE TABLE IF NOT EXISTS {schema}.media (\
                id BIGSERIAL PRIMARY KEY, \
                file_name TEXT NOT NULL, \
                content_type TEXT, \
                size_bytes BIGINT NOT NULL DEFAULT 0, \
                storage_key TEXT NOT NULL, \
                created_at TIMESTAMPTZ NOT NULL DEFAULT now())"
        ),
        format!("CREATE INDEX IF NOT EXISTS media_created_idx ON {schema}.media (created_at)"),
        format!(
            "CREATE TABLE IF NOT EXISTS {schema}.templates (\
                id BIGSERIAL PRIMARY KEY, \
                name TEXT NOT NULL, \
                source TEXT NOT NULL DEFAULT '', \
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(), \
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now())"
        ),
        format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS templates_name_idx ON {schema}.templates (name)"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {schema}.workflows (\
                id BIGSERIAL PRIMARY KEY, \
                name TEXT NOT NULL, \
                definition JSONB NOT NULL DEFAULT '{{}}'::jsonb, \
                enabled BOOLEAN NOT NULL DEFAULT TRUE, \
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(), \
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now())"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS workflows_enabled_idx ON {schema}.workflows (enabled)"
        ),
    ]
}

/// System-wide tables owned by this layer in the default schema
pub fn system_statements() -> Vec<&'static str> {
    vec![
        "CREATE TABLE IF NOT EXISTS request_logs (\
            id BIGSERIAL PRIMARY KEY, \
            tenant_id TEXT NOT NULL, \
            path TEXT NOT NULL, \
            method TEXT NOT NULL, \
            duration_ms BIGINT NOT NULL DEFAULT 0, \
            status_code SMALLINT NOT NULL DEFAULT 0, \
            content_length BIGINT NOT NULL DEFAULT 0, \
            timestamp TIMESTAMPTZ NOT NULL DEFAULT now())",
        "CREATE INDEX IF NOT EXISTS request_logs_tenant_time_idx \
            ON request_logs (tenant_id, timestamp)",
        "CREATE TABLE IF NOT EXISTS tenant_quotas (\
            tenant_id TEXT PRIMARY KEY, \
            max_storage_gb DOUBLE PRECISION NOT NULL, \
            max_requests_per_minute BIGINT NOT NULL, \
            max_concurrent_connections BIGINT NOT NULL, \
            max_query_timeout BIGINT NOT NULL, \
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(), \
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now())",
    ]
}

/// Create the system-wide tables on the default pool, idempotently
pub async fn ensure_system_tables(pool: &PgPool) -> TenancyResult<()> {
    let mut tx = pool.begin().await?;
    for statement in system_statements() {
        sqlx::query(statement).execute(&mut *tx).await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Postgres schema provisioner
#[derive(Debug, Clone, Default)]
pub struct PgSchemaProvisioner;

#[async_trait]
impl SchemaProvisioner for PgSchemaProvisioner {
    type Pool = PgPool;

    async fn ensure_schema(&self, pool: &PgPool, tenant: &TenantId) -> TenancyResult<()> {
        let mut tx = pool.begin().await.map_err(|e| TenancyError::Provisioning {
            tenant: tenant.to_string(),
            reason: e.to_string(),
        })?;

        for statement in provisioning_statements(tenant) {
            // Transaction drop rolls back the whole set on failure.
            sqlx::query(&statement).execute(&mut *tx).await.map_err(|e| {
                TenancyError::Provisioning {
                    tenant: tenant.to_string(),
                    reason: e.to_string(),
                }
            })?;
        }

        tx.commit().await.map_err(|e| TenancyError::Provisioning {
            tenant: tenant.to_string(),
            reason: e.to_string(),
        })?;

        info!(tenant = %tenant, schema = %tenant.schema_name(), "tenant schema ensured");
        Ok(())
    }
}
