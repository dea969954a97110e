//! Multi-Tenancy for Pagecraft
//!
//! Tenant isolation and resource governance for the Pagecraft platform:
//! schema-per-tenant Postgres isolation, lazily created per-tenant connection
//! pools, per-tenant quotas with live usage measurement, and an admission
//! gate that resolves, validates and rate-governs every request.
//!
//! # Features
//!
//! - 🏢 **Tenant Isolation** - Request-scoped tenant context, no global state
//! - 📊 **Schema Per Tenant** - PostgreSQL `org_<id>` schema isolation
//! - 🗄️ **Pool Per Tenant** - Lazy, single-flight pool creation
//! - 🔍 **Tenant Resolution** - Subdomain, header, query and principal sources
//! - 🚦 **Admission Gate** - Resolve → validate → quota check per request
//! - 🎛️ **Quotas & Usage** - Storage, request-rate and connection ceilings
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use pagecraft_tenancy::prelude::*;
//! use std::sync::Arc;
//!
//! // Connect the default pool and bootstrap the system tables.
//! let config = DatabaseConfig::from_env()?;
//! let registry = Arc::new(PgPoolRegistry::connect(config).await?);
//!
//! // Wire the admission gate over the default pool.
//! let pool = registry.default_pool().clone();
//! let gate = AdmissionGate::new(
//!     TenantResolver::new().with_base_domain("pagecraft.io"),
//!     Arc::new(PgTenantStore::new(pool.clone())),
//!     Arc::new(PgQuotaStore::new(pool.clone())),
//!     Arc::new(PgUsageAccountant::new(pool.clone())),
//!     Arc::new(PgRequestLogStore::new(pool)),
//! );
//!
//! // Per request: admit, then run tenant-scoped work.
//! let ctx = gate.admit(&request).await?;
//! let pages: i64 = registry
//!     .execute_for_tenant(&ctx, |conn| {
//!         Box::pin(async move {
//!             let row = sqlx::query("SELECT COUNT(*) AS pages FROM pages")
//!                 .fetch_one(conn)
//!                 .await?;
//!             Ok(row.try_get("pages")?)
//!         })
//!     })
//!     .await?;
//!
//! // After the response: record usage, fire-and-forget.
//! gate.record_request(
//!     RequestLogEntry::new(ctx.tenant_id().clone(), "GET", "/pages")
//!         .with_status(200)
//!         .with_duration_ms(12),
//! );
//! ```

pub mod config;
pub mod database;
pub mod error;
pub mod middleware;
pub mod quota;
pub mod request_log;
pub mod resolver;
pub mod schema;
pub mod tenant;
pub mod usage;

pub use config::{DatabaseConfig, QuotaDefaults};
pub use database::{PgPoolBackend, PgPoolRegistry, PoolBackend, PoolRegistry};
pub use error::{QuotaDimension, TenancyError, TenancyResult};
pub use middleware::AdmissionGate;
pub use quota::{InMemoryQuotaStore, PgQuotaStore, QuotaStore, ResourceLimits};
pub use request_log::{
    InMemoryRequestLogStore, PgRequestLogStore, RequestLogEntry, RequestLogStore,
};
pub use resolver::{Principal, RequestContext, TenantResolver};
pub use schema::{PgSchemaProvisioner, SchemaProvisioner, ensure_system_tables};
pub use tenant::{
    InMemoryTenantStore, PgTenantStore, Tenant, TenantContext, TenantId, TenantStore,
};
pub use usage::{InMemoryUsageAccountant, PgUsageAccountant, ResourceUsage, UsageAccountant};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{DatabaseConfig, QuotaDefaults};
    pub use crate::database::{PgPoolRegistry, PoolRegistry};
    pub use crate::error::{QuotaDimension, TenancyError, TenancyResult};
    pub use crate::middleware::AdmissionGate;
    pub use crate::quota::{PgQuotaStore, QuotaStore, ResourceLimits};
    pub use crate::request_log::{PgRequestLogStore, RequestLogEntry, RequestLogStore};
    pub use crate::resolver::{Principal, RequestContext, TenantResolver};
    pub use crate::schema::{PgSchemaProvisioner, SchemaProvisioner};
    pub use crate::tenant::{PgTenantStore, Tenant, TenantContext, TenantId, TenantStore};
    pub use crate::usage::{PgUsageAccountant, ResourceUsage, UsageAccountant};
}
