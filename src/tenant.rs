//! Tenant identity and request-scoped tenant context.
//!
//! The resolved tenant is threaded through calls as an explicit
//! [`TenantContext`] parameter rather than stashed in process-wide state, so
//! concurrent requests can never observe each other's tenant.

use crate::error::{TenancyError, TenancyResult};
use crate::quota::ResourceLimits;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use std::collections::HashMap;

/// Longest identifier accepted; keeps derived Postgres names under the
/// 63-byte identifier limit.
const MAX_TENANT_ID_LEN: usize = 40;

/// Opaque tenant identifier, typically an organization id.
///
/// Identifiers are normalized to lowercase and restricted to
/// `[a-z0-9_-]` so the derived schema and application names are always
/// safe to splice into SQL identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Parse and validate a tenant identifier
    ///
    /// # Examples
    ///
    /// ```
    /// use pagecraft_tenancy::TenantId;
    ///
    /// let id = TenantId::new("Acme").unwrap();
    /// assert_eq!(id.as_str(), "acme");
    /// assert_eq!(id.schema_name(), "org_acme");
    /// assert!(TenantId::new("acme; DROP SCHEMA public").is_err());
    /// ```
    pub fn new(id: impl Into<String>) -> TenancyResult<Self> {
        let id = id.into().trim().to_ascii_lowercase();
        let valid = !id.is_empty()
            && id.len() <= MAX_TENANT_ID_LEN
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if valid {
            Ok(Self(id))
        } else {
            Err(TenancyError::InvalidTenant(id))
        }
    }

    /// The raw identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the tenant's isolated database schema (`org_<id>`)
    pub fn schema_name(&self) -> String {
        format!("org_{}", self.0)
    }

    /// `application_name` tag applied to every connection in the tenant's
    /// pool; connection counting filters `pg_stat_activity` on this value.
    pub fn application_name(&self) -> String {
        format!("pagecraft_org_{}", self.0)
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tenant information
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tenant {
    /// Unique tenant identifier
    pub id: TenantId,

    /// Display name/slug
    pub name: String,

    /// Whether the tenant is active
    pub active: bool,

    /// Additional metadata
    pub metadata: HashMap<String, String>,
}

impl Tenant {
    /// Create a new tenant
    ///
    /// # Examples
    ///
    /// ```
    /// use pagecraft_tenancy::{Tenant, TenantId};
    ///
    /// let tenant = Tenant::new(TenantId::new("acme").unwrap(), "Acme Corp");
    /// assert!(tenant.active);
    /// ```
    pub fn new(id: TenantId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            active: true,
            metadata: HashMap::new(),
        }
    }

    /// Set active status
    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    /// Add metadata
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Request-scoped tenant context.
///
/// Produced by the admission gate once a request has been resolved,
/// validated and admitted; carries the effective resource limits so
/// downstream database work can apply the tenant's query timeout without
/// another quota lookup.
#[derive(Debug, Clone)]
pub struct TenantContext {
    tenant: Tenant,
    limits: ResourceLimits,
}

impl TenantContext {
    /// Create a context with explicit limits
    pub fn new(tenant: Tenant, limits: ResourceLimits) -> Self {
        Self { tenant, limits }
    }

    /// Create a context with default limits
    pub fn with_default_limits(tenant: Tenant) -> Self {
        Self {
            tenant,
            limits: ResourceLimits::default(),
        }
    }

    /// The resolved tenant
    pub fn tenant(&self) -> &Tenant {
        &self.tenant
    }

    /// The resolved tenant's identifier
    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant.id
    }

    /// Effective resource limits for the tenant
    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }
}

/// Tenant lookup used by the admission gate's validation step.
///
/// Organizations themselves are owned by an external collaborator; this
/// layer only needs to answer "is this tenant known, and is it active".
#[async_trait]
pub trait TenantStore: Send + Sync {
    /// Find tenant by ID
    async fn find_by_id(&self, id: &TenantId) -> TenancyResult<Option<Tenant>>;
}

/// Tenant store backed by the `organizations` table in the default schema
pub struct PgTenantStore {
    pool: PgPool,
}

impl PgTenantStore {
    /// Create a store over the system/default pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TenantStore for PgTenantStore {
    async fn find_by_id(&self, id: &TenantId) -> TenancyResult<Option<Tenant>> {
        let row = sqlx::query("SELECT id, name, status FROM organizations WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let raw_id: String = row.try_get("id")?;
                let name: String = row.try_get("name")?;
                let status: String = row.try_get("status")?;
                let tenant = Tenant::new(TenantId::new(raw_id)?, name).with_active(status == "active");
                Ok(Some(tenant))
            }
            None => Ok(None),
        }
    }
}

/// In-memory tenant store for testing
#[derive(Debug, Default)]
pub struct InMemoryTenantStore {
    tenants: parking_lot::RwLock<HashMap<TenantId, Tenant>>,
}

impl InMemoryTenantStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tenant
    pub fn insert(&self, tenant: Tenant) {
        self.tenants.write().insert(tenant.id.clone(), tenant);
    }
}

#[async_trait]
impl TenantStore for InMemoryTenantStore {
    async fn find_by_id(&self, id: &TenantId) -> TenancyResult<Option<Tenant>> {
        Ok(self.tenants.read().get(id).cloned())
    }
}
