//! Per-tenant connection pools.
//!
//! The [`PoolRegistry`] is the single authority for obtaining a working,
//! schema-ready pool for a tenant. Pools are created lazily on first use;
//! concurrent first-time callers for the same tenant await one in-flight
//! creation rather than racing to create their own (single-flight). A pool
//! is registered only after provisioning succeeds, so a failed provisioning
//! run caches nothing and a later request retries from scratch.

use crate::config::DatabaseConfig;
use crate::error::{TenancyError, TenancyResult};
use crate::quota::{PgQuotaStore, QuotaStore, ResourceLimits};
use crate::schema::{self, PgSchemaProvisioner, SchemaProvisioner};
use crate::tenant::{TenantContext, TenantId};
use crate::usage::{PgUsageAccountant, ResourceUsage, UsageAccountant};
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgConnection, PgPool};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{info, warn};

/// Creates and closes connection pools.
///
/// The registry is generic over this seam so pool lifecycle logic can be
/// exercised without a database.
#[async_trait]
pub trait PoolBackend: Send + Sync {
    /// The pool type (e.g. `sqlx::PgPool`)
    type Pool: Clone + Send + Sync + 'static;

    /// Create a pool. `tenant` is `None` for the default/system pool;
    /// tenant pools carry the tenant's `application_name` tag.
    async fn create_pool(
        &self,
        config: &DatabaseConfig,
        tenant: Option<&TenantId>,
    ) -> TenancyResult<Self::Pool>;

    /// Close a pool
    async fn close_pool(&self, pool: &Self::Pool) -> TenancyResult<()>;
}

/// Postgres pool backend
#[derive(Debug, Clone, Default)]
pub struct PgPoolBackend;

#[async_trait]
impl PoolBackend for PgPoolBackend {
    type Pool = PgPool;

    async fn create_pool(
        &self,
        config: &DatabaseConfig,
        tenant: Option<&TenantId>,
    ) -> TenancyResult<PgPool> {
        let application_name = match tenant {
            Some(tenant) => tenant.application_name(),
            None => config.application_name.clone(),
        };

        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.username)
            .password(&config.password)
            .database(&config.database)
            .application_name(&application_name);

        let pool = PgPoolOptions::new()
            .min_connections(config.min_connections)
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .connect_with(options)
            .await?;

        Ok(pool)
    }

    async fn close_pool(&self, pool: &PgPool) -> TenancyResult<()> {
        pool.close().await;
        Ok(())
    }
}

/// Owns one connection pool per tenant plus the default/system pool.
///
/// At most one live pool exists per tenant identifier at any time; pool
/// lifetime equals process lifetime (no eviction).
pub struct PoolRegistry<B, S>
where
    B: PoolBackend,
    S: SchemaProvisioner<Pool = B::Pool>,
{
    backend: B,
    provisioner: S,
    config: DatabaseConfig,
    default_pool: B::Pool,
    tenants: Mutex<HashMap<TenantId, Arc<OnceCell<B::Pool>>>>,
}

impl<B, S> PoolRegistry<B, S>
where
    B: PoolBackend,
    S: SchemaProvisioner<Pool = B::Pool>,
{
    /// Create a registry with an explicit backend and provisioner,
    /// connecting the default pool
    pub async fn new_with(backend: B, provisioner: S, config: DatabaseConfig) -> TenancyResult<Self> {
        let default_pool = backend.create_pool(&config, None).await?;
        Ok(Self {
            backend,
            provisioner,
            config,
            default_pool,
            tenants: Mutex::new(HashMap::new()),
        })
    }

    /// The default/system pool, used for quotas and request logs.
    ///
    /// Never tenant-scoped.
    pub fn default_pool(&self) -> &B::Pool {
        &self.default_pool
    }

    /// Get the tenant's pool, creating and provisioning it on first use.
    ///
    /// Concurrent calls for a not-yet-registered tenant share a single
    /// creation: the per-tenant cell is installed under the registry lock
    /// and every caller awaits the same in-flight initialization. Failed
    /// initialization leaves the cell empty, so nothing is cached and the
    /// next call retries.
    pub async fn get_tenant_pool(&self, tenant: &TenantId) -> TenancyResult<B::Pool> {
        let cell = {
            let mut tenants = self.tenants.lock();
            Arc::clone(
                tenants
                    .entry(tenant.clone())
                    .or_insert_with(|| Arc::new(OnceCell::new())),
            )
        };

        let pool = cell
            .get_or_try_init(|| async {
                info!(tenant = %tenant, "creating tenant connection pool");
                let pool = self.backend.create_pool(&self.config, Some(tenant)).await?;
                if let Err(e) = self.provisioner.ensure_schema(&pool, tenant).await {
                    // Do not register a pool for a tenant whose provisioning
                    // failed.
                    if let Err(close_err) = self.backend.close_pool(&pool).await {
                        warn!(tenant = %tenant, error = %close_err,
                            "failed to close pool after provisioning failure");
                    }
                    return Err(e);
                }
                Ok(pool)
            })
            .await?;

        Ok(pool.clone())
    }

    /// Tenants with a registered (or in-flight) pool
    pub fn registered_tenants(&self) -> Vec<TenantId> {
        self.tenants.lock().keys().cloned().collect()
    }

    /// Close the default pool and every registered tenant pool.
    ///
    /// Used at process shutdown. Individual close failures are logged and
    /// do not abort the remaining closes.
    pub async fn cleanup(&self) {
        let cells: Vec<(TenantId, Arc<OnceCell<B::Pool>>)> =
            self.tenants.lock().drain().collect();

        if let Err(e) = self.backend.close_pool(&self.default_pool).await {
            warn!(error = %e, "failed to close default pool");
        }

        for (tenant, cell) in cells {
            if let Some(pool) = cell.get() {
                if let Err(e) = self.backend.close_pool(pool).await {
                    warn!(tenant = %tenant, error = %e, "failed to close tenant pool");
                }
            }
        }
    }
}

/// Registry wired to Postgres
pub type PgPoolRegistry = PoolRegistry<PgPoolBackend, PgSchemaProvisioner>;

impl PgPoolRegistry {
    /// Connect the default pool and ensure the system-wide tables exist
    pub async fn connect(config: DatabaseConfig) -> TenancyResult<Self> {
        let registry = Self::new_with(PgPoolBackend, PgSchemaProvisioner, config).await?;
        schema::ensure_system_tables(registry.default_pool()).await?;
        Ok(registry)
    }

    /// Run `work` on a connection scoped to the tenant's namespace.
    ///
    /// The connection's `search_path` is set to the tenant schema and its
    /// `statement_timeout` to the tenant's query-timeout limit before `work`
    /// runs. The connection returns to the pool when it drops, on every exit
    /// path: success, business error or panic unwind.
    ///
    /// # Examples
    ///
    /// ```rust,ignore
    /// let page_count: i64 = registry
    ///     .execute_for_tenant(&ctx, |conn| {
    ///         Box::pin(async move {
    ///             let row = sqlx::query("SELECT COUNT(*) AS pages FROM pages")
    ///                 .fetch_one(conn)
    ///                 .await?;
    ///             Ok(row.try_get("pages")?)
    ///         })
    ///     })
    ///     .await?;
    /// ```
    pub async fn execute_for_tenant<T, F>(
        &self,
        ctx: &TenantContext,
        work: F,
    ) -> TenancyResult<T>
    where
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, TenancyResult<T>> + Send,
        T: Send,
    {
        let pool = self.get_tenant_pool(ctx.tenant_id()).await?;
        let mut conn = pool.acquire().await?;

        // Session state set here stays within this tenant's pool; pools are
        // never shared across tenants.
        let schema = ctx.tenant_id().schema_name();
        sqlx::query(&format!("SET search_path TO \"{schema}\""))
            .execute(&mut *conn)
            .await?;

        let timeout_ms = ctx.limits().max_query_timeout_ms;
        if timeout_ms > 0 {
            sqlx::query(&format!("SET statement_timeout = {timeout_ms}"))
                .execute(&mut *conn)
                .await?;
        }

        work(&mut conn).await
    }

    /// Current usage snapshot for the tenant
    pub async fn get_tenant_resource_usage(&self, tenant: &TenantId) -> ResourceUsage {
        PgUsageAccountant::new(self.default_pool().clone())
            .snapshot(tenant)
            .await
    }

    /// Upsert the tenant's resource limits
    pub async fn set_tenant_resource_limits(
        &self,
        tenant: &TenantId,
        limits: &ResourceLimits,
    ) -> TenancyResult<()> {
        PgQuotaStore::new(self.default_pool().clone())
            .set_limits(tenant, limits)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::AdmissionGate;
    use crate::quota::InMemoryQuotaStore;
    use crate::request_log::InMemoryRequestLogStore;
    use crate::resolver::{RequestContext, TenantResolver};
    use crate::tenant::{InMemoryTenantStore, Tenant};
    use crate::usage::InMemoryUsageAccountant;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct MockBackend {
        created: Arc<AtomicUsize>,
        closed: Arc<Mutex<Vec<String>>>,
        fail_close_for: Option<String>,
        create_delay_ms: u64,
    }

    #[async_trait]
    impl PoolBackend for MockBackend {
        type Pool = String;

        async fn create_pool(
            &self,
            _config: &DatabaseConfig,
            tenant: Option<&TenantId>,
        ) -> TenancyResult<String> {
            if self.create_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.create_delay_ms)).await;
            }
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(match tenant {
                Some(tenant) => format!("pool-{tenant}"),
                None => "pool-default".to_string(),
            })
        }

        async fn close_pool(&self, pool: &String) -> TenancyResult<()> {
            self.closed.lock().push(pool.clone());
            if self.fail_close_for.as_deref() == Some(pool.as_str()) {
                return Err(TenancyError::storage("close failed"));
            }
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct MockProvisioner {
        runs: Arc<AtomicUsize>,
        fail_remaining: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SchemaProvisioner for MockProvisioner {
        type Pool = String;

        async fn ensure_schema(&self, _pool: &String, tenant: &TenantId) -> TenancyResult<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self
                .fail_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(TenancyError::Provisioning {
                    tenant: tenant.to_string(),
                    reason: "induced failure".to_string(),
                });
            }
            Ok(())
        }
    }

    async fn registry(
        backend: MockBackend,
        provisioner: MockProvisioner,
    ) -> PoolRegistry<MockBackend, MockProvisioner> {
        PoolRegistry::new_with(backend, provisioner, DatabaseConfig::default())
            .await
            .unwrap()
    }

    fn tenant(id: &str) -> TenantId {
        TenantId::new(id).unwrap()
    }

    #[tokio::test]
    async fn test_pool_created_once_and_reused() {
        let backend = MockBackend::default();
        let provisioner = MockProvisioner::default();
        let registry = registry(backend.clone(), provisioner.clone()).await;
        let acme = tenant("acme");

        let first = registry.get_tenant_pool(&acme).await.unwrap();
        let second = registry.get_tenant_pool(&acme).await.unwrap();

        assert_eq!(first, "pool-acme");
        assert_eq!(first, second);
        // Default pool plus one tenant pool.
        assert_eq!(backend.created.load(Ordering::SeqCst), 2);
        assert_eq!(provisioner.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_first_use_is_single_flight() {
        let backend = MockBackend {
            create_delay_ms: 20,
            ..Default::default()
        };
        let provisioner = MockProvisioner::default();
        let registry = Arc::new(registry(backend.clone(), provisioner.clone()).await);
        let acme = tenant("acme");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            let acme = acme.clone();
            handles.push(tokio::spawn(async move {
                registry.get_tenant_pool(&acme).await.unwrap()
            }));
        }

        let pools: Vec<String> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect();

        assert!(pools.iter().all(|pool| pool == "pool-acme"));
        assert_eq!(backend.created.load(Ordering::SeqCst), 2);
        assert_eq!(provisioner.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_distinct_tenants_get_distinct_pools() {
        let backend = MockBackend::default();
        let registry = registry(backend, MockProvisioner::default()).await;

        let acme = registry.get_tenant_pool(&tenant("acme")).await.unwrap();
        let globex = registry.get_tenant_pool(&tenant("globex")).await.unwrap();

        assert_ne!(acme, globex);
        assert_eq!(registry.registered_tenants().len(), 2);
    }

    #[tokio::test]
    async fn test_provisioning_failure_caches_nothing() {
        let backend = MockBackend::default();
        let provisioner = MockProvisioner::default();
        provisioner.fail_remaining.store(1, Ordering::SeqCst);
        let registry = registry(backend.clone(), provisioner.clone()).await;
        let acme = tenant("acme");

        let err = registry.get_tenant_pool(&acme).await.unwrap_err();
        assert!(matches!(err, TenancyError::Provisioning { .. }));
        // The half-created pool was closed, not registered.
        assert!(backend.closed.lock().contains(&"pool-acme".to_string()));

        // A later call retries and succeeds.
        let pool = registry.get_tenant_pool(&acme).await.unwrap();
        assert_eq!(pool, "pool-acme");
        assert_eq!(provisioner.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_admitted_context_drives_pool_provisioning() {
        let backend = MockBackend::default();
        let provisioner = MockProvisioner::default();
        let registry = registry(backend.clone(), provisioner.clone()).await;

        let acme = tenant("acme");
        let tenants = Arc::new(InMemoryTenantStore::new());
        tenants.insert(Tenant::new(acme.clone(), "Acme"));
        let quotas = Arc::new(InMemoryQuotaStore::new());
        quotas
            .set_limits(&acme, &ResourceLimits::default().with_query_timeout_ms(5_000))
            .await
            .unwrap();

        let gate = AdmissionGate::new(
            TenantResolver::new(),
            tenants,
            quotas,
            Arc::new(InMemoryUsageAccountant::new()),
            Arc::new(InMemoryRequestLogStore::new()),
        );

        let request = RequestContext::new("GET", "/pages").with_header("X-Tenant-ID", "acme");
        let ctx = gate.admit(&request).await.unwrap();
        assert_eq!(ctx.limits().max_query_timeout_ms, 5_000);

        // The admitted context carries the id the registry keys pools by.
        let pool = registry.get_tenant_pool(ctx.tenant_id()).await.unwrap();
        assert_eq!(pool, "pool-acme");
        assert_eq!(provisioner.runs.load(Ordering::SeqCst), 1);
        assert_eq!(registry.registered_tenants(), vec![acme]);
    }

    #[tokio::test]
    async fn test_cleanup_closes_every_pool_despite_failures() {
        let backend = MockBackend {
            fail_close_for: Some("pool-t3".to_string()),
            ..Default::default()
        };
        let registry = registry(backend.clone(), MockProvisioner::default()).await;

        for id in ["t1", "t2", "t3", "t4", "t5"] {
            registry.get_tenant_pool(&tenant(id)).await.unwrap();
        }

        registry.cleanup().await;

        let closed = backend.closed.lock();
        assert_eq!(closed.len(), 6);
        assert!(closed.contains(&"pool-default".to_string()));
        for id in ["t1", "t2", "t3", "t4", "t5"] {
            assert!(closed.contains(&format!("pool-{id}")));
        }
        assert!(registry.registered_tenants().is_empty());
    }
}
