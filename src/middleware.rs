//! Admission control.
//!
//! Orchestrates tenant resolution, access validation and quota evaluation
//! before a request proceeds, and records usage metrics after it completes.
//! Per request the gate moves through resolve → validate → check-limits,
//! short-circuiting to a specific rejection at any step.

use crate::error::{QuotaDimension, TenancyError, TenancyResult};
use crate::quota::{QuotaStore, ResourceLimits};
use crate::request_log::{RequestLogEntry, RequestLogStore};
use crate::resolver::{RequestContext, TenantResolver};
use crate::tenant::{TenantContext, TenantId, TenantStore};
use crate::usage::UsageAccountant;
use std::sync::Arc;
use tracing::{debug, warn};

/// Tenant-context middleware.
///
/// The HTTP collaborator calls [`AdmissionGate::admit`] before the handler
/// runs and [`AdmissionGate::record_request`] after the response is sent.
pub struct AdmissionGate {
    resolver: TenantResolver,
    tenants: Arc<dyn TenantStore>,
    quotas: Arc<dyn QuotaStore>,
    usage: Arc<dyn UsageAccountant>,
    request_log: Arc<dyn RequestLogStore>,
}

impl AdmissionGate {
    /// Create a gate over the given stores
    pub fn new(
        resolver: TenantResolver,
        tenants: Arc<dyn TenantStore>,
        quotas: Arc<dyn QuotaStore>,
        usage: Arc<dyn UsageAccountant>,
        request_log: Arc<dyn RequestLogStore>,
    ) -> Self {
        Self {
            resolver,
            tenants,
            quotas,
            usage,
            request_log,
        }
    }

    /// Decide whether the request may proceed.
    ///
    /// Returns the request-scoped [`TenantContext`] on admission, or the
    /// specific rejection: missing-tenant (400), forbidden-tenant (403) or
    /// quota-exceeded naming the dimension (429).
    pub async fn admit(&self, request: &RequestContext) -> TenancyResult<TenantContext> {
        // RESOLVE
        let candidate = self
            .resolver
            .resolve(request)
            .ok_or(TenancyError::MissingTenant)?;
        let tenant_id = TenantId::new(&candidate)?;

        // VALIDATE
        let tenant = self
            .tenants
            .find_by_id(&tenant_id)
            .await?
            .ok_or_else(|| TenancyError::Forbidden(tenant_id.to_string()))?;

        match &request.principal {
            Some(principal) => {
                let permitted = principal.cross_tenant_admin
                    || principal.organization_id.as_deref() == Some(tenant_id.as_str());
                if !permitted {
                    debug!(tenant = %tenant_id, user = %principal.user_id,
                        "principal organization mismatch");
                    return Err(TenancyError::Forbidden(tenant_id.to_string()));
                }
            }
            None => {
                if !tenant.active {
                    debug!(tenant = %tenant_id, "tenant is not active");
                    return Err(TenancyError::Forbidden(tenant_id.to_string()));
                }
            }
        }

        // CHECK_LIMITS
        let limits = match self.quotas.get_limits(&tenant_id).await {
            Ok(limits) => limits,
            Err(e) => {
                // Quota reads follow the same fail-open policy as usage
                // measurements: defaults apply rather than blocking traffic.
                warn!(tenant = %tenant_id, error = %e, "quota lookup failed, using defaults");
                ResourceLimits::default()
            }
        };
        self.check_limits(&tenant_id, &limits).await?;

        debug!(tenant = %tenant_id, "request admitted");
        Ok(TenantContext::new(tenant, limits))
    }

    /// Evaluate current usage against the tenant's limits.
    ///
    /// Dimensions are checked in order (storage, request rate, connections)
    /// and the first one exceeded produces the rejection. A measurement error
    /// on a dimension is treated as within limits (fail-open) and logged,
    /// never surfaced to the caller.
    pub async fn check_limits(
        &self,
        tenant: &TenantId,
        limits: &ResourceLimits,
    ) -> TenancyResult<()> {
        match self.usage.storage_gb(tenant).await {
            Ok(storage_gb) if storage_gb > limits.max_storage_gb => {
                return Err(TenancyError::QuotaExceeded {
                    tenant: tenant.to_string(),
                    dimension: QuotaDimension::Storage,
                });
            }
            Ok(_) => {}
            Err(e) => {
                warn!(tenant = %tenant, error = %e, "storage measurement failed, allowing");
            }
        }

        match self.usage.requests_last_minute(tenant).await {
            // The admitted request itself counts toward the window.
            Ok(requests) if requests + 1 > limits.max_requests_per_minute => {
                return Err(TenancyError::QuotaExceeded {
                    tenant: tenant.to_string(),
                    dimension: QuotaDimension::RequestRate,
                });
            }
            Ok(_) => {}
            Err(e) => {
                warn!(tenant = %tenant, error = %e, "request rate measurement failed, allowing");
            }
        }

        match self.usage.active_connections(tenant).await {
            Ok(connections) if connections + 1 > limits.max_concurrent_connections => {
                return Err(TenancyError::QuotaExceeded {
                    tenant: tenant.to_string(),
                    dimension: QuotaDimension::Connections,
                });
            }
            Ok(_) => {}
            Err(e) => {
                warn!(tenant = %tenant, error = %e, "connection count failed, allowing");
            }
        }

        Ok(())
    }

    /// Record usage metrics for a completed request.
    ///
    /// Fire-and-forget: the write happens on a spawned task and its failure
    /// is logged and discarded; it never affects the completed request.
    pub fn record_request(&self, entry: RequestLogEntry) {
        let request_log = Arc::clone(&self.request_log);
        tokio::spawn(async move {
            if let Err(e) = request_log.append(&entry).await {
                warn!(tenant = %entry.tenant_id, error = %e, "failed to record request metrics");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::InMemoryQuotaStore;
    use crate::request_log::InMemoryRequestLogStore;
    use crate::resolver::Principal;
    use crate::tenant::{InMemoryTenantStore, Tenant};
    use crate::usage::InMemoryUsageAccountant;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio_test::assert_ok;

    struct Fixture {
        gate: AdmissionGate,
        tenants: Arc<InMemoryTenantStore>,
        quotas: Arc<InMemoryQuotaStore>,
        usage: Arc<InMemoryUsageAccountant>,
        log: Arc<InMemoryRequestLogStore>,
    }

    fn fixture() -> Fixture {
        let tenants = Arc::new(InMemoryTenantStore::new());
        let quotas = Arc::new(InMemoryQuotaStore::new());
        let log = Arc::new(InMemoryRequestLogStore::new());
        let usage = Arc::new(InMemoryUsageAccountant::new().with_request_log(Arc::clone(&log)));

        let gate = AdmissionGate::new(
            TenantResolver::new().with_base_domain("pagecraft.io"),
            Arc::clone(&tenants) as Arc<dyn TenantStore>,
            Arc::clone(&quotas) as Arc<dyn QuotaStore>,
            Arc::clone(&usage) as Arc<dyn UsageAccountant>,
            Arc::clone(&log) as Arc<dyn RequestLogStore>,
        );

        Fixture {
            gate,
            tenants,
            quotas,
            usage,
            log,
        }
    }

    fn tenant(id: &str) -> TenantId {
        TenantId::new(id).unwrap()
    }

    fn acme_request() -> RequestContext {
        RequestContext::new("GET", "/pages").with_header("X-Tenant-ID", "acme")
    }

    #[tokio::test]
    async fn test_missing_tenant_is_rejected() {
        let fx = fixture();
        let err = fx
            .gate
            .admit(&RequestContext::new("GET", "/pages"))
            .await
            .unwrap_err();

        assert!(matches!(err, TenancyError::MissingTenant));
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn test_unknown_tenant_is_forbidden() {
        let fx = fixture();
        let err = fx.gate.admit(&acme_request()).await.unwrap_err();

        assert!(matches!(err, TenancyError::Forbidden(_)));
        assert_eq!(err.status_code(), 403);
    }

    #[tokio::test]
    async fn test_inactive_tenant_is_forbidden_without_principal() {
        let fx = fixture();
        fx.tenants
            .insert(Tenant::new(tenant("acme"), "Acme").with_active(false));

        let err = fx.gate.admit(&acme_request()).await.unwrap_err();
        assert!(matches!(err, TenancyError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_principal_must_match_organization() {
        let fx = fixture();
        fx.tenants.insert(Tenant::new(tenant("acme"), "Acme"));

        let outsider = acme_request().with_principal(Principal::new("u-1", "globex"));
        let err = fx.gate.admit(&outsider).await.unwrap_err();
        assert!(matches!(err, TenancyError::Forbidden(_)));

        let member = acme_request().with_principal(Principal::new("u-2", "acme"));
        assert_ok!(fx.gate.admit(&member).await);
    }

    #[tokio::test]
    async fn test_cross_tenant_admin_bypasses_organization_check() {
        let fx = fixture();
        fx.tenants.insert(Tenant::new(tenant("acme"), "Acme"));

        let admin = acme_request()
            .with_principal(Principal::new("u-ops", "globex").with_cross_tenant_admin(true));
        assert_ok!(fx.gate.admit(&admin).await);
    }

    #[tokio::test]
    async fn test_admitted_context_carries_default_limits() {
        let fx = fixture();
        fx.tenants.insert(Tenant::new(tenant("acme"), "Acme"));

        let ctx = fx.gate.admit(&acme_request()).await.unwrap();
        assert_eq!(ctx.tenant_id().as_str(), "acme");
        assert_eq!(ctx.limits().max_storage_gb, 100.0);
        assert_eq!(ctx.limits().max_requests_per_minute, 1000);
        assert_eq!(ctx.limits().max_concurrent_connections, 100);
        assert_eq!(ctx.limits().max_query_timeout_ms, 30_000);
    }

    #[tokio::test]
    async fn test_storage_over_limit_is_rejected_first() {
        let fx = fixture();
        let acme = tenant("acme");
        fx.tenants.insert(Tenant::new(acme.clone(), "Acme"));
        fx.quotas
            .set_limits(&acme, &ResourceLimits::default().with_storage_gb(1.0))
            .await
            .unwrap();
        fx.usage.set_storage_gb(&acme, 1.5);
        // Also saturate connections; storage must be the reported dimension.
        fx.usage.set_connections(&acme, 1000);

        let err = fx.gate.admit(&acme_request()).await.unwrap_err();
        assert!(matches!(
            err,
            TenancyError::QuotaExceeded {
                dimension: QuotaDimension::Storage,
                ..
            }
        ));
        assert_eq!(err.status_code(), 429);
    }

    #[tokio::test]
    async fn test_connection_ceiling_is_enforced() {
        let fx = fixture();
        let acme = tenant("acme");
        fx.tenants.insert(Tenant::new(acme.clone(), "Acme"));
        fx.quotas
            .set_limits(
                &acme,
                &ResourceLimits::default().with_concurrent_connections(10),
            )
            .await
            .unwrap();

        fx.usage.set_connections(&acme, 9);
        assert_ok!(fx.gate.admit(&acme_request()).await);

        fx.usage.set_connections(&acme, 10);
        let err = fx.gate.admit(&acme_request()).await.unwrap_err();
        assert!(matches!(
            err,
            TenancyError::QuotaExceeded {
                dimension: QuotaDimension::Connections,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_rate_window_admits_then_rejects() {
        let fx = fixture();
        let acme = tenant("acme");
        fx.tenants.insert(Tenant::new(acme.clone(), "Acme"));
        fx.quotas
            .set_limits(&acme, &ResourceLimits::default().with_requests_per_minute(60))
            .await
            .unwrap();

        // First request against a fresh tenant is admitted.
        assert_ok!(fx.gate.admit(&acme_request()).await);

        // 60 requests recorded within the window; the 61st is rejected.
        for _ in 0..60 {
            fx.log
                .append(&RequestLogEntry::new(acme.clone(), "GET", "/pages").with_status(200))
                .await
                .unwrap();
        }
        let err = fx.gate.admit(&acme_request()).await.unwrap_err();
        assert!(matches!(
            err,
            TenancyError::QuotaExceeded {
                dimension: QuotaDimension::RequestRate,
                ..
            }
        ));
        assert_eq!(err.status_code(), 429);
    }

    #[tokio::test]
    async fn test_rate_at_limit_minus_one_is_admitted() {
        let fx = fixture();
        let acme = tenant("acme");
        fx.tenants.insert(Tenant::new(acme.clone(), "Acme"));
        fx.quotas
            .set_limits(&acme, &ResourceLimits::default().with_requests_per_minute(60))
            .await
            .unwrap();

        for _ in 0..59 {
            fx.log
                .append(&RequestLogEntry::new(acme.clone(), "GET", "/pages"))
                .await
                .unwrap();
        }
        assert_ok!(fx.gate.admit(&acme_request()).await);
    }

    struct FlakyAccountant;

    #[async_trait]
    impl UsageAccountant for FlakyAccountant {
        async fn storage_gb(&self, _tenant: &TenantId) -> TenancyResult<f64> {
            Err(TenancyError::storage("connection refused"))
        }

        async fn active_connections(&self, _tenant: &TenantId) -> TenancyResult<i64> {
            Err(TenancyError::storage("connection refused"))
        }

        async fn requests_last_minute(&self, _tenant: &TenantId) -> TenancyResult<i64> {
            Err(TenancyError::storage("connection refused"))
        }
    }

    #[tokio::test]
    async fn test_measurement_failures_fail_open() {
        let tenants = Arc::new(InMemoryTenantStore::new());
        tenants.insert(Tenant::new(tenant("acme"), "Acme"));
        let gate = AdmissionGate::new(
            TenantResolver::new(),
            tenants,
            Arc::new(InMemoryQuotaStore::new()),
            Arc::new(FlakyAccountant),
            Arc::new(InMemoryRequestLogStore::new()),
        );

        // Every measurement errors; the request is still admitted.
        assert_ok!(gate.admit(&acme_request()).await);
    }

    #[tokio::test]
    async fn test_record_request_is_fire_and_forget() {
        let fx = fixture();
        let acme = tenant("acme");

        fx.gate.record_request(
            RequestLogEntry::new(acme, "GET", "/pages")
                .with_status(200)
                .with_duration_ms(12)
                .with_content_length(512),
        );

        // The write happens on a spawned task; give it a moment.
        for _ in 0..50 {
            if !fx.log.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(fx.log.len(), 1);
    }
}
