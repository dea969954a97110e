//! Tenant resolution.
//!
//! Derives one tenant identifier from an inbound request, trying candidate
//! sources in a fixed priority order and stopping at the first non-empty
//! match. Resolution never falls back to a default tenant; "no tenant" is
//! always a caller-visible outcome.

use std::collections::HashMap;

/// Authenticated principal attached to a request by the auth collaborator
#[derive(Debug, Clone)]
pub struct Principal {
    /// User identifier
    pub user_id: String,
    /// Organization the principal belongs to
    pub organization_id: Option<String>,
    /// Cross-tenant administrative capability
    pub cross_tenant_admin: bool,
}

impl Principal {
    /// Create a principal for a user in an organization
    pub fn new(user_id: impl Into<String>, organization_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            organization_id: Some(organization_id.into()),
            cross_tenant_admin: false,
        }
    }

    /// Grant the cross-tenant administrative capability
    pub fn with_cross_tenant_admin(mut self, admin: bool) -> Self {
        self.cross_tenant_admin = admin;
        self
    }
}

/// The slice of an inbound request this layer needs.
///
/// The HTTP collaborator builds one of these per request; header names are
/// stored lowercased.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Request method
    pub method: String,
    /// Request path
    pub path: String,
    /// Request host, if known
    pub host: Option<String>,
    headers: HashMap<String, String>,
    query: HashMap<String, String>,
    /// Authenticated principal, if any
    pub principal: Option<Principal>,
}

impl RequestContext {
    /// Create a request context
    ///
    /// # Examples
    ///
    /// ```
    /// use pagecraft_tenancy::RequestContext;
    ///
    /// let ctx = RequestContext::new("GET", "/pages")
    ///     .with_header("X-Tenant-ID", "acme");
    /// assert_eq!(ctx.header("x-tenant-id"), Some("acme"));
    /// ```
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Self::default()
        }
    }

    /// Set the request host
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Add a header (name is lowercased)
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into().to_lowercase(), value.into());
        self
    }

    /// Add a query parameter
    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    /// Attach an authenticated principal
    pub fn with_principal(mut self, principal: Principal) -> Self {
        self.principal = Some(principal);
        self
    }

    /// Header value by (case-insensitive) name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }

    /// Query parameter value by name
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }
}

/// Resolves the tenant identifier from a request.
///
/// Sources, in priority order:
/// 1. non-"www" subdomain of the request host (requires a base domain)
/// 2. the tenant header (default `X-Tenant-ID`)
/// 3. the query parameter (default `tenant`)
/// 4. the authenticated principal's organization
#[derive(Debug, Clone)]
pub struct TenantResolver {
    header_name: String,
    query_param: String,
    base_domain: Option<String>,
}

impl Default for TenantResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl TenantResolver {
    /// Create a resolver with the default header and query parameter names
    pub fn new() -> Self {
        Self {
            header_name: "x-tenant-id".to_string(),
            query_param: "tenant".to_string(),
            base_domain: None,
        }
    }

    /// Enable subdomain resolution against a base domain
    ///
    /// # Examples
    ///
    /// ```
    /// use pagecraft_tenancy::{RequestContext, TenantResolver};
    ///
    /// let resolver = TenantResolver::new().with_base_domain("pagecraft.io");
    /// let ctx = RequestContext::new("GET", "/").with_host("acme.pagecraft.io:8080");
    /// assert_eq!(resolver.resolve(&ctx), Some("acme".to_string()));
    /// ```
    pub fn with_base_domain(mut self, base_domain: impl Into<String>) -> Self {
        self.base_domain = Some(base_domain.into());
        self
    }

    /// Override the tenant header name
    pub fn with_header_name(mut self, name: impl Into<String>) -> Self {
        self.header_name = name.into().to_lowercase();
        self
    }

    /// Override the query parameter name
    pub fn with_query_param(mut self, name: impl Into<String>) -> Self {
        self.query_param = name.into();
        self
    }

    /// Extract the tenant identifier, or `None` when no source matches
    pub fn resolve(&self, request: &RequestContext) -> Option<String> {
        self.from_subdomain(request)
            .or_else(|| self.from_header(request))
            .or_else(|| self.from_query(request))
            .or_else(|| self.from_principal(request))
    }

    fn from_subdomain(&self, request: &RequestContext) -> Option<String> {
        let base = self.base_domain.as_deref()?;
        let host = request.host.as_deref()?;
        // Strip port if present
        let host = host.split(':').next().unwrap_or(host);

        let subdomain = host.strip_suffix(base)?.strip_suffix('.')?;
        if subdomain.is_empty() || subdomain.contains('.') || subdomain == "www" {
            return None;
        }
        Some(subdomain.to_string())
    }

    fn from_header(&self, request: &RequestContext) -> Option<String> {
        non_empty(request.header(&self.header_name))
    }

    fn from_query(&self, request: &RequestContext) -> Option<String> {
        non_empty(request.query_param(&self.query_param))
    }

    fn from_principal(&self, request: &RequestContext) -> Option<String> {
        non_empty(
            request
                .principal
                .as_ref()
                .and_then(|p| p.organization_id.as_deref()),
        )
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
