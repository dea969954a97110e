//! Error types for the tenancy layer.
//!
//! The variants here are deliberate admission decisions or genuine failures;
//! transient measurement errors are *not* represented because they are caught
//! where they occur and treated as fail-open (see [`crate::usage`]).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for tenancy operations
pub type TenancyResult<T> = Result<T, TenancyError>;

/// Quota dimension that was exceeded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaDimension {
    /// On-disk storage across the tenant's tables
    Storage,
    /// Requests in the trailing 60-second window
    RequestRate,
    /// Currently open database connections
    Connections,
}

impl std::fmt::Display for QuotaDimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Storage => write!(f, "storage"),
            Self::RequestRate => write!(f, "request_rate"),
            Self::Connections => write!(f, "connections"),
        }
    }
}

/// Tenancy layer errors
#[derive(Debug, Error)]
pub enum TenancyError {
    /// No tenant could be determined from the request.
    ///
    /// Never silently defaulted to a fallback tenant.
    #[error("no tenant could be resolved from the request")]
    MissingTenant,

    /// A tenant identifier was present but malformed
    #[error("invalid tenant identifier: {0}")]
    InvalidTenant(String),

    /// Tenant exists but the caller lacks rights, or the tenant is not active
    #[error("access to tenant '{0}' is forbidden")]
    Forbidden(String),

    /// A resource quota was exceeded; carries the specific dimension
    #[error("quota exceeded for tenant '{tenant}': {dimension}")]
    QuotaExceeded {
        /// Tenant that hit the limit
        tenant: String,
        /// Which limit was hit
        dimension: QuotaDimension,
    },

    /// Schema setup failed; fatal to the triggering request.
    ///
    /// The pool registry never caches a pool for a tenant whose
    /// provisioning failed.
    #[error("schema provisioning failed for tenant '{tenant}': {reason}")]
    Provisioning {
        /// Tenant being provisioned
        tenant: String,
        /// Underlying failure
        reason: String,
    },

    /// Underlying database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Store error (in-memory or other non-SQL backends)
    #[error("storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl TenancyError {
    /// HTTP status the HTTP-facing collaborator should apply for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Self::MissingTenant | Self::InvalidTenant(_) => 400,
            Self::Forbidden(_) => 403,
            Self::QuotaExceeded { .. } => 429,
            Self::Provisioning { .. }
            | Self::Database(_)
            | Self::Storage(_)
            | Self::Configuration(_) => 500,
        }
    }

    /// Create a new storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
}
