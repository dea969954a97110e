//! Configuration for the tenancy layer.
//!
//! Database coordinates, pool sizing and the default quota values are all
//! overridable through `PAGECRAFT_*` environment variables; everything has a
//! sane default so tests and local development need no environment at all.

use crate::error::{TenancyError, TenancyResult};
use crate::quota::ResourceLimits;
use std::time::Duration;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> TenancyResult<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| TenancyError::config(format!("invalid value for {key}: {raw}"))),
        Err(_) => Ok(default),
    }
}

/// Database and pool configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Database host
    pub host: String,
    /// Database port
    pub port: u16,
    /// Database user
    pub username: String,
    /// Database password
    pub password: String,
    /// Database name
    pub database: String,
    /// Minimum connections kept open per pool
    pub min_connections: u32,
    /// Connection ceiling per pool
    pub max_connections: u32,
    /// How long to wait for a connection from the pool
    pub acquire_timeout: Duration,
    /// How long an idle connection may linger before being closed
    pub idle_timeout: Duration,
    /// `application_name` tag for the default/system pool.
    ///
    /// Tenant pools derive their own tag from the tenant id.
    pub application_name: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            username: "pagecraft".to_string(),
            password: String::new(),
            database: "pagecraft".to_string(),
            min_connections: 1,
            max_connections: 10,
            acquire_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
            application_name: "pagecraft_system".to_string(),
        }
    }
}

impl DatabaseConfig {
    /// Load configuration from `PAGECRAFT_DB_*` environment variables,
    /// falling back to defaults for anything unset
    pub fn from_env() -> TenancyResult<Self> {
        let defaults = Self::default();
        Ok(Self {
            host: env_or("PAGECRAFT_DB_HOST", &defaults.host),
            port: env_parse("PAGECRAFT_DB_PORT", defaults.port)?,
            username: env_or("PAGECRAFT_DB_USER", &defaults.username),
            password: env_or("PAGECRAFT_DB_PASSWORD", &defaults.password),
            database: env_or("PAGECRAFT_DB_NAME", &defaults.database),
            min_connections: env_parse("PAGECRAFT_DB_MIN_CONNECTIONS", defaults.min_connections)?,
            max_connections: env_parse("PAGECRAFT_DB_MAX_CONNECTIONS", defaults.max_connections)?,
            acquire_timeout: Duration::from_secs(env_parse(
                "PAGECRAFT_DB_ACQUIRE_TIMEOUT_SECS",
                defaults.acquire_timeout.as_secs(),
            )?),
            idle_timeout: Duration::from_secs(env_parse(
                "PAGECRAFT_DB_IDLE_TIMEOUT_SECS",
                defaults.idle_timeout.as_secs(),
            )?),
            application_name: env_or("PAGECRAFT_DB_APPLICATION_NAME", &defaults.application_name),
        })
    }

    /// Set database host
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set database credentials
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// Set database name
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// Set pool connection bounds
    pub fn with_pool_size(mut self, min: u32, max: u32) -> Self {
        self.min_connections = min;
        self.max_connections = max;
        self
    }
}

/// Default quota values applied to tenants without an explicit quota row
#[derive(Debug, Clone)]
pub struct QuotaDefaults {
    /// Default storage ceiling in GB
    pub max_storage_gb: f64,
    /// Default requests per trailing minute
    pub max_requests_per_minute: i64,
    /// Default concurrent connection ceiling
    pub max_concurrent_connections: i64,
    /// Default query timeout in milliseconds
    pub max_query_timeout_ms: i64,
}

impl Default for QuotaDefaults {
    fn default() -> Self {
        let limits = ResourceLimits::default();
        Self {
            max_storage_gb: limits.max_storage_gb,
            max_requests_per_minute: limits.max_requests_per_minute,
            max_concurrent_connections: limits.max_concurrent_connections,
            max_query_timeout_ms: limits.max_query_timeout_ms,
        }
    }
}

impl QuotaDefaults {
    /// Load defaults from `PAGECRAFT_QUOTA_*` environment variables
    pub fn from_env() -> TenancyResult<Self> {
        let defaults = Self::default();
        Ok(Self {
            max_storage_gb: env_parse("PAGECRAFT_QUOTA_STORAGE_GB", defaults.max_storage_gb)?,
            max_requests_per_minute: env_parse(
                "PAGECRAFT_QUOTA_REQUESTS_PER_MINUTE",
                defaults.max_requests_per_minute,
            )?,
            max_concurrent_connections: env_parse(
                "PAGECRAFT_QUOTA_CONCURRENT_CONNECTIONS",
                defaults.max_concurrent_connections,
            )?,
            max_query_timeout_ms: env_parse(
                "PAGECRAFT_QUOTA_QUERY_TIMEOUT_MS",
                defaults.max_query_timeout_ms,
            )?,
        })
    }

    /// The limits these defaults describe
    pub fn limits(&self) -> ResourceLimits {
        ResourceLimits {
            max_storage_gb: self.max_storage_gb,
            max_requests_per_minute: self.max_requests_per_minute,
            max_concurrent_connections: self.max_concurrent_connections,
            max_query_timeout_ms: self.max_query_timeout_ms,
        }
    }
}
