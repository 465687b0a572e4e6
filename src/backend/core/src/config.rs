//! Configuration management.
//!
//! Values come from an optional file (any format the `config` crate reads)
//! overlaid with `SCOPEGATE__SECTION__KEY` environment variables.

use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

use crate::error::{GateError, Result};
use crate::proxy::QueryDialect;

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Token verification
    #[serde(default)]
    pub auth: AuthConfig,

    /// Tenant-enforcing proxy backends
    #[serde(default)]
    pub proxy: ProxyConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// HTTP server host
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Origins allowed by CORS; empty allows any origin
    #[serde(default)]
    pub cors_allowed_origins: Vec<String>,

    /// How long in-flight requests get to finish on shutdown
    #[serde(default = "default_shutdown_grace", with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_allowed_origins: Vec::new(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// How long to wait for a pooled connection
    #[serde(default = "default_acquire_timeout", with = "humantime_serde")]
    pub acquire_timeout: Duration,

    /// Apply embedded migrations at startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// OpenTelemetry OTLP endpoint
    pub otlp_endpoint: Option<String>,

    /// Service name reported to the trace backend
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Log filter, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_true")]
    pub json_logging: bool,

    /// Serve Prometheus metrics at `/metrics`
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            otlp_endpoint: None,
            service_name: default_service_name(),
            log_level: default_log_level(),
            json_logging: true,
            metrics_enabled: true,
        }
    }
}

/// Which identity verifier the server installs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VerifierKind {
    #[default]
    Jwt,
    Static,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub verifier: VerifierKind,

    #[serde(default)]
    pub jwt: JwtSettings,

    /// Token table for the static verifier
    #[serde(default)]
    pub static_tokens: Vec<StaticTokenEntry>,

    /// Confirm the user record and transfer pending invitations on login
    #[serde(default = "default_true")]
    pub reconcile_logins: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            verifier: VerifierKind::default(),
            jwt: JwtSettings::default(),
            static_tokens: Vec::new(),
            reconcile_logins: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtSettings {
    /// "HS256" or "RS256"
    #[serde(default = "default_jwt_algorithm")]
    pub algorithm: String,

    /// Shared secret for HS256
    pub secret: Option<String>,

    /// PEM-encoded public key for RS256
    pub public_key_pem: Option<String>,

    pub issuer: Option<String>,

    pub audience: Option<String>,

    /// Clock skew tolerance in seconds
    #[serde(default = "default_leeway")]
    pub leeway_secs: u64,
}

impl Default for JwtSettings {
    fn default() -> Self {
        Self {
            algorithm: default_jwt_algorithm(),
            secret: None,
            public_key_pem: None,
            issuer: None,
            audience: None,
            leeway_secs: default_leeway(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaticTokenEntry {
    pub token: String,
    pub user_id: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Upper bound on the permission check of one proxied request
    #[serde(default = "default_authz_timeout", with = "humantime_serde")]
    pub authz_timeout: Duration,

    /// Upper bound on one upstream round trip
    #[serde(default = "default_upstream_timeout", with = "humantime_serde")]
    pub upstream_timeout: Duration,

    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            authz_timeout: default_authz_timeout(),
            upstream_timeout: default_upstream_timeout(),
            backends: Vec::new(),
        }
    }
}

/// One proxied observability backend.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Label used in logs and metrics
    pub name: String,

    /// Query language spoken by the backend
    pub kind: QueryDialect,

    /// Public mount point, e.g. `/logs`
    pub route_prefix: String,

    /// Base URL of the backend
    pub upstream_url: String,

    /// Backend endpoint prefix; the dialect default when unset
    pub native_prefix: Option<String>,

    /// Tenant header name; the dialect default when unset
    pub tenant_header: Option<String>,
}

impl BackendConfig {
    pub fn native_prefix(&self) -> &str {
        self.native_prefix
            .as_deref()
            .unwrap_or(self.kind.spec().native_prefix)
    }

    pub fn tenant_header(&self) -> &str {
        self.tenant_header
            .as_deref()
            .unwrap_or(self.kind.spec().tenant_header)
    }
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_shutdown_grace() -> Duration { Duration::from_secs(10) }
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 2 }
fn default_acquire_timeout() -> Duration { Duration::from_secs(5) }
fn default_service_name() -> String { "scopegate".to_string() }
fn default_log_level() -> String { "info".to_string() }
fn default_jwt_algorithm() -> String { "HS256".to_string() }
fn default_leeway() -> u64 { 30 }
fn default_authz_timeout() -> Duration { Duration::from_secs(2) }
fn default_upstream_timeout() -> Duration { Duration::from_secs(30) }
fn default_true() -> bool { true }

impl Config {
    /// Load configuration from an optional file plus the environment.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        let config = builder
            .add_source(config::Environment::with_prefix("SCOPEGATE").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject combinations that would fail at request time.
    pub fn validate(&self) -> Result<()> {
        match self.auth.verifier {
            VerifierKind::Jwt => {
                let jwt = &self.auth.jwt;
                match jwt.algorithm.as_str() {
                    "HS256" if jwt.secret.is_none() => {
                        return Err(GateError::configuration(
                            "auth.jwt.secret is required for HS256",
                        ))
                    }
                    "RS256" if jwt.public_key_pem.is_none() => {
                        return Err(GateError::configuration(
                            "auth.jwt.public_key_pem is required for RS256",
                        ))
                    }
                    "HS256" | "RS256" => {}
                    other => {
                        return Err(GateError::configuration(format!(
                            "Unsupported JWT algorithm: {}",
                            other
                        )))
                    }
                }
            }
            VerifierKind::Static => {
                if self.auth.static_tokens.is_empty() {
                    return Err(GateError::configuration(
                        "auth.static_tokens must not be empty for the static verifier",
                    ));
                }
            }
        }

        let mut prefixes = HashSet::new();
        for backend in &self.proxy.backends {
            let prefix = backend.route_prefix.trim_end_matches('/');
            if !prefix.starts_with('/') || prefix.len() < 2 {
                return Err(GateError::configuration(format!(
                    "Backend '{}': route_prefix must start with '/' and name a path",
                    backend.name
                )));
            }
            if prefix.starts_with("/api") || prefix == "/health" || prefix == "/metrics" {
                return Err(GateError::configuration(format!(
                    "Backend '{}': route_prefix {} collides with a built-in route",
                    backend.name, prefix
                )));
            }
            if !prefixes.insert(prefix.to_string()) {
                return Err(GateError::configuration(format!(
                    "Duplicate proxy route_prefix: {}",
                    prefix
                )));
            }
            if reqwest::Url::parse(&backend.upstream_url).is_err() {
                return Err(GateError::configuration(format!(
                    "Backend '{}': invalid upstream_url {}",
                    backend.name, backend.upstream_url
                )));
            }
        }

        Ok(())
    }
}
