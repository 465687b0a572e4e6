//! Error handling for ScopeGate.
//!
//! Every fallible operation in the crate returns [`GateError`], which carries:
//! - a stable, machine-readable [`ErrorCode`]
//! - a user-safe message (what clients see)
//! - an optional internal message (logged, never serialized)
//! - structured [`ErrorDetails`] and an optional source error
//!
//! The code drives the HTTP status, the log level and whether a caller may
//! retry. Authorization failures are deliberately terse on the wire; input
//! validation failures are specific.
//!
//! # Usage
//!
//! ```rust,ignore
//! use scopegate_core::error::{GateError, Result};
//!
//! fn lookup(id: &str) -> Result<()> {
//!     Err(GateError::not_found("project", id))
//! }
//! ```

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for ScopeGate operations.
pub type Result<T> = std::result::Result<T, GateError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes for API responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Authorization (1000-1099)
    PermissionDenied,
    Unauthorized,
    InvalidToken,
    TokenExpired,

    // Identity and roles (1100-1199)
    InvalidIdentity,
    RoleNotFound,

    // Records (2000-2099)
    NotFound,
    DuplicateRecord,

    // Data store (2100-2199)
    StoreUnavailable,
    DatabaseError,

    // Upstream backends (3000-3099)
    UpstreamUnavailable,
    UpstreamTimeout,

    // Validation (4100-4199)
    ValidationError,
    InvalidFormat,

    // Operation lifecycle (5000-5099)
    Cancelled,
    Timeout,

    // Configuration (6000-6099)
    ConfigurationError,

    // Internal (9000-9099)
    SerializationError,
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::PermissionDenied => 1000,
            Self::Unauthorized => 1001,
            Self::InvalidToken => 1002,
            Self::TokenExpired => 1003,

            Self::InvalidIdentity => 1100,
            Self::RoleNotFound => 1101,

            Self::NotFound => 2000,
            Self::DuplicateRecord => 2001,

            Self::StoreUnavailable => 2100,
            Self::DatabaseError => 2101,

            Self::UpstreamUnavailable => 3000,
            Self::UpstreamTimeout => 3001,

            Self::ValidationError => 4100,
            Self::InvalidFormat => 4101,

            Self::Cancelled => 5000,
            Self::Timeout => 5001,

            Self::ConfigurationError => 6000,

            Self::SerializationError => 9001,
            Self::InternalError => 9000,
        }
    }

    /// Get the HTTP status code for this error.
    pub const fn http_status(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::DuplicateRecord => StatusCode::CONFLICT,

            Self::PermissionDenied => StatusCode::FORBIDDEN,
            Self::Unauthorized | Self::InvalidToken | Self::TokenExpired => {
                StatusCode::UNAUTHORIZED
            }

            Self::InvalidIdentity | Self::RoleNotFound | Self::ValidationError => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Self::InvalidFormat => StatusCode::BAD_REQUEST,

            Self::StoreUnavailable | Self::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout | Self::Timeout => StatusCode::GATEWAY_TIMEOUT,

            Self::DatabaseError
            | Self::ConfigurationError
            | Self::SerializationError
            | Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this error is retryable.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable
                | Self::UpstreamUnavailable
                | Self::UpstreamTimeout
                | Self::Timeout
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "authorization",
            1100..=1199 => "identity",
            2000..=2099 => "record",
            2100..=2199 => "store",
            3000..=3099 => "upstream",
            4100..=4199 => "validation",
            5000..=5099 => "operation",
            6000..=6099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Caller errors (bad input, denied access)
    Low,
    /// Operational issues (timeouts, cancellation, upstream hiccups)
    Medium,
    /// System errors (query failures, misconfiguration)
    High,
    /// Loss of the data store or an internal bug
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::PermissionDenied
            | ErrorCode::Unauthorized
            | ErrorCode::InvalidToken
            | ErrorCode::TokenExpired
            | ErrorCode::InvalidIdentity
            | ErrorCode::RoleNotFound
            | ErrorCode::NotFound
            | ErrorCode::DuplicateRecord
            | ErrorCode::ValidationError
            | ErrorCode::InvalidFormat => Self::Low,

            ErrorCode::UpstreamUnavailable
            | ErrorCode::UpstreamTimeout
            | ErrorCode::Cancelled
            | ErrorCode::Timeout => Self::Medium,

            ErrorCode::DatabaseError
            | ErrorCode::ConfigurationError
            | ErrorCode::SerializationError => Self::High,

            ErrorCode::StoreUnavailable | ErrorCode::InternalError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Additional structured details about an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Additional context key-value pairs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Related entity ID (organization, project, role, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Related entity type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    /// Suggested action for resolution
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<String>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggested_action = Some(suggestion.into());
        self
    }

    fn is_empty(&self) -> bool {
        self.context.is_empty()
            && self.entity_id.is_none()
            && self.suggested_action.is_none()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for ScopeGate.
#[derive(Error, Debug)]
pub struct GateError {
    /// Machine-readable error code
    code: ErrorCode,

    /// User-friendly error message (safe to expose to clients)
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for GateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl GateError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        }
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error (500).
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    /// A referenced entity or scope does not exist.
    pub fn not_found(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        let entity_type = entity_type.into();
        let entity_id = entity_id.into();
        Self::new(
            ErrorCode::NotFound,
            format!("{} not found: {}", entity_type, entity_id),
        )
        .with_details(ErrorDetails::new().with_entity(&entity_type, &entity_id))
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    /// Malformed request input (path, query, identifiers).
    pub fn invalid_format(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::InvalidFormat, message)
    }

    /// Create an unauthorized error.
    pub fn unauthorized(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    /// A terse permission denial. The reason stays in the internal message.
    pub fn forbidden(internal_reason: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::PermissionDenied, "Forbidden", internal_reason)
    }

    /// The identity is unknown and cannot be invited.
    pub fn invalid_identity(identity: impl Into<String>) -> Self {
        let identity = identity.into();
        Self::new(
            ErrorCode::InvalidIdentity,
            format!(
                "User '{}' does not exist and is not a valid email address",
                identity
            ),
        )
        .with_details(
            ErrorDetails::new()
                .with_entity("user", &identity)
                .with_suggestion("Invite the user by email address, or use an existing user id"),
        )
    }

    /// The named role is not defined.
    pub fn role_not_found(role_name: impl Into<String>) -> Self {
        let name = role_name.into();
        Self::new(ErrorCode::RoleNotFound, format!("Role not found: {}", name))
            .with_details(ErrorDetails::new().with_entity("role", &name))
    }

    /// The data store could not be reached.
    pub fn store_unavailable(internal: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::StoreUnavailable,
            "The data store is unavailable",
            internal,
        )
    }

    /// A proxied backend failed or could not be reached.
    pub fn upstream_unavailable(backend: impl Into<String>, internal: impl Into<String>) -> Self {
        let backend = backend.into();
        Self::with_internal(
            ErrorCode::UpstreamUnavailable,
            "The upstream service is unavailable",
            internal,
        )
        .with_context("backend", &backend)
    }

    /// The caller cancelled the operation.
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::Cancelled,
            "The operation was cancelled",
            format!("cancelled: {}", operation.into()),
        )
    }

    /// The operation exceeded its deadline.
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::Timeout,
            "The operation timed out",
            format!("deadline exceeded: {}", operation.into()),
        )
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigurationError, message.into())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add error details.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    /// Add context to details.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    pub fn http_status(&self) -> StatusCode {
        self.code.http_status()
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    /// True for `NotFound`.
    pub fn is_not_found(&self) -> bool {
        self.code == ErrorCode::NotFound
    }

    /// True when the failure came from the data store or the operation
    /// lifecycle rather than from a decision.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::StoreUnavailable
                | ErrorCode::DatabaseError
                | ErrorCode::Timeout
                | ErrorCode::Cancelled
        )
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity and count it in
    /// `scopegate_errors_total`.
    pub fn log(&self) {
        self.record_metrics();
        let code = self.code.to_string();
        let category = self.code.category();
        let status = self.http_status().as_u16();

        match self.severity() {
            ErrorSeverity::Critical | ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    source = ?self.source,
                    "request failed"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    internal_message = ?self.internal_message,
                    "request failed"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    internal_message = ?self.internal_message,
                    "request rejected"
                );
            }
        }
    }

    fn record_metrics(&self) {
        counter!(
            "scopegate_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string()
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// API Response
// ═══════════════════════════════════════════════════════════════════════════════

/// Error response for API clients.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Always false for errors
    pub success: bool,

    /// Error information
    pub error: ErrorInfo,
}

/// Detailed error information for API responses.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub numeric_code: u32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<ErrorDetails>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl From<&GateError> for ErrorResponse {
    fn from(error: &GateError) -> Self {
        // Denials never carry details: they would leak why access failed.
        let details = if error.code == ErrorCode::PermissionDenied || error.details.is_empty() {
            None
        } else {
            Some(error.details.clone())
        };

        Self {
            success: false,
            error: ErrorInfo {
                code: error.code,
                numeric_code: error.code.numeric_code(),
                message: error.user_message.to_string(),
                details,
                timestamp: chrono::Utc::now(),
            },
        }
    }
}

impl IntoResponse for GateError {
    fn into_response(self) -> Response {
        self.log();

        let status = self.http_status();
        let response = ErrorResponse::from(&self);

        (status, Json(response)).into_response()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<sqlx::Error> for GateError {
    fn from(error: sqlx::Error) -> Self {
        let (code, user_msg) = match &error {
            sqlx::Error::RowNotFound => (ErrorCode::NotFound, "The requested record was not found"),
            sqlx::Error::Database(db_err) => {
                if let Some(constraint) = db_err.constraint() {
                    if constraint.contains("unique") || constraint.contains("pkey") {
                        return Self::with_internal(
                            ErrorCode::DuplicateRecord,
                            "A record with this identifier already exists",
                            format!("Constraint violation: {}", constraint),
                        )
                        .with_source(error);
                    }
                }
                (ErrorCode::DatabaseError, "A database error occurred")
            }
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_) => (ErrorCode::StoreUnavailable, "The data store is unavailable"),
            _ => (ErrorCode::DatabaseError, "A database error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for GateError {
    fn from(error: serde_json::Error) -> Self {
        Self::with_internal(
            ErrorCode::SerializationError,
            "Failed to process JSON data",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<reqwest::Error> for GateError {
    fn from(error: reqwest::Error) -> Self {
        let (code, user_msg) = if error.is_timeout() {
            (ErrorCode::UpstreamTimeout, "The upstream service timed out")
        } else {
            (ErrorCode::UpstreamUnavailable, "The upstream service is unavailable")
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<tokio::time::error::Elapsed> for GateError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        Self::with_internal(ErrorCode::Timeout, "The operation timed out", error.to_string())
            .with_source(error)
    }
}

impl From<config::ConfigError> for GateError {
    fn from(error: config::ConfigError) -> Self {
        Self::with_internal(
            ErrorCode::ConfigurationError,
            "Configuration error occurred",
            error.to_string(),
        )
    }
}

impl From<anyhow::Error> for GateError {
    fn from(error: anyhow::Error) -> Self {
        match error.downcast::<GateError>() {
            Ok(gate_error) => gate_error,
            Err(error) => Self::internal(error.to_string()),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_http_status() {
        assert_eq!(ErrorCode::NotFound.http_status(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorCode::PermissionDenied.http_status(), StatusCode::FORBIDDEN);
        assert_eq!(ErrorCode::Unauthorized.http_status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ErrorCode::UpstreamUnavailable.http_status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            ErrorCode::InvalidIdentity.http_status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }

    #[test]
    fn test_authz_and_upstream_never_share_a_status() {
        assert_ne!(
            ErrorCode::PermissionDenied.http_status(),
            ErrorCode::UpstreamUnavailable.http_status()
        );
        assert_ne!(
            ErrorCode::Unauthorized.http_status(),
            ErrorCode::UpstreamTimeout.http_status()
        );
    }

    #[test]
    fn test_error_code_is_retryable() {
        assert!(ErrorCode::StoreUnavailable.is_retryable());
        assert!(ErrorCode::UpstreamUnavailable.is_retryable());
        assert!(!ErrorCode::PermissionDenied.is_retryable());
        assert!(!ErrorCode::InvalidIdentity.is_retryable());
    }

    #[test]
    fn test_forbidden_is_terse() {
        let error = GateError::forbidden("user alice lacks read on project p1");
        let response = ErrorResponse::from(&error);

        assert_eq!(response.error.message, "Forbidden");
        assert!(response.error.details.is_none());

        let json = serde_json::to_string(&response).unwrap();
        assert!(!json.contains("alice"));
        assert!(json.contains("PERMISSION_DENIED"));
    }

    #[test]
    fn test_invalid_identity_is_specific() {
        let error = GateError::invalid_identity("not-an-email");
        assert_eq!(error.code(), ErrorCode::InvalidIdentity);
        assert!(error.user_message().contains("not-an-email"));
        assert!(error.user_message().contains("not a valid email"));
    }

    #[test]
    fn test_not_found_details() {
        let error = GateError::not_found("project", "p-123");
        assert!(error.is_not_found());
        assert_eq!(error.details().entity_type.as_deref(), Some("project"));
        assert_eq!(error.details().entity_id.as_deref(), Some("p-123"));
    }

    #[test]
    fn test_store_failure_classification() {
        assert!(GateError::store_unavailable("pool closed").is_store_failure());
        assert!(GateError::timeout("check_permission").is_store_failure());
        assert!(GateError::cancelled("assign_role").is_store_failure());
        assert!(!GateError::forbidden("denied").is_store_failure());
        assert!(!GateError::not_found("scope", "x").is_store_failure());
    }

    #[test]
    fn test_error_severity() {
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::ValidationError),
            ErrorSeverity::Low
        );
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::UpstreamTimeout),
            ErrorSeverity::Medium
        );
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::StoreUnavailable),
            ErrorSeverity::Critical
        );
    }

    #[test]
    fn test_error_display() {
        let error = GateError::with_internal(
            ErrorCode::DatabaseError,
            "A database error occurred",
            "relation \"role_assignments\" does not exist",
        );

        let display = format!("{}", error);
        assert!(display.contains("DatabaseError"));
        assert!(display.contains("role_assignments"));
    }

    #[test]
    fn test_errors_counted_only_when_surfaced() {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            let _swallowed = GateError::not_found("scope", "project/p1");
        });
        assert!(!handle.render().contains("scopegate_errors_total"));

        metrics::with_local_recorder(&recorder, || {
            let _ = GateError::not_found("scope", "project/p1").into_response();
        });
        assert!(handle.render().contains("scopegate_errors_total"));
    }
}
