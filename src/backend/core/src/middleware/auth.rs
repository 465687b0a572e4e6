//! Authentication middleware.
//!
//! Features:
//! - Pluggable token verification through the [`IdentityVerifier`] capability
//! - JWT verification (HS256/RS256) with issuer, audience and leeway checks
//! - Static token table for development and tests
//! - Login reconciliation: confirms the user record and claims pending
//!   invitations addressed to the verified email
//! - Request context injection
//!
//! # Example
//!
//! ```rust,ignore
//! use scopegate_core::middleware::auth::{AuthLayer, JwtVerifier};
//!
//! let verifier = Arc::new(JwtVerifier::from_settings(&config.auth.jwt)?);
//!
//! let app = Router::new()
//!     .route("/api/v1/organizations", post(create_organization))
//!     .layer(AuthLayer::new(verifier).with_reconciliation(manager));
//! ```

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::{FromRequestParts, Request},
    http::{request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{Duration, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::Arc,
    task::{Context, Poll},
    time::Instant,
};
use thiserror::Error;
use tower::{Layer, Service};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{JwtSettings, StaticTokenEntry};
use crate::context::OpContext;
use crate::error::GateError;
use crate::rbac::{RoleAssignmentManager, UserId};

/// How long a reconciled login is remembered before the next request
/// reconciles again.
const RECONCILE_TTL: std::time::Duration = std::time::Duration::from_secs(300);

/// Upper bound on one reconciliation.
const RECONCILE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);

/// Size above which expired reconciliation entries are swept on insert.
const RECONCILE_SWEEP_THRESHOLD: usize = 10_000;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Types
// ═══════════════════════════════════════════════════════════════════════════════

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing authentication credentials")]
    MissingCredentials,

    #[error("Invalid authentication token")]
    InvalidToken,

    #[error("Token has expired")]
    TokenExpired,

    #[error("Token validation error: {0}")]
    ValidationError(String),

    #[error("Internal authentication error: {0}")]
    Internal(String),
}

impl AuthError {
    fn parts(&self) -> (StatusCode, &'static str, &'static str) {
        match self {
            Self::MissingCredentials => (
                StatusCode::UNAUTHORIZED,
                "MISSING_CREDENTIALS",
                "Authentication credentials are required",
            ),
            Self::InvalidToken | Self::ValidationError(_) => (
                StatusCode::UNAUTHORIZED,
                "INVALID_TOKEN",
                "The provided token is invalid",
            ),
            Self::TokenExpired => (
                StatusCode::UNAUTHORIZED,
                "TOKEN_EXPIRED",
                "The authentication token has expired",
            ),
            Self::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An authentication error occurred",
            ),
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();

        debug!(error = %self, "Authentication failed");
        counter!(
            "scopegate_auth_errors_total",
            "error_type" => code
        )
        .increment(1);

        let body = serde_json::json!({
            "success": false,
            "error": {
                "code": code,
                "message": message,
            }
        });

        (status, Json(body)).into_response()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Identity Verification
// ═══════════════════════════════════════════════════════════════════════════════

/// The identity a verifier vouches for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedIdentity {
    pub user_id: UserId,
    /// Only set when the issuer vouches for the address.
    pub email: Option<String>,
}

/// Turns a bearer token into a verified identity.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<VerifiedIdentity, AuthError>;
}

/// JWT token claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: String,

    /// User email (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    /// Whether the issuer verified the email
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_verified: Option<bool>,

    /// Issued at timestamp
    #[serde(default)]
    pub iat: i64,

    /// Expiration timestamp
    pub exp: i64,

    /// Issuer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,

    /// Audience
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
}

impl Claims {
    /// Create new claims for a user.
    pub fn new(user_id: impl Into<String>, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            sub: user_id.into(),
            email: None,
            email_verified: None,
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
            iss: None,
            aud: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_email_verified(mut self, verified: bool) -> Self {
        self.email_verified = Some(verified);
        self
    }

    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.iss = Some(issuer.into());
        self
    }

    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.aud = Some(audience.into());
        self
    }

    fn into_identity(self) -> Result<VerifiedIdentity, AuthError> {
        if self.sub.trim().is_empty() {
            return Err(AuthError::InvalidToken);
        }
        let email = match self.email_verified {
            Some(false) => None,
            _ => self.email,
        };
        Ok(VerifiedIdentity {
            user_id: UserId::new(self.sub),
            email,
        })
    }
}

/// Verifies signed JWTs.
pub struct JwtVerifier {
    algorithm: Algorithm,
    encoding_key: Option<EncodingKey>,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    /// HS256 with a shared secret.
    pub fn hs256(secret: &str) -> Self {
        Self::with_keys(
            Algorithm::HS256,
            Some(EncodingKey::from_secret(secret.as_bytes())),
            DecodingKey::from_secret(secret.as_bytes()),
        )
    }

    /// RS256 with a PEM-encoded public key.
    pub fn rs256(public_key_pem: &str) -> Result<Self, GateError> {
        let key = DecodingKey::from_rsa_pem(public_key_pem.as_bytes()).map_err(|e| {
            GateError::configuration(format!("Invalid RSA public key: {}", e))
        })?;
        Ok(Self::with_keys(Algorithm::RS256, None, key))
    }

    /// Build from configuration.
    pub fn from_settings(settings: &JwtSettings) -> Result<Self, GateError> {
        let verifier = match settings.algorithm.as_str() {
            "HS256" => {
                let secret = settings.secret.as_deref().ok_or_else(|| {
                    GateError::configuration("JWT secret required for HS256")
                })?;
                Self::hs256(secret)
            }
            "RS256" => {
                let pem = settings.public_key_pem.as_deref().ok_or_else(|| {
                    GateError::configuration("JWT public key required for RS256")
                })?;
                Self::rs256(pem)?
            }
            other => {
                return Err(GateError::configuration(format!(
                    "Unsupported JWT algorithm: {}",
                    other
                )))
            }
        };

        let mut verifier = verifier.with_leeway(settings.leeway_secs);
        if let Some(ref issuer) = settings.issuer {
            verifier = verifier.with_issuer(issuer);
        }
        if let Some(ref audience) = settings.audience {
            verifier = verifier.with_audience(audience);
        }
        Ok(verifier)
    }

    fn with_keys(algorithm: Algorithm, encoding_key: Option<EncodingKey>, decoding_key: DecodingKey) -> Self {
        let mut validation = Validation::new(algorithm);
        validation.validate_aud = false;
        Self {
            algorithm,
            encoding_key,
            decoding_key,
            validation,
        }
    }

    pub fn with_leeway(mut self, secs: u64) -> Self {
        self.validation.leeway = secs;
        self
    }

    pub fn with_issuer(mut self, issuer: &str) -> Self {
        self.validation.set_issuer(&[issuer]);
        self
    }

    pub fn with_audience(mut self, audience: &str) -> Self {
        self.validation.set_audience(&[audience]);
        self
    }

    /// Sign claims; only available for shared-secret algorithms.
    pub fn generate_token(&self, claims: &Claims) -> Result<String, AuthError> {
        let encoding_key = self
            .encoding_key
            .as_ref()
            .ok_or_else(|| AuthError::Internal("JWT encoding key not configured".into()))?;

        encode(&Header::new(self.algorithm), claims, encoding_key)
            .map_err(|e| AuthError::Internal(format!("Failed to generate token: {}", e)))
    }
}

#[async_trait]
impl IdentityVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> Result<VerifiedIdentity, AuthError> {
        let token_data = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| {
                debug!("JWT validation failed: {}", e);
                match e.kind() {
                    jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                    jsonwebtoken::errors::ErrorKind::InvalidToken
                    | jsonwebtoken::errors::ErrorKind::InvalidSignature => AuthError::InvalidToken,
                    _ => AuthError::ValidationError(e.to_string()),
                }
            })?;

        counter!("scopegate_auth_success_total", "method" => "jwt").increment(1);
        token_data.claims.into_identity()
    }
}

/// Fixed token table.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, VerifiedIdentity>,
}

impl StaticTokenVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(
        mut self,
        token: impl Into<String>,
        user_id: impl Into<UserId>,
        email: Option<&str>,
    ) -> Self {
        self.tokens.insert(
            token.into(),
            VerifiedIdentity {
                user_id: user_id.into(),
                email: email.map(str::to_string),
            },
        );
        self
    }

    pub fn from_entries(entries: &[StaticTokenEntry]) -> Self {
        entries.iter().fold(Self::new(), |verifier, entry| {
            verifier.with_token(
                entry.token.clone(),
                entry.user_id.as_str(),
                entry.email.as_deref(),
            )
        })
    }
}

#[async_trait]
impl IdentityVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<VerifiedIdentity, AuthError> {
        let identity = self
            .tokens
            .get(token)
            .cloned()
            .ok_or(AuthError::InvalidToken)?;
        counter!("scopegate_auth_success_total", "method" => "static").increment(1);
        Ok(identity)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Authentication Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Authentication context attached to requests.
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// Verified user ID
    pub user_id: UserId,

    /// Verified email
    pub email: Option<String>,

    /// Request ID for correlation
    pub request_id: String,
}

impl AuthContext {
    pub fn new(identity: VerifiedIdentity, request_id: impl Into<String>) -> Self {
        Self {
            user_id: identity.user_id,
            email: identity.email,
            request_id: request_id.into(),
        }
    }
}

fn request_id(headers: &HeaderMap) -> String {
    headers
        .get("X-Request-ID")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer ").or_else(|| s.strip_prefix("bearer ")))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tower Layer and Service
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Clone)]
struct Reconciler {
    manager: RoleAssignmentManager,
    seen: Arc<DashMap<UserId, Instant>>,
    ttl: std::time::Duration,
    sweep_threshold: usize,
}

impl Reconciler {
    fn new(manager: RoleAssignmentManager) -> Self {
        Self {
            manager,
            seen: Arc::new(DashMap::new()),
            ttl: RECONCILE_TTL,
            sweep_threshold: RECONCILE_SWEEP_THRESHOLD,
        }
    }

    fn is_fresh(&self, user_id: &UserId) -> bool {
        self.seen
            .get(user_id)
            .map_or(false, |at| at.elapsed() < self.ttl)
    }

    /// Remember a reconciled user. Past the sweep threshold, expired entries
    /// are dropped so the map stays bounded by the logins of one TTL window.
    fn remember(&self, user_id: UserId) {
        self.seen.insert(user_id, Instant::now());
        if self.seen.len() > self.sweep_threshold {
            let ttl = self.ttl;
            self.seen.retain(|_, at| at.elapsed() < ttl);
        }
    }

    async fn run(&self, identity: &VerifiedIdentity) {
        if self.is_fresh(&identity.user_id) {
            return;
        }

        let ctx = OpContext::with_timeout(RECONCILE_TIMEOUT);
        match self
            .manager
            .reconcile_login(&ctx, &identity.user_id, identity.email.as_deref())
            .await
        {
            Ok(_) => self.remember(identity.user_id.clone()),
            Err(e) => {
                warn!(user_id = %identity.user_id, error = %e, "Login reconciliation failed");
            }
        }
    }
}

/// Authentication layer for Tower.
#[derive(Clone)]
pub struct AuthLayer {
    verifier: Arc<dyn IdentityVerifier>,
    reconciler: Option<Reconciler>,
    public_paths: Arc<Vec<String>>,
}

impl AuthLayer {
    /// Create a new auth layer.
    pub fn new(verifier: Arc<dyn IdentityVerifier>) -> Self {
        Self {
            verifier,
            reconciler: None,
            public_paths: Arc::new(vec![
                "/health".to_string(),
                "/ready".to_string(),
                "/metrics".to_string(),
            ]),
        }
    }

    /// Reconcile every newly seen identity with the user store.
    pub fn with_reconciliation(mut self, manager: RoleAssignmentManager) -> Self {
        self.reconciler = Some(Reconciler::new(manager));
        self
    }

    /// Check if a path is public (doesn't require auth).
    pub fn is_public_path(&self, path: &str) -> bool {
        self.public_paths.iter().any(|p| path == p)
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthService {
            inner,
            layer: self.clone(),
        }
    }
}

/// Authentication service.
#[derive(Clone)]
pub struct AuthService<S> {
    inner: S,
    layer: AuthLayer,
}

impl<S> Service<Request<Body>> for AuthService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<Body>) -> Self::Future {
        let layer = self.layer.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            if layer.is_public_path(request.uri().path()) {
                return inner.call(request).await;
            }

            let token = match bearer_token(request.headers()) {
                Some(token) => token.to_string(),
                None => return Ok(AuthError::MissingCredentials.into_response()),
            };

            let identity = match layer.verifier.verify(&token).await {
                Ok(identity) => identity,
                Err(e) => return Ok(e.into_response()),
            };

            if let Some(reconciler) = &layer.reconciler {
                reconciler.run(&identity).await;
            }

            let auth_context = AuthContext::new(identity, request_id(request.headers()));
            request.extensions_mut().insert(auth_context);
            inner.call(request).await
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Axum Extractor
// ═══════════════════════════════════════════════════════════════════════════════

/// Extractor for authentication context in handlers.
#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthContext
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthContext>()
            .cloned()
            .ok_or(AuthError::MissingCredentials)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
