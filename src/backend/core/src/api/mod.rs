//! HTTP surface.
//!
//! - `/health`, `/ready`, `/metrics`: unversioned and unauthenticated
//! - `/api/v1/...`: the management API, JSON `ApiResponse` envelope
//! - one tenant-enforcing proxy per configured observability backend
//!
//! Everything except the unversioned probes sits behind the [`AuthLayer`].

mod handlers;

use axum::{
    http::{header, HeaderValue, Method},
    routing::{delete, get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};

use crate::db::Database;
use crate::middleware::AuthLayer;
use crate::rbac::{AuthorizationEngine, RoleAssignmentManager};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: AuthorizationEngine,
    pub manager: RoleAssignmentManager,
    /// Probed by `/ready`; absent when running on the in-memory store.
    pub db: Option<Database>,
    pub metrics: Option<PrometheusHandle>,
}

/// Management routes, relative to `/api/v1`.
fn v1_router() -> Router<AppState> {
    Router::new()
        .route("/me", get(handlers::whoami))
        .route("/authorize", post(handlers::authorize))
        .route("/organizations", post(handlers::create_organization))
        .route(
            "/organizations/:organization_id/projects",
            post(handlers::create_project),
        )
        .route(
            "/projects/:project_id/resources",
            post(handlers::create_resource),
        )
        .route(
            "/scopes/:scope_type/:scope_id/permissions",
            get(handlers::list_permissions),
        )
        .route(
            "/scopes/:scope_type/:scope_id/assignments",
            get(handlers::list_assignments).post(handlers::assign_role),
        )
        .route(
            "/scopes/:scope_type/:scope_id/assignments/:user_id/:role",
            delete(handlers::revoke_role),
        )
}

/// Build the full router.
///
/// `proxies` is usually [`crate::proxy::proxy_router`]; pass `Router::new()`
/// to serve the management API alone.
///
/// # Example
///
/// ```rust,ignore
/// let app = build_router(state, AuthLayer::new(verifier), proxies, cors_layer(&[]));
/// ```
pub fn build_router(state: AppState, auth: AuthLayer, proxies: Router, cors: CorsLayer) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness))
        .route("/metrics", get(handlers::prometheus_metrics))
        .nest("/api/v1", v1_router())
        .fallback(handlers::not_found)
        .with_state(state)
        .merge(proxies)
        .layer(auth)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// CORS policy; an empty list allows any origin.
pub fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    if allowed_origins.is_empty() {
        return base.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(origin = %o, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    base.allow_origin(AllowOrigin::list(origins))
}

/// API response wrapper.
#[derive(Debug, serde::Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            error_code: None,
        }
    }

    pub fn error_with_code(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
            error_code: Some(code.into()),
        }
    }
}
