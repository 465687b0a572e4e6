//! API request handlers with proper error propagation.
//!
//! All handlers return `Result<impl IntoResponse, GateError>` so that errors
//! are converted to HTTP status codes by the `IntoResponse` implementation on
//! `GateError`. Every management call runs under its own [`OpContext`].

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{ApiResponse, AppState};
use crate::context::OpContext;
use crate::error::{GateError, Result};
use crate::middleware::AuthContext;
use crate::rbac::{
    Action, AssignRoleRequest, OrganizationId, ProjectId, ScopeRef, ScopeType,
    UserId,
};
use crate::store::PermissionStore;

/// Upper bound on one management operation.
const OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

fn op_context() -> OpContext {
    OpContext::with_timeout(OPERATION_TIMEOUT)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Health, Readiness, Metrics
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now().to_rfc3339()
    }))
}

/// Ready when the database answers; always ready without one.
pub async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    let database = match &state.db {
        Some(db) => match db.ping().await {
            Ok(()) => "up",
            Err(e) => {
                tracing::error!(error = %e, "Readiness probe failed");
                "down"
            }
        },
        None => "not_configured",
    };

    let status = if database == "down" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (
        status,
        Json(serde_json::json!({
            "ready": status == StatusCode::OK,
            "database": database,
        })),
    )
}

pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            handle.render(),
        ),
        None => (
            StatusCode::NOT_FOUND,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "metrics exporter disabled\n".to_string(),
        ),
    }
}

pub async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(ApiResponse::<()>::error_with_code(
            "No route matches this request",
            "NOT_FOUND",
        )),
    )
}

// ═══════════════════════════════════════════════════════════════════════════════
// Entity Handlers
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Deserialize)]
pub struct CreateOrganizationRequest {
    pub name: String,
}

#[derive(Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    pub description: Option<String>,
}

#[derive(Deserialize)]
pub struct CreateResourceRequest {
    pub name: String,
    pub kind: String,
}

pub async fn create_organization(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateOrganizationRequest>,
) -> Result<impl IntoResponse> {
    let organization = state
        .manager
        .create_organization(&op_context(), &req.name, &auth.user_id)
        .await?;

    Ok((StatusCode::CREATED, Json(ApiResponse::success(organization))))
}

pub async fn create_project(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(organization_id): Path<String>,
    Json(req): Json<CreateProjectRequest>,
) -> Result<impl IntoResponse> {
    let ctx = op_context();
    let scope = ScopeRef::parse(ScopeType::Organization.as_str(), &organization_id)?;
    state
        .engine
        .enforce(&ctx, &auth.user_id, Action::Write, &scope)
        .await?;

    let project = state
        .manager
        .create_project(
            &ctx,
            &OrganizationId::new(organization_id),
            &req.name,
            req.description,
            &auth.user_id,
        )
        .await?;

    Ok((StatusCode::CREATED, Json(ApiResponse::success(project))))
}

pub async fn create_resource(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(project_id): Path<String>,
    Json(req): Json<CreateResourceRequest>,
) -> Result<impl IntoResponse> {
    let ctx = op_context();
    let scope = ScopeRef::parse(ScopeType::Project.as_str(), &project_id)?;
    state
        .engine
        .enforce(&ctx, &auth.user_id, Action::Write, &scope)
        .await?;

    let resource = state
        .manager
        .create_resource(&ctx, &ProjectId::new(project_id), &req.name, &req.kind)
        .await?;

    Ok((StatusCode::CREATED, Json(ApiResponse::success(resource))))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Permission Handlers
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Serialize)]
pub struct PermissionsResponse {
    pub scope: ScopeRef,
    pub actions: Vec<Action>,
}

/// The caller's effective actions at a scope. Unknown scopes are reported as
/// forbidden.
pub async fn list_permissions(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((scope_type, scope_id)): Path<(String, String)>,
) -> Result<impl IntoResponse> {
    let scope = ScopeRef::parse(&scope_type, &scope_id)?;

    let actions = state
        .engine
        .list_permissions(&op_context(), &auth.user_id, &scope)
        .await
        .map_err(|e| {
            if e.is_not_found() {
                GateError::forbidden(format!("scope {} does not exist", scope))
            } else {
                e
            }
        })?;

    Ok(Json(ApiResponse::success(PermissionsResponse {
        scope,
        actions: actions.into_iter().collect(),
    })))
}

#[derive(Deserialize)]
pub struct ScopeInput {
    #[serde(rename = "type")]
    pub scope_type: String,
    pub id: String,
}

#[derive(Deserialize)]
pub struct AuthorizeRequest {
    pub action: Action,
    pub scopes: Vec<ScopeInput>,
}

#[derive(Serialize)]
pub struct AuthorizeResponse {
    pub action: Action,
    pub permitted: Vec<ScopeRef>,
}

/// Which of the given scopes the caller may act on.
pub async fn authorize(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<AuthorizeRequest>,
) -> Result<impl IntoResponse> {
    let scopes = req
        .scopes
        .iter()
        .map(|s| ScopeRef::parse(&s.scope_type, &s.id))
        .collect::<Result<Vec<_>>>()?;

    let permitted = state
        .engine
        .filter_permitted(&op_context(), &auth.user_id, req.action, &scopes)
        .await?;

    Ok(Json(ApiResponse::success(AuthorizeResponse {
        action: req.action,
        permitted,
    })))
}

/// The caller's identity and every active grant they hold.
pub async fn whoami(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<impl IntoResponse> {
    let assignments = op_context()
        .run(
            "active_assignments",
            state.engine.store().active_assignments(&auth.user_id),
        )
        .await?;

    Ok(Json(ApiResponse::success(serde_json::json!({
        "user_id": auth.user_id,
        "email": auth.email,
        "assignments": assignments,
    }))))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Assignment Handlers
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Deserialize)]
pub struct AssignRoleBody {
    /// Existing user id or an email address to invite.
    pub user_id: String,
    pub role: String,
    pub expires_at: Option<DateTime<Utc>>,
}

async fn require_manage_access(
    state: &AppState,
    ctx: &OpContext,
    auth: &AuthContext,
    scope_type: &str,
    scope_id: &str,
) -> Result<ScopeRef> {
    let scope = ScopeRef::parse(scope_type, scope_id)?;
    state
        .engine
        .enforce(ctx, &auth.user_id, Action::ManageAccess, &scope)
        .await?;
    Ok(scope)
}

pub async fn list_assignments(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((scope_type, scope_id)): Path<(String, String)>,
) -> Result<impl IntoResponse> {
    let ctx = op_context();
    let scope = require_manage_access(&state, &ctx, &auth, &scope_type, &scope_id).await?;

    let assignments = ctx
        .run(
            "active_assignments_at",
            state.engine.store().active_assignments_at(&scope),
        )
        .await?;

    Ok(Json(ApiResponse::success(assignments)))
}

pub async fn assign_role(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((scope_type, scope_id)): Path<(String, String)>,
    Json(body): Json<AssignRoleBody>,
) -> Result<impl IntoResponse> {
    let ctx = op_context();
    let scope = require_manage_access(&state, &ctx, &auth, &scope_type, &scope_id).await?;

    let outcome = state
        .manager
        .assign_role(
            &ctx,
            AssignRoleRequest {
                user_id: UserId::new(body.user_id.trim()),
                role_name: body.role,
                scope,
                assigned_by: Some(auth.user_id.clone()),
                expires_at: body.expires_at,
            },
        )
        .await?;

    let status = if outcome.outcome.changed() {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(ApiResponse::success(outcome))))
}

pub async fn revoke_role(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((scope_type, scope_id, user_id, role)): Path<(String, String, String, String)>,
) -> Result<impl IntoResponse> {
    let ctx = op_context();
    let scope = require_manage_access(&state, &ctx, &auth, &scope_type, &scope_id).await?;

    let removed = state
        .manager
        .revoke_role(&ctx, &UserId::new(user_id), &role, &scope)
        .await?;

    Ok(Json(ApiResponse::success(serde_json::json!({
        "removed": removed,
    }))))
}
