//! Integration tests for the management API.
//!
//! Requests go through the full router (auth layer included) with
//! `tower::ServiceExt::oneshot` against the in-memory store.

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    Router,
};
use scopegate_core::api::{build_router, cors_layer, AppState};
use scopegate_core::middleware::{AuthLayer, StaticTokenVerifier};
use scopegate_core::rbac::{AuthorizationEngine, RoleAssignmentManager};
use scopegate_core::store::{MemoryStore, SharedStore};
use serde_json::{json, Value};
use tower::ServiceExt;

// ============================================================================
// Test Utilities
// ============================================================================

fn app() -> Router {
    let shared: SharedStore = Arc::new(MemoryStore::new());
    let verifier = StaticTokenVerifier::new()
        .with_token("alice-token", "alice", Some("alice@example.com"))
        .with_token("bob-token", "bob", None);

    build_router(
        AppState {
            engine: AuthorizationEngine::new(shared.clone()),
            manager: RoleAssignmentManager::new(shared),
            db: None,
            metrics: None,
        },
        AuthLayer::new(Arc::new(verifier)),
        Router::new(),
        cors_layer(&[]),
    )
}

async fn call(
    app: &Router,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, json)
}

/// alice creates an organization and a project; returns their ids.
async fn org_and_project(app: &Router) -> (String, String) {
    let (status, org) = call(
        app,
        "POST",
        "/api/v1/organizations",
        Some("alice-token"),
        Some(json!({ "name": "Acme" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let org_id = org["data"]["id"].as_str().unwrap().to_string();

    let (status, project) = call(
        app,
        "POST",
        &format!("/api/v1/organizations/{}/projects", org_id),
        Some("alice-token"),
        Some(json!({ "name": "web", "description": "storefront" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let project_id = project["data"]["id"].as_str().unwrap().to_string();

    (org_id, project_id)
}

// ============================================================================
// Probes and authentication
// ============================================================================

#[tokio::test]
async fn test_health_needs_no_token() {
    let app = app();
    let (status, body) = call(&app, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_ready_without_database() {
    let app = app();
    let (status, body) = call(&app, "GET", "/ready", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["database"], "not_configured");
}

#[tokio::test]
async fn test_metrics_disabled_is_not_found() {
    let app = app();
    let (status, _) = call(&app, "GET", "/metrics", None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_api_requires_token() {
    let app = app();
    let (status, body) = call(&app, "GET", "/api/v1/me", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["success"], false);

    let (status, _) = call(&app, "GET", "/api/v1/me", Some("forged"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

// ============================================================================
// Entities and permissions
// ============================================================================

#[tokio::test]
async fn test_creator_holds_every_action_on_new_project() {
    let app = app();
    let (_, project_id) = org_and_project(&app).await;

    let (status, body) = call(
        &app,
        "GET",
        &format!("/api/v1/scopes/project/{}/permissions", project_id),
        Some("alice-token"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["actions"].as_array().unwrap().len(), 4);

    let (status, body) = call(&app, "GET", "/api/v1/me", Some("alice-token"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["assignments"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_project_creation_needs_write_on_org() {
    let app = app();
    let (org_id, _) = org_and_project(&app).await;

    let (status, _) = call(
        &app,
        "POST",
        &format!("/api/v1/organizations/{}/projects", org_id),
        Some("bob-token"),
        Some(json!({ "name": "sneaky" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_resource_creation_and_inheritance() {
    let app = app();
    let (_, project_id) = org_and_project(&app).await;

    let (status, resource) = call(
        &app,
        "POST",
        &format!("/api/v1/projects/{}/resources", project_id),
        Some("alice-token"),
        Some(json!({ "name": "checkout", "kind": "service" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let resource_id = resource["data"]["id"].as_str().unwrap().to_string();

    let (status, body) = call(
        &app,
        "POST",
        "/api/v1/authorize",
        Some("alice-token"),
        Some(json!({
            "action": "write",
            "scopes": [
                { "type": "resource", "id": resource_id },
                { "type": "project", "id": "elsewhere" }
            ]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let permitted = body["data"]["permitted"].as_array().unwrap();
    assert_eq!(permitted.len(), 1);
}

#[tokio::test]
async fn test_malformed_scope_type_is_bad_request() {
    let app = app();
    let (status, _) = call(
        &app,
        "GET",
        "/api/v1/scopes/galaxy/g1/permissions",
        Some("alice-token"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_blank_organization_name_is_rejected() {
    let app = app();
    let (status, _) = call(
        &app,
        "POST",
        "/api/v1/organizations",
        Some("alice-token"),
        Some(json!({ "name": "   " })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

// ============================================================================
// Assignments
// ============================================================================

#[tokio::test]
async fn test_invite_by_email_is_idempotent() {
    let app = app();
    let (_, project_id) = org_and_project(&app).await;
    let uri = format!("/api/v1/scopes/project/{}/assignments", project_id);
    let body = json!({ "user_id": "carol@example.com", "role": "viewer" });

    let (status, first) = call(&app, "POST", &uri, Some("alice-token"), Some(body.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(first["data"]["outcome"], "created");
    assert_eq!(first["data"]["placeholder_created"], true);

    let (status, second) = call(&app, "POST", &uri, Some("alice-token"), Some(body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["data"]["outcome"], "already_active");

    let (status, listed) = call(&app, "GET", &uri, Some("alice-token"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed["data"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_unknown_role_and_bad_identity() {
    let app = app();
    let (_, project_id) = org_and_project(&app).await;
    let uri = format!("/api/v1/scopes/project/{}/assignments", project_id);

    let (status, _) = call(
        &app,
        "POST",
        &uri,
        Some("alice-token"),
        Some(json!({ "user_id": "carol@example.com", "role": "superuser" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _) = call(
        &app,
        "POST",
        &uri,
        Some("alice-token"),
        Some(json!({ "user_id": "not an email", "role": "viewer" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_non_owner_cannot_manage_access() {
    let app = app();
    let (_, project_id) = org_and_project(&app).await;
    let uri = format!("/api/v1/scopes/project/{}/assignments", project_id);

    let (status, body) = call(&app, "GET", &uri, Some("bob-token"), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(!body.to_string().contains("bob"));

    let (status, _) = call(
        &app,
        "POST",
        &uri,
        Some("bob-token"),
        Some(json!({ "user_id": "bob", "role": "owner" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_viewer_grant_then_revoke() {
    let app = app();
    let (_, project_id) = org_and_project(&app).await;

    let uri = format!("/api/v1/scopes/project/{}/assignments", project_id);
    let (status, _) = call(
        &app,
        "POST",
        &uri,
        Some("alice-token"),
        Some(json!({ "user_id": "bob@example.com", "role": "viewer" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let revoke = format!("{}/bob@example.com/viewer", uri);
    let (status, body) = call(&app, "DELETE", &revoke, Some("alice-token"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["removed"], true);

    let (status, body) = call(&app, "DELETE", &revoke, Some("alice-token"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["removed"], false);
}

#[tokio::test]
async fn test_unknown_route_uses_envelope() {
    let app = app();
    let (status, body) = call(&app, "GET", "/api/v1/nowhere", Some("alice-token"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error_code"], "NOT_FOUND");
}
