//! Integration tests for the tenant-enforcing proxy.
//!
//! A `wiremock` server stands in for the logs and metrics backends. Tests
//! cover:
//! - Forwarding with the tenant header and resource filter
//! - Series selectors and mixed-case form bodies
//! - Rejection before any outbound call for other tenants and for
//!   expressions that would escape the filter
//! - Authentication, path and upstream failure statuses

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    Router,
};
use scopegate_core::api::{build_router, cors_layer, AppState};
use scopegate_core::config::{BackendConfig, ProxyConfig};
use scopegate_core::context::OpContext;
use scopegate_core::middleware::{AuthLayer, StaticTokenVerifier};
use scopegate_core::proxy::{proxy_router, QueryDialect};
use scopegate_core::rbac::{
    AssignRoleRequest, AuthorizationEngine, Project, Resource, RoleAssignmentManager, UserId,
};
use scopegate_core::store::{FailPoint, MemoryStore, SharedStore};
use tower::ServiceExt;
use wiremock::matchers::{any, header as header_is, header_exists, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

// ============================================================================
// Test Utilities
// ============================================================================

struct Fixture {
    store: MemoryStore,
    manager: RoleAssignmentManager,
    engine: AuthorizationEngine,
    allowed: Project,
    allowed_resource: Resource,
    other: Project,
}

/// alice owns both projects; bob is a Viewer on `allowed` only.
async fn fixture() -> Fixture {
    let store = MemoryStore::new();
    let shared: SharedStore = Arc::new(store.clone());
    let engine = AuthorizationEngine::new(shared.clone());
    let manager = RoleAssignmentManager::new(shared);
    let ctx = OpContext::new();
    let alice = UserId::new("alice");

    let org = manager.create_organization(&ctx, "Acme", &alice).await.unwrap();
    let allowed = manager
        .create_project(&ctx, &org.id, "web", None, &alice)
        .await
        .unwrap();
    let other = manager
        .create_project(&ctx, &org.id, "billing", None, &alice)
        .await
        .unwrap();
    let allowed_resource = manager
        .create_resource(&ctx, &allowed.id, "checkout", "service")
        .await
        .unwrap();

    manager.reconcile_login(&ctx, &UserId::new("bob"), None).await.unwrap();
    manager
        .assign_role(
            &ctx,
            AssignRoleRequest {
                user_id: UserId::new("bob"),
                role_name: "Viewer".into(),
                scope: allowed.scope(),
                assigned_by: Some(alice),
                expires_at: None,
            },
        )
        .await
        .unwrap();

    Fixture {
        store,
        manager,
        engine,
        allowed,
        allowed_resource,
        other,
    }
}

fn backend(name: &str, kind: QueryDialect, prefix: &str, upstream: &str) -> BackendConfig {
    BackendConfig {
        name: name.to_string(),
        kind,
        route_prefix: prefix.to_string(),
        upstream_url: upstream.to_string(),
        native_prefix: None,
        tenant_header: None,
    }
}

fn app(f: &Fixture, backends: Vec<BackendConfig>, authz_timeout: Duration) -> Router {
    let proxies = proxy_router(
        &ProxyConfig {
            authz_timeout,
            upstream_timeout: Duration::from_secs(2),
            backends,
        },
        f.engine.clone(),
    )
    .unwrap();

    let verifier = StaticTokenVerifier::new()
        .with_token("alice-token", "alice", None)
        .with_token("bob-token", "bob", None);

    build_router(
        AppState {
            engine: f.engine.clone(),
            manager: f.manager.clone(),
            db: None,
            metrics: None,
        },
        AuthLayer::new(Arc::new(verifier)),
        proxies,
        cors_layer(&[]),
    )
}

fn get(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(Body::empty()).unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

// ============================================================================
// Forwarding
// ============================================================================

#[tokio::test]
async fn test_logs_query_forwarded_with_tenant_and_filter() {
    let f = fixture().await;
    let server = MockServer::start().await;

    Mock::given(header_exists("authorization"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/select/logsql/query"))
        .and(header_is("accountid", f.allowed.id.as_str()))
        .and(query_param(
            "query",
            format!(
                r#"resource_id:"{}" AND (level:error)"#,
                f.allowed_resource.id
            ),
        ))
        .and(query_param("limit", "10"))
        .and(query_param(
            "extra_filters",
            format!(r#"{{"resource_id":"{}"}}"#, f.allowed_resource.id),
        ))
        .respond_with(ResponseTemplate::new(200).set_body_string("{\"_msg\":\"boom\"}"))
        .expect(1)
        .mount(&server)
        .await;

    let app = app(
        &f,
        vec![backend("logs", QueryDialect::Logs, "/logs", &server.uri())],
        Duration::from_secs(2),
    );

    let uri = format!(
        "/logs/projects/{}/resources/{}/query?query=level%3Aerror&limit=10&extra_filters=%7B%7D",
        f.allowed.id, f.allowed_resource.id
    );
    let mut request = get(&uri, Some("bob-token"));
    request
        .headers_mut()
        .insert("accountid", f.other.id.as_str().parse().unwrap());

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "{\"_msg\":\"boom\"}");
}

#[tokio::test]
async fn test_metrics_form_body_gets_filter() {
    let f = fixture().await;
    let server = MockServer::start().await;
    let resource_id = f.allowed_resource.id.to_string();
    let expected = format!(
        r#"(sum(rate(http_requests_total[5m]))) and on(resource_id) {{resource_id="{}"}}"#,
        resource_id
    );

    Mock::given(method("POST"))
        .and(path("/api/v1/query"))
        .and(header_is("x-scope-orgid", f.allowed.id.as_str()))
        .and(move |req: &wiremock::Request| {
            form_urlencoded::parse(&req.body)
                .any(|(k, v)| k == "query" && v == expected.as_str())
        })
        .respond_with(ResponseTemplate::new(200).set_body_string("{\"status\":\"success\"}"))
        .expect(1)
        .mount(&server)
        .await;

    let app = app(
        &f,
        vec![backend("metrics", QueryDialect::Metrics, "/prometheus", &server.uri())],
        Duration::from_secs(2),
    );

    let request = Request::builder()
        .method("POST")
        .uri(format!(
            "/prometheus/projects/{}/resources/{}/query",
            f.allowed.id, resource_id
        ))
        .header(header::AUTHORIZATION, "Bearer alice-token")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from("query=sum%28rate%28http_requests_total%5B5m%5D%29%29"))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_mixed_case_form_content_type_gets_filter() {
    let f = fixture().await;
    let server = MockServer::start().await;
    let resource_id = f.allowed_resource.id.to_string();
    let expected = format!(
        r#"(up) and on(resource_id) {{resource_id="{}"}}"#,
        resource_id
    );
    let extra_label = format!("resource_id={}", resource_id);

    Mock::given(method("POST"))
        .and(path("/api/v1/query"))
        .and(move |req: &wiremock::Request| {
            let pairs: Vec<(String, String)> = form_urlencoded::parse(&req.body)
                .into_owned()
                .collect();
            pairs.iter().any(|(k, v)| k == "query" && *v == expected)
                && pairs.iter().all(|(k, v)| k != "query" || *v != "up")
                && pairs.iter().any(|(k, v)| k == "extra_label" && *v == extra_label)
        })
        .respond_with(ResponseTemplate::new(200).set_body_string("{\"status\":\"success\"}"))
        .expect(1)
        .mount(&server)
        .await;

    let app = app(
        &f,
        vec![backend("metrics", QueryDialect::Metrics, "/prometheus", &server.uri())],
        Duration::from_secs(2),
    );

    let request = Request::builder()
        .method("POST")
        .uri(format!(
            "/prometheus/projects/{}/resources/{}/query",
            f.allowed.id, resource_id
        ))
        .header(header::AUTHORIZATION, "Bearer alice-token")
        .header(header::CONTENT_TYPE, "Application/X-WWW-Form-Urlencoded ; charset=UTF-8")
        .body(Body::from("query=up"))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_series_selector_gets_resource_matcher() {
    let f = fixture().await;
    let server = MockServer::start().await;
    let resource_id = f.allowed_resource.id.to_string();

    Mock::given(method("GET"))
        .and(path("/api/v1/series"))
        .and(header_is("x-scope-orgid", f.allowed.id.as_str()))
        .and(query_param(
            "match[]",
            format!(r#"up{{job="api",resource_id="{}"}}"#, resource_id),
        ))
        .and(query_param("extra_label", format!("resource_id={}", resource_id)))
        .respond_with(ResponseTemplate::new(200).set_body_string("{\"status\":\"success\"}"))
        .expect(1)
        .mount(&server)
        .await;

    let app = app(
        &f,
        vec![backend("metrics", QueryDialect::Metrics, "/prometheus", &server.uri())],
        Duration::from_secs(2),
    );
    let uri = format!(
        "/prometheus/projects/{}/resources/{}/series?match%5B%5D=up%7Bjob%3D%22api%22%7D",
        f.allowed.id, resource_id
    );

    let response = app.oneshot(get(&uri, Some("bob-token"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_upstream_status_passes_through() {
    let f = fixture().await;
    let uri = format!(
        "/logs/projects/{}/resources/{}/query?query=level%3A",
        f.allowed.id, f.allowed_resource.id
    );

    for (upstream, expected) in [
        (422, StatusCode::UNPROCESSABLE_ENTITY),
        (403, StatusCode::BAD_GATEWAY),
        (401, StatusCode::BAD_GATEWAY),
        (503, StatusCode::BAD_GATEWAY),
    ] {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(upstream).set_body_string("bad query"))
            .mount(&server)
            .await;

        let app = app(
            &f,
            vec![backend("logs", QueryDialect::Logs, "/logs", &server.uri())],
            Duration::from_secs(2),
        );
        let response = app.oneshot(get(&uri, Some("bob-token"))).await.unwrap();
        assert_eq!(response.status(), expected, "upstream {}", upstream);

        let body = body_string(response).await;
        if expected == StatusCode::BAD_GATEWAY {
            assert!(!body.contains("bad query"), "upstream {}", upstream);
        } else {
            assert_eq!(body, "bad query");
        }
    }
}

// ============================================================================
// Rejections
// ============================================================================

async fn assert_rejected_without_upstream_call(
    f: &Fixture,
    uri: String,
    token: Option<&str>,
    authz_timeout: Duration,
    expected: StatusCode,
) {
    let server = MockServer::start().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let app = app(
        f,
        vec![backend("logs", QueryDialect::Logs, "/logs", &server.uri())],
        authz_timeout,
    );
    let response = app.oneshot(get(&uri, token)).await.unwrap();
    assert_eq!(response.status(), expected);
}

#[tokio::test]
async fn test_other_tenant_rejected_before_forwarding() {
    let f = fixture().await;
    let uri = format!(
        "/logs/projects/{}/resources/{}/query?query=*",
        f.other.id, f.allowed_resource.id
    );
    assert_rejected_without_upstream_call(
        &f,
        uri,
        Some("bob-token"),
        Duration::from_secs(2),
        StatusCode::FORBIDDEN,
    )
    .await;
}

#[tokio::test]
async fn test_unknown_project_is_forbidden() {
    let f = fixture().await;
    let uri = "/logs/projects/no-such-project/resources/r1/query".to_string();
    assert_rejected_without_upstream_call(
        &f,
        uri,
        Some("alice-token"),
        Duration::from_secs(2),
        StatusCode::FORBIDDEN,
    )
    .await;
}

#[tokio::test]
async fn test_missing_token_is_unauthorized() {
    let f = fixture().await;
    let uri = format!(
        "/logs/projects/{}/resources/{}/query",
        f.allowed.id, f.allowed_resource.id
    );
    assert_rejected_without_upstream_call(
        &f,
        uri,
        None,
        Duration::from_secs(2),
        StatusCode::UNAUTHORIZED,
    )
    .await;
}

#[tokio::test]
async fn test_unknown_token_is_unauthorized() {
    let f = fixture().await;
    let uri = format!(
        "/logs/projects/{}/resources/{}/query",
        f.allowed.id, f.allowed_resource.id
    );
    assert_rejected_without_upstream_call(
        &f,
        uri,
        Some("forged"),
        Duration::from_secs(2),
        StatusCode::UNAUTHORIZED,
    )
    .await;
}

#[tokio::test]
async fn test_malformed_path_is_bad_request() {
    let f = fixture().await;
    let uri = format!("/logs/projects/{}/query", f.allowed.id);
    assert_rejected_without_upstream_call(
        &f,
        uri,
        Some("bob-token"),
        Duration::from_secs(2),
        StatusCode::BAD_REQUEST,
    )
    .await;
}

#[tokio::test]
async fn test_store_failure_is_forbidden() {
    let f = fixture().await;
    f.store.fail_on(FailPoint::Reads);
    let uri = format!(
        "/logs/projects/{}/resources/{}/query",
        f.allowed.id, f.allowed_resource.id
    );
    assert_rejected_without_upstream_call(
        &f,
        uri,
        Some("bob-token"),
        Duration::from_secs(2),
        StatusCode::FORBIDDEN,
    )
    .await;
}

#[tokio::test]
async fn test_slow_permission_check_is_forbidden() {
    let f = fixture().await;
    f.store.set_latency(Duration::from_millis(300));
    let uri = format!(
        "/logs/projects/{}/resources/{}/query",
        f.allowed.id, f.allowed_resource.id
    );
    assert_rejected_without_upstream_call(
        &f,
        uri,
        Some("bob-token"),
        Duration::from_millis(50),
        StatusCode::FORBIDDEN,
    )
    .await;
}

#[tokio::test]
async fn test_unreachable_upstream_is_bad_gateway() {
    let f = fixture().await;
    let app = app(
        &f,
        vec![backend("logs", QueryDialect::Logs, "/logs", "http://127.0.0.1:1")],
        Duration::from_secs(2),
    );
    let uri = format!(
        "/logs/projects/{}/resources/{}/query?query=*",
        f.allowed.id, f.allowed_resource.id
    );

    let response = app.oneshot(get(&uri, Some("bob-token"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_filter_breakout_is_bad_request() {
    let f = fixture().await;
    for query in ["x%29%20OR%20%28*", "%28", "%22unterminated"] {
        let uri = format!(
            "/logs/projects/{}/resources/{}/query?query={}",
            f.allowed.id, f.allowed_resource.id, query
        );
        assert_rejected_without_upstream_call(
            &f,
            uri,
            Some("bob-token"),
            Duration::from_secs(2),
            StatusCode::BAD_REQUEST,
        )
        .await;
    }
}
