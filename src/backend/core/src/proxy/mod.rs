//! Tenant-enforcing reverse proxy for observability backends.
//!
//! Each configured backend is mounted at its route prefix. A request under
//! `{prefix}/projects/{project_id}/resources/{resource_id}/...` is forwarded
//! only after the caller is confirmed to hold `read` on the project. On the
//! way out the proxy:
//!
//! - replaces any client-supplied tenant header with the project id
//! - maps the path onto the backend's native endpoint prefix
//! - injects a resource filter into every query-language parameter and a
//!   resource matcher into every series selector, in the query string and in
//!   form-encoded bodies
//! - pins the backend's own filter parameter (`extra_filters` or
//!   `extra_label`) to the resource
//! - drops hop-by-hop and credential headers
//!
//! Expressions whose brackets or quotes do not balance are refused with 400.
//! Upstream failures, including backend 401, 403 and 5xx answers, surface as
//! 502 and are never reported as permission errors. Response bodies are
//! streamed through without buffering.

pub mod path;
pub mod query;

use axum::{
    body::{to_bytes, Body, Bytes},
    extract::{Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use metrics::{counter, histogram};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use crate::config::{BackendConfig, ProxyConfig};
use crate::context::OpContext;
use crate::error::{ErrorCode, GateError, Result};
use crate::middleware::AuthContext;
use crate::rbac::{Action, AuthorizationEngine, ScopeRef};

pub use path::TenantPath;
pub use query::{DialectSpec, QueryDialect};

/// Largest request body the proxy buffers.
pub const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

/// Headers that describe one connection and must not be forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Request headers that carry the caller's credentials or are recomputed.
const STRIPPED_REQUEST: &[&str] = &["authorization", "cookie", "host", "content-length"];

/// One mounted backend.
pub struct TenantProxy {
    name: String,
    dialect: QueryDialect,
    route_prefix: String,
    upstream_base: String,
    native_prefix: String,
    tenant_header: HeaderName,
    engine: AuthorizationEngine,
    client: reqwest::Client,
    authz_timeout: Duration,
}

impl TenantProxy {
    pub fn new(
        backend: &BackendConfig,
        engine: AuthorizationEngine,
        client: reqwest::Client,
        authz_timeout: Duration,
    ) -> Result<Self> {
        let tenant_header = HeaderName::from_bytes(backend.tenant_header().as_bytes())
            .map_err(|e| {
                GateError::configuration(format!(
                    "Backend '{}' has an invalid tenant header: {}",
                    backend.name, e
                ))
            })?;

        Ok(Self {
            name: backend.name.clone(),
            dialect: backend.kind,
            route_prefix: backend.route_prefix.trim_end_matches('/').to_string(),
            upstream_base: backend.upstream_url.trim_end_matches('/').to_string(),
            native_prefix: backend.native_prefix().to_string(),
            tenant_header,
            engine,
            client,
            authz_timeout,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Router serving `{route_prefix}/*path`.
    pub fn router(self: Arc<Self>) -> Router {
        let route = format!("{}/*path", self.route_prefix);
        Router::new().route(&route, any(proxy_handler)).with_state(self)
    }

    /// Authorize, rewrite and forward one request.
    pub async fn handle(&self, request: Request) -> Response {
        let auth = match request.extensions().get::<AuthContext>().cloned() {
            Some(auth) => auth,
            None => {
                self.record("unauthenticated");
                return GateError::unauthorized("Authentication required").into_response();
            }
        };

        let below_prefix = request
            .uri()
            .path()
            .strip_prefix(self.route_prefix.as_str())
            .unwrap_or_default()
            .to_string();
        let tenant = match TenantPath::parse(&below_prefix) {
            Ok(tenant) => tenant,
            Err(e) => {
                self.record("bad_request");
                return e.into_response();
            }
        };

        if let Err(denial) = self.authorize(&auth, &tenant).await {
            self.record("forbidden");
            return denial.into_response();
        }

        let outbound = match self.rewrite(request, &tenant).await {
            Ok(outbound) => outbound,
            Err(e) => {
                self.record("bad_request");
                return e.into_response();
            }
        };

        match self.forward(outbound).await {
            Ok(response) => {
                self.record("forwarded");
                response
            }
            Err(e) => {
                self.record("upstream_error");
                e.into_response()
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Authorization
    // ─────────────────────────────────────────────────────────────────────────

    /// Every failure becomes a terse 403; the log keeps the cause.
    async fn authorize(&self, auth: &AuthContext, tenant: &TenantPath) -> Result<()> {
        let scope = ScopeRef::project(tenant.project_id.as_str());
        let ctx = OpContext::with_timeout(self.authz_timeout);

        let cause = match self
            .engine
            .check_permission(&ctx, &auth.user_id, Action::Read, &scope)
            .await
        {
            Ok(true) => return Ok(()),
            Ok(false) => {
                warn!(backend = %self.name, user_id = %auth.user_id, project_id = %tenant.project_id, "Proxy request denied: no read grant");
                "denied"
            }
            Err(e) if e.is_not_found() => {
                warn!(backend = %self.name, user_id = %auth.user_id, project_id = %tenant.project_id, "Proxy request denied: unknown project");
                "unknown_project"
            }
            Err(e) if e.code() == ErrorCode::Timeout => {
                error!(backend = %self.name, user_id = %auth.user_id, project_id = %tenant.project_id, "Proxy request denied: permission check timed out");
                "timeout"
            }
            Err(e) => {
                error!(backend = %self.name, user_id = %auth.user_id, project_id = %tenant.project_id, error = %e, "Proxy request denied: store error");
                "store_error"
            }
        };

        Err(GateError::forbidden(format!(
            "proxy {} refused {} on {}: {}",
            self.name, auth.user_id, scope, cause
        )))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Forwarding
    // ─────────────────────────────────────────────────────────────────────────

    /// Build the tenant-scoped outbound request. Fails with 400 when a query
    /// expression cannot be restricted safely.
    async fn rewrite(&self, request: Request, tenant: &TenantPath) -> Result<Outbound> {
        let (parts, body) = request.into_parts();
        let resource_id = tenant.resource_id.as_str();

        let pairs = self.dialect.rewrite_params(
            query::parse_pairs(parts.uri.query().unwrap_or_default()),
            resource_id,
        )?;
        let url = format!(
            "{}{}?{}",
            self.upstream_base,
            tenant.upstream_path(&self.native_prefix),
            query::encode_pairs(&pairs)
        );

        let body = to_bytes(body, MAX_BODY_BYTES)
            .await
            .map_err(|e| GateError::validation(format!("Request body rejected: {}", e)))?;
        let body = if is_form(&parts.headers) {
            let pairs = self
                .dialect
                .rewrite_params(query::parse_pairs(&String::from_utf8_lossy(&body)), resource_id)?;
            Bytes::from(query::encode_pairs(&pairs))
        } else {
            body
        };

        let method = reqwest::Method::from_bytes(parts.method.as_str().as_bytes())
            .map_err(|e| GateError::invalid_format(format!("Unsupported method: {}", e)))?;

        let mut headers = reqwest::header::HeaderMap::new();
        for (name, value) in forwardable(&parts.headers, &self.tenant_header) {
            if let (Ok(name), Ok(value)) = (
                reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
                reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
            ) {
                headers.append(name, value);
            }
        }
        if let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(self.tenant_header.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_str(tenant.project_id.as_str()),
        ) {
            headers.insert(name, value);
        }

        Ok(Outbound {
            method,
            url,
            headers,
            body,
        })
    }

    /// Send the outbound request and stream the backend's answer back.
    async fn forward(&self, outbound: Outbound) -> Result<Response> {
        debug!(backend = %self.name, method = %outbound.method, url = %outbound.url, "Forwarding proxy request");

        let started = Instant::now();
        let upstream = self
            .client
            .request(outbound.method, &outbound.url)
            .headers(outbound.headers)
            .body(outbound.body)
            .send()
            .await;
        histogram!("scopegate_proxy_upstream_seconds", "backend" => self.name.clone())
            .record(started.elapsed().as_secs_f64());

        let upstream = upstream.map_err(|e| self.upstream_failure(e))?;
        let status = upstream_status(upstream.status().as_u16()).map_err(|code| {
            error!(backend = %self.name, status = code, "Upstream answered with an error status");
            GateError::upstream_unavailable(
                self.name.clone(),
                format!("upstream answered {}", code),
            )
        })?;

        let mut response_headers = HeaderMap::new();
        for (name, value) in upstream.headers() {
            if is_hop_by_hop(name.as_str()) || name.as_str() == "content-length" {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_str().as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                response_headers.append(name, value);
            }
        }

        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        Ok(response)
    }

    fn upstream_failure(&self, e: reqwest::Error) -> GateError {
        error!(backend = %self.name, error = %e, timeout = e.is_timeout(), "Upstream request failed");
        GateError::upstream_unavailable(self.name.clone(), e.to_string())
    }

    fn record(&self, outcome: &'static str) {
        counter!(
            "scopegate_proxy_requests_total",
            "backend" => self.name.clone(),
            "outcome" => outcome
        )
        .increment(1);
    }
}

/// A rewritten request ready to send upstream.
struct Outbound {
    method: reqwest::Method,
    url: String,
    headers: reqwest::header::HeaderMap,
    body: Bytes,
}

async fn proxy_handler(State(proxy): State<Arc<TenantProxy>>, request: Request) -> Response {
    proxy.handle(request).await
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Status returned to the caller for an upstream status. Backend auth
/// failures and server errors are not the caller's fault and surface as 502;
/// the rejected code is returned as the error.
fn upstream_status(code: u16) -> std::result::Result<StatusCode, u16> {
    match StatusCode::from_u16(code) {
        Ok(status)
            if status == StatusCode::UNAUTHORIZED
                || status == StatusCode::FORBIDDEN
                || status.is_server_error() =>
        {
            Err(code)
        }
        Ok(status) => Ok(status),
        Err(_) => Err(code),
    }
}

/// Media types compare case-insensitively and may carry parameters.
fn is_form(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|ct| ct.split(';').next())
        .map(|media| media.trim().eq_ignore_ascii_case("application/x-www-form-urlencoded"))
        .unwrap_or(false)
}

/// Request headers that survive the hop, minus the tenant header and any
/// header named in `Connection`.
fn forwardable<'a>(
    headers: &'a HeaderMap,
    tenant_header: &'a HeaderName,
) -> impl Iterator<Item = (&'a HeaderName, &'a HeaderValue)> + 'a {
    let connection_listed: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .collect();

    headers.iter().filter(move |(name, _)| {
        let name = name.as_str();
        !is_hop_by_hop(name)
            && !STRIPPED_REQUEST.contains(&name)
            && name != tenant_header.as_str()
            && !connection_listed.iter().any(|c| c == name)
    })
}

/// Mount every configured backend.
pub fn proxy_router(config: &ProxyConfig, engine: AuthorizationEngine) -> Result<Router> {
    let client = reqwest::Client::builder()
        .timeout(config.upstream_timeout)
        .build()
        .map_err(|e| GateError::configuration(format!("Failed to build HTTP client: {}", e)))?;

    let mut router = Router::new();
    for backend in &config.backends {
        let proxy = Arc::new(TenantProxy::new(
            backend,
            engine.clone(),
            client.clone(),
            config.authz_timeout,
        )?);
        tracing::info!(
            backend = %proxy.name(),
            kind = %backend.kind,
            route_prefix = %backend.route_prefix,
            upstream = %backend.upstream_url,
            "Mounted proxy backend"
        );
        router = router.merge(proxy.router());
    }
    Ok(router)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forwardable_strips_credentials_and_tenant() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer t"));
        headers.insert("cookie", HeaderValue::from_static("session=1"));
        headers.insert("accountid", HeaderValue::from_static("other-project"));
        headers.insert("connection", HeaderValue::from_static("keep-alive, x-private"));
        headers.insert("x-private", HeaderValue::from_static("1"));
        headers.insert("accept", HeaderValue::from_static("application/json"));

        let tenant = HeaderName::from_static("accountid");
        let kept: Vec<&str> = forwardable(&headers, &tenant)
            .map(|(name, _)| name.as_str())
            .collect();
        assert_eq!(kept, vec!["accept"]);
    }

    #[test]
    fn test_form_detection() {
        let mut headers = HeaderMap::new();
        assert!(!is_form(&headers));

        for content_type in [
            "application/x-www-form-urlencoded; charset=utf-8",
            "Application/X-WWW-Form-Urlencoded",
            "  APPLICATION/X-WWW-FORM-URLENCODED ;charset=utf-8",
        ] {
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
            assert!(is_form(&headers), "{}", content_type);
        }

        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded-ish"),
        );
        assert!(!is_form(&headers));
    }

    #[test]
    fn test_upstream_status_mapping() {
        assert_eq!(upstream_status(200), Ok(StatusCode::OK));
        assert_eq!(upstream_status(400), Ok(StatusCode::BAD_REQUEST));
        assert_eq!(upstream_status(422), Ok(StatusCode::UNPROCESSABLE_ENTITY));
        assert_eq!(upstream_status(401), Err(401));
        assert_eq!(upstream_status(403), Err(403));
        assert_eq!(upstream_status(500), Err(500));
        assert_eq!(upstream_status(503), Err(503));
    }
}
