#![allow(clippy::result_large_err)]
//! # ScopeGate Core
//!
//! Scope-hierarchical authorization for multi-tenant platforms, plus a
//! reverse proxy that confines observability queries to one tenant.
//!
//! ## Architecture
//!
//! - **RBAC**: organization → project → resource scope tree, predefined roles,
//!   inherited grants and the authorization engine
//! - **Assignments**: transactional entity creation, grants, revocation and
//!   placeholder (invited) identities
//! - **Store**: persistence seams with PostgreSQL and in-memory backends
//! - **Proxy**: tenant-enforcing forwarding to logs and metrics backends
//! - **Middleware**: bearer token verification and login reconciliation
//! - **API**: management endpoints, health, readiness and metrics
//! - **Observability**: structured logging, OTLP tracing, Prometheus metrics

pub mod api;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod middleware;
pub mod observability;
pub mod proxy;
pub mod rbac;
pub mod store;

pub use error::{ErrorCode, ErrorDetails, ErrorSeverity, GateError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::context::OpContext;
    pub use crate::error::{ErrorCode, GateError, Result};
    pub use crate::middleware::{
        AuthContext, AuthError, AuthLayer, IdentityVerifier, JwtVerifier, StaticTokenVerifier,
        VerifiedIdentity,
    };
    pub use crate::proxy::{QueryDialect, TenantPath, TenantProxy};
    pub use crate::rbac::{
        Action, AssignRoleOutcome, AssignRoleRequest, AuthorizationEngine, Organization,
        OrganizationId, Permission, PredefinedRole, Project, ProjectId, Resource, ResourceId,
        Role, RoleAssignment, RoleAssignmentManager, RoleId, ScopeRef, ScopeType, User, UserId,
    };
    pub use crate::store::{
        GrantOutcome, MemoryStore, PermissionStore, PgStore, ScopeStore, SharedStore, Store,
        StoreTransaction, TransactionalStore,
    };
}
