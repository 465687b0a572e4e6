//! Scope-hierarchical role-based access control.
//!
//! This module provides:
//! - **Models**: identifiers, actions, permissions, roles, assignments, users
//!   and the organization/project/resource entities
//! - **Scope tree**: typed scope references and the ancestor walk
//! - **Authorization Engine**: decides whether a user may perform an action
//!   at a scope, with grants inherited downward
//! - **Role Assignment Manager**: transactional entity creation, grants,
//!   revocation and placeholder transfer
//! - **Predefined Roles**: Owner, Editor, Viewer
//!
//! # Usage
//!
//! ```rust,ignore
//! use scopegate_core::context::OpContext;
//! use scopegate_core::rbac::{Action, AuthorizationEngine, ScopeRef};
//!
//! let engine = AuthorizationEngine::new(store);
//! let allowed = engine
//!     .check_permission(&OpContext::new(), &user_id, Action::Read, &ScopeRef::project(id))
//!     .await?;
//! ```

pub mod assignments;
pub mod engine;
pub mod identity;
pub mod models;
pub mod roles;
pub mod scope;

pub use assignments::{
    AssignRoleOutcome, AssignRoleRequest, LoginReconciliation, RoleAssignmentManager,
};
pub use engine::AuthorizationEngine;
pub use identity::is_valid_email;
pub use models::{
    Action, Organization, OrganizationId, Permission, Project, ProjectId, Resource, ResourceId,
    Role, RoleAssignment, RoleId, User, UserId, PERMISSION_DOMAIN,
};
pub use roles::PredefinedRole;
pub use scope::{effective_scopes, ScopeRef, ScopeType};
