//! Persistence seams for the authorization engine and the assignment manager.
//!
//! Reads go through [`ScopeStore`] and [`PermissionStore`], one statement per
//! call. Writes go through a [`StoreTransaction`] obtained from
//! [`TransactionalStore::begin`]; dropping a transaction without calling
//! [`StoreTransaction::commit`] rolls it back.
//!
//! Two implementations ship with the crate:
//! - [`PgStore`]: PostgreSQL via `sqlx`
//! - [`MemoryStore`]: in-process, for tests and local development

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

use crate::error::Result;
use crate::rbac::models::{
    Organization, Permission, Project, Resource, Role, RoleAssignment, RoleId, User, UserId,
};
use crate::rbac::scope::ScopeRef;

pub use memory::{FailPoint, MemoryStore};
pub use postgres::PgStore;

/// Result of inserting a role assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantOutcome {
    /// A new row was written.
    Created,
    /// An active row with the same grant key already existed; nothing changed.
    AlreadyActive,
    /// An expired row with the same grant key was given the new expiry.
    Reactivated,
}

impl GrantOutcome {
    /// Whether the call changed stored state.
    pub fn changed(&self) -> bool {
        !matches!(self, Self::AlreadyActive)
    }
}

/// Scope-tree navigation.
#[async_trait]
pub trait ScopeStore: Send + Sync {
    /// Parent of `scope`, `None` for an organization. `NotFound` if the scope
    /// does not exist.
    async fn parent_scope(&self, scope: &ScopeRef) -> Result<Option<ScopeRef>>;
}

/// Read-only lookups over roles, permissions and active assignments.
///
/// "Active" means `expires_at` is unset or in the future at read time.
#[async_trait]
pub trait PermissionStore: Send + Sync {
    async fn role_by_name(&self, name: &str) -> Result<Option<Role>>;

    async fn permissions_for_role(&self, role_id: &RoleId) -> Result<HashSet<Permission>>;

    /// All active assignments for a user, at any scope.
    async fn active_assignments(&self, user_id: &UserId) -> Result<Vec<RoleAssignment>>;

    /// All active assignments anchored exactly at `scope`.
    async fn active_assignments_at(&self, scope: &ScopeRef) -> Result<Vec<RoleAssignment>>;

    /// Active assignments for one user anchored exactly at `scope`.
    async fn active_assignments_for(
        &self,
        user_id: &UserId,
        scope: &ScopeRef,
    ) -> Result<Vec<RoleAssignment>>;

    async fn user_exists(&self, user_id: &UserId) -> Result<bool>;
}

#[async_trait]
pub trait TransactionalStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>>;
}

/// A unit of work. Nothing is visible to readers until [`commit`](Self::commit).
#[async_trait]
pub trait StoreTransaction: Send {
    async fn role_by_name(&mut self, name: &str) -> Result<Option<Role>>;

    async fn find_user(&mut self, user_id: &UserId) -> Result<Option<User>>;

    /// Insert the user unless a record with the same id exists. Returns
    /// whether a row was created.
    async fn insert_user(&mut self, user: &User) -> Result<bool>;

    async fn delete_user(&mut self, user_id: &UserId) -> Result<bool>;

    async fn insert_organization(&mut self, organization: &Organization) -> Result<()>;

    /// `NotFound` if the parent organization does not exist.
    async fn insert_project(&mut self, project: &Project) -> Result<()>;

    /// `NotFound` if the parent project does not exist.
    async fn insert_resource(&mut self, resource: &Resource) -> Result<()>;

    async fn scope_exists(&mut self, scope: &ScopeRef) -> Result<bool>;

    async fn insert_assignment(&mut self, assignment: &RoleAssignment) -> Result<GrantOutcome>;

    async fn delete_assignment(
        &mut self,
        user_id: &UserId,
        role_id: &RoleId,
        scope: &ScopeRef,
    ) -> Result<bool>;

    /// Re-key every assignment of `from` to `to`. Rows `to` already holds
    /// actively are dropped from `from` first. Returns the number of rows moved.
    async fn reassign_user(&mut self, from: &UserId, to: &UserId) -> Result<u64>;

    async fn commit(self: Box<Self>) -> Result<()>;
}

/// Everything the engine and the manager need from persistence.
pub trait Store: ScopeStore + PermissionStore + TransactionalStore {}

impl<T> Store for T where T: ScopeStore + PermissionStore + TransactionalStore {}

/// Shared store handle.
pub type SharedStore = Arc<dyn Store>;
