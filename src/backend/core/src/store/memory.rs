//! In-memory store for tests and local development.
//!
//! State lives behind one `tokio::sync::Mutex`. A transaction holds the lock
//! for its lifetime and works on a copy of the state, which replaces the
//! shared state on commit. Fail points and an artificial latency let tests
//! exercise rollback and timeout paths.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashSet;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{
    GrantOutcome, PermissionStore, ScopeStore, StoreTransaction, TransactionalStore,
};
use crate::error::{GateError, Result};
use crate::rbac::models::{
    Organization, OrganizationId, Permission, Project, ProjectId, Resource, ResourceId, Role,
    RoleAssignment, RoleId, User, UserId,
};
use crate::rbac::roles::PredefinedRole;
use crate::rbac::scope::{ScopeRef, ScopeType};

/// Store operations that can be made to fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    /// Every read returns `StoreUnavailable`.
    Reads,
    InsertUser,
    InsertOrganization,
    InsertProject,
    InsertAssignment,
    ReassignUser,
    DeleteUser,
    Commit,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    users: HashMap<UserId, User>,
    organizations: HashMap<OrganizationId, Organization>,
    projects: HashMap<ProjectId, Project>,
    resources: HashMap<ResourceId, Resource>,
    roles: HashMap<RoleId, Role>,
    role_permissions: HashMap<RoleId, HashSet<Permission>>,
    assignments: Vec<RoleAssignment>,
}

impl MemoryState {
    fn seeded() -> Self {
        let mut state = Self::default();
        for (role, permissions) in PredefinedRole::all_defaults() {
            state.role_permissions.insert(role.id.clone(), permissions);
            state.roles.insert(role.id.clone(), role);
        }
        state
    }

    fn role_by_name(&self, name: &str) -> Option<Role> {
        self.roles
            .values()
            .find(|r| r.name.eq_ignore_ascii_case(name))
            .cloned()
    }

    fn scope_exists(&self, scope: &ScopeRef) -> bool {
        let id = scope.scope_id.as_str();
        match scope.scope_type {
            ScopeType::Organization => self.organizations.contains_key(&OrganizationId::new(id)),
            ScopeType::Project => self.projects.contains_key(&ProjectId::new(id)),
            ScopeType::Resource => self.resources.contains_key(&ResourceId::new(id)),
        }
    }

    fn active<'a>(
        &'a self,
        filter: impl Fn(&RoleAssignment) -> bool + 'a,
    ) -> impl Iterator<Item = &'a RoleAssignment> + 'a {
        let now = Utc::now();
        self.assignments
            .iter()
            .filter(move |a| a.is_active_at(now) && filter(a))
    }
}

/// In-memory implementation of every store trait.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    fail_points: Arc<DashSet<FailPoint>>,
    latency_ms: Arc<AtomicU64>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// A store seeded with the predefined roles.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::seeded())),
            fail_points: Arc::new(DashSet::new()),
            latency_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn fail_on(&self, point: FailPoint) {
        self.fail_points.insert(point);
    }

    pub fn clear_failures(&self) {
        self.fail_points.clear();
    }

    /// Delay every read and every transaction step by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Insert an assignment row directly, bypassing all checks (fixtures).
    pub async fn seed_assignment(&self, assignment: RoleAssignment) {
        self.state.lock().await.assignments.push(assignment);
    }

    /// Every assignment row for `user_id`, expired ones included.
    pub async fn all_assignments_for(&self, user_id: &UserId) -> Vec<RoleAssignment> {
        let state = self.state.lock().await;
        state
            .assignments
            .iter()
            .filter(|a| &a.user_id == user_id)
            .cloned()
            .collect()
    }

    pub async fn find_user(&self, user_id: &UserId) -> Option<User> {
        self.state.lock().await.users.get(user_id).cloned()
    }

    pub async fn organization_count(&self) -> usize {
        self.state.lock().await.organizations.len()
    }

    pub async fn project_count(&self) -> usize {
        self.state.lock().await.projects.len()
    }

    async fn simulate_io(&self) {
        simulate_io(&self.latency_ms).await;
    }

    fn check_reads(&self) -> Result<()> {
        check(&self.fail_points, FailPoint::Reads)
    }
}

async fn simulate_io(latency_ms: &AtomicU64) {
    let ms = latency_ms.load(Ordering::Relaxed);
    if ms > 0 {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

fn check(fail_points: &DashSet<FailPoint>, point: FailPoint) -> Result<()> {
    if fail_points.contains(&point) {
        return Err(GateError::store_unavailable(format!(
            "injected failure at {:?}",
            point
        )));
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Reads
// ═══════════════════════════════════════════════════════════════════════════════

#[async_trait]
impl ScopeStore for MemoryStore {
    async fn parent_scope(&self, scope: &ScopeRef) -> Result<Option<ScopeRef>> {
        self.simulate_io().await;
        self.check_reads()?;

        let state = self.state.lock().await;
        let id = scope.scope_id.as_str();
        let parent = match scope.scope_type {
            ScopeType::Organization => state
                .organizations
                .get(&OrganizationId::new(id))
                .map(|_| None),
            ScopeType::Project => state
                .projects
                .get(&ProjectId::new(id))
                .map(|p| Some(ScopeRef::organization(p.organization_id.as_str()))),
            ScopeType::Resource => state
                .resources
                .get(&ResourceId::new(id))
                .map(|r| Some(ScopeRef::project(r.project_id.as_str()))),
        };

        parent.ok_or_else(|| GateError::not_found(scope.scope_type.as_str(), id))
    }
}

#[async_trait]
impl PermissionStore for MemoryStore {
    async fn role_by_name(&self, name: &str) -> Result<Option<Role>> {
        self.simulate_io().await;
        self.check_reads()?;
        Ok(self.state.lock().await.role_by_name(name))
    }

    async fn permissions_for_role(&self, role_id: &RoleId) -> Result<HashSet<Permission>> {
        self.simulate_io().await;
        self.check_reads()?;
        let state = self.state.lock().await;
        Ok(state.role_permissions.get(role_id).cloned().unwrap_or_default())
    }

    async fn active_assignments(&self, user_id: &UserId) -> Result<Vec<RoleAssignment>> {
        self.simulate_io().await;
        self.check_reads()?;
        let state = self.state.lock().await;
        Ok(state.active(|a| &a.user_id == user_id).cloned().collect())
    }

    async fn active_assignments_at(&self, scope: &ScopeRef) -> Result<Vec<RoleAssignment>> {
        self.simulate_io().await;
        self.check_reads()?;
        let state = self.state.lock().await;
        Ok(state.active(|a| &a.scope == scope).cloned().collect())
    }

    async fn active_assignments_for(
        &self,
        user_id: &UserId,
        scope: &ScopeRef,
    ) -> Result<Vec<RoleAssignment>> {
        self.simulate_io().await;
        self.check_reads()?;
        let state = self.state.lock().await;
        Ok(state
            .active(|a| &a.user_id == user_id && &a.scope == scope)
            .cloned()
            .collect())
    }

    async fn user_exists(&self, user_id: &UserId) -> Result<bool> {
        self.simulate_io().await;
        self.check_reads()?;
        Ok(self.state.lock().await.users.contains_key(user_id))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Transactions
// ═══════════════════════════════════════════════════════════════════════════════

#[async_trait]
impl TransactionalStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        self.simulate_io().await;
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTransaction {
            guard,
            working,
            fail_points: self.fail_points.clone(),
            latency_ms: self.latency_ms.clone(),
        }))
    }
}

/// Holds the store lock; changes land on commit.
pub struct MemoryTransaction {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
    fail_points: Arc<DashSet<FailPoint>>,
    latency_ms: Arc<AtomicU64>,
}

impl MemoryTransaction {
    async fn step(&self, point: Option<FailPoint>) -> Result<()> {
        simulate_io(&self.latency_ms).await;
        match point {
            Some(point) => check(&self.fail_points, point),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn role_by_name(&mut self, name: &str) -> Result<Option<Role>> {
        self.step(None).await?;
        Ok(self.working.role_by_name(name))
    }

    async fn find_user(&mut self, user_id: &UserId) -> Result<Option<User>> {
        self.step(None).await?;
        Ok(self.working.users.get(user_id).cloned())
    }

    async fn insert_user(&mut self, user: &User) -> Result<bool> {
        self.step(Some(FailPoint::InsertUser)).await?;
        if self.working.users.contains_key(&user.id) {
            return Ok(false);
        }
        self.working.users.insert(user.id.clone(), user.clone());
        Ok(true)
    }

    async fn delete_user(&mut self, user_id: &UserId) -> Result<bool> {
        self.step(Some(FailPoint::DeleteUser)).await?;
        let removed = self.working.users.remove(user_id).is_some();
        if removed {
            self.working.assignments.retain(|a| &a.user_id != user_id);
        }
        Ok(removed)
    }

    async fn insert_organization(&mut self, organization: &Organization) -> Result<()> {
        self.step(Some(FailPoint::InsertOrganization)).await?;
        self.working
            .organizations
            .insert(organization.id.clone(), organization.clone());
        Ok(())
    }

    async fn insert_project(&mut self, project: &Project) -> Result<()> {
        self.step(Some(FailPoint::InsertProject)).await?;
        if !self
            .working
            .organizations
            .contains_key(&project.organization_id)
        {
            return Err(GateError::not_found(
                "organization",
                project.organization_id.as_str(),
            ));
        }
        self.working.projects.insert(project.id.clone(), project.clone());
        Ok(())
    }

    async fn insert_resource(&mut self, resource: &Resource) -> Result<()> {
        self.step(None).await?;
        if !self.working.projects.contains_key(&resource.project_id) {
            return Err(GateError::not_found("project", resource.project_id.as_str()));
        }
        self.working
            .resources
            .insert(resource.id.clone(), resource.clone());
        Ok(())
    }

    async fn scope_exists(&mut self, scope: &ScopeRef) -> Result<bool> {
        self.step(None).await?;
        Ok(self.working.scope_exists(scope))
    }

    async fn insert_assignment(&mut self, assignment: &RoleAssignment) -> Result<GrantOutcome> {
        self.step(Some(FailPoint::InsertAssignment)).await?;
        let now = Utc::now();

        if let Some(existing) = self
            .working
            .assignments
            .iter_mut()
            .find(|a| a.same_grant(assignment))
        {
            if existing.is_active_at(now) {
                return Ok(GrantOutcome::AlreadyActive);
            }
            existing.expires_at = assignment.expires_at;
            existing.assigned_by = assignment.assigned_by.clone();
            existing.created_at = assignment.created_at;
            return Ok(GrantOutcome::Reactivated);
        }

        self.working.assignments.push(assignment.clone());
        Ok(GrantOutcome::Created)
    }

    async fn delete_assignment(
        &mut self,
        user_id: &UserId,
        role_id: &RoleId,
        scope: &ScopeRef,
    ) -> Result<bool> {
        self.step(None).await?;
        let before = self.working.assignments.len();
        self.working.assignments.retain(|a| {
            !(&a.user_id == user_id && &a.role_id == role_id && &a.scope == scope)
        });
        Ok(self.working.assignments.len() != before)
    }

    async fn reassign_user(&mut self, from: &UserId, to: &UserId) -> Result<u64> {
        self.step(Some(FailPoint::ReassignUser)).await?;
        let now = Utc::now();

        let held: Vec<(RoleId, ScopeRef, bool)> = self
            .working
            .assignments
            .iter()
            .filter(|a| &a.user_id == to)
            .map(|a| (a.role_id.clone(), a.scope.clone(), a.is_active_at(now)))
            .collect();
        let collides = |a: &RoleAssignment, active: bool| {
            held.iter()
                .any(|(role, scope, act)| *act == active && role == &a.role_id && scope == &a.scope)
        };

        let from_keys: Vec<(RoleId, ScopeRef)> = self
            .working
            .assignments
            .iter()
            .filter(|a| &a.user_id == from)
            .map(|a| (a.role_id.clone(), a.scope.clone()))
            .collect();

        // An expired row of the target yields to the incoming row; an active one wins.
        self.working.assignments.retain(|a| {
            let expired_target = &a.user_id == to
                && !a.is_active_at(now)
                && from_keys.iter().any(|(r, s)| r == &a.role_id && s == &a.scope);
            let shadowed_source = &a.user_id == from && collides(a, true);
            !(expired_target || shadowed_source)
        });

        let mut moved = 0;
        for assignment in self.working.assignments.iter_mut() {
            if &assignment.user_id == from {
                assignment.user_id = to.clone();
                moved += 1;
            }
        }
        Ok(moved)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.step(Some(FailPoint::Commit)).await?;
        let MemoryTransaction {
            mut guard, working, ..
        } = *self;
        *guard = working;
        Ok(())
    }
}
