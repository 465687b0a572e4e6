//! Role assignment lifecycle.
//!
//! Every operation here is one store transaction: either all of its writes
//! land or none do. Each step runs under the caller's [`OpContext`], so a
//! cancelled or timed-out operation drops its transaction, which rolls it
//! back.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument};

use super::identity::is_valid_email;
use super::models::{
    Organization, OrganizationId, Project, ProjectId, Resource, Role, RoleAssignment, UserId, User,
};
use super::roles::PredefinedRole;
use super::scope::ScopeRef;
use crate::context::OpContext;
use crate::error::{GateError, Result};
use crate::store::{GrantOutcome, SharedStore, StoreTransaction, TransactionalStore};

/// Upper bound on entity names.
pub const MAX_NAME_LEN: usize = 200;

/// Input to [`RoleAssignmentManager::assign_role`].
#[derive(Debug, Clone)]
pub struct AssignRoleRequest {
    /// Existing user id, or an email address to invite.
    pub user_id: UserId,
    pub role_name: String,
    pub scope: ScopeRef,
    pub assigned_by: Option<UserId>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssignRoleOutcome {
    pub user_id: UserId,
    pub role: Role,
    pub scope: ScopeRef,
    pub outcome: GrantOutcome,
    /// A placeholder user was created for an invited email.
    pub placeholder_created: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct LoginReconciliation {
    pub user_created: bool,
    pub assignments_transferred: u64,
}

/// Creates scope-tree entities with their owner grant and manages role
/// assignments.
#[derive(Clone)]
pub struct RoleAssignmentManager {
    store: SharedStore,
}

impl RoleAssignmentManager {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Entity creation
    // ─────────────────────────────────────────────────────────────────────────

    /// Create an organization and make `owner` its Owner.
    #[instrument(skip_all, fields(owner = %owner))]
    pub async fn create_organization(
        &self,
        ctx: &OpContext,
        name: &str,
        owner: &UserId,
    ) -> Result<Organization> {
        let organization = Organization::new(validate_name(name)?);

        let mut tx = ctx.run("begin", self.store.begin()).await?;
        ctx.run(
            "insert_organization",
            tx.insert_organization(&organization),
        )
        .await?;
        self.grant_owner(ctx, tx.as_mut(), owner, organization.scope())
            .await?;
        ctx.run("commit", tx.commit()).await?;

        info!(
            organization_id = %organization.id,
            owner = %owner,
            "Organization created"
        );
        Ok(organization)
    }

    /// Create a project under an existing organization and make `owner` its
    /// Owner.
    #[instrument(skip_all, fields(organization_id = %organization_id, owner = %owner))]
    pub async fn create_project(
        &self,
        ctx: &OpContext,
        organization_id: &OrganizationId,
        name: &str,
        description: Option<String>,
        owner: &UserId,
    ) -> Result<Project> {
        let project = Project::new(organization_id.clone(), validate_name(name)?, description);

        let mut tx = ctx.run("begin", self.store.begin()).await?;
        ctx.run("insert_project", tx.insert_project(&project)).await?;
        self.grant_owner(ctx, tx.as_mut(), owner, project.scope())
            .await?;
        ctx.run("commit", tx.commit()).await?;

        info!(
            project_id = %project.id,
            organization_id = %organization_id,
            owner = %owner,
            "Project created"
        );
        Ok(project)
    }

    /// Create a resource under an existing project. Access is inherited from
    /// the project; no grant is written.
    #[instrument(skip_all, fields(project_id = %project_id))]
    pub async fn create_resource(
        &self,
        ctx: &OpContext,
        project_id: &ProjectId,
        name: &str,
        kind: &str,
    ) -> Result<Resource> {
        let kind = kind.trim();
        if kind.is_empty() {
            return Err(GateError::validation("Resource kind must not be empty"));
        }
        let resource = Resource::new(project_id.clone(), validate_name(name)?, kind);

        let mut tx = ctx.run("begin", self.store.begin()).await?;
        ctx.run("insert_resource", tx.insert_resource(&resource))
            .await?;
        ctx.run("commit", tx.commit()).await?;

        info!(resource_id = %resource.id, project_id = %project_id, "Resource created");
        Ok(resource)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Grants
    // ─────────────────────────────────────────────────────────────────────────

    /// Grant a role at a scope.
    ///
    /// An unknown user id that is a valid email address gets a placeholder
    /// record; any other unknown id fails with `InvalidIdentity`. Granting an
    /// active duplicate is a no-op.
    #[instrument(skip_all, fields(user_id = %request.user_id, role = %request.role_name, scope = %request.scope))]
    pub async fn assign_role(
        &self,
        ctx: &OpContext,
        request: AssignRoleRequest,
    ) -> Result<AssignRoleOutcome> {
        if let Some(expires_at) = request.expires_at {
            if expires_at <= Utc::now() {
                return Err(GateError::validation("expires_at must be in the future"));
            }
        }

        let mut tx = ctx.run("begin", self.store.begin()).await?;

        let role = ctx
            .run("role_by_name", tx.role_by_name(&request.role_name))
            .await?
            .ok_or_else(|| GateError::role_not_found(&request.role_name))?;

        if !ctx.run("scope_exists", tx.scope_exists(&request.scope)).await? {
            return Err(GateError::not_found(
                request.scope.scope_type.as_str(),
                &request.scope.scope_id,
            ));
        }

        let existing = ctx
            .run("find_user", tx.find_user(&request.user_id))
            .await?;
        let placeholder_created = match existing {
            Some(_) => false,
            None if is_valid_email(request.user_id.as_str()) => {
                let placeholder = User::placeholder(request.user_id.as_str());
                ctx.run("insert_user", tx.insert_user(&placeholder)).await?
            }
            None => return Err(GateError::invalid_identity(request.user_id.as_str())),
        };

        let assignment = RoleAssignment::new(
            request.user_id.clone(),
            role.id.clone(),
            request.scope.clone(),
        )
        .assigned_by(request.assigned_by.clone())
        .with_expiry(request.expires_at);

        let outcome = ctx
            .run("insert_assignment", tx.insert_assignment(&assignment))
            .await?;
        ctx.run("commit", tx.commit()).await?;

        info!(
            user_id = %request.user_id,
            role_id = %role.id,
            scope = %request.scope,
            outcome = ?outcome,
            placeholder_created,
            "Role assigned"
        );

        Ok(AssignRoleOutcome {
            user_id: request.user_id,
            role,
            scope: request.scope,
            outcome,
            placeholder_created,
        })
    }

    /// Remove a grant. Returns whether a row was deleted.
    #[instrument(skip_all, fields(user_id = %user_id, role = %role_name, scope = %scope))]
    pub async fn revoke_role(
        &self,
        ctx: &OpContext,
        user_id: &UserId,
        role_name: &str,
        scope: &ScopeRef,
    ) -> Result<bool> {
        let mut tx = ctx.run("begin", self.store.begin()).await?;

        let role = ctx
            .run("role_by_name", tx.role_by_name(role_name))
            .await?
            .ok_or_else(|| GateError::role_not_found(role_name))?;

        let removed = ctx
            .run(
                "delete_assignment",
                tx.delete_assignment(user_id, &role.id, scope),
            )
            .await?;
        ctx.run("commit", tx.commit()).await?;

        info!(user_id = %user_id, role_id = %role.id, scope = %scope, removed, "Role revoked");
        Ok(removed)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Placeholder identities
    // ─────────────────────────────────────────────────────────────────────────

    /// Move every assignment of the placeholder keyed by `placeholder_email`
    /// to `real_user_id` and delete the placeholder. Returns the number of
    /// assignments moved.
    #[instrument(skip_all, fields(placeholder = %placeholder_email, user_id = %real_user_id))]
    pub async fn transfer_placeholder_assignments(
        &self,
        ctx: &OpContext,
        placeholder_email: &str,
        real_user_id: &UserId,
    ) -> Result<u64> {
        let placeholder_id = UserId::new(placeholder_email);
        if &placeholder_id == real_user_id {
            return Err(GateError::validation(
                "A placeholder cannot be transferred onto itself",
            ));
        }

        let mut tx = ctx.run("begin", self.store.begin()).await?;

        match ctx.run("find_user", tx.find_user(&placeholder_id)).await? {
            Some(user) if user.is_placeholder => {}
            Some(_) => {
                return Err(GateError::validation(format!(
                    "User '{}' is not a placeholder",
                    placeholder_email
                )))
            }
            None => return Err(GateError::not_found("user", placeholder_email)),
        }

        let real_user = User::new(real_user_id.clone(), Some(placeholder_email.to_string()));
        ctx.run("insert_user", tx.insert_user(&real_user)).await?;

        let moved = move_placeholder(ctx, tx.as_mut(), &placeholder_id, real_user_id).await?;
        ctx.run("commit", tx.commit()).await?;

        info!(
            placeholder = %placeholder_email,
            user_id = %real_user_id,
            moved,
            "Placeholder assignments transferred"
        );
        Ok(moved)
    }

    /// Run after every successful authentication: confirm the user record and
    /// claim a pending invitation addressed to the verified email.
    #[instrument(skip_all, fields(user_id = %user_id))]
    pub async fn reconcile_login(
        &self,
        ctx: &OpContext,
        user_id: &UserId,
        email: Option<&str>,
    ) -> Result<LoginReconciliation> {
        let mut tx = ctx.run("begin", self.store.begin()).await?;

        let user = User::new(user_id.clone(), email.map(str::to_string));
        let user_created = ctx.run("insert_user", tx.insert_user(&user)).await?;

        let mut assignments_transferred = 0;
        if let Some(email) = email.filter(|e| is_valid_email(e) && *e != user_id.as_str()) {
            let placeholder_id = UserId::new(email);
            let pending = ctx.run("find_user", tx.find_user(&placeholder_id)).await?;
            if pending.map_or(false, |u| u.is_placeholder) {
                assignments_transferred =
                    move_placeholder(ctx, tx.as_mut(), &placeholder_id, user_id).await?;
            }
        }

        ctx.run("commit", tx.commit()).await?;

        if user_created || assignments_transferred > 0 {
            info!(
                user_id = %user_id,
                user_created,
                assignments_transferred,
                "Login reconciled"
            );
        }
        Ok(LoginReconciliation {
            user_created,
            assignments_transferred,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────────────────

    async fn grant_owner(
        &self,
        ctx: &OpContext,
        tx: &mut dyn StoreTransaction,
        owner: &UserId,
        scope: ScopeRef,
    ) -> Result<()> {
        ctx.run("insert_user", tx.insert_user(&User::new(owner.clone(), None)))
            .await?;

        let role = ctx
            .run("role_by_name", tx.role_by_name(PredefinedRole::Owner.name()))
            .await?
            .ok_or_else(|| GateError::role_not_found(PredefinedRole::Owner.name()))?;

        let assignment = RoleAssignment::new(owner.clone(), role.id, scope).assigned_by(Some(owner.clone()));
        let outcome = ctx
            .run("insert_assignment", tx.insert_assignment(&assignment))
            .await?;
        debug!(owner = %owner, scope = %assignment.scope, outcome = ?outcome, "Owner granted");
        Ok(())
    }
}

async fn move_placeholder(
    ctx: &OpContext,
    tx: &mut dyn StoreTransaction,
    placeholder: &UserId,
    real_user: &UserId,
) -> Result<u64> {
    let moved = ctx
        .run("reassign_user", tx.reassign_user(placeholder, real_user))
        .await?;
    ctx.run("delete_user", tx.delete_user(placeholder)).await?;
    Ok(moved)
}

fn validate_name(name: &str) -> Result<&str> {
    let name = name.trim();
    if name.is_empty() {
        return Err(GateError::validation("Name must not be empty"));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(GateError::validation(format!(
            "Name must be at most {} characters",
            MAX_NAME_LEN
        )));
    }
    Ok(name)
}
