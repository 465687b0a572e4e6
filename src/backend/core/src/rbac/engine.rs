//! Authorization engine.
//!
//! Answers "can user U perform action A on scope S?" by walking from S up to
//! its organization and testing the user's active assignments at each level.
//! A grant at an ancestor applies to every descendant; grants never flow
//! upward. The engine holds no state besides the store handle and caches no
//! decisions.

use metrics::counter;
use std::collections::BTreeSet;
use tracing::{debug, instrument, warn};

use super::models::{Action, RoleId, UserId};
use super::scope::{effective_scopes, ScopeRef};
use crate::context::OpContext;
use crate::error::{GateError, Result};
use crate::store::{PermissionStore, SharedStore};

/// Stateless permission evaluator over a [`Store`](crate::store::Store).
#[derive(Clone)]
pub struct AuthorizationEngine {
    store: SharedStore,
}

impl AuthorizationEngine {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Decisions
    // ─────────────────────────────────────────────────────────────────────────

    /// `Ok(false)` is a negative decision. A scope that does not exist fails
    /// with `NotFound`.
    #[instrument(skip_all, fields(user_id = %user_id, action = %action, scope = %scope))]
    pub async fn check_permission(
        &self,
        ctx: &OpContext,
        user_id: &UserId,
        action: Action,
        scope: &ScopeRef,
    ) -> Result<bool> {
        let result = self.find_grant(ctx, user_id, action, scope).await;

        let outcome = match &result {
            Ok(Some((granted_at, role_id))) => {
                debug!(granted_at = %granted_at, role_id = %role_id, "Permission granted");
                "allow"
            }
            Ok(None) => {
                debug!("Permission denied: no matching grant");
                "deny"
            }
            Err(e) if e.is_not_found() => "not_found",
            Err(_) => "error",
        };
        counter!(
            "scopegate_authz_decisions_total",
            "action" => action.as_str(),
            "scope_type" => scope.scope_type.as_str(),
            "decision" => outcome
        )
        .increment(1);

        result.map(|grant| grant.is_some())
    }

    /// Every action the user holds at `scope`, directly or inherited.
    #[instrument(skip_all, fields(user_id = %user_id, scope = %scope))]
    pub async fn list_permissions(
        &self,
        ctx: &OpContext,
        user_id: &UserId,
        scope: &ScopeRef,
    ) -> Result<BTreeSet<Action>> {
        let chain = effective_scopes(ctx, self.store.as_ref(), scope).await?;
        let mut actions = BTreeSet::new();

        for level in &chain {
            let assignments = ctx
                .run(
                    "active_assignments_for",
                    self.store.active_assignments_for(user_id, level),
                )
                .await?;

            for assignment in assignments {
                let permissions = ctx
                    .run(
                        "permissions_for_role",
                        self.store.permissions_for_role(&assignment.role_id),
                    )
                    .await?;
                actions.extend(
                    Action::ALL
                        .into_iter()
                        .filter(|action| permissions.iter().any(|p| p.grants(*action))),
                );
            }

            if actions.len() == Action::ALL.len() {
                break;
            }
        }

        Ok(actions)
    }

    /// Allow, or fail with a terse `PermissionDenied`.
    ///
    /// A missing scope is reported as a denial so callers cannot probe for
    /// existence. Store and lifecycle failures keep their own code.
    pub async fn enforce(
        &self,
        ctx: &OpContext,
        user_id: &UserId,
        action: Action,
        scope: &ScopeRef,
    ) -> Result<()> {
        match self.check_permission(ctx, user_id, action, scope).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                warn!(user_id = %user_id, action = %action, scope = %scope, "Access denied");
                Err(GateError::forbidden(format!(
                    "user {} lacks {} on {}",
                    user_id, action, scope
                )))
            }
            Err(e) if e.is_not_found() => {
                warn!(user_id = %user_id, action = %action, scope = %scope, "Access denied: unknown scope");
                Err(GateError::forbidden(format!("scope {} does not exist", scope)))
            }
            Err(e) => Err(e),
        }
    }

    /// The subset of `scopes` on which the user holds `action`. Scopes that
    /// do not exist are dropped.
    pub async fn filter_permitted(
        &self,
        ctx: &OpContext,
        user_id: &UserId,
        action: Action,
        scopes: &[ScopeRef],
    ) -> Result<Vec<ScopeRef>> {
        let mut permitted = Vec::with_capacity(scopes.len());
        for scope in scopes {
            match self.check_permission(ctx, user_id, action, scope).await {
                Ok(true) => permitted.push(scope.clone()),
                Ok(false) => {}
                Err(e) if e.is_not_found() => {
                    debug!(scope = %scope, "Skipping unknown scope");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(permitted)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────────────────

    /// First level (nearest first) and role that grant `action`.
    async fn find_grant(
        &self,
        ctx: &OpContext,
        user_id: &UserId,
        action: Action,
        scope: &ScopeRef,
    ) -> Result<Option<(ScopeRef, RoleId)>> {
        let chain = effective_scopes(ctx, self.store.as_ref(), scope).await?;

        for level in chain {
            let assignments = ctx
                .run(
                    "active_assignments_for",
                    self.store.active_assignments_for(user_id, &level),
                )
                .await?;

            for assignment in assignments {
                let permissions = ctx
                    .run(
                        "permissions_for_role",
                        self.store.permissions_for_role(&assignment.role_id),
                    )
                    .await?;
                if permissions.iter().any(|p| p.grants(action)) {
                    return Ok(Some((level, assignment.role_id)));
                }
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rbac::models::{Organization, Project, RoleAssignment};
    use crate::store::{MemoryStore, TransactionalStore};
    use std::sync::Arc;

    async fn fixture() -> (MemoryStore, AuthorizationEngine, Organization, Project) {
        let store = MemoryStore::new();
        let org = Organization::new("Acme");
        let project = Project::new(org.id.clone(), "web", None);

        let mut tx = store.begin().await.unwrap();
        tx.insert_organization(&org).await.unwrap();
        tx.insert_project(&project).await.unwrap();
        tx.commit().await.unwrap();

        let engine = AuthorizationEngine::new(Arc::new(store.clone()));
        (store, engine, org, project)
    }

    #[tokio::test]
    async fn test_grant_at_org_reaches_project() {
        let (store, engine, org, project) = fixture().await;
        let ctx = OpContext::new();
        let user = UserId::new("alice");

        store
            .seed_assignment(RoleAssignment::new(user.clone(), RoleId::new("viewer"), org.scope()))
            .await;

        assert!(engine
            .check_permission(&ctx, &user, Action::Read, &project.scope())
            .await
            .unwrap());
        assert!(!engine
            .check_permission(&ctx, &user, Action::Write, &project.scope())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_grant_at_project_does_not_reach_org() {
        let (store, engine, org, project) = fixture().await;
        let ctx = OpContext::new();
        let user = UserId::new("bob");

        store
            .seed_assignment(RoleAssignment::new(
                user.clone(),
                RoleId::new("owner"),
                project.scope(),
            ))
            .await;

        assert!(!engine
            .check_permission(&ctx, &user, Action::Read, &org.scope())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_unknown_scope_is_an_error_not_a_denial() {
        let (_store, engine, _org, _project) = fixture().await;
        let ctx = OpContext::new();

        let err = engine
            .check_permission(&ctx, &UserId::new("alice"), Action::Read, &ScopeRef::project("nope"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let err = engine
            .enforce(&ctx, &UserId::new("alice"), Action::Read, &ScopeRef::project("nope"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::PermissionDenied);
    }

    #[tokio::test]
    async fn test_list_permissions_unions_levels() {
        let (store, engine, org, project) = fixture().await;
        let ctx = OpContext::new();
        let user = UserId::new("carol");

        store
            .seed_assignment(RoleAssignment::new(user.clone(), RoleId::new("viewer"), org.scope()))
            .await;
        store
            .seed_assignment(RoleAssignment::new(
                user.clone(),
                RoleId::new("editor"),
                project.scope(),
            ))
            .await;

        let actions = engine
            .list_permissions(&ctx, &user, &project.scope())
            .await
            .unwrap();
        assert_eq!(
            actions.into_iter().collect::<Vec<_>>(),
            vec![Action::Read, Action::Write, Action::Delete]
        );
    }
}
