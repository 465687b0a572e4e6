//! PostgreSQL store.
//!
//! Every read is one statement on a pooled connection. Expiry is evaluated
//! against the database clock. Role permissions are fixed per role and cached
//! after the first lookup.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::{Postgres, Transaction};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use super::{
    GrantOutcome, PermissionStore, ScopeStore, StoreTransaction, TransactionalStore,
};
use crate::db::Database;
use crate::error::{GateError, Result};
use crate::rbac::models::{
    Organization, Permission, Project, Resource, Role, RoleAssignment, RoleId, User, UserId,
};
use crate::rbac::scope::{ScopeRef, ScopeType};

const ASSIGNMENT_COLUMNS: &str =
    "id, user_id, role_id, scope_type, scope_id, assigned_by, created_at, expires_at";

const ACTIVE: &str = "(expires_at IS NULL OR expires_at > NOW())";

// ═══════════════════════════════════════════════════════════════════════════════
// Row types
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, sqlx::FromRow)]
struct AssignmentRow {
    id: Uuid,
    user_id: String,
    role_id: String,
    scope_type: String,
    scope_id: String,
    assigned_by: Option<String>,
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

impl TryFrom<AssignmentRow> for RoleAssignment {
    type Error = GateError;

    fn try_from(row: AssignmentRow) -> Result<Self> {
        let scope_type: ScopeType = row.scope_type.parse().map_err(|_| {
            GateError::internal(format!(
                "assignment {} has unknown scope type {}",
                row.id, row.scope_type
            ))
        })?;

        Ok(RoleAssignment {
            id: row.id,
            user_id: UserId::new(row.user_id),
            role_id: RoleId::new(row.role_id),
            scope: ScopeRef::new(scope_type, row.scope_id),
            assigned_by: row.assigned_by.map(UserId::new),
            created_at: row.created_at,
            expires_at: row.expires_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RoleRow {
    id: String,
    name: String,
    display_name: String,
    is_system: bool,
}

impl From<RoleRow> for Role {
    fn from(row: RoleRow) -> Self {
        Role {
            id: RoleId::new(row.id),
            name: row.name,
            display_name: row.display_name,
            is_system: row.is_system,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PermissionRow {
    id: String,
    resource_type: String,
    action: String,
}

#[derive(Debug, sqlx::FromRow)]
struct UserRow {
    id: String,
    email: Option<String>,
    is_placeholder: bool,
    created_at: DateTime<Utc>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: UserId::new(row.id),
            email: row.email,
            is_placeholder: row.is_placeholder,
            created_at: row.created_at,
        }
    }
}

fn into_assignments(rows: Vec<AssignmentRow>) -> Result<Vec<RoleAssignment>> {
    rows.into_iter().map(RoleAssignment::try_from).collect()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Store
// ═══════════════════════════════════════════════════════════════════════════════

/// PostgreSQL-backed implementation of every store trait.
#[derive(Clone)]
pub struct PgStore {
    db: Database,
    role_permissions: Arc<DashMap<RoleId, HashSet<Permission>>>,
}

impl PgStore {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            role_permissions: Arc::new(DashMap::new()),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

#[async_trait]
impl ScopeStore for PgStore {
    async fn parent_scope(&self, scope: &ScopeRef) -> Result<Option<ScopeRef>> {
        let pool = self.db.pool();
        let id = scope.scope_id.as_str();

        let parent = match scope.scope_type {
            ScopeType::Organization => {
                sqlx::query_scalar::<_, String>("SELECT id FROM organizations WHERE id = $1")
                    .bind(id)
                    .fetch_optional(pool)
                    .await?
                    .map(|_| None)
            }
            ScopeType::Project => {
                sqlx::query_scalar::<_, String>(
                    "SELECT organization_id FROM projects WHERE id = $1",
                )
                .bind(id)
                .fetch_optional(pool)
                .await?
                .map(|org| Some(ScopeRef::organization(org)))
            }
            ScopeType::Resource => {
                sqlx::query_scalar::<_, String>("SELECT project_id FROM resources WHERE id = $1")
                    .bind(id)
                    .fetch_optional(pool)
                    .await?
                    .map(|project| Some(ScopeRef::project(project)))
            }
        };

        parent.ok_or_else(|| GateError::not_found(scope.scope_type.as_str(), id))
    }
}

#[async_trait]
impl PermissionStore for PgStore {
    async fn role_by_name(&self, name: &str) -> Result<Option<Role>> {
        let row = sqlx::query_as::<_, RoleRow>(
            "SELECT id, name, display_name, is_system FROM roles WHERE LOWER(name) = LOWER($1)",
        )
        .bind(name)
        .fetch_optional(self.db.pool())
        .await?;

        Ok(row.map(Role::from))
    }

    async fn permissions_for_role(&self, role_id: &RoleId) -> Result<HashSet<Permission>> {
        if let Some(cached) = self.role_permissions.get(role_id) {
            return Ok(cached.clone());
        }

        let rows = sqlx::query_as::<_, PermissionRow>(
            r#"
            SELECT p.id, p.resource_type, p.action
            FROM role_permissions rp
            JOIN permissions p ON p.id = rp.permission_id
            WHERE rp.role_id = $1
            "#,
        )
        .bind(role_id.as_str())
        .fetch_all(self.db.pool())
        .await?;

        let permissions = rows
            .into_iter()
            .map(|row| Ok(Permission::new(row.id, row.resource_type, row.action.parse()?)))
            .collect::<Result<HashSet<_>>>()?;

        self.role_permissions
            .insert(role_id.clone(), permissions.clone());
        Ok(permissions)
    }

    async fn active_assignments(&self, user_id: &UserId) -> Result<Vec<RoleAssignment>> {
        let rows = sqlx::query_as::<_, AssignmentRow>(&format!(
            "SELECT {} FROM role_assignments WHERE user_id = $1 AND {} ORDER BY created_at",
            ASSIGNMENT_COLUMNS, ACTIVE
        ))
        .bind(user_id.as_str())
        .fetch_all(self.db.pool())
        .await?;

        into_assignments(rows)
    }

    async fn active_assignments_at(&self, scope: &ScopeRef) -> Result<Vec<RoleAssignment>> {
        let rows = sqlx::query_as::<_, AssignmentRow>(&format!(
            "SELECT {} FROM role_assignments \
             WHERE scope_type = $1 AND scope_id = $2 AND {} ORDER BY created_at",
            ASSIGNMENT_COLUMNS, ACTIVE
        ))
        .bind(scope.scope_type.as_str())
        .bind(&scope.scope_id)
        .fetch_all(self.db.pool())
        .await?;

        into_assignments(rows)
    }

    async fn active_assignments_for(
        &self,
        user_id: &UserId,
        scope: &ScopeRef,
    ) -> Result<Vec<RoleAssignment>> {
        let rows = sqlx::query_as::<_, AssignmentRow>(&format!(
            "SELECT {} FROM role_assignments \
             WHERE user_id = $1 AND scope_type = $2 AND scope_id = $3 AND {}",
            ASSIGNMENT_COLUMNS, ACTIVE
        ))
        .bind(user_id.as_str())
        .bind(scope.scope_type.as_str())
        .bind(&scope.scope_id)
        .fetch_all(self.db.pool())
        .await?;

        into_assignments(rows)
    }

    async fn user_exists(&self, user_id: &UserId) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM users WHERE id = $1)")
                .bind(user_id.as_str())
                .fetch_one(self.db.pool())
                .await?;
        Ok(exists)
    }
}

#[async_trait]
impl TransactionalStore for PgStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        let tx = self.db.pool().begin().await?;
        Ok(Box::new(PgTransaction { tx }))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Transaction
// ═══════════════════════════════════════════════════════════════════════════════

/// Open database transaction; rolled back on drop unless committed.
pub struct PgTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTransaction for PgTransaction {
    async fn role_by_name(&mut self, name: &str) -> Result<Option<Role>> {
        let row = sqlx::query_as::<_, RoleRow>(
            "SELECT id, name, display_name, is_system FROM roles WHERE LOWER(name) = LOWER($1)",
        )
        .bind(name)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(row.map(Role::from))
    }

    async fn find_user(&mut self, user_id: &UserId) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, email, is_placeholder, created_at FROM users WHERE id = $1",
        )
        .bind(user_id.as_str())
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(row.map(User::from))
    }

    async fn insert_user(&mut self, user: &User) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO users (id, email, is_placeholder, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(user.id.as_str())
        .bind(&user.email)
        .bind(user.is_placeholder)
        .bind(user.created_at)
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete_user(&mut self, user_id: &UserId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(user_id.as_str())
            .execute(&mut *self.tx)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn insert_organization(&mut self, organization: &Organization) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO organizations (id, name, created_at, updated_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(organization.id.as_str())
        .bind(&organization.name)
        .bind(organization.created_at)
        .bind(organization.updated_at)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn insert_project(&mut self, project: &Project) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO projects (id, organization_id, name, description, created_at, updated_at)
            SELECT $1, o.id, $3, $4, $5, $6 FROM organizations o WHERE o.id = $2
            "#,
        )
        .bind(project.id.as_str())
        .bind(project.organization_id.as_str())
        .bind(&project.name)
        .bind(&project.description)
        .bind(project.created_at)
        .bind(project.updated_at)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(GateError::not_found(
                "organization",
                project.organization_id.as_str(),
            ));
        }
        Ok(())
    }

    async fn insert_resource(&mut self, resource: &Resource) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO resources (id, project_id, name, kind, created_at, updated_at)
            SELECT $1, p.id, $3, $4, $5, $6 FROM projects p WHERE p.id = $2
            "#,
        )
        .bind(resource.id.as_str())
        .bind(resource.project_id.as_str())
        .bind(&resource.name)
        .bind(&resource.kind)
        .bind(resource.created_at)
        .bind(resource.updated_at)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(GateError::not_found("project", resource.project_id.as_str()));
        }
        Ok(())
    }

    async fn scope_exists(&mut self, scope: &ScopeRef) -> Result<bool> {
        let table = match scope.scope_type {
            ScopeType::Organization => "organizations",
            ScopeType::Project => "projects",
            ScopeType::Resource => "resources",
        };
        let exists: bool = sqlx::query_scalar(&format!(
            "SELECT EXISTS (SELECT 1 FROM {} WHERE id = $1)",
            table
        ))
        .bind(&scope.scope_id)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(exists)
    }

    async fn insert_assignment(&mut self, assignment: &RoleAssignment) -> Result<GrantOutcome> {
        // No row back: an active duplicate exists. xmax = 0: fresh insert.
        let inserted: Option<bool> = sqlx::query_scalar(
            r#"
            INSERT INTO role_assignments
                (id, user_id, role_id, scope_type, scope_id, assigned_by, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT ON CONSTRAINT role_assignments_grant_unique DO UPDATE
                SET expires_at = EXCLUDED.expires_at,
                    assigned_by = EXCLUDED.assigned_by,
                    created_at = EXCLUDED.created_at
                WHERE role_assignments.expires_at IS NOT NULL
                  AND role_assignments.expires_at <= NOW()
            RETURNING (xmax = 0)
            "#,
        )
        .bind(assignment.id)
        .bind(assignment.user_id.as_str())
        .bind(assignment.role_id.as_str())
        .bind(assignment.scope.scope_type.as_str())
        .bind(&assignment.scope.scope_id)
        .bind(assignment.assigned_by.as_ref().map(|u| u.as_str()))
        .bind(assignment.created_at)
        .bind(assignment.expires_at)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(match inserted {
            None => GrantOutcome::AlreadyActive,
            Some(true) => GrantOutcome::Created,
            Some(false) => GrantOutcome::Reactivated,
        })
    }

    async fn delete_assignment(
        &mut self,
        user_id: &UserId,
        role_id: &RoleId,
        scope: &ScopeRef,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM role_assignments
            WHERE user_id = $1 AND role_id = $2 AND scope_type = $3 AND scope_id = $4
            "#,
        )
        .bind(user_id.as_str())
        .bind(role_id.as_str())
        .bind(scope.scope_type.as_str())
        .bind(&scope.scope_id)
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn reassign_user(&mut self, from: &UserId, to: &UserId) -> Result<u64> {
        // Expired rows of the target yield to incoming rows.
        sqlx::query(
            r#"
            DELETE FROM role_assignments t
            WHERE t.user_id = $2
              AND t.expires_at IS NOT NULL AND t.expires_at <= NOW()
              AND EXISTS (
                  SELECT 1 FROM role_assignments f
                  WHERE f.user_id = $1 AND f.role_id = t.role_id
                    AND f.scope_type = t.scope_type AND f.scope_id = t.scope_id)
            "#,
        )
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&mut *self.tx)
        .await?;

        // Grants the target already holds actively stay as they are.
        sqlx::query(
            r#"
            DELETE FROM role_assignments f
            WHERE f.user_id = $1
              AND EXISTS (
                  SELECT 1 FROM role_assignments t
                  WHERE t.user_id = $2 AND t.role_id = f.role_id
                    AND t.scope_type = f.scope_type AND t.scope_id = f.scope_id)
            "#,
        )
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&mut *self.tx)
        .await?;

        let moved = sqlx::query("UPDATE role_assignments SET user_id = $2 WHERE user_id = $1")
            .bind(from.as_str())
            .bind(to.as_str())
            .execute(&mut *self.tx)
            .await?;

        Ok(moved.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}
