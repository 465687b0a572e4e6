//! RBAC data models: identifiers, actions, permissions, roles, assignments,
//! users and the three entity kinds that make up the scope tree.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::scope::{ScopeRef, ScopeType};
use crate::error::GateError;

/// Resource type tag carried by every permission this system evaluates.
pub const PERMISSION_DOMAIN: &str = "scope";

// ═══════════════════════════════════════════════════════════════════════════════
// Identifiers
// ═══════════════════════════════════════════════════════════════════════════════

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generate a fresh random identifier.
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Stable external subject identifier, or an email for placeholder users.
    UserId
);
string_id!(
    /// Role identifier.
    RoleId
);
string_id!(
    /// Organization identifier (root of the scope tree).
    OrganizationId
);
string_id!(
    /// Project identifier (child of an organization).
    ProjectId
);
string_id!(
    /// Resource identifier (child of a project).
    ResourceId
);

// ═══════════════════════════════════════════════════════════════════════════════
// Action & Permission
// ═══════════════════════════════════════════════════════════════════════════════

/// The closed set of actions a permission can grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Read,
    Write,
    Delete,
    ManageAccess,
}

impl Action {
    pub const ALL: [Action; 4] = [
        Action::Read,
        Action::Write,
        Action::Delete,
        Action::ManageAccess,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Delete => "delete",
            Self::ManageAccess => "manage_access",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(Self::Read),
            "write" => Ok(Self::Write),
            "delete" => Ok(Self::Delete),
            "manage_access" => Ok(Self::ManageAccess),
            other => Err(GateError::invalid_format(format!("Unknown action: {}", other))),
        }
    }
}

/// A permission grants one action within one resource-type domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Permission {
    pub id: String,
    pub resource_type: String,
    pub action: Action,
}

impl Permission {
    pub fn new(id: impl Into<String>, resource_type: impl Into<String>, action: Action) -> Self {
        Self {
            id: id.into(),
            resource_type: resource_type.into(),
            action,
        }
    }

    /// A permission in this system's own domain, with a derived id.
    pub fn scoped(action: Action) -> Self {
        Self::new(
            format!("{}:{}", PERMISSION_DOMAIN, action),
            PERMISSION_DOMAIN,
            action,
        )
    }

    /// Whether this permission grants `action` in this system's domain.
    pub fn grants(&self, action: Action) -> bool {
        self.resource_type == PERMISSION_DOMAIN && self.action == action
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resource_type, self.action)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Role
// ═══════════════════════════════════════════════════════════════════════════════

/// A named role. Its permissions live in the store's role-permission mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: RoleId,
    pub name: String,
    pub display_name: String,
    /// Built-in roles cannot be modified or deleted.
    pub is_system: bool,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Role Assignment
// ═══════════════════════════════════════════════════════════════════════════════

/// Grants a role to a user at exactly one scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub id: Uuid,
    pub user_id: UserId,
    pub role_id: RoleId,
    pub scope: ScopeRef,
    pub assigned_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
    /// None = never expires.
    pub expires_at: Option<DateTime<Utc>>,
}

impl RoleAssignment {
    pub fn new(user_id: UserId, role_id: RoleId, scope: ScopeRef) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            role_id,
            scope,
            assigned_by: None,
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    pub fn assigned_by(mut self, user_id: Option<UserId>) -> Self {
        self.assigned_by = user_id;
        self
    }

    pub fn with_expiry(mut self, expires_at: Option<DateTime<Utc>>) -> Self {
        self.expires_at = expires_at;
        self
    }

    /// Active iff there is no expiry or the expiry lies after `now`.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |exp| exp > now)
    }

    /// Same grant key: user, role and scope.
    pub fn same_grant(&self, other: &RoleAssignment) -> bool {
        self.user_id == other.user_id && self.role_id == other.role_id && self.scope == other.scope
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// User
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub email: Option<String>,
    /// Created by an invitation; keyed by the invitee's email.
    pub is_placeholder: bool,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(id: UserId, email: Option<String>) -> Self {
        Self {
            id,
            email,
            is_placeholder: false,
            created_at: Utc::now(),
        }
    }

    /// A placeholder record whose identifier is the invitee's email.
    pub fn placeholder(email: &str) -> Self {
        Self {
            id: UserId::new(email),
            email: Some(email.to_string()),
            is_placeholder: true,
            created_at: Utc::now(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Scope tree entities
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub id: OrganizationId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Organization {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: OrganizationId::generate(),
            name: name.into(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn scope(&self) -> ScopeRef {
        ScopeRef::new(ScopeType::Organization, self.id.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub organization_id: OrganizationId,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn new(
        organization_id: OrganizationId,
        name: impl Into<String>,
        description: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ProjectId::generate(),
            organization_id,
            name: name.into(),
            description,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn scope(&self) -> ScopeRef {
        ScopeRef::new(ScopeType::Project, self.id.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub project_id: ProjectId,
    pub name: String,
    /// Free-form kind label, e.g. "service" or "database".
    pub kind: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Resource {
    pub fn new(project_id: ProjectId, name: impl Into<String>, kind: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: ResourceId::generate(),
            project_id,
            name: name.into(),
            kind: kind.into(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn scope(&self) -> ScopeRef {
        ScopeRef::new(ScopeType::Resource, self.id.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
