//! Predefined system roles with their default permission sets.
//!
//! ScopeGate ships with three immutable roles, each a strict superset of the
//! next:
//!
//! | Role   | Actions                                   |
//! |--------|-------------------------------------------|
//! | Owner  | read, write, delete, manage_access        |
//! | Editor | read, write, delete                       |
//! | Viewer | read                                      |
//!
//! The initial migration seeds the same rows into PostgreSQL.

use std::collections::HashSet;

use super::models::{Action, Permission, Role, RoleId};

/// Predefined role templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredefinedRole {
    Owner,
    Editor,
    Viewer,
}

impl PredefinedRole {
    /// Get the role identifier string.
    pub fn id(&self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Editor => "editor",
            Self::Viewer => "viewer",
        }
    }

    /// Get the role name used in grant requests.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Owner => "Owner",
            Self::Editor => "Editor",
            Self::Viewer => "Viewer",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Owner => "Owner (full control, including access management)",
            Self::Editor => "Editor (read and modify)",
            Self::Viewer => "Viewer (read only)",
        }
    }

    pub fn actions(&self) -> &'static [Action] {
        match self {
            Self::Owner => &[Action::Read, Action::Write, Action::Delete, Action::ManageAccess],
            Self::Editor => &[Action::Read, Action::Write, Action::Delete],
            Self::Viewer => &[Action::Read],
        }
    }

    /// Return the set of permissions for this predefined role.
    pub fn permissions(&self) -> HashSet<Permission> {
        self.actions().iter().copied().map(Permission::scoped).collect()
    }

    /// Build a full `Role` struct from this predefined role.
    pub fn to_role(&self) -> Role {
        Role {
            id: RoleId::new(self.id()),
            name: self.name().to_string(),
            display_name: self.display_name().to_string(),
            is_system: true,
        }
    }

    /// Return all predefined roles.
    pub fn all() -> [PredefinedRole; 3] {
        [Self::Owner, Self::Editor, Self::Viewer]
    }

    /// Return all predefined roles with their permission sets.
    pub fn all_defaults() -> Vec<(Role, HashSet<Permission>)> {
        Self::all()
            .into_iter()
            .map(|r| (r.to_role(), r.permissions()))
            .collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn grants(role: PredefinedRole, action: Action) -> bool {
        role.permissions().iter().any(|p| p.grants(action))
    }

    #[test]
    fn test_owner_has_every_action() {
        for action in Action::ALL {
            assert!(grants(PredefinedRole::Owner, action), "owner lacks {}", action);
        }
    }

    #[test]
    fn test_editor_cannot_manage_access() {
        assert!(grants(PredefinedRole::Editor, Action::Write));
        assert!(grants(PredefinedRole::Editor, Action::Delete));
        assert!(!grants(PredefinedRole::Editor, Action::ManageAccess));
    }

    #[test]
    fn test_viewer_read_only() {
        assert!(grants(PredefinedRole::Viewer, Action::Read));
        assert!(!grants(PredefinedRole::Viewer, Action::Write));
        assert!(!grants(PredefinedRole::Viewer, Action::Delete));
    }

    #[test]
    fn test_roles_are_nested() {
        let owner = PredefinedRole::Owner.permissions();
        let editor = PredefinedRole::Editor.permissions();
        let viewer = PredefinedRole::Viewer.permissions();
        assert!(viewer.is_subset(&editor));
        assert!(editor.is_subset(&owner));
    }

    #[test]
    fn test_all_defaults() {
        let roles = PredefinedRole::all_defaults();
        assert_eq!(roles.len(), 3);
        assert!(roles.iter().all(|(r, _)| r.is_system));
        assert_eq!(PredefinedRole::Owner.id(), "owner");
    }
}
