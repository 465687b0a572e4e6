//! The scope tree: organization → project → resource.
//!
//! Role assignments are anchored to exactly one scope, and a grant at a scope
//! applies to every descendant. [`effective_scopes`] computes the chain a
//! permission check has to look at.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use crate::context::OpContext;
use crate::error::{GateError, Result};
use crate::store::ScopeStore;

/// Upper bound on the length of a scope identifier.
pub const MAX_SCOPE_ID_LEN: usize = 128;

static SCOPE_ID_PATTERN: OnceLock<Regex> = OnceLock::new();

fn scope_id_pattern() -> &'static Regex {
    SCOPE_ID_PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]*$").expect("scope id pattern is valid")
    })
}

/// Level of a node in the scope tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeType {
    Organization,
    Project,
    Resource,
}

impl ScopeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Organization => "organization",
            Self::Project => "project",
            Self::Resource => "resource",
        }
    }

    /// The type of this scope's parent, `None` for the root level.
    pub fn parent_type(&self) -> Option<ScopeType> {
        match self {
            Self::Organization => None,
            Self::Project => Some(Self::Organization),
            Self::Resource => Some(Self::Project),
        }
    }
}

impl fmt::Display for ScopeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScopeType {
    type Err = GateError;

    /// Accepts singular and plural forms, as used in URL paths.
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "organization" | "organizations" => Ok(Self::Organization),
            "project" | "projects" => Ok(Self::Project),
            "resource" | "resources" => Ok(Self::Resource),
            other => Err(GateError::invalid_format(format!("Unknown scope type: {}", other))),
        }
    }
}

/// Reference to one node in the scope tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeRef {
    pub scope_type: ScopeType,
    pub scope_id: String,
}

impl ScopeRef {
    pub fn new(scope_type: ScopeType, scope_id: impl Into<String>) -> Self {
        Self {
            scope_type,
            scope_id: scope_id.into(),
        }
    }

    pub fn organization(id: impl Into<String>) -> Self {
        Self::new(ScopeType::Organization, id)
    }

    pub fn project(id: impl Into<String>) -> Self {
        Self::new(ScopeType::Project, id)
    }

    pub fn resource(id: impl Into<String>) -> Self {
        Self::new(ScopeType::Resource, id)
    }

    /// Parse a `(type, id)` pair coming from request input.
    pub fn parse(scope_type: &str, scope_id: &str) -> Result<Self> {
        let scope_type = scope_type.parse()?;
        validate_scope_id(scope_id)?;
        Ok(Self::new(scope_type, scope_id))
    }
}

impl fmt::Display for ScopeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scope_type, self.scope_id)
    }
}

/// Reject identifiers that could not have been generated by this system.
pub fn validate_scope_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(GateError::invalid_format("Scope id must not be empty"));
    }
    if id.len() > MAX_SCOPE_ID_LEN {
        return Err(GateError::invalid_format(format!(
            "Scope id exceeds {} characters",
            MAX_SCOPE_ID_LEN
        )));
    }
    if !scope_id_pattern().is_match(id) {
        return Err(GateError::invalid_format(format!(
            "Scope id contains invalid characters: {}",
            id
        )));
    }
    Ok(())
}

/// Compute `{scope} ∪ ancestors(scope)`, nearest first.
///
/// One parent lookup per level; the result has at most three elements. Fails
/// with `NotFound` when `scope` does not exist.
pub async fn effective_scopes<S>(
    ctx: &OpContext,
    store: &S,
    scope: &ScopeRef,
) -> Result<Vec<ScopeRef>>
where
    S: ScopeStore + ?Sized,
{
    let mut chain: Vec<ScopeRef> = Vec::with_capacity(3);
    let mut current = scope.clone();

    loop {
        let parent = ctx.run("parent_scope", store.parent_scope(&current)).await?;
        let expected = current.scope_type.parent_type();
        chain.push(current);

        match (parent, expected) {
            (None, None) => break,
            (Some(parent), Some(expected)) if parent.scope_type == expected => {
                current = parent;
            }
            (parent, expected) => {
                return Err(GateError::internal(format!(
                    "Inconsistent scope tree at {}: expected parent type {:?}, got {:?}",
                    chain[chain.len() - 1],
                    expected,
                    parent
                )));
            }
        }
    }

    Ok(chain)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_type_parse() {
        assert_eq!("projects".parse::<ScopeType>().unwrap(), ScopeType::Project);
        assert_eq!(
            "organization".parse::<ScopeType>().unwrap(),
            ScopeType::Organization
        );
        assert!("team".parse::<ScopeType>().is_err());
    }

    #[test]
    fn test_parent_types_form_three_levels() {
        assert_eq!(ScopeType::Resource.parent_type(), Some(ScopeType::Project));
        assert_eq!(ScopeType::Project.parent_type(), Some(ScopeType::Organization));
        assert_eq!(ScopeType::Organization.parent_type(), None);
    }

    #[test]
    fn test_validate_scope_id() {
        assert!(validate_scope_id("3f2b8c1e-9a4d-4e0b-8f57-0c6d2f9e1a77").is_ok());
        assert!(validate_scope_id("proj_1").is_ok());
        assert!(validate_scope_id("").is_err());
        assert!(validate_scope_id("p1\"} or {").is_err());
        assert!(validate_scope_id("../etc").is_err());
        assert!(validate_scope_id(&"a".repeat(MAX_SCOPE_ID_LEN + 1)).is_err());
    }

    #[test]
    fn test_scope_ref_display() {
        assert_eq!(ScopeRef::project("p1").to_string(), "project/p1");
    }
}
