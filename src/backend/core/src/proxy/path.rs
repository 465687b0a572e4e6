//! Tenant path grammar: `/projects/{project_id}/resources/{resource_id}/{rest}`.

use crate::error::{GateError, Result};
use crate::rbac::scope::validate_scope_id;
use crate::rbac::{ProjectId, ResourceId};

/// The tenant coordinates carried by a proxied request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantPath {
    pub project_id: ProjectId,
    pub resource_id: ResourceId,
    /// Everything after the resource id, with a leading `/` (or empty).
    pub remainder: String,
}

impl TenantPath {
    /// Parse the part of the request path below the backend's route prefix.
    pub fn parse(path: &str) -> Result<Self> {
        let trimmed = path.trim_start_matches('/');
        let mut segments = trimmed.splitn(5, '/');

        expect_literal(segments.next(), "projects")?;
        let project_id = expect_id(segments.next(), "project")?;
        expect_literal(segments.next(), "resources")?;
        let resource_id = expect_id(segments.next(), "resource")?;

        let remainder = match segments.next() {
            Some(rest) if !rest.is_empty() => format!("/{}", rest),
            _ => String::new(),
        };

        Ok(Self {
            project_id: ProjectId::new(project_id),
            resource_id: ResourceId::new(resource_id),
            remainder,
        })
    }

    /// Backend path: `native_prefix` followed by the remainder.
    pub fn upstream_path(&self, native_prefix: &str) -> String {
        format!("{}{}", native_prefix.trim_end_matches('/'), self.remainder)
    }
}

fn expect_literal(segment: Option<&str>, literal: &'static str) -> Result<()> {
    match segment {
        Some(s) if s == literal => Ok(()),
        Some("") | None => Err(GateError::invalid_format(format!(
            "Path must contain /projects/{{project_id}}/resources/{{resource_id}}: missing '{}' segment",
            literal
        ))),
        Some(other) => Err(GateError::invalid_format(format!(
            "Expected '{}' segment, found '{}'",
            literal, other
        ))),
    }
}

fn expect_id<'a>(segment: Option<&'a str>, kind: &'static str) -> Result<&'a str> {
    let id = segment
        .filter(|s| !s.is_empty())
        .ok_or_else(|| GateError::invalid_format(format!("Missing {} id in path", kind)))?;
    validate_scope_id(id)
        .map_err(|_| GateError::invalid_format(format!("Malformed {} id in path", kind)))?;
    Ok(id)
}
