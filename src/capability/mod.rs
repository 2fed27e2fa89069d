//! Capability-based authorization.
//!
//! A [`TokenStore`] issues [`CapabilityToken`]s to [`CapabilityContext`]s.
//! A context's effective authority is its own active tokens plus whatever its
//! ancestors hold, so revoking a parent's token immediately removes the
//! inherited access from every descendant without touching them.

use serde::Serialize;

pub mod pattern;
pub mod scope;
pub mod store;

pub use pattern::{
    matches, minimal_grant, normalize_resource, Grant, PatternError, Permission, ResourcePattern,
};
pub use scope::{CapabilityScope, ContextStack};
pub use store::{
    run_purger, AccessDecision, CapabilityContext, CapabilityToken, IssueError, TokenStore,
};

/// Read a file.
pub const FILE_READ: &str = "file.read";
/// Create or overwrite a file.
pub const FILE_WRITE: &str = "file.write";
/// Issue an HTTP GET.
pub const HTTP_GET: &str = "http.get";
/// Launch a program.
pub const PROCESS_SPAWN: &str = "process.spawn";

/// A gated operation was not authorized.
///
/// Aborts only that operation. Carries the narrowest grant that would have
/// allowed it, when the resource normalizes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{permission} on '{resource}' denied in context '{context}'{}", .minimal_grant.as_ref().map(|g| format!("; minimal grant: {g}")).unwrap_or_default())]
pub struct CapabilityError {
    /// Requested permission.
    pub permission: String,
    /// Requested resource.
    pub resource: String,
    /// Name of the asking context.
    pub context: String,
    /// Grant string sufficient for this access.
    pub minimal_grant: Option<String>,
}

impl CapabilityError {
    /// Build the error for a denied check.
    pub fn denied(permission: &str, resource: &str, context: &CapabilityContext) -> Self {
        Self {
            permission: permission.to_owned(),
            resource: resource.to_owned(),
            context: context.name().to_owned(),
            minimal_grant: minimal_grant(permission, resource),
        }
    }
}
