//! # Routing Scope
//!
//! The `(tenant_id, workspace_id)` pair every event and every session carries.
//! Both parts are opaque to the engine and compared byte for byte; the only
//! rule is that neither may be blank.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Rejected scope identifiers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScopeError {
    /// `tenant_id` was empty or whitespace.
    #[error("tenant_id must not be empty")]
    EmptyTenant,
    /// `workspace_id` was empty or whitespace.
    #[error("workspace_id must not be empty")]
    EmptyWorkspace,
}

/// Partition key used to route events to sessions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Scope {
    tenant_id: String,
    workspace_id: String,
}

impl Scope {
    /// Builds a scope from the identifiers as given. Empty or whitespace-only
    /// identifiers are rejected; anything else is kept verbatim.
    pub fn new(tenant_id: impl Into<String>, workspace_id: impl Into<String>) -> Result<Self, ScopeError> {
        let tenant_id = tenant_id.into();
        let workspace_id = workspace_id.into();
        if tenant_id.trim().is_empty() {
            return Err(ScopeError::EmptyTenant);
        }
        if workspace_id.trim().is_empty() {
            return Err(ScopeError::EmptyWorkspace);
        }
        Ok(Self {
            tenant_id,
            workspace_id,
        })
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.workspace_id)
    }
}
