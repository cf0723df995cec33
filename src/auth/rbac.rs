//! Role-based authorization — a static role to operation table.
//!
//! # Design
//!
//! The table is built once at startup from validated configuration and never
//! mutated afterwards, so `authorize` is a pure function: the same roles and
//! operation always produce the same answer, with no I/O and no clock.
//!
//! ## Patterns
//!
//! Each role maps to a list of operation patterns:
//!
//! | Pattern | Meaning |
//! |---------|---------|
//! | `adapter.execute` | Exactly that operation |
//! | `adapter.*` | Any operation with the `adapter.` prefix |
//! | `*` | Every operation |
//!
//! A role name held by a token but absent from the table matches nothing.
//! Operations listed as public (by default only `auth.login`) bypass the
//! check entirely.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::config::AuthzConfig;
use crate::{Error, Result};

/// The authorization table: role name to permitted operation patterns.
#[derive(Debug)]
pub struct PermissionTable {
    roles: HashMap<String, Vec<String>>,
    public: HashSet<String>,
}

impl PermissionTable {
    /// Build and validate a table.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for empty role names, empty pattern lists, or
    /// empty patterns.
    pub fn new(roles: HashMap<String, Vec<String>>, public: HashSet<String>) -> Result<Self> {
        for (role, patterns) in &roles {
            if role.is_empty() {
                return Err(Error::Config("authz: empty role name".to_string()));
            }
            if patterns.is_empty() {
                return Err(Error::Config(format!(
                    "authz: role '{role}' has an empty permission list"
                )));
            }
            if patterns.iter().any(|p| p.is_empty()) {
                return Err(Error::Config(format!(
                    "authz: role '{role}' contains an empty pattern"
                )));
            }
        }
        Ok(Self { roles, public })
    }

    /// Build from the authz section of the configuration.
    ///
    /// # Errors
    ///
    /// Propagates the structural checks of [`PermissionTable::new`].
    pub fn from_config(config: &AuthzConfig) -> Result<Self> {
        Self::new(
            config.roles.clone(),
            config.public.iter().cloned().collect(),
        )
    }

    /// Whether an operation requires no token at all.
    #[must_use]
    pub fn is_public(&self, operation: &str) -> bool {
        self.public.contains(operation)
    }

    /// Grant or deny `operation` for a caller holding `roles`.
    ///
    /// Pure set membership: grants if the operation is public or any held
    /// role carries a matching pattern.
    ///
    /// # Errors
    ///
    /// `Error::Authorization` naming the denied operation and the roles that
    /// lacked it.
    pub fn authorize(&self, roles: &[String], operation: &str) -> Result<()> {
        if self.is_public(operation) {
            return Ok(());
        }

        let granted = roles.iter().any(|role| {
            self.roles
                .get(role)
                .is_some_and(|patterns| patterns.iter().any(|p| pattern_matches(p, operation)))
        });

        if granted {
            Ok(())
        } else {
            debug!(?roles, operation, "Authorization denied");
            Err(Error::Authorization {
                operation: operation.to_string(),
                roles: roles.to_vec(),
            })
        }
    }

    /// Number of roles in the table.
    #[must_use]
    pub fn len(&self) -> usize {
        self.roles.len()
    }

    /// Whether the table has no roles at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }
}

/// Check if a `pattern` (possibly with a trailing `*`) matches an operation.
fn pattern_matches(pattern: &str, operation: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix('*') {
        operation.starts_with(prefix)
    } else {
        pattern == operation
    }
}
