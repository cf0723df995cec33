//! Authentication and authorization.
//!
//! Two independent pieces with one seam between them:
//!
//! 1. **Tokens** ([`TokenStore`]): login or direct issuance produces a signed
//!    bearer; `validate` re-derives validity on every call from the signature,
//!    the signed expiry, and the live revocation record. The store is the
//!    single source of truth; nothing else holds a validity verdict.
//!
//! 2. **Roles** ([`PermissionTable`]): a static role to operation table built
//!    once at startup. `authorize` is pure set membership over the roles a
//!    validated token carries.
//!
//! The dispatch pipeline runs them strictly in that order: a caller is
//! authenticated before its roles are ever consulted.

pub mod rbac;
pub mod token;

pub use rbac::PermissionTable;
pub use token::{IssuedToken, TokenIdentity, TokenStore, spawn_reaper};
