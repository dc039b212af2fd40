//! Access control engine
//!
//! Gates every read and write of cluster state by subject-domain/object-type
//! rule lookup. Three selectable security levels are supported:
//!
//! - `NoSecurity`: every access check passes
//! - `Rbac`: every access check passes (role enforcement happens outside
//!   this core)
//! - `Mac`: mandatory access control by rule-table lookup, overridable by
//!   the `MAC_OVRD` privilege
//!
//! The rule and type registry is process-scoped state passed around by
//! handle; it is never reached through ambient globals.

mod access;
mod types;

pub use access::{AccessContext, AccessType, Privilege, PrivilegeSet};
pub use types::{
    ObjectProtection, SecType, SecurityLevel, SecurityRegistry, SecurityRule, SecuritySnapshot,
};
