//! Access types, privileges, and the per-subject access context

use std::sync::Arc;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::security::types::SecType;

// =============================================================================
// Access Types
// =============================================================================

/// Type of access to a protected object, totally ordered by increasing
/// capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccessType {
    View,
    Use,
    Change,
    Control,
}

impl AccessType {
    /// Check whether this granted access level covers the requested one
    pub fn has_access(self, requested: AccessType) -> bool {
        self >= requested
    }

    /// Combine two optional access grants into the strongest of the two
    pub fn union(first: Option<AccessType>, second: Option<AccessType>) -> Option<AccessType> {
        match (first, second) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }
}

impl std::fmt::Display for AccessType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessType::View => write!(f, "VIEW"),
            AccessType::Use => write!(f, "USE"),
            AccessType::Change => write!(f, "CHANGE"),
            AccessType::Control => write!(f, "CONTROL"),
        }
    }
}

// =============================================================================
// Privileges
// =============================================================================

bitflags! {
    /// Privileges a subject may hold in its effective privilege set
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Privilege: u64 {
        /// Override mandatory access control rule checks
        const MAC_OVRD    = 0x0000_0001;
        /// View any protected object
        const OBJ_VIEW    = 0x0000_0002;
        /// Use any protected object
        const OBJ_USE     = 0x0000_0004;
        /// Change any protected object
        const OBJ_CHANGE  = 0x0000_0008;
        /// Full control over any protected object
        const OBJ_CONTROL = 0x0000_0010;
        /// Global administrative privilege, implies all others
        const SYS_ALL     = 0x8000_0000;
    }
}

/// Effective privilege set of a subject
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrivilegeSet {
    privs: Privilege,
}

impl PrivilegeSet {
    pub fn new(privs: Privilege) -> Self {
        Self { privs }
    }

    /// An empty privilege set
    pub fn none() -> Self {
        Self {
            privs: Privilege::empty(),
        }
    }

    /// Check whether all of the requested privileges are held.
    ///
    /// `SYS_ALL` implies every other privilege.
    pub fn has_privileges(&self, requested: Privilege) -> bool {
        self.privs.contains(Privilege::SYS_ALL) || self.privs.contains(requested)
    }

    /// Map the strongest held object privilege onto a MAC access type
    pub fn to_mac_access(&self) -> Option<AccessType> {
        if self.has_privileges(Privilege::OBJ_CONTROL) || self.has_privileges(Privilege::MAC_OVRD) {
            Some(AccessType::Control)
        } else if self.has_privileges(Privilege::OBJ_CHANGE) {
            Some(AccessType::Change)
        } else if self.has_privileges(Privilege::OBJ_USE) {
            Some(AccessType::Use)
        } else if self.has_privileges(Privilege::OBJ_VIEW) {
            Some(AccessType::View)
        } else {
            None
        }
    }
}

// =============================================================================
// Access Context
// =============================================================================

/// Security context of a subject: its security domain plus the effective
/// privilege set it carries
#[derive(Clone)]
pub struct AccessContext {
    subject_domain: Arc<SecType>,
    privileges: PrivilegeSet,
}

impl AccessContext {
    pub fn new(subject_domain: Arc<SecType>, privileges: PrivilegeSet) -> Self {
        Self {
            subject_domain,
            privileges,
        }
    }

    pub fn subject_domain(&self) -> &Arc<SecType> {
        &self.subject_domain
    }

    pub fn privileges(&self) -> &PrivilegeSet {
        &self.privileges
    }

    /// Require the given privileges, failing with `MissingPrivileges`
    /// otherwise
    pub fn require_privileges(&self, required: Privilege) -> Result<()> {
        if self.privileges.has_privileges(required) {
            Ok(())
        } else {
            Err(Error::MissingPrivileges {
                subject_domain: self.subject_domain.name().to_string(),
                required: format!("{required:?}"),
            })
        }
    }
}

impl std::fmt::Debug for AccessContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessContext")
            .field("subject_domain", &self.subject_domain.name().to_string())
            .field("privileges", &self.privileges)
            .finish()
    }
}
