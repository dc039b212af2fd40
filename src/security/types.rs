//! Security types, the global type registry, and object protection
//!
//! A security type describes either the type of a protected object or the
//! domain of a subject. The process-wide registry of types is guarded by a
//! reader/writer lock: every request performs concurrent rule lookups,
//! administrative writes and full reloads exclude all readers for their
//! duration.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::objects::name::SecTypeName;
use crate::security::access::{AccessContext, AccessType, Privilege, PrivilegeSet};

// =============================================================================
// Security Level
// =============================================================================

/// Process-wide security level, set at startup and read lock-free
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityLevel {
    /// Every access check passes
    NoSecurity,
    /// Every access check passes; role enforcement happens outside this core
    Rbac,
    /// Mandatory access control by rule-table lookup
    Mac,
}

impl std::fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SecurityLevel::NoSecurity => write!(f, "NO_SECURITY"),
            SecurityLevel::Rbac => write!(f, "RBAC"),
            SecurityLevel::Mac => write!(f, "MAC"),
        }
    }
}

impl std::str::FromStr for SecurityLevel {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_uppercase().as_str() {
            "NO_SECURITY" => Ok(SecurityLevel::NoSecurity),
            "RBAC" => Ok(SecurityLevel::Rbac),
            "MAC" => Ok(SecurityLevel::Mac),
            _ => Err(Error::Configuration(format!(
                "Unknown security level: {value}"
            ))),
        }
    }
}

/// Shared security level cell; shared between the registry and every
/// security type it hands out
#[derive(Debug)]
pub(crate) struct SharedSecurityLevel(AtomicU8);

impl SharedSecurityLevel {
    fn new(level: SecurityLevel) -> Self {
        Self(AtomicU8::new(level as u8))
    }

    pub(crate) fn get(&self) -> SecurityLevel {
        match self.0.load(Ordering::Relaxed) {
            0 => SecurityLevel::NoSecurity,
            1 => SecurityLevel::Rbac,
            _ => SecurityLevel::Mac,
        }
    }

    fn set(&self, level: SecurityLevel) {
        self.0.store(level as u8, Ordering::Relaxed);
    }
}

// =============================================================================
// Security Type
// =============================================================================

/// The security type of a protected object, or the security domain of a
/// subject
pub struct SecType {
    name: SecTypeName,
    level: Arc<SharedSecurityLevel>,
    /// Access rules granted to subject domains, keyed by domain name
    rules: Mutex<BTreeMap<SecTypeName, AccessType>>,
}

impl SecType {
    fn new(name: SecTypeName, level: Arc<SharedSecurityLevel>) -> Arc<Self> {
        Arc::new(Self {
            name,
            level,
            rules: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn name(&self) -> &SecTypeName {
        &self.name
    }

    /// Check whether the subject domain of `ctx` has the requested type of
    /// access to objects of this security type
    pub fn require_access(&self, ctx: &AccessContext, requested: AccessType) -> Result<()> {
        match self.level.get() {
            SecurityLevel::NoSecurity | SecurityLevel::Rbac => Ok(()),
            SecurityLevel::Mac => {
                let rule = self.get_rule(ctx.subject_domain().name());
                let mut allowed = rule.is_some_and(|granted| granted.has_access(requested));
                if !allowed {
                    allowed = ctx.privileges().has_privileges(Privilege::MAC_OVRD);
                }
                if allowed {
                    Ok(())
                } else {
                    Err(Error::AccessDenied {
                        subject_domain: ctx.subject_domain().name().to_string(),
                        object_type: self.name.to_string(),
                        requested,
                    })
                }
            }
        }
    }

    /// Return the maximum access type grantable to the subject of `ctx`,
    /// `None` meaning no access. Never fails.
    pub fn query_access(&self, ctx: &AccessContext) -> Option<AccessType> {
        match self.level.get() {
            SecurityLevel::NoSecurity | SecurityLevel::Rbac => Some(AccessType::Control),
            SecurityLevel::Mac => AccessType::union(
                ctx.privileges().to_mac_access(),
                self.get_rule(ctx.subject_domain().name()),
            ),
        }
    }

    /// Access granted to the given subject domain by rule, if any
    pub fn get_rule(&self, domain: &SecTypeName) -> Option<AccessType> {
        self.rules.lock().get(domain).copied()
    }

    /// Grant the given access to a subject domain. Administrative.
    pub fn add_rule(
        &self,
        ctx: &AccessContext,
        domain: &SecTypeName,
        granted: AccessType,
    ) -> Result<()> {
        ctx.require_privileges(Privilege::SYS_ALL)?;
        self.rules.lock().insert(domain.clone(), granted);
        Ok(())
    }

    /// Remove a subject domain's rule entry. Administrative.
    pub fn del_rule(&self, ctx: &AccessContext, domain: &SecTypeName) -> Result<()> {
        ctx.require_privileges(Privilege::SYS_ALL)?;
        self.rules.lock().remove(domain);
        Ok(())
    }

    /// Snapshot of all rule entries for this type. Administrative.
    pub fn get_all_rules(&self, ctx: &AccessContext) -> Result<BTreeMap<SecTypeName, AccessType>> {
        ctx.require_privileges(Privilege::SYS_ALL)?;
        Ok(self.rules.lock().clone())
    }

    fn clear_rules(&self) {
        self.rules.lock().clear();
    }
}

impl std::fmt::Debug for SecType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecType")
            .field("name", &self.name.to_string())
            .finish()
    }
}

// =============================================================================
// Security Registry
// =============================================================================

/// A full-table reload source: the set of security types plus the type
/// enforcement rules, as loaded by the (external) persistence driver
#[derive(Debug, Clone, Default)]
pub struct SecuritySnapshot {
    pub types: Vec<SecTypeName>,
    pub rules: Vec<SecurityRule>,
}

/// One type enforcement rule: subject domain → granted access, per object
/// security type
#[derive(Debug, Clone)]
pub struct SecurityRule {
    pub domain: SecTypeName,
    pub object_type: SecTypeName,
    pub access: AccessType,
}

/// Process-scoped registry of security types.
///
/// Passed around by handle; the two built-in types `SYSTEM` and `PUBLIC`
/// always exist and survive every reload.
pub struct SecurityRegistry {
    level: Arc<SharedSecurityLevel>,
    types: RwLock<BTreeMap<SecTypeName, Arc<SecType>>>,
    system: Arc<SecType>,
    public: Arc<SecType>,
}

impl SecurityRegistry {
    pub fn new(level: SecurityLevel) -> Arc<Self> {
        let shared = Arc::new(SharedSecurityLevel::new(level));
        let system_name = SecTypeName::new("SYSTEM").expect("builtin type name is valid");
        let public_name = SecTypeName::new("PUBLIC").expect("builtin type name is valid");
        let system = SecType::new(system_name.clone(), shared.clone());
        let public = SecType::new(public_name.clone(), shared.clone());

        let mut types = BTreeMap::new();
        types.insert(system_name, system.clone());
        types.insert(public_name, public.clone());

        Arc::new(Self {
            level: shared,
            types: RwLock::new(types),
            system,
            public,
        })
    }

    pub fn security_level(&self) -> SecurityLevel {
        self.level.get()
    }

    /// Change the process-wide security level. Startup/administrative only.
    pub fn set_security_level(&self, ctx: &AccessContext, level: SecurityLevel) -> Result<()> {
        ctx.require_privileges(Privilege::SYS_ALL)?;
        info!(%level, "security level changed");
        self.level.set(level);
        Ok(())
    }

    /// The built-in SYSTEM type
    pub fn system_type(&self) -> Arc<SecType> {
        self.system.clone()
    }

    /// The built-in PUBLIC type
    pub fn public_type(&self) -> Arc<SecType> {
        self.public.clone()
    }

    /// A fully privileged system context
    pub fn system_context(&self) -> AccessContext {
        AccessContext::new(self.system.clone(), PrivilegeSet::new(Privilege::SYS_ALL))
    }

    /// An unprivileged public context
    pub fn public_context(&self) -> AccessContext {
        AccessContext::new(self.public.clone(), PrivilegeSet::none())
    }

    /// Get or create a security type. Administrative.
    pub fn create_type(&self, ctx: &AccessContext, name: SecTypeName) -> Result<Arc<SecType>> {
        ctx.require_privileges(Privilege::SYS_ALL)?;
        let mut types = self.types.write();
        let sec_type = types
            .entry(name.clone())
            .or_insert_with(|| SecType::new(name, self.level.clone()));
        Ok(sec_type.clone())
    }

    pub fn get_type(&self, name: &SecTypeName) -> Option<Arc<SecType>> {
        self.types.read().get(name).cloned()
    }

    pub fn all_types(&self) -> Vec<Arc<SecType>> {
        self.types.read().values().cloned().collect()
    }

    /// Atomically replace the type registry and all rule sets from a reload
    /// source, re-seeding the built-in types first. Readers never observe a
    /// partially replaced table.
    pub fn reload(&self, ctx: &AccessContext, snapshot: &SecuritySnapshot) -> Result<()> {
        ctx.require_privileges(Privilege::SYS_ALL)?;

        let mut types = self.types.write();
        types.clear();
        self.system.clear_rules();
        self.public.clear_rules();
        types.insert(self.system.name().clone(), self.system.clone());
        types.insert(self.public.name().clone(), self.public.clone());

        for name in &snapshot.types {
            if name != self.system.name() && name != self.public.name() {
                types.insert(name.clone(), SecType::new(name.clone(), self.level.clone()));
            }
        }

        for rule in &snapshot.rules {
            match types.get(&rule.object_type) {
                Some(sec_type) => {
                    sec_type
                        .rules
                        .lock()
                        .insert(rule.domain.clone(), rule.access);
                }
                None => {
                    warn!(
                        object_type = %rule.object_type,
                        domain = %rule.domain,
                        "skipping rule for unknown security type"
                    );
                }
            }
        }
        info!(
            types = types.len(),
            rules = snapshot.rules.len(),
            "security type table reloaded"
        );
        Ok(())
    }
}

// =============================================================================
// Object Protection
// =============================================================================

/// Access control guard attached to a protectable object
#[derive(Debug)]
pub struct ObjectProtection {
    creator_domain: SecTypeName,
    sec_type: Arc<SecType>,
}

impl ObjectProtection {
    /// Guard a new object; the object inherits the creator's security domain
    /// as its security type
    pub fn new(ctx: &AccessContext) -> Self {
        Self {
            creator_domain: ctx.subject_domain().name().clone(),
            sec_type: ctx.subject_domain().clone(),
        }
    }

    /// Guard a new object with an explicit security type
    pub fn with_type(ctx: &AccessContext, sec_type: Arc<SecType>) -> Self {
        Self {
            creator_domain: ctx.subject_domain().name().clone(),
            sec_type,
        }
    }

    pub fn creator_domain(&self) -> &SecTypeName {
        &self.creator_domain
    }

    pub fn sec_type(&self) -> &Arc<SecType> {
        &self.sec_type
    }

    pub fn require_access(&self, ctx: &AccessContext, requested: AccessType) -> Result<()> {
        self.sec_type.require_access(ctx, requested)
    }

    pub fn query_access(&self, ctx: &AccessContext) -> Option<AccessType> {
        self.sec_type.query_access(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn domain_ctx(
        registry: &Arc<SecurityRegistry>,
        name: &str,
        privs: Privilege,
    ) -> AccessContext {
        let sys = registry.system_context();
        let domain = registry
            .create_type(&sys, SecTypeName::new(name).unwrap())
            .unwrap();
        AccessContext::new(domain, PrivilegeSet::new(privs))
    }

    #[test]
    fn test_non_mac_levels_never_deny() {
        for level in [SecurityLevel::NoSecurity, SecurityLevel::Rbac] {
            let registry = SecurityRegistry::new(level);
            let ctx = registry.public_context();
            let target = registry.system_type();
            // no rules at all, still granted
            assert!(target.require_access(&ctx, AccessType::Control).is_ok());
            assert_eq!(target.query_access(&ctx), Some(AccessType::Control));
        }
    }

    #[test]
    fn test_mac_rule_lookup() {
        let registry = SecurityRegistry::new(SecurityLevel::Mac);
        let sys = registry.system_context();
        let ctx = domain_ctx(&registry, "TENANT_A", Privilege::empty());
        let target = registry
            .create_type(&sys, SecTypeName::new("DATA").unwrap())
            .unwrap();

        // no rule: denied
        assert_matches!(
            target.require_access(&ctx, AccessType::View),
            Err(Error::AccessDenied { .. })
        );

        target
            .add_rule(&sys, ctx.subject_domain().name(), AccessType::Use)
            .unwrap();
        assert!(target.require_access(&ctx, AccessType::View).is_ok());
        assert!(target.require_access(&ctx, AccessType::Use).is_ok());
        let err = target
            .require_access(&ctx, AccessType::Change)
            .unwrap_err();
        match err {
            Error::AccessDenied {
                subject_domain,
                object_type,
                requested,
            } => {
                assert_eq!(subject_domain, "TENANT_A");
                assert_eq!(object_type, "DATA");
                assert_eq!(requested, AccessType::Change);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_mac_override_privilege() {
        let registry = SecurityRegistry::new(SecurityLevel::Mac);
        let ctx = domain_ctx(&registry, "OVERRIDER", Privilege::MAC_OVRD);
        let target = registry.public_type();
        // no rule, but MAC_OVRD allows anything
        assert!(target.require_access(&ctx, AccessType::Control).is_ok());
    }

    #[test]
    fn test_query_access_unions_privs_and_rules() {
        let registry = SecurityRegistry::new(SecurityLevel::Mac);
        let sys = registry.system_context();
        let ctx = domain_ctx(&registry, "VIEWER", Privilege::OBJ_VIEW);
        let target = registry.public_type();

        assert_eq!(target.query_access(&ctx), Some(AccessType::View));
        target
            .add_rule(&sys, ctx.subject_domain().name(), AccessType::Change)
            .unwrap();
        assert_eq!(target.query_access(&ctx), Some(AccessType::Change));

        let nobody = domain_ctx(&registry, "NOBODY", Privilege::empty());
        assert_eq!(target.query_access(&nobody), None);
    }

    #[test]
    fn test_rule_mutation_requires_admin() {
        let registry = SecurityRegistry::new(SecurityLevel::Mac);
        let ctx = registry.public_context();
        let target = registry.public_type();
        assert_matches!(
            target.add_rule(&ctx, ctx.subject_domain().name(), AccessType::View),
            Err(Error::MissingPrivileges { .. })
        );
        assert_matches!(
            target.get_all_rules(&ctx),
            Err(Error::MissingPrivileges { .. })
        );
    }

    #[test]
    fn test_reload_preserves_builtins_and_drops_stale_types() {
        let registry = SecurityRegistry::new(SecurityLevel::Mac);
        let sys = registry.system_context();
        let stale = SecTypeName::new("STALE").unwrap();
        registry.create_type(&sys, stale.clone()).unwrap();

        let fresh = SecTypeName::new("FRESH").unwrap();
        let snapshot = SecuritySnapshot {
            types: vec![fresh.clone()],
            rules: vec![SecurityRule {
                domain: SecTypeName::new("PUBLIC").unwrap(),
                object_type: fresh.clone(),
                access: AccessType::Use,
            }],
        };
        registry.reload(&sys, &snapshot).unwrap();

        assert!(registry.get_type(&stale).is_none());
        assert!(registry.get_type(&SecTypeName::new("SYSTEM").unwrap()).is_some());
        assert!(registry.get_type(&SecTypeName::new("PUBLIC").unwrap()).is_some());
        let fresh_type = registry.get_type(&fresh).unwrap();
        assert_eq!(
            fresh_type.get_rule(&SecTypeName::new("PUBLIC").unwrap()),
            Some(AccessType::Use)
        );
    }
}
