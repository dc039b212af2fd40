//! Cluster-wide entity registry
//!
//! The registry maps are not transactional: an entity becomes visible
//! cluster-wide the moment it is registered. The factories order their
//! phases so that a failed creation removes its registration again before
//! escalating, and lookups of half-created entities are prevented by the
//! per-map access guards.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::objects::name::{NodeName, ResourceName, StorPoolName};
use crate::objects::node::Node;
use crate::objects::resource_definition::ResourceDefinition;
use crate::objects::stor_pool::StorPool;
use crate::security::{AccessContext, AccessType, ObjectProtection};

/// Top-level entity maps of the cluster
pub struct CoreRegistry {
    nodes: RwLock<BTreeMap<NodeName, Arc<Node>>>,
    rsc_dfns: RwLock<BTreeMap<ResourceName, Arc<ResourceDefinition>>>,
    stor_pools: RwLock<BTreeMap<(NodeName, StorPoolName), Arc<StorPool>>>,
    nodes_prot: ObjectProtection,
    rsc_dfns_prot: ObjectProtection,
    stor_pools_prot: ObjectProtection,
}

impl CoreRegistry {
    /// Create the registry; the map guards inherit the security domain of
    /// the initializing context
    pub fn new(ctx: &AccessContext) -> Arc<Self> {
        Arc::new(Self {
            nodes: RwLock::new(BTreeMap::new()),
            rsc_dfns: RwLock::new(BTreeMap::new()),
            stor_pools: RwLock::new(BTreeMap::new()),
            nodes_prot: ObjectProtection::new(ctx),
            rsc_dfns_prot: ObjectProtection::new(ctx),
            stor_pools_prot: ObjectProtection::new(ctx),
        })
    }

    // =========================================================================
    // Nodes
    // =========================================================================

    pub fn require_nodes_access(&self, ctx: &AccessContext, requested: AccessType) -> Result<()> {
        self.nodes_prot.require_access(ctx, requested)
    }

    pub fn contains_node(&self, name: &NodeName) -> bool {
        self.nodes.read().contains_key(name)
    }

    pub fn get_node(&self, ctx: &AccessContext, name: &NodeName) -> Result<Arc<Node>> {
        self.require_nodes_access(ctx, AccessType::View)?;
        self.nodes
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound {
                kind: "Node",
                name: name.display().to_string(),
            })
    }

    pub fn nodes(&self, ctx: &AccessContext) -> Result<Vec<Arc<Node>>> {
        self.require_nodes_access(ctx, AccessType::View)?;
        Ok(self.nodes.read().values().cloned().collect())
    }

    pub fn put_node(&self, ctx: &AccessContext, node: Arc<Node>) -> Result<()> {
        self.require_nodes_access(ctx, AccessType::Change)?;
        let mut nodes = self.nodes.write();
        if nodes.contains_key(node.name()) {
            return Err(Error::AlreadyExists {
                kind: "Node",
                name: node.name().display().to_string(),
            });
        }
        nodes.insert(node.name().clone(), node);
        Ok(())
    }

    pub fn remove_node(&self, ctx: &AccessContext, name: &NodeName) -> Result<()> {
        self.require_nodes_access(ctx, AccessType::Change)?;
        self.nodes.write().remove(name);
        Ok(())
    }

    /// Undo a registration while backing out of a failed creation; skips
    /// the access check because the failing flow already passed it
    pub(crate) fn remove_node_registration(&self, name: &NodeName) {
        self.nodes.write().remove(name);
    }

    // =========================================================================
    // Resource Definitions
    // =========================================================================

    pub fn require_rsc_dfns_access(
        &self,
        ctx: &AccessContext,
        requested: AccessType,
    ) -> Result<()> {
        self.rsc_dfns_prot.require_access(ctx, requested)
    }

    pub fn contains_rsc_dfn(&self, name: &ResourceName) -> bool {
        self.rsc_dfns.read().contains_key(name)
    }

    pub fn get_rsc_dfn(
        &self,
        ctx: &AccessContext,
        name: &ResourceName,
    ) -> Result<Arc<ResourceDefinition>> {
        self.require_rsc_dfns_access(ctx, AccessType::View)?;
        self.rsc_dfns
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound {
                kind: "ResourceDefinition",
                name: name.display().to_string(),
            })
    }

    pub fn rsc_dfns(&self, ctx: &AccessContext) -> Result<Vec<Arc<ResourceDefinition>>> {
        self.require_rsc_dfns_access(ctx, AccessType::View)?;
        Ok(self.rsc_dfns.read().values().cloned().collect())
    }

    pub fn put_rsc_dfn(&self, ctx: &AccessContext, rsc_dfn: Arc<ResourceDefinition>) -> Result<()> {
        self.require_rsc_dfns_access(ctx, AccessType::Change)?;
        let mut rsc_dfns = self.rsc_dfns.write();
        if rsc_dfns.contains_key(rsc_dfn.name()) {
            return Err(Error::AlreadyExists {
                kind: "ResourceDefinition",
                name: rsc_dfn.name().display().to_string(),
            });
        }
        rsc_dfns.insert(rsc_dfn.name().clone(), rsc_dfn);
        Ok(())
    }

    pub fn remove_rsc_dfn(&self, ctx: &AccessContext, name: &ResourceName) -> Result<()> {
        self.require_rsc_dfns_access(ctx, AccessType::Change)?;
        self.rsc_dfns.write().remove(name);
        Ok(())
    }

    // =========================================================================
    // Storage Pools
    // =========================================================================

    pub fn require_stor_pools_access(
        &self,
        ctx: &AccessContext,
        requested: AccessType,
    ) -> Result<()> {
        self.stor_pools_prot.require_access(ctx, requested)
    }

    pub fn contains_stor_pool(&self, node: &NodeName, name: &StorPoolName) -> bool {
        self.stor_pools
            .read()
            .contains_key(&(node.clone(), name.clone()))
    }

    pub fn get_stor_pool(
        &self,
        ctx: &AccessContext,
        node: &NodeName,
        name: &StorPoolName,
    ) -> Result<Arc<StorPool>> {
        self.require_stor_pools_access(ctx, AccessType::View)?;
        self.stor_pools
            .read()
            .get(&(node.clone(), name.clone()))
            .cloned()
            .ok_or_else(|| Error::NotFound {
                kind: "StorPool",
                name: format!("{node}/{name}"),
            })
    }

    pub fn stor_pools(&self, ctx: &AccessContext) -> Result<Vec<Arc<StorPool>>> {
        self.require_stor_pools_access(ctx, AccessType::View)?;
        Ok(self.stor_pools.read().values().cloned().collect())
    }

    pub fn put_stor_pool(&self, ctx: &AccessContext, pool: Arc<StorPool>) -> Result<()> {
        self.require_stor_pools_access(ctx, AccessType::Change)?;
        let key = (pool.node().name().clone(), pool.name().clone());
        let mut stor_pools = self.stor_pools.write();
        if stor_pools.contains_key(&key) {
            return Err(Error::AlreadyExists {
                kind: "StorPool",
                name: pool.key(),
            });
        }
        stor_pools.insert(key, pool);
        Ok(())
    }

    pub fn remove_stor_pool(
        &self,
        ctx: &AccessContext,
        node: &NodeName,
        name: &StorPoolName,
    ) -> Result<()> {
        self.require_stor_pools_access(ctx, AccessType::Change)?;
        self.stor_pools
            .write()
            .remove(&(node.clone(), name.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::name::SecTypeName;
    use crate::security::{Privilege, PrivilegeSet, SecurityLevel, SecurityRegistry};
    use assert_matches::assert_matches;

    #[test]
    fn test_lookup_requires_view_access() {
        let security = SecurityRegistry::new(SecurityLevel::Mac);
        let sys = security.system_context();
        let registry = CoreRegistry::new(&sys);

        let tenant = security
            .create_type(&sys, SecTypeName::new("TENANT").unwrap())
            .unwrap();
        let tenant_ctx = AccessContext::new(tenant, PrivilegeSet::new(Privilege::empty()));

        assert_matches!(
            registry.get_node(&tenant_ctx, &NodeName::new("N1").unwrap()),
            Err(Error::AccessDenied { .. })
        );
        // the system domain passes the guard but the node does not exist
        assert_matches!(
            registry.get_node(&sys, &NodeName::new("N1").unwrap()),
            Err(Error::NotFound { kind: "Node", .. })
        );
    }
}
