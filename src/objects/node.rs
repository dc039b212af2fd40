//! Cluster nodes
//!
//! A node is the root of all per-host state: the resources deployed on it,
//! the storage pools it offers, and the network interfaces it is reachable
//! through. Node creation is the one entity flow that manages its own
//! transaction context, because callers bootstrapping a cluster have no
//! enclosing request transaction yet.

use std::sync::Arc;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::drivers::{EntityDriver, EntityRecord, Table};
use crate::error::{Error, Result};
use crate::objects::name::{NodeName, ResourceName, StorPoolName};
use crate::objects::registry::CoreRegistry;
use crate::objects::resource::Resource;
use crate::objects::stor_pool::StorPool;
use crate::security::{AccessContext, AccessType, ObjectProtection};
use crate::transaction::{
    PropsContainer, StateFlags, TransactionMgr, TransactionObject, TxCell, TxCellOps, TxList,
    TxMap,
};

bitflags! {
    /// Persistent node state flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NodeFlags: u64 {
        /// Marked for deletion; the physical erase follows once the node
        /// has no more dependents
        const DELETE  = 0x0000_0001;
        /// Excluded from quorum accounting
        const QIGNORE = 0x0001_0000;
    }
}

/// Role of a node within the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeType {
    Controller,
    Satellite,
    Combined,
    Auxiliary,
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeType::Controller => write!(f, "CONTROLLER"),
            NodeType::Satellite => write!(f, "SATELLITE"),
            NodeType::Combined => write!(f, "COMBINED"),
            NodeType::Auxiliary => write!(f, "AUXILIARY"),
        }
    }
}

impl std::str::FromStr for NodeType {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_uppercase().as_str() {
            "CONTROLLER" => Ok(NodeType::Controller),
            "SATELLITE" => Ok(NodeType::Satellite),
            "COMBINED" => Ok(NodeType::Combined),
            "AUXILIARY" => Ok(NodeType::Auxiliary),
            _ => Err(Error::Configuration(format!("Unknown node type: {value}"))),
        }
    }
}

/// One network interface of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetInterface {
    pub name: String,
    pub address: String,
}

// =============================================================================
// Node
// =============================================================================

/// A cluster node
pub struct Node {
    uuid: Uuid,
    name: NodeName,
    obj_prot: ObjectProtection,
    node_type: TxCell<NodeType>,
    flags: StateFlags<NodeFlags>,
    props: PropsContainer,
    resources: TxMap<ResourceName, Arc<Resource>>,
    stor_pools: TxMap<StorPoolName, Arc<StorPool>>,
    net_interfaces: TxList<NetInterface>,
}

impl Node {
    pub fn new(
        ctx: &AccessContext,
        driver: Arc<dyn EntityDriver>,
        name: NodeName,
        node_type: NodeType,
    ) -> Arc<Self> {
        let uuid = Uuid::new_v4();
        let flags_driver = driver.clone();
        Arc::new(Self {
            uuid,
            name,
            obj_prot: ObjectProtection::new(ctx),
            node_type: TxCell::new(node_type),
            flags: StateFlags::with_persist(
                NodeFlags::empty(),
                Box::new(move |flags: &NodeFlags| {
                    flags_driver.update_flags(Table::Nodes, uuid, flags.bits())
                }),
            ),
            props: PropsContainer::new(),
            resources: TxMap::new(),
            stor_pools: TxMap::new(),
            net_interfaces: TxList::new(Vec::new()),
        })
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn name(&self) -> &NodeName {
        &self.name
    }

    pub fn obj_prot(&self) -> &ObjectProtection {
        &self.obj_prot
    }

    pub fn require_access(&self, ctx: &AccessContext, requested: AccessType) -> Result<()> {
        self.obj_prot.require_access(ctx, requested)
    }

    pub fn node_type(&self, ctx: &AccessContext) -> Result<NodeType> {
        self.require_access(ctx, AccessType::View)?;
        Ok(self.node_type.get())
    }

    pub fn set_node_type(
        self: &Arc<Self>,
        ctx: &AccessContext,
        tx: &TransactionMgr,
        node_type: NodeType,
    ) -> Result<()> {
        self.require_access(ctx, AccessType::Change)?;
        self.node_type.set(tx, node_type);
        tx.touch(self.clone());
        Ok(())
    }

    pub fn flags(&self) -> NodeFlags {
        self.flags.get()
    }

    pub fn is_deleted(&self) -> bool {
        self.flags.is_set(NodeFlags::DELETE)
    }

    /// Reject mutation on a node already marked for deletion
    pub fn require_not_deleted(&self) -> Result<()> {
        if self.is_deleted() {
            Err(Error::DeletedObject {
                kind: "Node",
                name: self.name.display().to_string(),
            })
        } else {
            Ok(())
        }
    }

    pub fn mark_deleted(
        self: &Arc<Self>,
        ctx: &AccessContext,
        tx: &TransactionMgr,
    ) -> Result<()> {
        self.require_access(ctx, AccessType::Control)?;
        self.flags.enable(tx, NodeFlags::DELETE);
        tx.touch(self.clone());
        Ok(())
    }

    pub fn props(&self) -> &PropsContainer {
        &self.props
    }

    pub fn set_prop(
        self: &Arc<Self>,
        ctx: &AccessContext,
        tx: &TransactionMgr,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<()> {
        self.require_access(ctx, AccessType::Change)?;
        self.props.set(tx, key, value);
        tx.touch(self.clone());
        Ok(())
    }

    pub fn get_resource(&self, ctx: &AccessContext, name: &ResourceName) -> Result<Arc<Resource>> {
        self.require_access(ctx, AccessType::View)?;
        self.resources.get(name).ok_or_else(|| Error::NotFound {
            kind: "Resource",
            name: format!("{}/{}", self.name, name),
        })
    }

    pub fn has_resource(&self, name: &ResourceName) -> bool {
        self.resources.contains_key(name)
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    pub(crate) fn put_resource(self: &Arc<Self>, tx: &TransactionMgr, rsc: Arc<Resource>) {
        self.resources
            .insert(tx, rsc.definition().name().clone(), rsc);
        tx.touch(self.clone());
    }

    pub(crate) fn remove_resource(self: &Arc<Self>, tx: &TransactionMgr, name: &ResourceName) {
        self.resources.remove(tx, name);
        tx.touch(self.clone());
    }

    pub fn get_stor_pool(
        &self,
        ctx: &AccessContext,
        name: &StorPoolName,
    ) -> Result<Arc<StorPool>> {
        self.require_access(ctx, AccessType::View)?;
        self.stor_pools.get(name).ok_or_else(|| Error::NotFound {
            kind: "StorPool",
            name: format!("{}/{}", self.name, name),
        })
    }

    pub fn stor_pool_count(&self) -> usize {
        self.stor_pools.len()
    }

    pub(crate) fn put_stor_pool(self: &Arc<Self>, tx: &TransactionMgr, pool: Arc<StorPool>) {
        self.stor_pools.insert(tx, pool.name().clone(), pool);
        tx.touch(self.clone());
    }

    pub(crate) fn remove_stor_pool(self: &Arc<Self>, tx: &TransactionMgr, name: &StorPoolName) {
        self.stor_pools.remove(tx, name);
        tx.touch(self.clone());
    }

    pub fn net_interfaces(&self, ctx: &AccessContext) -> Result<Vec<NetInterface>> {
        self.require_access(ctx, AccessType::View)?;
        Ok(self.net_interfaces.get_all())
    }

    pub fn add_net_interface(
        self: &Arc<Self>,
        ctx: &AccessContext,
        tx: &TransactionMgr,
        net_if: NetInterface,
    ) -> Result<()> {
        self.require_access(ctx, AccessType::Change)?;
        self.net_interfaces.append(tx, net_if);
        tx.touch(self.clone());
        Ok(())
    }

    /// Whether any resource or storage pool still references this node
    pub fn has_dependents(&self) -> bool {
        !self.resources.is_empty() || !self.stor_pools.is_empty()
    }

    pub(crate) fn record(&self) -> EntityRecord {
        EntityRecord {
            uuid: self.uuid.as_hyphenated().to_string(),
            name: self.name.value().to_string(),
            dsp_name: self.name.display().to_string(),
            flags: self.flags.mask(),
            layer_stack: None,
        }
    }
}

impl TransactionObject for Node {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn tx_cells(&self) -> Vec<&dyn TxCellOps> {
        vec![
            &self.node_type,
            self.flags.as_cell(),
            self.props.as_cell(),
            &self.resources,
            &self.stor_pools,
            &self.net_interfaces,
        ]
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("uuid", &self.uuid)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Node Factory
// =============================================================================

/// Creates and deletes nodes.
///
/// Creation runs through explicit phases (validate, persist, register,
/// commit) so that a failure in any phase can undo exactly the work of the
/// phases already completed, instead of inferring progress from the error.
pub struct NodeFactory {
    driver: Arc<dyn EntityDriver>,
    registry: Arc<CoreRegistry>,
}

impl NodeFactory {
    pub fn new(driver: Arc<dyn EntityDriver>, registry: Arc<CoreRegistry>) -> Self {
        Self { driver, registry }
    }

    /// Create a node inside the caller's transaction context. The caller
    /// commits or rolls back.
    pub fn create(
        &self,
        ctx: &AccessContext,
        tx: &TransactionMgr,
        name: NodeName,
        node_type: NodeType,
    ) -> Result<Arc<Node>> {
        self.registry.require_nodes_access(ctx, AccessType::Change)?;
        if self.registry.contains_node(&name) {
            return Err(Error::AlreadyExists {
                kind: "Node",
                name: name.display().to_string(),
            });
        }

        let node = Node::new(ctx, self.driver.clone(), name, node_type);
        self.driver.create(Table::Nodes, node.record())?;
        self.registry.put_node(ctx, node.clone())?;
        tx.touch(node.clone());
        Ok(node)
    }

    /// Create a node in a dedicated transaction context and commit it.
    ///
    /// Phase failures undo completed phases explicitly: a persist failure
    /// only rolls back staged state, a registration failure additionally
    /// deletes the persisted row, and a commit failure unregisters the node
    /// and deletes the row before escalating.
    pub fn create_and_commit(
        &self,
        ctx: &AccessContext,
        name: NodeName,
        node_type: NodeType,
    ) -> Result<Arc<Node>> {
        let tx = TransactionMgr::new();

        // phase 1: validate
        self.registry.require_nodes_access(ctx, AccessType::Change)?;
        if self.registry.contains_node(&name) {
            return Err(Error::AlreadyExists {
                kind: "Node",
                name: name.display().to_string(),
            });
        }

        // phase 2: construct and persist
        let node = Node::new(ctx, self.driver.clone(), name, node_type);
        if let Err(create_err) = self.driver.create(Table::Nodes, node.record()) {
            tx.rollback();
            return Err(create_err);
        }

        // phase 3: register
        if let Err(reg_err) = self.registry.put_node(ctx, node.clone()) {
            if let Err(cleanup_err) = self.driver.delete(Table::Nodes, node.uuid()) {
                warn!(
                    node = %node.name(),
                    error = %cleanup_err,
                    "failed to erase node row while undoing registration failure"
                );
            }
            tx.rollback();
            return Err(reg_err);
        }
        tx.touch(node.clone());

        // phase 4: commit
        if let Err(commit_err) = tx.commit() {
            self.registry.remove_node_registration(node.name());
            if let Err(cleanup_err) = self.driver.delete(Table::Nodes, node.uuid()) {
                warn!(
                    node = %node.name(),
                    error = %cleanup_err,
                    "failed to erase node row while undoing commit failure"
                );
            }
            return Err(commit_err);
        }

        info!(node = %node.name(), node_type = %node_type, "node created");
        Ok(node)
    }

    /// Delete a node: marked for deletion while dependents remain, erased
    /// physically once nothing references it
    pub fn delete(
        &self,
        ctx: &AccessContext,
        tx: &TransactionMgr,
        node: &Arc<Node>,
    ) -> Result<()> {
        node.require_access(ctx, AccessType::Control)?;
        if node.has_dependents() {
            node.mark_deleted(ctx, tx)?;
            info!(node = %node.name(), "node marked for deletion, dependents remain");
        } else {
            self.driver.delete(Table::Nodes, node.uuid())?;
            self.registry.remove_node(ctx, node.name())?;
            info!(node = %node.name(), "node erased");
        }
        Ok(())
    }
}
