//! Per-node resources
//!
//! A resource is the deployment of a resource definition on one node. It
//! holds the volumes deployed for it, pairwise connections to its peer
//! resources, and the root of its layer data tree.

use std::sync::Arc;

use bitflags::bitflags;
use uuid::Uuid;

use crate::drivers::{EntityDriver, EntityRecord, Table};
use crate::error::{Error, Result};
use crate::layers::{LayerPayload, LayerStackBuilder, RscLayerData};
use crate::objects::name::NodeName;
use crate::objects::node::Node;
use crate::objects::numbers::VolumeNumber;
use crate::objects::resource_definition::ResourceDefinition;
use crate::objects::volume::Volume;
use crate::security::{AccessContext, AccessType, ObjectProtection};
use crate::transaction::{
    PropsContainer, StateFlags, TransactionMgr, TransactionObject, TxCellOps, TxMap,
};

bitflags! {
    /// Persistent resource state flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RscFlags: u64 {
        /// The satellite has brought the resource up to its target state
        const CLEAN  = 0x0000_0001;
        const DELETE = 0x0000_0002;
    }
}

/// Pairwise connection state between two resources of the same definition
pub struct ResourceConnection {
    uuid: Uuid,
    props: PropsContainer,
}

impl ResourceConnection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            uuid: Uuid::new_v4(),
            props: PropsContainer::new(),
        })
    }

    pub fn props(&self) -> &PropsContainer {
        &self.props
    }
}

impl TransactionObject for ResourceConnection {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn tx_cells(&self) -> Vec<&dyn TxCellOps> {
        vec![self.props.as_cell()]
    }
}

// =============================================================================
// Resource
// =============================================================================

/// Deployment of a resource definition on one node
pub struct Resource {
    uuid: Uuid,
    definition: Arc<ResourceDefinition>,
    node: Arc<Node>,
    obj_prot: ObjectProtection,
    flags: StateFlags<RscFlags>,
    props: PropsContainer,
    volumes: TxMap<VolumeNumber, Arc<Volume>>,
    /// Connections to peer resources, keyed by the peer's node name
    connections: TxMap<NodeName, Arc<ResourceConnection>>,
    layer_root: parking_lot::Mutex<Option<Arc<RscLayerData>>>,
}

impl Resource {
    fn new(
        ctx: &AccessContext,
        driver: Arc<dyn EntityDriver>,
        definition: Arc<ResourceDefinition>,
        node: Arc<Node>,
    ) -> Arc<Self> {
        let uuid = Uuid::new_v4();
        let flags_driver = driver;
        Arc::new(Self {
            uuid,
            definition,
            node,
            obj_prot: ObjectProtection::new(ctx),
            flags: StateFlags::with_persist(
                RscFlags::empty(),
                Box::new(move |flags: &RscFlags| {
                    flags_driver.update_flags(Table::Resources, uuid, flags.bits())
                }),
            ),
            props: PropsContainer::new(),
            volumes: TxMap::new(),
            connections: TxMap::new(),
            layer_root: parking_lot::Mutex::new(None),
        })
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn definition(&self) -> &Arc<ResourceDefinition> {
        &self.definition
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn obj_prot(&self) -> &ObjectProtection {
        &self.obj_prot
    }

    pub fn require_access(&self, ctx: &AccessContext, requested: AccessType) -> Result<()> {
        self.obj_prot.require_access(ctx, requested)
    }

    pub fn flags(&self) -> RscFlags {
        self.flags.get()
    }

    pub fn mark_clean(self: &Arc<Self>, ctx: &AccessContext, tx: &TransactionMgr) -> Result<()> {
        self.require_access(ctx, AccessType::Change)?;
        self.flags.enable(tx, RscFlags::CLEAN);
        tx.touch(self.clone());
        Ok(())
    }

    pub fn mark_deleted(
        self: &Arc<Self>,
        ctx: &AccessContext,
        tx: &TransactionMgr,
    ) -> Result<()> {
        self.require_access(ctx, AccessType::Control)?;
        self.flags.enable(tx, RscFlags::DELETE);
        tx.touch(self.clone());
        Ok(())
    }

    pub fn is_deleted(&self) -> bool {
        self.flags.is_set(RscFlags::DELETE)
    }

    pub fn props(&self) -> &PropsContainer {
        &self.props
    }

    pub fn get_volume(&self, vlm_nr: VolumeNumber) -> Option<Arc<Volume>> {
        self.volumes.get(&vlm_nr)
    }

    pub fn has_volume(&self, vlm_nr: VolumeNumber) -> bool {
        self.volumes.contains_key(&vlm_nr)
    }

    pub fn volumes(&self) -> Vec<Arc<Volume>> {
        self.volumes.values()
    }

    pub fn volume_count(&self) -> usize {
        self.volumes.len()
    }

    pub(crate) fn put_volume(self: &Arc<Self>, tx: &TransactionMgr, vlm: Arc<Volume>) {
        self.volumes.insert(tx, vlm.volume_number(), vlm);
        tx.touch(self.clone());
    }

    pub(crate) fn remove_volume(self: &Arc<Self>, tx: &TransactionMgr, vlm_nr: VolumeNumber) {
        self.volumes.remove(tx, &vlm_nr);
        tx.touch(self.clone());
    }

    pub fn get_connection(&self, peer: &NodeName) -> Option<Arc<ResourceConnection>> {
        self.connections.get(peer)
    }

    pub fn put_connection(
        self: &Arc<Self>,
        ctx: &AccessContext,
        tx: &TransactionMgr,
        peer: NodeName,
        conn: Arc<ResourceConnection>,
    ) -> Result<()> {
        self.require_access(ctx, AccessType::Change)?;
        self.connections.insert(tx, peer, conn);
        tx.touch(self.clone());
        Ok(())
    }

    /// Root of the layer data tree, `None` until the stack has been built
    pub fn layer_root(&self) -> Option<Arc<RscLayerData>> {
        self.layer_root.lock().clone()
    }

    pub(crate) fn set_layer_root(&self, root: Arc<RscLayerData>) {
        *self.layer_root.lock() = Some(root);
    }

    /// Resource key: node name plus definition name
    pub fn key(&self) -> String {
        format!("{}/{}", self.node.name(), self.definition.name())
    }

    pub(crate) fn record(&self) -> EntityRecord {
        EntityRecord {
            uuid: self.uuid.as_hyphenated().to_string(),
            name: format!(
                "{}/{}",
                self.node.name().value(),
                self.definition.name().value()
            ),
            dsp_name: self.key(),
            flags: self.flags.mask(),
            layer_stack: None,
        }
    }
}

impl TransactionObject for Resource {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn tx_cells(&self) -> Vec<&dyn TxCellOps> {
        vec![
            self.flags.as_cell(),
            self.props.as_cell(),
            &self.volumes,
            &self.connections,
        ]
    }
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("uuid", &self.uuid)
            .field("key", &self.key())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Resource Factory
// =============================================================================

pub struct ResourceFactory {
    driver: Arc<dyn EntityDriver>,
    layer_builder: LayerStackBuilder,
}

impl ResourceFactory {
    pub fn new(driver: Arc<dyn EntityDriver>) -> Self {
        Self {
            driver,
            layer_builder: LayerStackBuilder::new(),
        }
    }

    /// Deploy a resource definition on a node. The layer data tree is built
    /// immediately; device-layer volume objects follow as volumes are
    /// created.
    pub fn create(
        &self,
        ctx: &AccessContext,
        tx: &TransactionMgr,
        rsc_dfn: &Arc<ResourceDefinition>,
        node: &Arc<Node>,
    ) -> Result<Arc<Resource>> {
        node.require_access(ctx, AccessType::Use)?;
        node.require_not_deleted()?;
        rsc_dfn.require_access(ctx, AccessType::Use)?;
        rsc_dfn.require_not_deleted()?;
        if rsc_dfn.has_resource(node.name()) {
            return Err(Error::AlreadyExists {
                kind: "Resource",
                name: format!("{}/{}", node.name(), rsc_dfn.name()),
            });
        }

        let rsc = Resource::new(ctx, self.driver.clone(), rsc_dfn.clone(), node.clone());
        self.driver.create(Table::Resources, rsc.record())?;
        node.put_resource(tx, rsc.clone());
        rsc_dfn.put_resource(tx, rsc.clone());
        tx.touch(rsc.clone());

        self.layer_builder
            .ensure_stack_data(ctx, tx, &rsc, &LayerPayload::new())?;
        Ok(rsc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::MemoryDriver;
    use crate::layers::LayerKind;
    use crate::objects::name::{NodeName, ResourceName};
    use crate::objects::node::{NodeFactory, NodeType};
    use crate::objects::registry::CoreRegistry;
    use crate::objects::resource_definition::ResourceDefinitionFactory;
    use crate::security::{SecurityLevel, SecurityRegistry};
    use assert_matches::assert_matches;

    fn setup() -> (
        Arc<MemoryDriver>,
        Arc<ResourceDefinition>,
        Arc<Node>,
        AccessContext,
        TransactionMgr,
    ) {
        let security = SecurityRegistry::new(SecurityLevel::Mac);
        let sys = security.system_context();
        let registry = CoreRegistry::new(&sys);
        let driver = Arc::new(MemoryDriver::new());
        let node = NodeFactory::new(driver.clone(), registry.clone())
            .create_and_commit(&sys, NodeName::new("N1").unwrap(), NodeType::Satellite)
            .unwrap();
        let tx = TransactionMgr::new();
        let rsc_dfn = ResourceDefinitionFactory::new(driver.clone(), registry)
            .create(
                &sys,
                &tx,
                ResourceName::new("R1").unwrap(),
                vec![LayerKind::Replication, LayerKind::Storage],
            )
            .unwrap();
        (driver, rsc_dfn, node, sys, tx)
    }

    #[test]
    fn test_create_builds_layer_tree_and_registers_twice() {
        let (driver, rsc_dfn, node, sys, tx) = setup();
        let factory = ResourceFactory::new(driver.clone());

        let rsc = factory.create(&sys, &tx, &rsc_dfn, &node).unwrap();
        assert_eq!(driver.row_count(Table::Resources), 1);
        assert!(node.has_resource(rsc_dfn.name()));
        assert!(rsc_dfn.has_resource(node.name()));

        let root = rsc.layer_root().unwrap();
        assert_eq!(root.kind(), LayerKind::Replication);
        let child = root.child(LayerKind::Storage).unwrap();
        assert_eq!(child.kind(), LayerKind::Storage);
        assert!(child.children().is_empty());
    }

    #[test]
    fn test_duplicate_deployment_rejected() {
        let (driver, rsc_dfn, node, sys, tx) = setup();
        let factory = ResourceFactory::new(driver);

        factory.create(&sys, &tx, &rsc_dfn, &node).unwrap();
        let err = factory.create(&sys, &tx, &rsc_dfn, &node).unwrap_err();
        assert_matches!(err, Error::AlreadyExists { kind: "Resource", .. });
    }
}
