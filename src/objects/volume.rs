//! Per-node volumes
//!
//! A volume is the deployment of a volume definition within one resource.
//! Creating a volume allocates its device-layer volume object from the
//! storage pool assigned to it and registers the volume with both its
//! resource and its volume definition.

use std::collections::BTreeMap;
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::drivers::{EntityDriver, EntityRecord, Table};
use crate::error::{Error, Result};
use crate::layers::{LayerKind, LayerPayload, LayerStackBuilder, StorageVlmData};
use crate::objects::name::{NodeName, StorPoolName};
use crate::objects::numbers::VolumeNumber;
use crate::objects::resource::Resource;
use crate::objects::volume_definition::VolumeDefinition;
use crate::security::{AccessContext, AccessType};
use crate::transaction::{
    PropsContainer, StateFlags, TransactionMgr, TransactionObject, TxCellOps, TxMap,
};

bitflags! {
    /// Persistent volume state flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VolumeFlags: u64 {
        /// The backing device matches the target state
        const CLEAN  = 0x0000_0001;
        const DELETE = 0x0000_0002;
        const RESIZE = 0x0000_0004;
    }
}

/// Pairwise connection state between the same volume on two nodes
pub struct VolumeConnection {
    uuid: Uuid,
    props: PropsContainer,
}

impl VolumeConnection {
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

impl TransactionObject for VolumeConnection {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn tx_cells(&self) -> Vec<&dyn TxCellOps> {
        vec![self.props.as_cell()]
    }
}

// =============================================================================
// Volume
// =============================================================================

/// Deployment of a volume definition within one resource
pub struct Volume {
    uuid: Uuid,
    resource: Arc<Resource>,
    definition: Arc<VolumeDefinition>,
    flags: StateFlags<VolumeFlags>,
    props: PropsContainer,
    /// Connections to the same volume on peer nodes
    connections: TxMap<NodeName, Arc<VolumeConnection>>,
    /// Device-layer volume object, set once the layer stack has been built
    layer_data: Mutex<Option<Arc<StorageVlmData>>>,
}

impl Volume {
    fn new(
        driver: Arc<dyn EntityDriver>,
        resource: Arc<Resource>,
        definition: Arc<VolumeDefinition>,
    ) -> Arc<Self> {
        let uuid = Uuid::new_v4();
        let flags_driver = driver;
        Arc::new(Self {
            uuid,
            resource,
            definition,
            flags: StateFlags::with_persist(
                VolumeFlags::empty(),
                Box::new(move |flags: &VolumeFlags| {
                    flags_driver.update_flags(Table::Volumes, uuid, flags.bits())
                }),
            ),
            props: PropsContainer::new(),
            connections: TxMap::new(),
            layer_data: Mutex::new(None),
        })
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn resource(&self) -> &Arc<Resource> {
        &self.resource
    }

    pub fn definition(&self) -> &Arc<VolumeDefinition> {
        &self.definition
    }

    pub fn volume_number(&self) -> VolumeNumber {
        self.definition.volume_number()
    }

    /// Access checks delegate to the owning resource
    pub fn require_access(&self, ctx: &AccessContext, requested: AccessType) -> Result<()> {
        self.resource.require_access(ctx, requested)
    }

    pub fn flags(&self) -> VolumeFlags {
        self.flags.get()
    }

    pub fn mark_clean(self: &Arc<Self>, ctx: &AccessContext, tx: &TransactionMgr) -> Result<()> {
        self.require_access(ctx, AccessType::Change)?;
        self.flags.enable(tx, VolumeFlags::CLEAN);
        tx.touch(self.clone());
        Ok(())
    }

    pub fn mark_deleted(
        self: &Arc<Self>,
        ctx: &AccessContext,
        tx: &TransactionMgr,
    ) -> Result<()> {
        self.require_access(ctx, AccessType::Control)?;
        self.flags.enable(tx, VolumeFlags::DELETE);
        tx.touch(self.clone());
        Ok(())
    }

    pub fn is_deleted(&self) -> bool {
        self.flags.is_set(VolumeFlags::DELETE)
    }

    pub fn props(&self) -> &PropsContainer {
        &self.props
    }

    pub fn get_connection(&self, peer: &NodeName) -> Option<Arc<VolumeConnection>> {
        self.connections.get(peer)
    }

    pub fn put_connection(
        self: &Arc<Self>,
        ctx: &AccessContext,
        tx: &TransactionMgr,
        peer: NodeName,
        conn: Arc<VolumeConnection>,
    ) -> Result<()> {
        self.require_access(ctx, AccessType::Change)?;
        self.connections.insert(tx, peer, conn);
        tx.touch(self.clone());
        Ok(())
    }

    pub fn layer_data(&self) -> Option<Arc<StorageVlmData>> {
        self.layer_data.lock().clone()
    }

    pub(crate) fn set_layer_data(&self, data: Arc<StorageVlmData>) {
        *self.layer_data.lock() = Some(data);
    }

    /// Volume key: node, resource, and volume number
    pub fn key(&self) -> String {
        format!("{}/{}", self.resource.key(), self.volume_number())
    }

    pub(crate) fn record(&self) -> EntityRecord {
        EntityRecord {
            uuid: self.uuid.as_hyphenated().to_string(),
            name: format!(
                "{}/{}/{}",
                self.resource.node().name().value(),
                self.definition.resource_definition().name().value(),
                self.volume_number()
            ),
            dsp_name: self.key(),
            flags: self.flags.mask(),
            layer_stack: None,
        }
    }
}

impl TransactionObject for Volume {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn tx_cells(&self) -> Vec<&dyn TxCellOps> {
        vec![
            self.flags.as_cell(),
            self.props.as_cell(),
            &self.connections,
        ]
    }
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("uuid", &self.uuid)
            .field("key", &self.key())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Volume Factory
// =============================================================================

pub struct VolumeFactory {
    driver: Arc<dyn EntityDriver>,
    layer_builder: LayerStackBuilder,
}

impl VolumeFactory {
    pub fn new(driver: Arc<dyn EntityDriver>) -> Self {
        Self {
            driver,
            layer_builder: LayerStackBuilder::new(),
        }
    }

    /// Deploy a volume definition within a resource, allocating its
    /// device-layer volume object from the assigned storage pools.
    ///
    /// `stor_pool_map` assigns one pool per layer resource name suffix.
    /// Linear stacks only carry the empty suffix, so any other assignment
    /// is rejected.
    pub fn create(
        &self,
        ctx: &AccessContext,
        tx: &TransactionMgr,
        rsc: &Arc<Resource>,
        vlm_dfn: &Arc<VolumeDefinition>,
        stor_pool_map: &BTreeMap<String, StorPoolName>,
    ) -> Result<Arc<Volume>> {
        rsc.require_access(ctx, AccessType::Use)?;
        vlm_dfn.require_not_deleted()?;
        if !Arc::ptr_eq(rsc.definition(), vlm_dfn.resource_definition()) {
            return Err(Error::Internal(format!(
                "volume definition {}/{} does not belong to resource definition {}",
                vlm_dfn.resource_definition().name(),
                vlm_dfn.volume_number(),
                rsc.definition().name()
            )));
        }
        let vlm_nr = vlm_dfn.volume_number();
        if rsc.has_volume(vlm_nr) {
            return Err(Error::AlreadyExists {
                kind: "Volume",
                name: format!("{}/{}", rsc.key(), vlm_nr),
            });
        }
        for suffix in stor_pool_map.keys() {
            if !suffix.is_empty() {
                return Err(Error::Configuration(format!(
                    "storage pool assigned to unknown layer resource name suffix '{suffix}'"
                )));
            }
        }

        let vlm = Volume::new(self.driver.clone(), rsc.clone(), vlm_dfn.clone());
        self.driver.create(Table::Volumes, vlm.record())?;
        rsc.put_volume(tx, vlm.clone());
        vlm_dfn.put_volume(tx, rsc.node().name().clone(), vlm.clone());
        tx.touch(vlm.clone());

        let mut payload = LayerPayload::new();
        for (suffix, pool_name) in stor_pool_map {
            payload.put_storage_pool(suffix.clone(), vlm_nr, pool_name.clone());
        }
        let build_result = self
            .layer_builder
            .ensure_stack_data(ctx, tx, rsc, &payload)
            .and_then(|()| {
                storage_data(rsc, vlm_nr).ok_or_else(|| {
                    Error::Internal(format!(
                        "layer stack of {} yielded no storage volume object for volume {vlm_nr}",
                        rsc.key()
                    ))
                })
            });
        let data = match build_result {
            Ok(data) => data,
            Err(build_err) => {
                // a failed layer build undoes the registrations and the
                // persisted row; the staged cells revert on the caller's
                // rollback
                rsc.remove_volume(tx, vlm_nr);
                vlm_dfn.remove_volume(tx, rsc.node().name());
                if let Err(cleanup_err) = self.driver.delete(Table::Volumes, vlm.uuid()) {
                    warn!(
                        volume = %vlm.key(),
                        error = %cleanup_err,
                        "failed to erase volume row while undoing failed create"
                    );
                }
                return Err(build_err);
            }
        };
        vlm.set_layer_data(data);
        Ok(vlm)
    }
}

/// Walk the linear layer chain down to the storage layer and return the
/// device-layer object of the given volume
fn storage_data(rsc: &Arc<Resource>, vlm_nr: VolumeNumber) -> Option<Arc<StorageVlmData>> {
    let mut current = rsc.layer_root()?;
    while current.kind() != LayerKind::Storage {
        current = current.children().into_iter().next()?;
    }
    current.volume(vlm_nr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::MemoryDriver;
    use crate::objects::name::{NodeName, ResourceName};
    use crate::objects::node::{Node, NodeFactory, NodeType};
    use crate::objects::numbers::MinorNumber;
    use crate::objects::registry::CoreRegistry;
    use crate::objects::resource::ResourceFactory;
    use crate::objects::resource_definition::ResourceDefinitionFactory;
    use crate::objects::stor_pool::StorPoolFactory;
    use crate::objects::volume_definition::VolumeDefinitionFactory;
    use crate::provider::DeviceProviderKind;
    use crate::security::{SecurityLevel, SecurityRegistry};
    use assert_matches::assert_matches;

    struct Fixture {
        driver: Arc<MemoryDriver>,
        rsc: Arc<Resource>,
        vlm_dfn: Arc<VolumeDefinition>,
        node: Arc<Node>,
        sys: AccessContext,
        tx: TransactionMgr,
        pool_map: BTreeMap<String, StorPoolName>,
    }

    fn setup() -> Fixture {
        let security = SecurityRegistry::new(SecurityLevel::Mac);
        let sys = security.system_context();
        let registry = CoreRegistry::new(&sys);
        let driver = Arc::new(MemoryDriver::new());
        let node = NodeFactory::new(driver.clone(), registry.clone())
            .create_and_commit(&sys, NodeName::new("N1").unwrap(), NodeType::Satellite)
            .unwrap();
        let tx = TransactionMgr::new();
        StorPoolFactory::new(driver.clone(), registry.clone())
            .create(
                &sys,
                &tx,
                &node,
                StorPoolName::new("pool-A").unwrap(),
                DeviceProviderKind::Lvm,
            )
            .unwrap();
        let rsc_dfn = ResourceDefinitionFactory::new(driver.clone(), registry)
            .create(
                &sys,
                &tx,
                ResourceName::new("R1").unwrap(),
                vec![LayerKind::Replication, LayerKind::Storage],
            )
            .unwrap();
        let vlm_dfn = VolumeDefinitionFactory::new(driver.clone())
            .create(
                &sys,
                &tx,
                &rsc_dfn,
                VolumeNumber::new(0).unwrap(),
                1_048_576,
                MinorNumber::new(1000).unwrap(),
            )
            .unwrap();
        let rsc = ResourceFactory::new(driver.clone())
            .create(&sys, &tx, &rsc_dfn, &node)
            .unwrap();
        let mut pool_map = BTreeMap::new();
        pool_map.insert(String::new(), StorPoolName::new("pool-A").unwrap());
        Fixture {
            driver,
            rsc,
            vlm_dfn,
            node,
            sys,
            tx,
            pool_map,
        }
    }

    #[test]
    fn test_create_allocates_from_assigned_pool() {
        let fx = setup();
        let factory = VolumeFactory::new(fx.driver.clone());

        let vlm = factory
            .create(&fx.sys, &fx.tx, &fx.rsc, &fx.vlm_dfn, &fx.pool_map)
            .unwrap();
        assert_eq!(fx.driver.row_count(Table::Volumes), 1);
        assert!(fx.rsc.has_volume(vlm.volume_number()));
        assert!(Arc::ptr_eq(
            &fx.vlm_dfn.get_volume(fx.node.name()).unwrap(),
            &vlm
        ));

        let data = vlm.layer_data().unwrap();
        assert_eq!(data.desired_size(), 1_048_576);
        assert_eq!(data.stor_pool().name().display(), "pool-A");
        assert_eq!(data.stor_pool().volume_count(), 1);
    }

    #[test]
    fn test_duplicate_volume_rejected() {
        let fx = setup();
        let factory = VolumeFactory::new(fx.driver.clone());

        factory
            .create(&fx.sys, &fx.tx, &fx.rsc, &fx.vlm_dfn, &fx.pool_map)
            .unwrap();
        let err = factory
            .create(&fx.sys, &fx.tx, &fx.rsc, &fx.vlm_dfn, &fx.pool_map)
            .unwrap_err();
        assert_matches!(err, Error::AlreadyExists { kind: "Volume", .. });
    }

    #[test]
    fn test_missing_pool_assignment_leaves_no_trace() {
        let fx = setup();
        let factory = VolumeFactory::new(fx.driver.clone());
        let err = factory
            .create(&fx.sys, &fx.tx, &fx.rsc, &fx.vlm_dfn, &BTreeMap::new())
            .unwrap_err();
        assert_matches!(err, Error::Configuration(_));
        assert_eq!(fx.driver.row_count(Table::Volumes), 0);
        assert_eq!(fx.rsc.volume_count(), 0);
        assert!(fx.vlm_dfn.get_volume(fx.node.name()).is_none());

        fx.tx.rollback();
        assert_eq!(fx.rsc.volume_count(), 0);
        assert!(fx.vlm_dfn.get_volume(fx.node.name()).is_none());
    }

    #[test]
    fn test_assignment_with_unknown_suffix_rejected() {
        let fx = setup();
        let factory = VolumeFactory::new(fx.driver.clone());
        let mut pool_map = fx.pool_map.clone();
        pool_map.insert(".meta".into(), StorPoolName::new("pool-A").unwrap());
        let err = factory
            .create(&fx.sys, &fx.tx, &fx.rsc, &fx.vlm_dfn, &pool_map)
            .unwrap_err();
        assert_matches!(err, Error::Configuration(_));
        assert_eq!(fx.driver.row_count(Table::Volumes), 0);
    }

    #[test]
    fn test_connection_staged_until_commit() {
        let fx = setup();
        let factory = VolumeFactory::new(fx.driver.clone());
        let vlm = factory
            .create(&fx.sys, &fx.tx, &fx.rsc, &fx.vlm_dfn, &fx.pool_map)
            .unwrap();
        fx.tx.commit().unwrap();

        let tx2 = TransactionMgr::new();
        let peer = NodeName::new("N2").unwrap();
        vlm.put_connection(&fx.sys, &tx2, peer.clone(), VolumeConnection::new())
            .unwrap();
        assert!(vlm.get_connection(&peer).is_some());

        tx2.rollback();
        assert!(vlm.get_connection(&peer).is_none());
    }
}
