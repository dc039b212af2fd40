//! Node-local storage pools
//!
//! A storage pool binds one device provider backend to one node. It tracks
//! the device-layer volume objects allocated from it plus the free and
//! total capacity last reported for it, either by a reconcile pass or by a
//! satellite sync message.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::drivers::{EntityDriver, EntityRecord, Table};
use crate::error::{Error, Result};
use crate::layers::StorageVlmData;
use crate::objects::name::StorPoolName;
use crate::objects::node::Node;
use crate::objects::registry::CoreRegistry;
use crate::provider::{DeviceProviderKind, SpaceInfo};
use crate::security::{AccessContext, AccessType, ObjectProtection};
use crate::transaction::{
    PropsContainer, TransactionMgr, TransactionObject, TxCellOps, TxMap,
};

/// Property key naming the backing volume group of an LVM pool
pub const PROP_KEY_LVM_VG: &str = "StorDriver/LvmVg";

// =============================================================================
// Free Space Tracker
// =============================================================================

#[derive(Debug, Default)]
struct FreeSpaceState {
    free_capacity: Option<u64>,
    total_capacity: Option<u64>,
    updated_at: Option<DateTime<Utc>>,
}

/// Last reported capacity of a storage pool, in KiB.
///
/// Unknown until the first report arrives. Shared between the pool and the
/// reconcile/sync paths that feed it.
#[derive(Debug, Default)]
pub struct FreeSpaceTracker {
    state: Mutex<FreeSpaceState>,
}

impl FreeSpaceTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record a full capacity report
    pub fn update(&self, info: SpaceInfo) {
        let mut state = self.state.lock();
        state.free_capacity = Some(info.free_capacity);
        state.total_capacity = Some(info.total_capacity);
        state.updated_at = Some(Utc::now());
    }

    /// Record a free-capacity-only report, keeping the known total
    pub fn set_free_capacity(&self, free_capacity: u64) {
        let mut state = self.state.lock();
        state.free_capacity = Some(free_capacity);
        state.updated_at = Some(Utc::now());
    }

    pub fn free_capacity(&self) -> Option<u64> {
        self.state.lock().free_capacity
    }

    pub fn total_capacity(&self) -> Option<u64> {
        self.state.lock().total_capacity
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().updated_at
    }
}

// =============================================================================
// Storage Pool
// =============================================================================

/// One device provider backend on one node
pub struct StorPool {
    uuid: Uuid,
    name: StorPoolName,
    node: Arc<Node>,
    provider_kind: DeviceProviderKind,
    obj_prot: ObjectProtection,
    props: PropsContainer,
    /// Device-layer volume objects allocated from this pool, keyed by
    /// [`StorageVlmData::key`]
    volumes: TxMap<String, Arc<StorageVlmData>>,
    free_space: Arc<FreeSpaceTracker>,
}

impl StorPool {
    fn new(
        ctx: &AccessContext,
        name: StorPoolName,
        node: Arc<Node>,
        provider_kind: DeviceProviderKind,
    ) -> Arc<Self> {
        Arc::new(Self {
            uuid: Uuid::new_v4(),
            name,
            node,
            provider_kind,
            obj_prot: ObjectProtection::new(ctx),
            props: PropsContainer::new(),
            volumes: TxMap::new(),
            free_space: FreeSpaceTracker::new(),
        })
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn name(&self) -> &StorPoolName {
        &self.name
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn provider_kind(&self) -> DeviceProviderKind {
        self.provider_kind
    }

    pub fn obj_prot(&self) -> &ObjectProtection {
        &self.obj_prot
    }

    pub fn require_access(&self, ctx: &AccessContext, requested: AccessType) -> Result<()> {
        self.obj_prot.require_access(ctx, requested)
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

    /// The backing volume group, for LVM-backed pools
    pub fn volume_group(&self) -> Option<String> {
        self.props.get(PROP_KEY_LVM_VG)
    }

    pub fn free_space(&self) -> &Arc<FreeSpaceTracker> {
        &self.free_space
    }

    pub fn get_volume(&self, key: &str) -> Option<Arc<StorageVlmData>> {
        self.volumes.get(&key.to_string())
    }

    pub fn volumes(&self) -> BTreeMap<String, Arc<StorageVlmData>> {
        self.volumes.snapshot()
    }

    pub fn volume_count(&self) -> usize {
        self.volumes.len()
    }

    pub(crate) fn put_volume(self: &Arc<Self>, tx: &TransactionMgr, data: Arc<StorageVlmData>) {
        debug!(pool = %self.name, volume = %data.key(), "volume object allocated from pool");
        self.volumes.insert(tx, data.key(), data);
        tx.touch(self.clone());
    }

    pub(crate) fn remove_volume(self: &Arc<Self>, tx: &TransactionMgr, key: &str) {
        self.volumes.remove(tx, &key.to_string());
        tx.touch(self.clone());
    }

    /// Pool key within the cluster-wide registry
    pub fn key(&self) -> String {
        format!("{}/{}", self.node.name(), self.name)
    }

    pub(crate) fn record(&self) -> EntityRecord {
        EntityRecord {
            uuid: self.uuid.as_hyphenated().to_string(),
            name: format!("{}/{}", self.node.name().value(), self.name.value()),
            dsp_name: self.key(),
            flags: 0,
            layer_stack: None,
        }
    }
}

impl TransactionObject for StorPool {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn tx_cells(&self) -> Vec<&dyn TxCellOps> {
        vec![self.props.as_cell(), &self.volumes]
    }
}

impl std::fmt::Debug for StorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorPool")
            .field("uuid", &self.uuid)
            .field("key", &self.key())
            .field("provider_kind", &self.provider_kind)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Storage Pool Factory
// =============================================================================

pub struct StorPoolFactory {
    driver: Arc<dyn EntityDriver>,
    registry: Arc<CoreRegistry>,
}

impl StorPoolFactory {
    pub fn new(driver: Arc<dyn EntityDriver>, registry: Arc<CoreRegistry>) -> Self {
        Self { driver, registry }
    }

    pub fn create(
        &self,
        ctx: &AccessContext,
        tx: &TransactionMgr,
        node: &Arc<Node>,
        name: StorPoolName,
        provider_kind: DeviceProviderKind,
    ) -> Result<Arc<StorPool>> {
        node.require_access(ctx, AccessType::Use)?;
        node.require_not_deleted()?;
        self.registry
            .require_stor_pools_access(ctx, AccessType::Change)?;
        if self.registry.contains_stor_pool(node.name(), &name) {
            return Err(Error::AlreadyExists {
                kind: "StorPool",
                name: format!("{}/{}", node.name(), name),
            });
        }

        let pool = StorPool::new(ctx, name, node.clone(), provider_kind);
        self.driver.create(Table::StorPools, pool.record())?;
        self.registry.put_stor_pool(ctx, pool.clone())?;
        node.put_stor_pool(tx, pool.clone());
        tx.touch(pool.clone());
        Ok(pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::MemoryDriver;
    use crate::objects::name::NodeName;
    use crate::objects::node::{NodeFactory, NodeType};
    use crate::security::{SecurityLevel, SecurityRegistry};
    use assert_matches::assert_matches;

    fn setup() -> (Arc<MemoryDriver>, Arc<CoreRegistry>, Arc<Node>, AccessContext) {
        let security = SecurityRegistry::new(SecurityLevel::Mac);
        let sys = security.system_context();
        let registry = CoreRegistry::new(&sys);
        let driver = Arc::new(MemoryDriver::new());
        let node = NodeFactory::new(driver.clone(), registry.clone())
            .create_and_commit(&sys, NodeName::new("N1").unwrap(), NodeType::Satellite)
            .unwrap();
        (driver, registry, node, sys)
    }

    #[test]
    fn test_create_registers_on_node_and_registry() {
        let (driver, registry, node, sys) = setup();
        let factory = StorPoolFactory::new(driver.clone(), registry.clone());
        let tx = TransactionMgr::new();

        let pool = factory
            .create(
                &sys,
                &tx,
                &node,
                StorPoolName::new("pool-A").unwrap(),
                DeviceProviderKind::Lvm,
            )
            .unwrap();
        tx.commit().unwrap();

        assert_eq!(driver.row_count(Table::StorPools), 1);
        assert_eq!(node.stor_pool_count(), 1);
        assert!(registry.contains_stor_pool(node.name(), pool.name()));
        assert!(Arc::ptr_eq(
            &node.get_stor_pool(&sys, pool.name()).unwrap(),
            &pool
        ));
    }

    #[test]
    fn test_duplicate_pool_rejected() {
        let (driver, registry, node, sys) = setup();
        let factory = StorPoolFactory::new(driver, registry);
        let tx = TransactionMgr::new();
        let name = StorPoolName::new("pool-A").unwrap();

        factory
            .create(&sys, &tx, &node, name.clone(), DeviceProviderKind::Lvm)
            .unwrap();
        tx.commit().unwrap();
        let tx2 = TransactionMgr::new();
        let err = factory
            .create(&sys, &tx2, &node, name, DeviceProviderKind::LvmThin)
            .unwrap_err();
        assert_matches!(err, Error::AlreadyExists { kind: "StorPool", .. });
    }

    #[test]
    fn test_free_space_tracker_reports() {
        let tracker = FreeSpaceTracker::new();
        assert_eq!(tracker.free_capacity(), None);
        assert_eq!(tracker.total_capacity(), None);

        tracker.update(SpaceInfo {
            free_capacity: 512,
            total_capacity: 1024,
        });
        assert_eq!(tracker.free_capacity(), Some(512));
        assert_eq!(tracker.total_capacity(), Some(1024));
        assert!(tracker.updated_at().is_some());

        tracker.set_free_capacity(256);
        assert_eq!(tracker.free_capacity(), Some(256));
        assert_eq!(tracker.total_capacity(), Some(1024));
    }
}
