//! Resource definitions
//!
//! A resource definition is the cluster-wide template of a replicated
//! resource: its ordered layer stack, its volume definitions, and the
//! per-node resources instantiated from it. Layer-specific definition
//! metadata is kept per (kind, suffix) pair so that one definition can
//! carry metadata for several occurrences of the same layer kind.

use std::sync::Arc;

use bitflags::bitflags;
use uuid::Uuid;

use crate::drivers::{EntityDriver, EntityRecord, Table};
use crate::error::{Error, Result};
use crate::layers::{join_kinds, LayerKind};
use crate::objects::name::{NodeName, ResourceName};
use crate::objects::numbers::VolumeNumber;
use crate::objects::registry::CoreRegistry;
use crate::objects::resource::Resource;
use crate::objects::volume_definition::VolumeDefinition;
use crate::security::{AccessContext, AccessType, ObjectProtection};
use crate::transaction::{
    PropsContainer, StateFlags, TransactionMgr, TransactionObject, TxCellOps, TxList, TxMap,
};

bitflags! {
    /// Persistent resource definition state flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RscDfnFlags: u64 {
        const DELETE = 0x0000_0001;
    }
}

/// Key of layer-specific definition metadata: layer kind plus resource name
/// suffix, so one definition can hold metadata for repeated kinds
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct LayerMetaKey {
    pub kind: LayerKind,
    pub suffix: String,
}

/// Layer-specific metadata attached to a resource definition
pub struct RscDfnLayerMeta {
    uuid: Uuid,
    key: LayerMetaKey,
    props: PropsContainer,
}

impl RscDfnLayerMeta {
    fn new(key: LayerMetaKey) -> Arc<Self> {
        Arc::new(Self {
            uuid: Uuid::new_v4(),
            key,
            props: PropsContainer::new(),
        })
    }

    pub fn kind(&self) -> LayerKind {
        self.key.kind
    }

    pub fn suffix(&self) -> &str {
        &self.key.suffix
    }

    pub fn props(&self) -> &PropsContainer {
        &self.props
    }
}

impl TransactionObject for RscDfnLayerMeta {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn tx_cells(&self) -> Vec<&dyn TxCellOps> {
        vec![self.props.as_cell()]
    }
}

// =============================================================================
// Resource Definition
// =============================================================================

/// Cluster-wide definition of a resource
pub struct ResourceDefinition {
    uuid: Uuid,
    name: ResourceName,
    obj_prot: ObjectProtection,
    flags: StateFlags<RscDfnFlags>,
    props: PropsContainer,
    layer_stack: TxList<LayerKind>,
    volume_definitions: TxMap<VolumeNumber, Arc<VolumeDefinition>>,
    resources: TxMap<NodeName, Arc<Resource>>,
    layer_meta: TxMap<LayerMetaKey, Arc<RscDfnLayerMeta>>,
}

impl ResourceDefinition {
    fn new(
        ctx: &AccessContext,
        driver: Arc<dyn EntityDriver>,
        name: ResourceName,
        layer_stack: Vec<LayerKind>,
    ) -> Arc<Self> {
        let uuid = Uuid::new_v4();
        let flags_driver = driver.clone();
        let stack_driver = driver;
        Arc::new(Self {
            uuid,
            name,
            obj_prot: ObjectProtection::new(ctx),
            flags: StateFlags::with_persist(
                RscDfnFlags::empty(),
                Box::new(move |flags: &RscDfnFlags| {
                    flags_driver.update_flags(Table::ResourceDefinitions, uuid, flags.bits())
                }),
            ),
            props: PropsContainer::new(),
            layer_stack: TxList::with_persist(
                layer_stack,
                Box::new(move |kinds: &Vec<LayerKind>| {
                    stack_driver.update_column(
                        Table::ResourceDefinitions,
                        uuid,
                        "LAYER_STACK",
                        join_kinds(kinds),
                    )
                }),
            ),
            volume_definitions: TxMap::new(),
            resources: TxMap::new(),
            layer_meta: TxMap::new(),
        })
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn name(&self) -> &ResourceName {
        &self.name
    }

    pub fn obj_prot(&self) -> &ObjectProtection {
        &self.obj_prot
    }

    pub fn require_access(&self, ctx: &AccessContext, requested: AccessType) -> Result<()> {
        self.obj_prot.require_access(ctx, requested)
    }

    pub fn flags(&self) -> RscDfnFlags {
        self.flags.get()
    }

    pub fn is_deleted(&self) -> bool {
        self.flags.is_set(RscDfnFlags::DELETE)
    }

    /// Reject new dependents on a definition already marked for deletion
    pub fn require_not_deleted(&self) -> Result<()> {
        if self.is_deleted() {
            Err(Error::DeletedObject {
                kind: "ResourceDefinition",
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
        self.flags.enable(tx, RscDfnFlags::DELETE);
        tx.touch(self.clone());
        Ok(())
    }

    pub fn props(&self) -> &PropsContainer {
        &self.props
    }

    /// The ordered layer stack this definition's resources are built with
    pub fn layer_stack(&self, ctx: &AccessContext) -> Result<Vec<LayerKind>> {
        self.require_access(ctx, AccessType::View)?;
        Ok(self.layer_stack.get_all())
    }

    pub(crate) fn layer_stack_unchecked(&self) -> Vec<LayerKind> {
        self.layer_stack.get_all()
    }

    pub fn get_volume_definition(
        &self,
        ctx: &AccessContext,
        vlm_nr: VolumeNumber,
    ) -> Result<Arc<VolumeDefinition>> {
        self.require_access(ctx, AccessType::View)?;
        self.volume_definitions
            .get(&vlm_nr)
            .ok_or_else(|| Error::NotFound {
                kind: "VolumeDefinition",
                name: format!("{}/{}", self.name, vlm_nr),
            })
    }

    pub fn has_volume_definition(&self, vlm_nr: VolumeNumber) -> bool {
        self.volume_definitions.contains_key(&vlm_nr)
    }

    pub fn volume_definitions(&self) -> Vec<Arc<VolumeDefinition>> {
        self.volume_definitions.values()
    }

    pub(crate) fn put_volume_definition(
        self: &Arc<Self>,
        tx: &TransactionMgr,
        vlm_dfn: Arc<VolumeDefinition>,
    ) {
        self.volume_definitions
            .insert(tx, vlm_dfn.volume_number(), vlm_dfn);
        tx.touch(self.clone());
    }

    pub fn get_resource(&self, ctx: &AccessContext, node: &NodeName) -> Result<Arc<Resource>> {
        self.require_access(ctx, AccessType::View)?;
        self.resources.get(node).ok_or_else(|| Error::NotFound {
            kind: "Resource",
            name: format!("{}/{}", node, self.name),
        })
    }

    pub fn has_resource(&self, node: &NodeName) -> bool {
        self.resources.contains_key(node)
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    pub fn resources(&self) -> Vec<Arc<Resource>> {
        self.resources.values()
    }

    pub(crate) fn put_resource(self: &Arc<Self>, tx: &TransactionMgr, rsc: Arc<Resource>) {
        self.resources.insert(tx, rsc.node().name().clone(), rsc);
        tx.touch(self.clone());
    }

    pub(crate) fn remove_resource(self: &Arc<Self>, tx: &TransactionMgr, node: &NodeName) {
        self.resources.remove(tx, node);
        tx.touch(self.clone());
    }

    /// Get or create the layer metadata entry for a (kind, suffix) pair
    pub fn ensure_layer_meta(
        self: &Arc<Self>,
        ctx: &AccessContext,
        tx: &TransactionMgr,
        kind: LayerKind,
        suffix: impl Into<String>,
    ) -> Result<Arc<RscDfnLayerMeta>> {
        self.require_access(ctx, AccessType::Change)?;
        let key = LayerMetaKey {
            kind,
            suffix: suffix.into(),
        };
        if let Some(meta) = self.layer_meta.get(&key) {
            return Ok(meta);
        }
        let meta = RscDfnLayerMeta::new(key.clone());
        self.layer_meta.insert(tx, key, meta.clone());
        tx.touch(self.clone());
        Ok(meta)
    }

    pub fn get_layer_meta(&self, kind: LayerKind, suffix: &str) -> Option<Arc<RscDfnLayerMeta>> {
        self.layer_meta.get(&LayerMetaKey {
            kind,
            suffix: suffix.to_string(),
        })
    }

    pub(crate) fn record(&self) -> EntityRecord {
        EntityRecord {
            uuid: self.uuid.as_hyphenated().to_string(),
            name: self.name.value().to_string(),
            dsp_name: self.name.display().to_string(),
            flags: self.flags.mask(),
            layer_stack: Some(join_kinds(&self.layer_stack.get_all())),
        }
    }
}

impl TransactionObject for ResourceDefinition {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn tx_cells(&self) -> Vec<&dyn TxCellOps> {
        vec![
            self.flags.as_cell(),
            self.props.as_cell(),
            &self.layer_stack,
            &self.volume_definitions,
            &self.resources,
            &self.layer_meta,
        ]
    }
}

impl std::fmt::Debug for ResourceDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceDefinition")
            .field("uuid", &self.uuid)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Resource Definition Factory
// =============================================================================

pub struct ResourceDefinitionFactory {
    driver: Arc<dyn EntityDriver>,
    registry: Arc<CoreRegistry>,
}

impl ResourceDefinitionFactory {
    pub fn new(driver: Arc<dyn EntityDriver>, registry: Arc<CoreRegistry>) -> Self {
        Self { driver, registry }
    }

    /// Create a resource definition with the given ordered layer stack.
    /// The stack must be non-empty and terminate in the storage layer.
    pub fn create(
        &self,
        ctx: &AccessContext,
        tx: &TransactionMgr,
        name: ResourceName,
        layer_stack: Vec<LayerKind>,
    ) -> Result<Arc<ResourceDefinition>> {
        self.registry
            .require_rsc_dfns_access(ctx, AccessType::Change)?;
        validate_layer_stack(&layer_stack)?;
        if self.registry.contains_rsc_dfn(&name) {
            return Err(Error::AlreadyExists {
                kind: "ResourceDefinition",
                name: name.display().to_string(),
            });
        }

        let rsc_dfn = ResourceDefinition::new(ctx, self.driver.clone(), name, layer_stack);
        self.driver
            .create(Table::ResourceDefinitions, rsc_dfn.record())?;
        self.registry.put_rsc_dfn(ctx, rsc_dfn.clone())?;
        tx.touch(rsc_dfn.clone());
        Ok(rsc_dfn)
    }
}

/// A usable stack has at least one layer, ends in the storage layer, and
/// names the storage layer exactly once
pub(crate) fn validate_layer_stack(stack: &[LayerKind]) -> Result<()> {
    if stack.is_empty() {
        return Err(Error::Configuration("layer stack must not be empty".into()));
    }
    if stack.last() != Some(&LayerKind::Storage) {
        return Err(Error::Configuration(
            "layer stack must terminate in the STORAGE layer".into(),
        ));
    }
    let storage_count = stack
        .iter()
        .filter(|kind| **kind == LayerKind::Storage)
        .count();
    if storage_count != 1 {
        return Err(Error::Configuration(
            "layer stack must name the STORAGE layer exactly once".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::MemoryDriver;
    use crate::security::{SecurityLevel, SecurityRegistry};
    use assert_matches::assert_matches;

    fn setup() -> (Arc<MemoryDriver>, Arc<CoreRegistry>, AccessContext) {
        let security = SecurityRegistry::new(SecurityLevel::Mac);
        let sys = security.system_context();
        let registry = CoreRegistry::new(&sys);
        (Arc::new(MemoryDriver::new()), registry, sys)
    }

    #[test]
    fn test_create_persists_layer_stack_column() {
        let (driver, registry, sys) = setup();
        let factory = ResourceDefinitionFactory::new(driver.clone(), registry);
        let tx = TransactionMgr::new();

        let rsc_dfn = factory
            .create(
                &sys,
                &tx,
                ResourceName::new("R1").unwrap(),
                vec![LayerKind::Replication, LayerKind::Storage],
            )
            .unwrap();
        tx.commit().unwrap();

        let row = driver
            .row(Table::ResourceDefinitions, rsc_dfn.uuid())
            .unwrap();
        assert_eq!(row.layer_stack.as_deref(), Some("REPLICATION,STORAGE"));
        assert_eq!(
            rsc_dfn.layer_stack(&sys).unwrap(),
            vec![LayerKind::Replication, LayerKind::Storage]
        );
    }

    #[test]
    fn test_invalid_layer_stacks_rejected() {
        assert_matches!(validate_layer_stack(&[]), Err(Error::Configuration(_)));
        assert_matches!(
            validate_layer_stack(&[LayerKind::Storage, LayerKind::Replication]),
            Err(Error::Configuration(_))
        );
        assert_matches!(
            validate_layer_stack(&[LayerKind::Storage, LayerKind::Storage]),
            Err(Error::Configuration(_))
        );
        assert!(validate_layer_stack(&[LayerKind::Nvme, LayerKind::Storage]).is_ok());
    }

    #[test]
    fn test_deleted_definition_rejects_dependents() {
        let (driver, registry, sys) = setup();
        let factory = ResourceDefinitionFactory::new(driver, registry);
        let tx = TransactionMgr::new();
        let rsc_dfn = factory
            .create(
                &sys,
                &tx,
                ResourceName::new("R1").unwrap(),
                vec![LayerKind::Storage],
            )
            .unwrap();
        rsc_dfn.mark_deleted(&sys, &tx).unwrap();
        assert_matches!(
            rsc_dfn.require_not_deleted(),
            Err(Error::DeletedObject {
                kind: "ResourceDefinition",
                ..
            })
        );
    }

    #[test]
    fn test_layer_meta_keyed_by_kind_and_suffix() {
        let (driver, registry, sys) = setup();
        let factory = ResourceDefinitionFactory::new(driver, registry);
        let tx = TransactionMgr::new();
        let rsc_dfn = factory
            .create(
                &sys,
                &tx,
                ResourceName::new("R1").unwrap(),
                vec![LayerKind::Storage],
            )
            .unwrap();

        let meta_a = rsc_dfn
            .ensure_layer_meta(&sys, &tx, LayerKind::Storage, "")
            .unwrap();
        let meta_b = rsc_dfn
            .ensure_layer_meta(&sys, &tx, LayerKind::Storage, "")
            .unwrap();
        let meta_c = rsc_dfn
            .ensure_layer_meta(&sys, &tx, LayerKind::Storage, ".meta")
            .unwrap();
        assert!(Arc::ptr_eq(&meta_a, &meta_b));
        assert!(!Arc::ptr_eq(&meta_a, &meta_c));
        assert_eq!(meta_c.suffix(), ".meta");
    }
}
