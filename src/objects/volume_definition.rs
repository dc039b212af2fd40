//! Volume definitions
//!
//! A volume definition fixes the number, size, and device minor number of
//! one volume slot within a resource definition. It carries no access guard
//! of its own; every check delegates to the owning resource definition.

use std::sync::Arc;

use bitflags::bitflags;
use uuid::Uuid;

use crate::drivers::{EntityDriver, EntityRecord, Table};
use crate::error::{Error, Result};
use crate::objects::name::NodeName;
use crate::objects::numbers::{MinorNumber, VolumeNumber};
use crate::objects::resource_definition::ResourceDefinition;
use crate::objects::volume::Volume;
use crate::security::{AccessContext, AccessType};
use crate::transaction::{
    PropsContainer, StateFlags, TransactionMgr, TransactionObject, TxCell, TxCellOps, TxMap,
};

bitflags! {
    /// Persistent volume definition state flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VlmDfnFlags: u64 {
        const DELETE = 0x0000_0001;
        /// A size change is pending rollout to the deployed volumes
        const RESIZE = 0x0000_0002;
    }
}

// =============================================================================
// Volume Definition
// =============================================================================

/// Definition of one volume slot within a resource definition
pub struct VolumeDefinition {
    uuid: Uuid,
    rsc_dfn: Arc<ResourceDefinition>,
    vlm_nr: VolumeNumber,
    flags: StateFlags<VlmDfnFlags>,
    props: PropsContainer,
    /// Net usable size in KiB
    size: TxCell<u64>,
    minor_nr: TxCell<MinorNumber>,
    volumes: TxMap<NodeName, Arc<Volume>>,
}

impl VolumeDefinition {
    fn new(
        driver: Arc<dyn EntityDriver>,
        rsc_dfn: Arc<ResourceDefinition>,
        vlm_nr: VolumeNumber,
        size_kib: u64,
        minor_nr: MinorNumber,
    ) -> Arc<Self> {
        let uuid = Uuid::new_v4();
        let flags_driver = driver.clone();
        let size_driver = driver.clone();
        let minor_driver = driver;
        Arc::new(Self {
            uuid,
            rsc_dfn,
            vlm_nr,
            flags: StateFlags::with_persist(
                VlmDfnFlags::empty(),
                Box::new(move |flags: &VlmDfnFlags| {
                    flags_driver.update_flags(Table::VolumeDefinitions, uuid, flags.bits())
                }),
            ),
            props: PropsContainer::new(),
            size: TxCell::with_persist(
                size_kib,
                Box::new(move |size: &u64| {
                    size_driver.update_column(
                        Table::VolumeDefinitions,
                        uuid,
                        "VLM_SIZE",
                        size.to_string(),
                    )
                }),
            ),
            minor_nr: TxCell::with_persist(
                minor_nr,
                Box::new(move |minor: &MinorNumber| {
                    minor_driver.update_column(
                        Table::VolumeDefinitions,
                        uuid,
                        "VLM_MINOR_NR",
                        minor.value().to_string(),
                    )
                }),
            ),
            volumes: TxMap::new(),
        })
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn resource_definition(&self) -> &Arc<ResourceDefinition> {
        &self.rsc_dfn
    }

    pub fn volume_number(&self) -> VolumeNumber {
        self.vlm_nr
    }

    /// Access checks delegate to the owning resource definition
    pub fn require_access(&self, ctx: &AccessContext, requested: AccessType) -> Result<()> {
        self.rsc_dfn.require_access(ctx, requested)
    }

    pub fn flags(&self) -> VlmDfnFlags {
        self.flags.get()
    }

    pub fn props(&self) -> &PropsContainer {
        &self.props
    }

    pub fn size(&self, ctx: &AccessContext) -> Result<u64> {
        self.require_access(ctx, AccessType::View)?;
        Ok(self.size.get())
    }

    pub(crate) fn size_unchecked(&self) -> u64 {
        self.size.get()
    }

    /// Stage a new size and flag the pending resize
    pub fn resize(
        self: &Arc<Self>,
        ctx: &AccessContext,
        tx: &TransactionMgr,
        new_size_kib: u64,
    ) -> Result<()> {
        self.require_access(ctx, AccessType::Change)?;
        self.rsc_dfn.require_not_deleted()?;
        self.size.set(tx, new_size_kib);
        self.flags.enable(tx, VlmDfnFlags::RESIZE);
        tx.touch(self.clone());
        Ok(())
    }

    pub fn minor_number(&self, ctx: &AccessContext) -> Result<MinorNumber> {
        self.require_access(ctx, AccessType::View)?;
        Ok(self.minor_nr.get())
    }

    pub fn mark_deleted(
        self: &Arc<Self>,
        ctx: &AccessContext,
        tx: &TransactionMgr,
    ) -> Result<()> {
        self.require_access(ctx, AccessType::Control)?;
        self.flags.enable(tx, VlmDfnFlags::DELETE);
        tx.touch(self.clone());
        Ok(())
    }

    pub fn is_deleted(&self) -> bool {
        self.flags.is_set(VlmDfnFlags::DELETE)
    }

    pub fn require_not_deleted(&self) -> Result<()> {
        if self.is_deleted() {
            Err(Error::DeletedObject {
                kind: "VolumeDefinition",
                name: self.key(),
            })
        } else {
            Ok(())
        }
    }

    pub fn get_volume(&self, node: &NodeName) -> Option<Arc<Volume>> {
        self.volumes.get(node)
    }

    pub fn volume_count(&self) -> usize {
        self.volumes.len()
    }

    pub(crate) fn put_volume(
        self: &Arc<Self>,
        tx: &TransactionMgr,
        node: NodeName,
        vlm: Arc<Volume>,
    ) {
        self.volumes.insert(tx, node, vlm);
        tx.touch(self.clone());
    }

    pub(crate) fn remove_volume(self: &Arc<Self>, tx: &TransactionMgr, node: &NodeName) {
        self.volumes.remove(tx, node);
        tx.touch(self.clone());
    }

    fn key(&self) -> String {
        format!("{}/{}", self.rsc_dfn.name(), self.vlm_nr)
    }

    pub(crate) fn record(&self) -> EntityRecord {
        EntityRecord {
            uuid: self.uuid.as_hyphenated().to_string(),
            name: format!("{}/{}", self.rsc_dfn.name().value(), self.vlm_nr),
            dsp_name: self.key(),
            flags: self.flags.mask(),
            layer_stack: None,
        }
    }
}

impl TransactionObject for VolumeDefinition {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn tx_cells(&self) -> Vec<&dyn TxCellOps> {
        vec![
            self.flags.as_cell(),
            self.props.as_cell(),
            &self.size,
            &self.minor_nr,
            &self.volumes,
        ]
    }
}

impl std::fmt::Debug for VolumeDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeDefinition")
            .field("uuid", &self.uuid)
            .field("key", &self.key())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Volume Definition Factory
// =============================================================================

pub struct VolumeDefinitionFactory {
    driver: Arc<dyn EntityDriver>,
}

impl VolumeDefinitionFactory {
    pub fn new(driver: Arc<dyn EntityDriver>) -> Self {
        Self { driver }
    }

    /// Create a volume definition within its resource definition
    pub fn create(
        &self,
        ctx: &AccessContext,
        tx: &TransactionMgr,
        rsc_dfn: &Arc<ResourceDefinition>,
        vlm_nr: VolumeNumber,
        size_kib: u64,
        minor_nr: MinorNumber,
    ) -> Result<Arc<VolumeDefinition>> {
        rsc_dfn.require_access(ctx, AccessType::Use)?;
        rsc_dfn.require_not_deleted()?;
        if rsc_dfn.has_volume_definition(vlm_nr) {
            return Err(Error::AlreadyExists {
                kind: "VolumeDefinition",
                name: format!("{}/{}", rsc_dfn.name(), vlm_nr),
            });
        }

        let vlm_dfn = VolumeDefinition::new(
            self.driver.clone(),
            rsc_dfn.clone(),
            vlm_nr,
            size_kib,
            minor_nr,
        );
        self.driver
            .create(Table::VolumeDefinitions, vlm_dfn.record())?;
        rsc_dfn.put_volume_definition(tx, vlm_dfn.clone());
        tx.touch(vlm_dfn.clone());
        Ok(vlm_dfn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::MemoryDriver;
    use crate::layers::LayerKind;
    use crate::objects::name::ResourceName;
    use crate::objects::registry::CoreRegistry;
    use crate::objects::resource_definition::ResourceDefinitionFactory;
    use crate::security::{SecurityLevel, SecurityRegistry};
    use assert_matches::assert_matches;

    fn setup() -> (
        Arc<MemoryDriver>,
        Arc<ResourceDefinition>,
        AccessContext,
        TransactionMgr,
    ) {
        let security = SecurityRegistry::new(SecurityLevel::Mac);
        let sys = security.system_context();
        let registry = CoreRegistry::new(&sys);
        let driver = Arc::new(MemoryDriver::new());
        let tx = TransactionMgr::new();
        let rsc_dfn = ResourceDefinitionFactory::new(driver.clone(), registry)
            .create(
                &sys,
                &tx,
                ResourceName::new("R1").unwrap(),
                vec![LayerKind::Storage],
            )
            .unwrap();
        (driver, rsc_dfn, sys, tx)
    }

    #[test]
    fn test_create_registers_in_definition() {
        let (driver, rsc_dfn, sys, tx) = setup();
        let factory = VolumeDefinitionFactory::new(driver.clone());

        let vlm_dfn = factory
            .create(
                &sys,
                &tx,
                &rsc_dfn,
                VolumeNumber::new(0).unwrap(),
                1_048_576,
                MinorNumber::new(1000).unwrap(),
            )
            .unwrap();
        assert_eq!(vlm_dfn.size(&sys).unwrap(), 1_048_576);
        assert_eq!(driver.row_count(Table::VolumeDefinitions), 1);
        assert!(rsc_dfn.has_volume_definition(VolumeNumber::new(0).unwrap()));
    }

    #[test]
    fn test_duplicate_volume_number_rejected() {
        let (driver, rsc_dfn, sys, tx) = setup();
        let factory = VolumeDefinitionFactory::new(driver);
        let nr = VolumeNumber::new(0).unwrap();

        factory
            .create(&sys, &tx, &rsc_dfn, nr, 1024, MinorNumber::new(1000).unwrap())
            .unwrap();
        let err = factory
            .create(&sys, &tx, &rsc_dfn, nr, 2048, MinorNumber::new(1001).unwrap())
            .unwrap_err();
        assert_matches!(err, Error::AlreadyExists { kind: "VolumeDefinition", .. });
    }

    #[test]
    fn test_resize_stages_size_and_flag() {
        let (driver, rsc_dfn, sys, tx) = setup();
        let factory = VolumeDefinitionFactory::new(driver);
        let vlm_dfn = factory
            .create(
                &sys,
                &tx,
                &rsc_dfn,
                VolumeNumber::new(0).unwrap(),
                1024,
                MinorNumber::new(1000).unwrap(),
            )
            .unwrap();
        tx.commit().unwrap();

        let tx2 = TransactionMgr::new();
        vlm_dfn.resize(&sys, &tx2, 4096).unwrap();
        assert_eq!(vlm_dfn.size(&sys).unwrap(), 4096);
        assert!(vlm_dfn.flags().contains(VlmDfnFlags::RESIZE));

        tx2.rollback();
        assert_eq!(vlm_dfn.size(&sys).unwrap(), 1024);
        assert!(!vlm_dfn.flags().contains(VlmDfnFlags::RESIZE));
    }

    #[test]
    fn test_create_on_deleted_definition_rejected() {
        let (driver, rsc_dfn, sys, tx) = setup();
        let factory = VolumeDefinitionFactory::new(driver);
        rsc_dfn.mark_deleted(&sys, &tx).unwrap();
        let err = factory
            .create(
                &sys,
                &tx,
                &rsc_dfn,
                VolumeNumber::new(0).unwrap(),
                1024,
                MinorNumber::new(1000).unwrap(),
            )
            .unwrap_err();
        assert_matches!(err, Error::DeletedObject { .. });
    }
}
