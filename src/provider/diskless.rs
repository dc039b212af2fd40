//! Diskless provider
//!
//! Diskless deployments attach to their peers over the replication layer
//! and have no backing device of their own, so every backend operation is
//! a no-op and the reported capacity is unbounded.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::layers::StorageVlmData;
use crate::objects::stor_pool::StorPool;
use crate::provider::{
    DeviceProvider, DeviceProviderKind, ReconcileReport, SpaceInfo,
};
use crate::security::{AccessContext, AccessType};

#[derive(Debug, Default)]
pub struct DisklessProvider;

impl DisklessProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DeviceProvider for DisklessProvider {
    fn kind(&self) -> DeviceProviderKind {
        DeviceProviderKind::Diskless
    }

    fn clear_cache(&self) {}

    async fn prepare(
        &self,
        _vlms: &[Arc<StorageVlmData>],
        _snap_vlms: &[Arc<StorageVlmData>],
    ) -> Result<()> {
        Ok(())
    }

    async fn process(
        &self,
        vlms: &[Arc<StorageVlmData>],
        snap_vlms: &[Arc<StorageVlmData>],
        report: &mut ReconcileReport,
    ) -> Result<()> {
        for vlm in vlms {
            vlm.set_exists(true);
            report.add_ok(vlm.key(), "diskless volume attached");
        }
        for snap in snap_vlms {
            report.add_error(snap.key(), "diskless volumes hold no data to snapshot");
        }
        Ok(())
    }

    async fn update_gross_size(&self, vlm: &Arc<StorageVlmData>) -> Result<()> {
        vlm.set_gross_size(vlm.desired_size());
        vlm.set_usable_size(vlm.desired_size());
        Ok(())
    }

    async fn update_allocated_size(&self, vlm: &Arc<StorageVlmData>) -> Result<()> {
        vlm.set_allocated_size(0);
        Ok(())
    }

    async fn get_space_info(
        &self,
        ctx: &AccessContext,
        pool: &Arc<StorPool>,
    ) -> Result<SpaceInfo> {
        pool.require_access(ctx, AccessType::View)?;
        Ok(SpaceInfo {
            free_capacity: u64::MAX,
            total_capacity: u64::MAX,
        })
    }

    async fn check_config(&self, _pool: &Arc<StorPool>) -> Result<()> {
        Ok(())
    }

    fn changed_stor_pools(&self) -> Vec<Arc<StorPool>> {
        Vec::new()
    }

    // diskless capacity is unbounded, there is nothing to refresh
    async fn update(&self, _ctx: &AccessContext, _pool: &Arc<StorPool>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::MemoryDriver;
    use crate::objects::name::{NodeName, StorPoolName};
    use crate::objects::node::{NodeFactory, NodeType};
    use crate::objects::registry::CoreRegistry;
    use crate::objects::stor_pool::StorPoolFactory;
    use crate::security::{SecurityLevel, SecurityRegistry};
    use crate::transaction::TransactionMgr;

    #[tokio::test]
    async fn test_reports_unbounded_capacity() {
        let security = SecurityRegistry::new(SecurityLevel::Mac);
        let sys = security.system_context();
        let registry = CoreRegistry::new(&sys);
        let driver = Arc::new(MemoryDriver::new());
        let node = NodeFactory::new(driver.clone(), registry.clone())
            .create_and_commit(&sys, NodeName::new("N1").unwrap(), NodeType::Satellite)
            .unwrap();
        let tx = TransactionMgr::new();
        let pool = StorPoolFactory::new(driver, registry)
            .create(
                &sys,
                &tx,
                &node,
                StorPoolName::new("diskless").unwrap(),
                DeviceProviderKind::Diskless,
            )
            .unwrap();

        let provider = DisklessProvider::new();
        let info = provider.get_space_info(&sys, &pool).await.unwrap();
        assert_eq!(info.free_capacity, u64::MAX);
        assert_eq!(info.total_capacity, u64::MAX);
        assert!(provider.check_config(&pool).await.is_ok());
    }

    #[tokio::test]
    async fn test_snapshots_rejected() {
        use crate::objects::name::ResourceName;
        use crate::objects::numbers::VolumeNumber;

        let security = SecurityRegistry::new(SecurityLevel::Mac);
        let sys = security.system_context();
        let registry = CoreRegistry::new(&sys);
        let driver = Arc::new(MemoryDriver::new());
        let node = NodeFactory::new(driver.clone(), registry.clone())
            .create_and_commit(&sys, NodeName::new("N1").unwrap(), NodeType::Satellite)
            .unwrap();
        let tx = TransactionMgr::new();
        let pool = StorPoolFactory::new(driver, registry)
            .create(
                &sys,
                &tx,
                &node,
                StorPoolName::new("diskless").unwrap(),
                DeviceProviderKind::Diskless,
            )
            .unwrap();
        let snap = StorageVlmData::new_snapshot(
            ResourceName::new("R1").unwrap(),
            "",
            VolumeNumber::new(0).unwrap(),
            1024,
            pool,
        );

        let provider = DisklessProvider::new();
        let mut report = ReconcileReport::new();
        provider
            .process(&[], std::slice::from_ref(&snap), &mut report)
            .await
            .unwrap();
        assert_eq!(report.error_count(), 1);
    }
}
