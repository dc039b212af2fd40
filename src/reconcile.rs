//! Reconcile driver
//!
//! Periodically drives every device-layer volume object towards its target
//! state. Each pass batches the volume objects by provider kind (resource
//! and snapshot objects separately), lets each provider refresh its backend
//! cache once for the whole batch, processes the batches, and finally
//! refreshes the capacity trackers of the pools the pass changed plus the
//! pools without any capacity report yet. Per-volume failures stay in the
//! pass report; a provider fault fails only that provider's batch, never
//! the whole pass.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::layers::StorageVlmData;
use crate::objects::registry::CoreRegistry;
use crate::objects::stor_pool::StorPool;
use crate::provider::{DeviceProvider, DeviceProviderKind, ReconcileReport};
use crate::security::AccessContext;

pub struct ReconcileDriver {
    registry: Arc<CoreRegistry>,
    providers: BTreeMap<DeviceProviderKind, Arc<dyn DeviceProvider>>,
    sys_ctx: AccessContext,
    interval: Duration,
}

impl ReconcileDriver {
    pub fn new(
        registry: Arc<CoreRegistry>,
        providers: BTreeMap<DeviceProviderKind, Arc<dyn DeviceProvider>>,
        sys_ctx: AccessContext,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            providers,
            sys_ctx,
            interval,
        }
    }

    /// Run reconcile passes until the task is cancelled
    pub async fn run(&self) {
        info!(interval_secs = self.interval.as_secs(), "reconcile loop started");
        loop {
            match self.run_pass().await {
                Ok(report) => {
                    if report.has_errors() {
                        warn!(
                            errors = report.error_count(),
                            entries = report.entries().len(),
                            "reconcile pass finished with errors"
                        );
                    } else {
                        debug!(entries = report.entries().len(), "reconcile pass finished");
                    }
                }
                Err(pass_err) => {
                    warn!(error = %pass_err, "reconcile pass failed");
                }
            }
            tokio::time::sleep(self.interval).await;
        }
    }

    /// Run one full pass over every registered storage pool
    pub async fn run_pass(&self) -> Result<ReconcileReport> {
        let pools = self.registry.stor_pools(&self.sys_ctx)?;
        let mut report = ReconcileReport::new();

        let mut batches: BTreeMap<DeviceProviderKind, Vec<Arc<StorageVlmData>>> = BTreeMap::new();
        let mut snap_batches: BTreeMap<DeviceProviderKind, Vec<Arc<StorageVlmData>>> =
            BTreeMap::new();
        let mut pools_by_kind: BTreeMap<DeviceProviderKind, Vec<Arc<StorPool>>> = BTreeMap::new();
        for pool in pools {
            let kind = pool.provider_kind();
            for data in pool.volumes().into_values() {
                if data.is_snapshot() {
                    snap_batches.entry(kind).or_default().push(data);
                } else {
                    batches.entry(kind).or_default().push(data);
                }
            }
            pools_by_kind.entry(kind).or_default().push(pool);
        }

        for (kind, kind_pools) in pools_by_kind {
            let Some(provider) = self.providers.get(&kind) else {
                warn!(%kind, "no provider registered for storage pool kind");
                report.add_error(kind.to_string(), "no provider registered");
                continue;
            };
            let batch = batches.remove(&kind).unwrap_or_default();
            let snap_batch = snap_batches.remove(&kind).unwrap_or_default();
            if let Err(batch_err) = self
                .process_batch(provider.as_ref(), &batch, &snap_batch, &kind_pools, &mut report)
                .await
            {
                warn!(%kind, error = %batch_err, "provider batch failed");
                report.add_error(kind.to_string(), batch_err.to_string());
            }
        }
        Ok(report)
    }

    async fn process_batch(
        &self,
        provider: &dyn DeviceProvider,
        batch: &[Arc<StorageVlmData>],
        snap_batch: &[Arc<StorageVlmData>],
        pools: &[Arc<StorPool>],
        report: &mut ReconcileReport,
    ) -> Result<()> {
        provider.clear_cache();
        provider.prepare(batch, snap_batch).await?;
        provider.process(batch, snap_batch, report).await?;

        if provider.kind().has_backing_storage() {
            let changed: BTreeSet<String> = provider
                .changed_stor_pools()
                .iter()
                .map(|pool| pool.key())
                .collect();
            for pool in pools {
                // pools the pass did not touch keep their last report
                if pool.free_space().updated_at().is_some() && !changed.contains(&pool.key()) {
                    continue;
                }
                if let Err(space_err) = provider.update(&self.sys_ctx, pool).await {
                    report.add_error(pool.key(), space_err.to_string());
                }
            }
        }
        Ok(())
    }
}
