//! Device providers
//!
//! A device provider adapts one storage backend (LVM, thin LVM, an Openflex
//! fabric, or no backend at all for diskless deployments) to the reconcile
//! driver. Providers are batch oriented: a reconcile pass hands each
//! provider every volume object of its kind at once, and per-volume
//! failures are collected in the pass report instead of aborting the batch.

pub mod diskless;
pub mod ext_cmd;
pub mod lvm;
pub mod openflex;

pub use diskless::DisklessProvider;
pub use ext_cmd::{CmdOutput, ExtCmd, TokioExtCmd};
pub use lvm::{LvmConfig, LvmProvider};
pub use openflex::{OpenflexConfig, OpenflexProvider};

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::layers::StorageVlmData;
use crate::objects::stor_pool::StorPool;
use crate::security::AccessContext;

// =============================================================================
// Provider Kinds
// =============================================================================

/// Kind of storage backend behind a storage pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceProviderKind {
    Diskless,
    Lvm,
    LvmThin,
    Openflex,
}

impl DeviceProviderKind {
    /// Whether volumes of this kind occupy backend capacity
    pub fn has_backing_storage(self) -> bool {
        !matches!(self, DeviceProviderKind::Diskless)
    }
}

impl std::fmt::Display for DeviceProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceProviderKind::Diskless => write!(f, "DISKLESS"),
            DeviceProviderKind::Lvm => write!(f, "LVM"),
            DeviceProviderKind::LvmThin => write!(f, "LVM_THIN"),
            DeviceProviderKind::Openflex => write!(f, "OPENFLEX"),
        }
    }
}

impl std::str::FromStr for DeviceProviderKind {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_uppercase().as_str() {
            "DISKLESS" => Ok(DeviceProviderKind::Diskless),
            "LVM" => Ok(DeviceProviderKind::Lvm),
            "LVM_THIN" => Ok(DeviceProviderKind::LvmThin),
            "OPENFLEX" => Ok(DeviceProviderKind::Openflex),
            _ => Err(Error::Configuration(format!(
                "Unknown device provider kind: {value}"
            ))),
        }
    }
}

// =============================================================================
// Capacity Reports
// =============================================================================

/// Free and total capacity of one storage pool, in KiB
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceInfo {
    pub free_capacity: u64,
    pub total_capacity: u64,
}

// =============================================================================
// Reconcile Reports
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportSeverity {
    Ok,
    Error,
}

/// Outcome of one volume within a reconcile pass
#[derive(Debug, Clone)]
pub struct ReportEntry {
    pub key: String,
    pub severity: ReportSeverity,
    pub message: String,
}

/// Per-volume outcomes of a reconcile pass.
///
/// A provider reports per-volume failures here and keeps processing the
/// rest of its batch; only faults that invalidate the whole batch surface
/// as errors.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    entries: Vec<ReportEntry>,
}

impl ReconcileReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_ok(&mut self, key: impl Into<String>, message: impl Into<String>) {
        self.entries.push(ReportEntry {
            key: key.into(),
            severity: ReportSeverity::Ok,
            message: message.into(),
        });
    }

    pub fn add_error(&mut self, key: impl Into<String>, message: impl Into<String>) {
        self.entries.push(ReportEntry {
            key: key.into(),
            severity: ReportSeverity::Error,
            message: message.into(),
        });
    }

    pub fn entries(&self) -> &[ReportEntry] {
        &self.entries
    }

    pub fn has_errors(&self) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.severity == ReportSeverity::Error)
    }

    pub fn error_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.severity == ReportSeverity::Error)
            .count()
    }
}

// =============================================================================
// Device Provider
// =============================================================================

/// Backend adapter driven by the reconcile loop.
///
/// Resource volumes and snapshot volumes are batched separately; both
/// batches carry [`StorageVlmData`] objects and providers dispatch on
/// their [`crate::layers::VlmDataKind`] where the backend treats the two
/// differently.
#[async_trait]
pub trait DeviceProvider: Send + Sync {
    fn kind(&self) -> DeviceProviderKind;

    /// Drop all backend state cached by earlier passes
    fn clear_cache(&self);

    /// Load the backend state needed to process the given batches
    async fn prepare(
        &self,
        vlms: &[Arc<StorageVlmData>],
        snap_vlms: &[Arc<StorageVlmData>],
    ) -> Result<()>;

    /// Drive every volume of the batches towards its target state,
    /// recording per-volume outcomes in the report
    async fn process(
        &self,
        vlms: &[Arc<StorageVlmData>],
        snap_vlms: &[Arc<StorageVlmData>],
        report: &mut ReconcileReport,
    ) -> Result<()>;

    /// Recompute the backend-granted gross size of one volume
    async fn update_gross_size(&self, vlm: &Arc<StorageVlmData>) -> Result<()>;

    /// Recompute the currently allocated size of one volume
    async fn update_allocated_size(&self, vlm: &Arc<StorageVlmData>) -> Result<()>;

    /// Query the backend for the pool's capacity. Requires view access to
    /// the pool.
    async fn get_space_info(&self, ctx: &AccessContext, pool: &Arc<StorPool>) -> Result<SpaceInfo>;

    /// Validate that the pool carries the configuration this backend needs
    async fn check_config(&self, pool: &Arc<StorPool>) -> Result<()>;

    /// Pools touched since the last `clear_cache`, for capacity refresh
    fn changed_stor_pools(&self) -> Vec<Arc<StorPool>>;

    /// Refresh the capacity tracker of one pool from the backend
    async fn update(&self, ctx: &AccessContext, pool: &Arc<StorPool>) -> Result<()>;
}

/// Build the standard provider set
pub fn default_providers(
    ext: Arc<dyn ExtCmd>,
    lvm_config: LvmConfig,
    openflex_config: OpenflexConfig,
) -> BTreeMap<DeviceProviderKind, Arc<dyn DeviceProvider>> {
    let mut providers: BTreeMap<DeviceProviderKind, Arc<dyn DeviceProvider>> = BTreeMap::new();
    providers.insert(
        DeviceProviderKind::Diskless,
        Arc::new(DisklessProvider::new()),
    );
    providers.insert(
        DeviceProviderKind::Lvm,
        Arc::new(LvmProvider::new(ext.clone(), lvm_config.clone(), false)),
    );
    providers.insert(
        DeviceProviderKind::LvmThin,
        Arc::new(LvmProvider::new(ext, lvm_config, true)),
    );
    providers.insert(
        DeviceProviderKind::Openflex,
        Arc::new(OpenflexProvider::new(openflex_config)),
    );
    providers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_kind_round_trip() {
        for kind in [
            DeviceProviderKind::Diskless,
            DeviceProviderKind::Lvm,
            DeviceProviderKind::LvmThin,
            DeviceProviderKind::Openflex,
        ] {
            assert_eq!(kind.to_string().parse::<DeviceProviderKind>().unwrap(), kind);
        }
        assert!("ZFS".parse::<DeviceProviderKind>().is_err());
    }

    #[test]
    fn test_report_classification() {
        let mut report = ReconcileReport::new();
        report.add_ok("R1/0", "volume exists");
        assert!(!report.has_errors());

        report.add_error("R2/0", "volume group missing");
        assert!(report.has_errors());
        assert_eq!(report.error_count(), 1);
        assert_eq!(report.entries().len(), 2);
    }
}
