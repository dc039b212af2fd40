//! Device layer stack data
//!
//! A resource definition declares an ordered sequence of layer kinds (for
//! example replication over storage); every resource instantiated from it
//! carries a tree of layer data objects mirroring that sequence. The
//! terminal storage layer holds one device-layer volume object per volume,
//! bound to the storage pool that backs it.

mod builder;

pub use builder::LayerStackBuilder;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::drivers::LAYER_STACK_DELIMITER;
use crate::error::{Error, Result};
use crate::objects::name::{ResourceName, StorPoolName};
use crate::objects::numbers::VolumeNumber;
use crate::objects::stor_pool::StorPool;

// =============================================================================
// Layer Kinds
// =============================================================================

/// Kind of one device layer in a resource's layer stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LayerKind {
    Replication,
    Nvme,
    Storage,
}

impl std::fmt::Display for LayerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LayerKind::Replication => write!(f, "REPLICATION"),
            LayerKind::Nvme => write!(f, "NVME"),
            LayerKind::Storage => write!(f, "STORAGE"),
        }
    }
}

impl std::str::FromStr for LayerKind {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_uppercase().as_str() {
            "REPLICATION" => Ok(LayerKind::Replication),
            "NVME" => Ok(LayerKind::Nvme),
            "STORAGE" => Ok(LayerKind::Storage),
            _ => Err(Error::Configuration(format!("Unknown layer kind: {value}"))),
        }
    }
}

/// Join an ordered kind list into the persisted layer-stack column form
pub fn join_kinds(kinds: &[LayerKind]) -> String {
    kinds
        .iter()
        .map(LayerKind::to_string)
        .collect::<Vec<_>>()
        .join(LAYER_STACK_DELIMITER)
}

/// Parse the persisted layer-stack column form
pub fn parse_kinds(value: &str) -> Result<Vec<LayerKind>> {
    value
        .split(LAYER_STACK_DELIMITER)
        .map(|part| part.trim().parse())
        .collect()
}

// =============================================================================
// Layer Payload
// =============================================================================

/// Per-volume storage pool assignments handed to the layer stack builder,
/// keyed by resource name suffix and volume number
#[derive(Debug, Clone, Default)]
pub struct LayerPayload {
    storage: BTreeMap<(String, VolumeNumber), StorPoolName>,
}

impl LayerPayload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_storage_pool(
        &mut self,
        suffix: impl Into<String>,
        vlm_nr: VolumeNumber,
        pool_name: StorPoolName,
    ) {
        self.storage.insert((suffix.into(), vlm_nr), pool_name);
    }

    pub fn storage_pool(&self, suffix: &str, vlm_nr: VolumeNumber) -> Option<&StorPoolName> {
        self.storage.get(&(suffix.to_string(), vlm_nr))
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }
}

// =============================================================================
// Resource Layer Data
// =============================================================================

/// One node of a resource's layer data tree
pub struct RscLayerData {
    kind: LayerKind,
    suffix: String,
    children: Mutex<Vec<Arc<RscLayerData>>>,
    /// Device-layer volume objects; populated on the storage layer only
    volumes: Mutex<BTreeMap<VolumeNumber, Arc<StorageVlmData>>>,
}

impl RscLayerData {
    pub fn new(kind: LayerKind, suffix: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            kind,
            suffix: suffix.into(),
            children: Mutex::new(Vec::new()),
            volumes: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn kind(&self) -> LayerKind {
        self.kind
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    pub fn child(&self, kind: LayerKind) -> Option<Arc<RscLayerData>> {
        self.children
            .lock()
            .iter()
            .find(|child| child.kind == kind)
            .cloned()
    }

    pub fn add_child(&self, child: Arc<RscLayerData>) {
        self.children.lock().push(child);
    }

    pub fn children(&self) -> Vec<Arc<RscLayerData>> {
        self.children.lock().clone()
    }

    pub fn volume(&self, vlm_nr: VolumeNumber) -> Option<Arc<StorageVlmData>> {
        self.volumes.lock().get(&vlm_nr).cloned()
    }

    pub fn put_volume(&self, data: Arc<StorageVlmData>) {
        self.volumes.lock().insert(data.vlm_nr(), data);
    }

    pub fn volumes(&self) -> BTreeMap<VolumeNumber, Arc<StorageVlmData>> {
        self.volumes.lock().clone()
    }
}

// =============================================================================
// Storage Layer Volume Data
// =============================================================================

/// Whether a device-layer volume object backs a live resource volume or a
/// point-in-time snapshot of one. Providers dispatch on this instead of
/// there being a parallel snapshot object hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VlmDataKind {
    Resource,
    Snapshot,
}

/// Device-layer payload of one volume: the storage pool backing it plus the
/// size accounting reported back by the pool's device provider.
///
/// Sizes are in KiB. The size fields reflect satellite-observed state and
/// are not part of the persisted entity tables.
pub struct StorageVlmData {
    data_kind: VlmDataKind,
    rsc_name: ResourceName,
    suffix: String,
    vlm_nr: VolumeNumber,
    stor_pool: Mutex<Arc<StorPool>>,
    desired_size: AtomicU64,
    gross_size: AtomicU64,
    allocated_size: AtomicU64,
    usable_size: AtomicU64,
    exists: AtomicBool,
    device_path: Mutex<Option<String>>,
}

impl StorageVlmData {
    pub fn new(
        rsc_name: ResourceName,
        suffix: impl Into<String>,
        vlm_nr: VolumeNumber,
        desired_size: u64,
        stor_pool: Arc<StorPool>,
    ) -> Arc<Self> {
        Self::with_kind(
            VlmDataKind::Resource,
            rsc_name,
            suffix,
            vlm_nr,
            desired_size,
            stor_pool,
        )
    }

    pub fn new_snapshot(
        rsc_name: ResourceName,
        suffix: impl Into<String>,
        vlm_nr: VolumeNumber,
        desired_size: u64,
        stor_pool: Arc<StorPool>,
    ) -> Arc<Self> {
        Self::with_kind(
            VlmDataKind::Snapshot,
            rsc_name,
            suffix,
            vlm_nr,
            desired_size,
            stor_pool,
        )
    }

    fn with_kind(
        data_kind: VlmDataKind,
        rsc_name: ResourceName,
        suffix: impl Into<String>,
        vlm_nr: VolumeNumber,
        desired_size: u64,
        stor_pool: Arc<StorPool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            data_kind,
            rsc_name,
            suffix: suffix.into(),
            vlm_nr,
            stor_pool: Mutex::new(stor_pool),
            desired_size: AtomicU64::new(desired_size),
            gross_size: AtomicU64::new(0),
            allocated_size: AtomicU64::new(0),
            usable_size: AtomicU64::new(0),
            exists: AtomicBool::new(false),
            device_path: Mutex::new(None),
        })
    }

    pub fn data_kind(&self) -> VlmDataKind {
        self.data_kind
    }

    pub fn is_snapshot(&self) -> bool {
        self.data_kind == VlmDataKind::Snapshot
    }

    /// Registry key of this volume object, unique within a storage pool
    pub fn key(&self) -> String {
        format!("{}{}/{}", self.rsc_name, self.suffix, self.vlm_nr)
    }

    /// Identifier of the backing device on the external system
    pub fn identifier(&self) -> String {
        format!(
            "{}{}_{:05}",
            self.rsc_name.display(),
            self.suffix,
            self.vlm_nr.value()
        )
    }

    pub fn rsc_name(&self) -> &ResourceName {
        &self.rsc_name
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    pub fn vlm_nr(&self) -> VolumeNumber {
        self.vlm_nr
    }

    pub fn stor_pool(&self) -> Arc<StorPool> {
        self.stor_pool.lock().clone()
    }

    pub fn set_stor_pool(&self, pool: Arc<StorPool>) {
        *self.stor_pool.lock() = pool;
    }

    pub fn desired_size(&self) -> u64 {
        self.desired_size.load(Ordering::Relaxed)
    }

    pub fn set_desired_size(&self, size: u64) {
        self.desired_size.store(size, Ordering::Relaxed);
    }

    pub fn gross_size(&self) -> u64 {
        self.gross_size.load(Ordering::Relaxed)
    }

    pub fn set_gross_size(&self, size: u64) {
        self.gross_size.store(size, Ordering::Relaxed);
    }

    pub fn allocated_size(&self) -> u64 {
        self.allocated_size.load(Ordering::Relaxed)
    }

    pub fn set_allocated_size(&self, size: u64) {
        self.allocated_size.store(size, Ordering::Relaxed);
    }

    pub fn usable_size(&self) -> u64 {
        self.usable_size.load(Ordering::Relaxed)
    }

    pub fn set_usable_size(&self, size: u64) {
        self.usable_size.store(size, Ordering::Relaxed);
    }

    pub fn exists(&self) -> bool {
        self.exists.load(Ordering::Relaxed)
    }

    pub fn set_exists(&self, exists: bool) {
        self.exists.store(exists, Ordering::Relaxed);
    }

    pub fn device_path(&self) -> Option<String> {
        self.device_path.lock().clone()
    }

    pub fn set_device_path(&self, path: Option<String>) {
        *self.device_path.lock() = path;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_kind_round_trip() {
        let kinds = vec![LayerKind::Replication, LayerKind::Storage];
        let joined = join_kinds(&kinds);
        assert_eq!(joined, "REPLICATION,STORAGE");
        assert_eq!(parse_kinds(&joined).unwrap(), kinds);
        assert!(parse_kinds("REPLICATION,BOGUS").is_err());
    }

    #[test]
    fn test_payload_lookup_by_suffix_and_number() {
        let mut payload = LayerPayload::new();
        let nr = VolumeNumber::new(0).unwrap();
        payload.put_storage_pool("", nr, StorPoolName::new("pool-A").unwrap());
        assert_eq!(
            payload.storage_pool("", nr).unwrap().display(),
            "pool-A"
        );
        assert!(payload.storage_pool(".nvme", nr).is_none());
    }
}
