//! Storage Controller Core
//!
//! The control plane core of a replicated cluster storage manager.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Request Handling                          │
//! │   AccessContext ──► security (MAC rule checks, privileges)      │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                       Entity Kernel                             │
//! │   CoreRegistry ──► Node / ResourceDefinition / StorPool         │
//! │        │                │                                       │
//! │        │          VolumeDefinition ── Resource ── Volume        │
//! │        │                                  │                     │
//! │        │                          layer data tree               │
//! │        └── factories stage changes in TransactionMgr cells      │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                       Device Layer                              │
//! │   ReconcileDriver ──► DeviceProvider (diskless/LVM/Openflex)    │
//! │   SatelliteSync   ──► FreeSpaceTracker per storage pool         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                       Persistence Boundary                      │
//! │   EntityDriver (external relational drivers, MemoryDriver)      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`security`]: access types, privileges, MAC rule engine
//! - [`transaction`]: transactional cells, commit/rollback driver
//! - [`objects`]: entity model, factories, cluster registry
//! - [`layers`]: layer stack data and the stack builder
//! - [`provider`]: device provider backends
//! - [`reconcile`]: periodic device-layer reconciliation
//! - [`sync`]: satellite authentication and free-space sync
//! - [`drivers`]: persistence driver boundary
//! - [`error`]: error types and handling

pub mod drivers;
pub mod error;
pub mod layers;
pub mod objects;
pub mod provider;
pub mod reconcile;
pub mod security;
pub mod sync;
pub mod transaction;

pub use error::{Error, Result};

pub use security::{
    AccessContext, AccessType, ObjectProtection, Privilege, PrivilegeSet, SecType, SecurityLevel,
    SecurityRegistry, SecurityRule, SecuritySnapshot,
};

pub use transaction::{
    PropsContainer, StateFlags, TransactionMgr, TransactionObject, TxCell, TxCellOps, TxList,
    TxMap,
};

pub use objects::{
    CoreRegistry, FreeSpaceTracker, MinorNumber, Node, NodeFactory, NodeName, NodeType, Resource,
    ResourceDefinition, ResourceDefinitionFactory, ResourceFactory, ResourceName, StorPool,
    StorPoolFactory, StorPoolName, Volume, VolumeDefinition, VolumeDefinitionFactory,
    VolumeFactory, VolumeNumber,
};

pub use layers::{
    LayerKind, LayerPayload, LayerStackBuilder, RscLayerData, StorageVlmData, VlmDataKind,
};

pub use provider::{
    default_providers, DeviceProvider, DeviceProviderKind, DisklessProvider, ExtCmd, LvmConfig,
    LvmProvider, OpenflexConfig, OpenflexProvider, ReconcileReport, SpaceInfo, TokioExtCmd,
};

pub use reconcile::ReconcileDriver;
pub use sync::{AuthSuccess, FreeSpaceRecord, SatelliteSync};

pub use drivers::{EntityDriver, EntityRecord, MemoryDriver, Table};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
