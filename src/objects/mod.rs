//! Core entity model
//!
//! The in-memory object graph of the cluster: nodes, resource definitions
//! with their volume definitions, per-node resources with their volumes,
//! and node-local storage pools. Every entity couples identity (uuid plus
//! checked name), an access control guard, transactional state cells, and
//! a persistence record shape.

pub mod name;
pub mod node;
pub mod numbers;
pub mod registry;
pub mod resource;
pub mod resource_definition;
pub mod stor_pool;
pub mod volume;
pub mod volume_definition;

pub use name::{NodeName, ResourceName, SecTypeName, StorPoolName};
pub use node::{NetInterface, Node, NodeFactory, NodeFlags, NodeType};
pub use numbers::{MinorNumber, VolumeNumber};
pub use registry::CoreRegistry;
pub use resource::{Resource, ResourceConnection, ResourceFactory, RscFlags};
pub use resource_definition::{
    LayerMetaKey, ResourceDefinition, ResourceDefinitionFactory, RscDfnFlags, RscDfnLayerMeta,
};
pub use stor_pool::{FreeSpaceTracker, StorPool, StorPoolFactory};
pub use volume::{Volume, VolumeConnection, VolumeFactory, VolumeFlags};
pub use volume_definition::{VolumeDefinition, VolumeDefinitionFactory, VlmDfnFlags};
