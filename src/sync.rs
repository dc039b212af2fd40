//! Satellite synchronization
//!
//! When a satellite authenticates, the controller answers with the full
//! sync id the satellite must echo back and applies the free-space figures
//! the satellite reported for its pools. Reports for pools the controller
//! does not know are logged and skipped; a satellite may legitimately still
//! carry pools that were deleted while it was offline.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::Result;
use crate::objects::name::{NodeName, StorPoolName};
use crate::objects::registry::CoreRegistry;
use crate::security::AccessContext;

/// Free-space figure of one pool, as reported by a satellite
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreeSpaceRecord {
    pub pool_uuid: String,
    pub pool_name: String,
    /// Free capacity in KiB
    pub free_space: u64,
}

/// Successful satellite authentication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSuccess {
    /// Sync id the satellite must echo in its following full sync
    pub expected_full_sync_id: u64,
    pub free_space: Vec<FreeSpaceRecord>,
}

/// Applies satellite authentication results to the controller state
pub struct SatelliteSync {
    registry: Arc<CoreRegistry>,
    next_full_sync_id: AtomicU64,
    /// Sync id expected from each authenticated satellite
    expected_ids: Mutex<BTreeMap<NodeName, u64>>,
}

impl SatelliteSync {
    pub fn new(registry: Arc<CoreRegistry>) -> Self {
        Self {
            registry,
            next_full_sync_id: AtomicU64::new(1),
            expected_ids: Mutex::new(BTreeMap::new()),
        }
    }

    /// Handle a successful satellite authentication: allocate the full sync
    /// id the satellite must echo and fold its free-space report into the
    /// pool trackers
    pub fn on_auth_success(
        &self,
        ctx: &AccessContext,
        node: &NodeName,
        free_space: Vec<FreeSpaceRecord>,
    ) -> Result<AuthSuccess> {
        let full_sync_id = self.next_full_sync_id.fetch_add(1, Ordering::Relaxed);
        self.expected_ids.lock().insert(node.clone(), full_sync_id);
        info!(node = %node, full_sync_id, pools = free_space.len(), "satellite authenticated");

        for record in &free_space {
            let pool_name = match StorPoolName::new(&record.pool_name) {
                Ok(name) => name,
                Err(name_err) => {
                    warn!(
                        node = %node,
                        pool = %record.pool_name,
                        error = %name_err,
                        "skipping free-space report with invalid pool name"
                    );
                    continue;
                }
            };
            match self.registry.get_stor_pool(ctx, node, &pool_name) {
                Ok(pool) => pool.free_space().set_free_capacity(record.free_space),
                Err(lookup_err) => {
                    warn!(
                        node = %node,
                        pool = %pool_name,
                        error = %lookup_err,
                        "skipping free-space report for unknown pool"
                    );
                }
            }
        }

        Ok(AuthSuccess {
            expected_full_sync_id: full_sync_id,
            free_space,
        })
    }

    /// Sync id expected from the given satellite, if it has authenticated
    pub fn expected_full_sync_id(&self, node: &NodeName) -> Option<u64> {
        self.expected_ids.lock().get(node).copied()
    }
}
