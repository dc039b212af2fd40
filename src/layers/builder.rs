//! Layer stack builder
//!
//! Idempotently materializes a resource's layer data tree from its
//! definition's layer stack. Existing layer objects are reused; only the
//! missing parts of the chain and the missing device-layer volume objects
//! are created. Called once when a resource is deployed and again whenever
//! a volume is added.

use tracing::debug;

use crate::error::{Error, Result};
use crate::layers::{LayerKind, LayerPayload, RscLayerData, StorageVlmData};
use crate::objects::resource::Resource;
use crate::objects::resource_definition::validate_layer_stack;
use crate::security::{AccessContext, AccessType};
use crate::transaction::TransactionMgr;

use std::sync::Arc;

#[derive(Default)]
pub struct LayerStackBuilder;

impl LayerStackBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Ensure the resource's layer data tree matches its definition's layer
    /// stack and that every deployed volume has a device-layer object on
    /// the storage layer.
    ///
    /// `payload` assigns storage pools to (suffix, volume number) slots; a
    /// volume that needs a new device-layer object but has no assignment is
    /// a configuration error.
    pub fn ensure_stack_data(
        &self,
        ctx: &AccessContext,
        tx: &TransactionMgr,
        rsc: &Arc<Resource>,
        payload: &LayerPayload,
    ) -> Result<()> {
        rsc.require_access(ctx, AccessType::Use)?;
        let stack = rsc.definition().layer_stack_unchecked();
        validate_layer_stack(&stack)?;

        let root = match rsc.layer_root() {
            Some(existing) => existing,
            None => {
                let root = RscLayerData::new(stack[0], "");
                rsc.set_layer_root(root.clone());
                root
            }
        };
        if root.kind() != stack[0] {
            return Err(Error::Internal(format!(
                "layer tree of {} starts with {} but the definition's stack starts with {}",
                rsc.key(),
                root.kind(),
                stack[0]
            )));
        }

        let mut current = root;
        for kind in &stack[1..] {
            current = match current.child(*kind) {
                Some(child) => child,
                None => {
                    let child = RscLayerData::new(*kind, "");
                    current.add_child(child.clone());
                    child
                }
            };
        }

        // current is the storage layer now
        for vlm in rsc.volumes() {
            let vlm_nr = vlm.volume_number();
            if current.volume(vlm_nr).is_some() {
                continue;
            }
            let pool_name = payload.storage_pool("", vlm_nr).ok_or_else(|| {
                Error::Configuration(format!(
                    "no storage pool assigned for volume {vlm_nr} of {}",
                    rsc.key()
                ))
            })?;
            let pool = rsc.node().get_stor_pool(ctx, pool_name)?;
            let data = StorageVlmData::new(
                rsc.definition().name().clone(),
                "",
                vlm_nr,
                vlm.definition().size_unchecked(),
                pool.clone(),
            );
            debug!(
                resource = %rsc.key(),
                volume = %vlm_nr,
                pool = %pool.name(),
                "storage layer volume object created"
            );
            current.put_volume(data.clone());
            pool.put_volume(tx, data);
        }
        Ok(())
    }
}
