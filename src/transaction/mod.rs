//! Transactional object kernel
//!
//! Every mutable field of a persistent entity is wrapped in a transactional
//! cell (scalar, list, or map valued). Writes stage the new value in memory
//! and mark the owning entity dirty in the active [`TransactionMgr`]; the
//! persistence callback bound to a cell runs on commit only, never on mere
//! assignment. [`TransactionMgr::rollback`] reverts every staged cell of
//! every touched entity.
//!
//! Each request runs with exactly one transaction context, passed explicitly
//! into every staging operation. An entity may be dirty in at most one
//! context at a time; staging through a second context while the first is
//! still uncommitted is a programming error and panics.

mod cell;
mod flags;
mod props;

pub use cell::{PersistFn, TxCell, TxList, TxMap};
pub use flags::StateFlags;
pub use props::PropsContainer;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;

static NEXT_TX_ID: AtomicU64 = AtomicU64::new(1);

// =============================================================================
// Transaction Object
// =============================================================================

/// A composite entity owning transactional cells.
///
/// Exposing the cell list lets the generic commit/rollback driver walk
/// nested ownership without each entity re-implementing the walk.
pub trait TransactionObject: Send + Sync {
    /// Stable identity, used to deduplicate dirty registrations
    fn uuid(&self) -> Uuid;

    /// All transactional cells owned by this entity
    fn tx_cells(&self) -> Vec<&dyn TxCellOps>;
}

/// Type-erased operations of a single transactional cell
pub trait TxCellOps: Send + Sync {
    /// Whether a staged, uncommitted value is present
    fn is_dirty(&self) -> bool;

    /// Apply the staged value and invoke the persistence callback
    fn commit_cell(&self) -> Result<()>;

    /// Discard the staged value, reverting to the last committed one
    fn rollback_cell(&self);
}

// =============================================================================
// Transaction Manager
// =============================================================================

/// Per-request transaction context tracking the set of dirty entities it
/// has touched, in first-touch order
pub struct TransactionMgr {
    id: u64,
    dirty: Mutex<Vec<Arc<dyn TransactionObject>>>,
}

impl TransactionMgr {
    pub fn new() -> Self {
        Self {
            id: NEXT_TX_ID.fetch_add(1, Ordering::Relaxed),
            dirty: Mutex::new(Vec::new()),
        }
    }

    /// Unique id of this context
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Register an entity as dirty in this context
    pub fn touch(&self, obj: Arc<dyn TransactionObject>) {
        let mut dirty = self.dirty.lock();
        if !dirty.iter().any(|entry| entry.uuid() == obj.uuid()) {
            dirty.push(obj);
        }
    }

    /// Number of dirty entities touched by this context
    pub fn dirty_count(&self) -> usize {
        self.dirty.lock().len()
    }

    /// Commit every staged change of every touched entity, invoking the
    /// pending persistence callbacks in staging order.
    ///
    /// If a persistence callback fails, callbacks already applied are not
    /// undone; the partial commit is unrecoverable for this context and the
    /// error must be escalated.
    pub fn commit(&self) -> Result<()> {
        let mut dirty = self.dirty.lock();
        for obj in dirty.iter() {
            for cell in obj.tx_cells() {
                if cell.is_dirty() {
                    cell.commit_cell()?;
                }
            }
        }
        debug!(tx_id = self.id, entities = dirty.len(), "transaction committed");
        dirty.clear();
        Ok(())
    }

    /// Discard all staged values of every touched entity and clear the
    /// dirty set
    pub fn rollback(&self) {
        let mut dirty = self.dirty.lock();
        for obj in dirty.iter() {
            for cell in obj.tx_cells() {
                cell.rollback_cell();
            }
        }
        debug!(tx_id = self.id, entities = dirty.len(), "transaction rolled back");
        dirty.clear();
    }
}

impl Default for TransactionMgr {
    fn default() -> Self {
        Self::new()
    }
}
