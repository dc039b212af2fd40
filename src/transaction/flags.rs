//! Transactional state flag bitmasks
//!
//! Flag bitmasks are combinations of named, type-specific bit constants;
//! unknown bits can never be set because the cell stores the typed flags
//! value, not a raw integer.

use bitflags::Flags;

use crate::transaction::{PersistFn, TransactionMgr, TxCell, TxCellOps};

/// Transactional bitmask of typed flags
pub struct StateFlags<F>
where
    F: Flags<Bits = u64> + Copy + Send + Sync,
{
    cell: TxCell<F>,
}

impl<F> StateFlags<F>
where
    F: Flags<Bits = u64> + Copy + Send + Sync,
{
    pub fn new(initial: F) -> Self {
        Self {
            cell: TxCell::new(initial),
        }
    }

    pub fn with_persist(initial: F, persist: PersistFn<F>) -> Self {
        Self {
            cell: TxCell::with_persist(initial, persist),
        }
    }

    /// Check whether all of the given flags are set
    pub fn is_set(&self, flags: F) -> bool {
        self.cell.get().contains(flags)
    }

    pub fn get(&self) -> F {
        self.cell.get()
    }

    /// The raw 64-bit mask, as persisted in the entity's flags column
    pub fn mask(&self) -> u64 {
        self.cell.get().bits()
    }

    pub fn enable(&self, tx: &TransactionMgr, flags: F) {
        let mut current = self.cell.get();
        current.insert(flags);
        self.cell.set(tx, current);
    }

    pub fn disable(&self, tx: &TransactionMgr, flags: F) {
        let mut current = self.cell.get();
        current.remove(flags);
        self.cell.set(tx, current);
    }

    pub fn set_flags(&self, tx: &TransactionMgr, flags: F) {
        self.cell.set(tx, flags);
    }

    /// The underlying cell, for an entity's `tx_cells` listing
    pub fn as_cell(&self) -> &dyn TxCellOps {
        &self.cell
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitflags::bitflags;

    bitflags! {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        struct TestFlags: u64 {
            const CLEAN = 1;
            const DELETE = 2;
        }
    }

    #[test]
    fn test_enable_disable_and_rollback() {
        let tx = TransactionMgr::new();
        let flags = StateFlags::new(TestFlags::empty());

        flags.enable(&tx, TestFlags::DELETE);
        assert!(flags.is_set(TestFlags::DELETE));
        assert_eq!(flags.mask(), 2);

        flags.as_cell().rollback_cell();
        assert!(!flags.is_set(TestFlags::DELETE));
        assert_eq!(flags.mask(), 0);

        let tx2 = TransactionMgr::new();
        flags.enable(&tx2, TestFlags::CLEAN | TestFlags::DELETE);
        flags.disable(&tx2, TestFlags::DELETE);
        flags.as_cell().commit_cell().unwrap();
        assert_eq!(flags.mask(), 1);
        let _ = tx;
    }
}
