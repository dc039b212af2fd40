//! Transactional property bags

use std::collections::BTreeMap;

use crate::transaction::{TransactionMgr, TxCellOps, TxMap};

/// String key/value property container attached to an entity
pub struct PropsContainer {
    map: TxMap<String, String>,
}

impl PropsContainer {
    pub fn new() -> Self {
        Self { map: TxMap::new() }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.map.get(&key.to_string())
    }

    pub fn set(
        &self,
        tx: &TransactionMgr,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Option<String> {
        self.map.insert(tx, key.into(), value.into())
    }

    pub fn remove(&self, tx: &TransactionMgr, key: &str) -> Option<String> {
        self.map.remove(tx, &key.to_string())
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.map.snapshot()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// The underlying cell, for an entity's `tx_cells` listing
    pub fn as_cell(&self) -> &dyn TxCellOps {
        &self.map
    }
}

impl Default for PropsContainer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_props_stage_and_rollback() {
        let tx = TransactionMgr::new();
        let props = PropsContainer::new();

        props.set(&tx, "StorDriver/LvmVg", "vg0");
        assert_eq!(props.get("StorDriver/LvmVg").as_deref(), Some("vg0"));

        props.as_cell().rollback_cell();
        assert_eq!(props.get("StorDriver/LvmVg"), None);
        assert!(props.is_empty());
    }
}
