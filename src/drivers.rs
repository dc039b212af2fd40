//! Persistence driver boundary
//!
//! The relational driver implementations live outside this crate; the core
//! talks to them through [`EntityDriver`]. The record shapes here are the
//! compatibility contract: UUIDs travel as 36-character canonical strings,
//! names as normalized + display pairs, flags as a 64-bit bitmask, and a
//! resource definition's layer stack as a delimiter-joined kind list.
//!
//! [`MemoryDriver`] implements the boundary for tests and standalone mode.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Delimiter joining layer kind names in the persisted layer-stack column
pub const LAYER_STACK_DELIMITER: &str = ",";

/// Entity tables of the persistent store
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Table {
    Nodes,
    ResourceDefinitions,
    VolumeDefinitions,
    Resources,
    Volumes,
    StorPools,
}

/// Row shape shared by every entity table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRecord {
    /// 36-character canonical UUID string
    pub uuid: String,
    /// Normalized comparison name
    pub name: String,
    /// Case-preserving display name
    pub dsp_name: String,
    /// 64-bit flags bitmask
    pub flags: u64,
    /// Ordered, delimiter-joined layer kind list; resource definitions only
    pub layer_stack: Option<String>,
}

/// Create/update/delete operations of one entity store
pub trait EntityDriver: Send + Sync {
    fn create(&self, table: Table, record: EntityRecord) -> Result<()>;

    fn delete(&self, table: Table, uuid: Uuid) -> Result<()>;

    fn update_flags(&self, table: Table, uuid: Uuid, flags: u64) -> Result<()>;

    fn update_column(
        &self,
        table: Table,
        uuid: Uuid,
        column: &'static str,
        value: String,
    ) -> Result<()>;
}

// =============================================================================
// In-Memory Driver
// =============================================================================

/// In-memory entity store used by tests and standalone mode
pub struct MemoryDriver {
    rows: Mutex<BTreeMap<(Table, Uuid), EntityRecord>>,
    columns: Mutex<BTreeMap<(Table, Uuid, &'static str), String>>,
    fail_next: AtomicBool,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(BTreeMap::new()),
            columns: Mutex::new(BTreeMap::new()),
            fail_next: AtomicBool::new(false),
        }
    }

    /// Make the next mutating operation fail, for persistence-failure tests
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn row(&self, table: Table, uuid: Uuid) -> Option<EntityRecord> {
        self.rows.lock().get(&(table, uuid)).cloned()
    }

    pub fn row_count(&self, table: Table) -> usize {
        self.rows
            .lock()
            .keys()
            .filter(|(tbl, _)| *tbl == table)
            .count()
    }

    fn check_injected_failure(&self) -> Result<()> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            Err(Error::Persistence("injected store failure".into()))
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityDriver for MemoryDriver {
    fn create(&self, table: Table, record: EntityRecord) -> Result<()> {
        self.check_injected_failure()?;
        let uuid = Uuid::parse_str(&record.uuid)
            .map_err(|parse_err| Error::Persistence(format!("malformed uuid: {parse_err}")))?;
        let mut rows = self.rows.lock();
        if rows.contains_key(&(table, uuid)) {
            return Err(Error::Persistence(format!(
                "duplicate row for {table:?}/{uuid}"
            )));
        }
        rows.insert((table, uuid), record);
        Ok(())
    }

    fn delete(&self, table: Table, uuid: Uuid) -> Result<()> {
        self.check_injected_failure()?;
        if self.rows.lock().remove(&(table, uuid)).is_none() {
            return Err(Error::Persistence(format!(
                "no row to delete for {table:?}/{uuid}"
            )));
        }
        Ok(())
    }

    fn update_flags(&self, table: Table, uuid: Uuid, flags: u64) -> Result<()> {
        self.check_injected_failure()?;
        let mut rows = self.rows.lock();
        match rows.get_mut(&(table, uuid)) {
            Some(record) => {
                record.flags = flags;
                Ok(())
            }
            None => Err(Error::Persistence(format!(
                "no row to update for {table:?}/{uuid}"
            ))),
        }
    }

    fn update_column(
        &self,
        table: Table,
        uuid: Uuid,
        column: &'static str,
        value: String,
    ) -> Result<()> {
        self.check_injected_failure()?;
        if column == "LAYER_STACK" {
            if let Some(record) = self.rows.lock().get_mut(&(table, uuid)) {
                record.layer_stack = Some(value.clone());
            }
        }
        self.columns.lock().insert((table, uuid, column), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(uuid: Uuid) -> EntityRecord {
        EntityRecord {
            uuid: uuid.as_hyphenated().to_string(),
            name: "R1".into(),
            dsp_name: "r1".into(),
            flags: 0,
            layer_stack: None,
        }
    }

    #[test]
    fn test_create_and_update() {
        let driver = MemoryDriver::new();
        let uuid = Uuid::new_v4();
        driver.create(Table::Nodes, record(uuid)).unwrap();
        assert_eq!(driver.row_count(Table::Nodes), 1);
        // the uuid string is the 36-char canonical form
        assert_eq!(driver.row(Table::Nodes, uuid).unwrap().uuid.len(), 36);

        driver.update_flags(Table::Nodes, uuid, 3).unwrap();
        assert_eq!(driver.row(Table::Nodes, uuid).unwrap().flags, 3);

        driver.delete(Table::Nodes, uuid).unwrap();
        assert_eq!(driver.row_count(Table::Nodes), 0);
    }

    #[test]
    fn test_injected_failure_fires_once() {
        let driver = MemoryDriver::new();
        driver.fail_next();
        let uuid = Uuid::new_v4();
        assert!(driver.create(Table::Nodes, record(uuid)).is_err());
        assert!(driver.create(Table::Nodes, record(uuid)).is_ok());
    }
}
