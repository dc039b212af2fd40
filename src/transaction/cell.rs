//! Transactional cells: scalar, list, and map valued
//!
//! A cell holds its last committed value plus an optional staged value. The
//! staged value is visible to reads within the owning context immediately;
//! the persistence callback bound at construction runs on commit only.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::Result;
use crate::transaction::{TransactionMgr, TxCellOps};

/// Persistence callback invoked with the newly committed value
pub type PersistFn<T> = Box<dyn Fn(&T) -> Result<()> + Send + Sync>;

/// Tracks which transaction context currently holds staged state in a cell.
///
/// Zero means unowned. Claiming from a second context while another still
/// holds staged state is a programming error and panics.
struct CellOwner(AtomicU64);

impl CellOwner {
    fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    fn claim(&self, tx: &TransactionMgr) {
        let current = self.0.load(Ordering::Acquire);
        if current == tx.id() {
            return;
        }
        if current != 0
            || self
                .0
                .compare_exchange(0, tx.id(), Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            panic!(
                "transactional cell is bound to a different uncommitted transaction \
                 (held by context {current}, staging attempted by context {})",
                tx.id()
            );
        }
    }

    fn release(&self) {
        self.0.store(0, Ordering::Release);
    }
}

// =============================================================================
// Scalar Cell
// =============================================================================

struct CellState<T> {
    committed: T,
    staged: Option<T>,
}

/// Single scalar-valued transactional cell
pub struct TxCell<T: Clone + Send + Sync> {
    state: Mutex<CellState<T>>,
    owner: CellOwner,
    persist: Option<PersistFn<T>>,
}

impl<T: Clone + Send + Sync> TxCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            state: Mutex::new(CellState {
                committed: value,
                staged: None,
            }),
            owner: CellOwner::new(),
            persist: None,
        }
    }

    pub fn with_persist(value: T, persist: PersistFn<T>) -> Self {
        Self {
            state: Mutex::new(CellState {
                committed: value,
                staged: None,
            }),
            owner: CellOwner::new(),
            persist: Some(persist),
        }
    }

    /// Current value: the staged one if present, the committed one otherwise
    pub fn get(&self) -> T {
        let state = self.state.lock();
        state
            .staged
            .as_ref()
            .unwrap_or(&state.committed)
            .clone()
    }

    /// Stage a new value in the given transaction context
    pub fn set(&self, tx: &TransactionMgr, value: T) {
        self.owner.claim(tx);
        self.state.lock().staged = Some(value);
    }
}

impl<T: Clone + Send + Sync> TxCellOps for TxCell<T> {
    fn is_dirty(&self) -> bool {
        self.state.lock().staged.is_some()
    }

    fn commit_cell(&self) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(staged) = state.staged.take() {
            state.committed = staged;
            if let Some(persist) = &self.persist {
                persist(&state.committed)?;
            }
        }
        self.owner.release();
        Ok(())
    }

    fn rollback_cell(&self) {
        self.state.lock().staged = None;
        self.owner.release();
    }
}

// =============================================================================
// List Cell
// =============================================================================

/// List-valued transactional cell
pub struct TxList<T: Clone + Send + Sync> {
    state: Mutex<CellState<Vec<T>>>,
    owner: CellOwner,
    persist: Option<PersistFn<Vec<T>>>,
}

impl<T: Clone + Send + Sync> TxList<T> {
    pub fn new(initial: Vec<T>) -> Self {
        Self {
            state: Mutex::new(CellState {
                committed: initial,
                staged: None,
            }),
            owner: CellOwner::new(),
            persist: None,
        }
    }

    pub fn with_persist(initial: Vec<T>, persist: PersistFn<Vec<T>>) -> Self {
        Self {
            state: Mutex::new(CellState {
                committed: initial,
                staged: None,
            }),
            owner: CellOwner::new(),
            persist: Some(persist),
        }
    }

    pub fn get_all(&self) -> Vec<T> {
        let state = self.state.lock();
        state.staged.as_ref().unwrap_or(&state.committed).clone()
    }

    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.staged.as_ref().unwrap_or(&state.committed).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn append(&self, tx: &TransactionMgr, value: T) {
        self.owner.claim(tx);
        let mut state = self.state.lock();
        let committed = state.committed.clone();
        state.staged.get_or_insert(committed).push(value);
    }

    pub fn set_all(&self, tx: &TransactionMgr, values: Vec<T>) {
        self.owner.claim(tx);
        self.state.lock().staged = Some(values);
    }

    pub fn clear(&self, tx: &TransactionMgr) {
        self.set_all(tx, Vec::new());
    }
}

impl<T: Clone + Send + Sync> TxCellOps for TxList<T> {
    fn is_dirty(&self) -> bool {
        self.state.lock().staged.is_some()
    }

    fn commit_cell(&self) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(staged) = state.staged.take() {
            state.committed = staged;
            if let Some(persist) = &self.persist {
                persist(&state.committed)?;
            }
        }
        self.owner.release();
        Ok(())
    }

    fn rollback_cell(&self) {
        self.state.lock().staged = None;
        self.owner.release();
    }
}

// =============================================================================
// Map Cell
// =============================================================================

/// Map-valued transactional cell.
///
/// Staging is copy-on-write: the first staged mutation in a context clones
/// the committed map, later mutations work on the staged copy.
pub struct TxMap<K: Ord + Clone + Send + Sync, V: Clone + Send + Sync> {
    state: Mutex<CellState<BTreeMap<K, V>>>,
    owner: CellOwner,
    persist: Option<PersistFn<BTreeMap<K, V>>>,
}

impl<K: Ord + Clone + Send + Sync, V: Clone + Send + Sync> TxMap<K, V> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CellState {
                committed: BTreeMap::new(),
                staged: None,
            }),
            owner: CellOwner::new(),
            persist: None,
        }
    }

    pub fn with_persist(persist: PersistFn<BTreeMap<K, V>>) -> Self {
        Self {
            state: Mutex::new(CellState {
                committed: BTreeMap::new(),
                staged: None,
            }),
            owner: CellOwner::new(),
            persist: Some(persist),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let state = self.state.lock();
        state
            .staged
            .as_ref()
            .unwrap_or(&state.committed)
            .get(key)
            .cloned()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        let state = self.state.lock();
        state
            .staged
            .as_ref()
            .unwrap_or(&state.committed)
            .contains_key(key)
    }

    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.staged.as_ref().unwrap_or(&state.committed).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn insert(&self, tx: &TransactionMgr, key: K, value: V) -> Option<V> {
        self.owner.claim(tx);
        let mut state = self.state.lock();
        let committed = state.committed.clone();
        state.staged.get_or_insert(committed).insert(key, value)
    }

    pub fn remove(&self, tx: &TransactionMgr, key: &K) -> Option<V> {
        self.owner.claim(tx);
        let mut state = self.state.lock();
        let committed = state.committed.clone();
        state.staged.get_or_insert(committed).remove(key)
    }

    /// Current contents: staged view if present, committed view otherwise
    pub fn snapshot(&self) -> BTreeMap<K, V> {
        let state = self.state.lock();
        state.staged.as_ref().unwrap_or(&state.committed).clone()
    }

    pub fn keys(&self) -> Vec<K> {
        self.snapshot().into_keys().collect()
    }

    pub fn values(&self) -> Vec<V> {
        self.snapshot().into_values().collect()
    }
}

impl<K: Ord + Clone + Send + Sync, V: Clone + Send + Sync> Default for TxMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord + Clone + Send + Sync, V: Clone + Send + Sync> TxCellOps for TxMap<K, V> {
    fn is_dirty(&self) -> bool {
        self.state.lock().staged.is_some()
    }

    fn commit_cell(&self) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(staged) = state.staged.take() {
            state.committed = staged;
            if let Some(persist) = &self.persist {
                persist(&state.committed)?;
            }
        }
        self.owner.release();
        Ok(())
    }

    fn rollback_cell(&self) {
        self.state.lock().staged = None;
        self.owner.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_cell_staging_and_rollback() {
        let tx = TransactionMgr::new();
        let cell = TxCell::new(10u32);

        cell.set(&tx, 42);
        assert!(cell.is_dirty());
        assert_eq!(cell.get(), 42);

        cell.rollback_cell();
        assert!(!cell.is_dirty());
        assert_eq!(cell.get(), 10);
    }

    #[test]
    fn test_map_cell_insert_remove_rollback() {
        let tx = TransactionMgr::new();
        let map: TxMap<String, u64> = TxMap::new();

        map.insert(&tx, "a".into(), 1);
        map.commit_cell().unwrap();
        assert_eq!(map.get(&"a".to_string()), Some(1));

        let tx2 = TransactionMgr::new();
        map.insert(&tx2, "b".into(), 2);
        map.remove(&tx2, &"a".to_string());
        assert_eq!(map.len(), 1);
        assert!(map.contains_key(&"b".to_string()));

        map.rollback_cell();
        assert_eq!(map.len(), 1);
        assert!(map.contains_key(&"a".to_string()));
        assert!(!map.contains_key(&"b".to_string()));
    }

    #[test]
    fn test_list_cell_append_and_commit() {
        let tx = TransactionMgr::new();
        let list = TxList::new(vec![1u8]);
        list.append(&tx, 2);
        list.append(&tx, 3);
        assert_eq!(list.get_all(), vec![1, 2, 3]);
        list.commit_cell().unwrap();
        assert_eq!(list.get_all(), vec![1, 2, 3]);
        assert!(!list.is_dirty());
    }

    #[test]
    fn test_same_context_can_restage() {
        let tx = TransactionMgr::new();
        let cell = TxCell::new(0u32);
        cell.set(&tx, 1);
        cell.set(&tx, 2);
        assert_eq!(cell.get(), 2);
    }
}
