/// In-memory cycle store for tests and simulation

use super::{CycleStore, Result, StorageError, StoredCycle};
use crate::membership::NodeList;
use std::collections::BTreeMap;
use std::sync::RwLock;

#[derive(Default)]
pub struct MemoryStore {
    cycles: RwLock<BTreeMap<u64, StoredCycle>>,
    node_list: RwLock<Option<NodeList>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> StorageError {
    StorageError::InvalidData("store lock poisoned".into())
}

impl CycleStore for MemoryStore {
    fn add_cycle(&self, cycle: &StoredCycle) -> Result<()> {
        let mut cycles = self.cycles.write().map_err(poisoned)?;
        if cycles.contains_key(&cycle.counter()) {
            return Err(StorageError::CycleExists(cycle.counter()));
        }
        cycles.insert(cycle.counter(), cycle.clone());
        Ok(())
    }

    fn update_cycle(&self, counter: u64, cycle: &StoredCycle) -> Result<()> {
        let mut cycles = self.cycles.write().map_err(poisoned)?;
        match cycles.get_mut(&counter) {
            Some(entry) => {
                *entry = cycle.clone();
                Ok(())
            }
            None => Err(StorageError::CycleNotFound(counter)),
        }
    }

    fn get_cycle(&self, counter: u64) -> Result<Option<StoredCycle>> {
        Ok(self.cycles.read().map_err(poisoned)?.get(&counter).cloned())
    }

    fn latest_cycle(&self) -> Result<Option<StoredCycle>> {
        Ok(self
            .cycles
            .read()
            .map_err(poisoned)?
            .values()
            .next_back()
            .cloned())
    }

    fn delete_cycle(&self, counter: u64) -> Result<()> {
        self.cycles.write().map_err(poisoned)?.remove(&counter);
        Ok(())
    }

    fn counters(&self) -> Result<Vec<u64>> {
        Ok(self.cycles.read().map_err(poisoned)?.keys().copied().collect())
    }

    fn save_node_list(&self, nodes: &NodeList) -> Result<()> {
        *self.node_list.write().map_err(poisoned)? = Some(nodes.clone());
        Ok(())
    }

    fn load_node_list(&self) -> Result<Option<NodeList>> {
        Ok(self.node_list.read().map_err(poisoned)?.clone())
    }
}
