/// Storage layer implementation using RocksDB
///
/// Persists the cycle chain and the node list snapshot, keyed by cycle
/// counter, with retention handled by the pruner.

use crate::crypto::Hash;
use crate::cycle::{CycleCert, CycleRecord};
use crate::membership::NodeList;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, DB};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

pub mod memory;
pub mod pruning;

// Re-export for convenience
pub use memory::MemoryStore;
pub use pruning::{PruneStats, Pruner, PruningConfig, RetentionPolicy};

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] rocksdb::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Cycle not found: {0}")]
    CycleNotFound(u64),

    #[error("Cycle already stored: {0}")]
    CycleExists(u64),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Persisted chain entry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredCycle {
    pub record: CycleRecord,
    /// Zero while provisional
    pub marker: Hash,
    pub certs: Vec<CycleCert>,
    /// Saved from our own candidate before the network agreed
    pub provisional: bool,
}

impl StoredCycle {
    pub fn committed(record: CycleRecord, marker: Hash, certs: Vec<CycleCert>) -> Self {
        Self {
            record,
            marker,
            certs,
            provisional: false,
        }
    }

    pub fn provisional(record: CycleRecord) -> Self {
        Self {
            record,
            marker: Hash::zero(),
            certs: Vec::new(),
            provisional: true,
        }
    }

    pub fn counter(&self) -> u64 {
        self.record.counter
    }
}

/// Cycle chain persistence
pub trait CycleStore: Send + Sync {
    /// Append a new entry; fails if the counter is taken
    fn add_cycle(&self, cycle: &StoredCycle) -> Result<()>;

    /// Amend an existing entry in place
    fn update_cycle(&self, counter: u64, cycle: &StoredCycle) -> Result<()>;

    fn get_cycle(&self, counter: u64) -> Result<Option<StoredCycle>>;

    /// Entry with the highest counter
    fn latest_cycle(&self) -> Result<Option<StoredCycle>>;

    fn delete_cycle(&self, counter: u64) -> Result<()>;

    /// Stored counters in ascending order
    fn counters(&self) -> Result<Vec<u64>>;

    fn save_node_list(&self, nodes: &NodeList) -> Result<()>;

    fn load_node_list(&self) -> Result<Option<NodeList>>;
}

/// Column family names
const CF_CYCLES: &str = "cycles";
const CF_METADATA: &str = "metadata";

/// Metadata keys
const KEY_NODE_LIST: &[u8] = b"node_list";

fn counter_key(counter: u64) -> [u8; 8] {
    // Big-endian so iteration order is counter order
    counter.to_be_bytes()
}

fn key_counter(key: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| StorageError::InvalidData("Invalid counter key".into()))?;
    Ok(u64::from_be_bytes(bytes))
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| StorageError::SerializationError(e.to_string()))
}

pub(crate) fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| StorageError::SerializationError(e.to_string()))
}

/// RocksDB-backed cycle store
pub struct RocksStore {
    db: Arc<DB>,
}

impl RocksStore {
    /// Opens RocksDB with predefined column families
    pub fn new(path: &Path) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cfs = vec![
            ColumnFamilyDescriptor::new(CF_CYCLES, Options::default()),
            ColumnFamilyDescriptor::new(CF_METADATA, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&opts, path, cfs)?;

        Ok(Self { db: Arc::new(db) })
    }

    fn get_cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::InvalidData(format!("Column family not found: {}", name)))
    }
}

impl CycleStore for RocksStore {
    fn add_cycle(&self, cycle: &StoredCycle) -> Result<()> {
        let cf = self.get_cf(CF_CYCLES)?;
        let key = counter_key(cycle.counter());
        if self.db.get_cf(cf, key)?.is_some() {
            return Err(StorageError::CycleExists(cycle.counter()));
        }
        self.db.put_cf(cf, key, encode(cycle)?)?;
        Ok(())
    }

    fn update_cycle(&self, counter: u64, cycle: &StoredCycle) -> Result<()> {
        let cf = self.get_cf(CF_CYCLES)?;
        let key = counter_key(counter);
        if self.db.get_cf(cf, key)?.is_none() {
            return Err(StorageError::CycleNotFound(counter));
        }
        self.db.put_cf(cf, key, encode(cycle)?)?;
        Ok(())
    }

    fn get_cycle(&self, counter: u64) -> Result<Option<StoredCycle>> {
        let cf = self.get_cf(CF_CYCLES)?;
        match self.db.get_cf(cf, counter_key(counter))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn latest_cycle(&self) -> Result<Option<StoredCycle>> {
        let cf = self.get_cf(CF_CYCLES)?;
        match self.db.iterator_cf(cf, IteratorMode::End).next() {
            Some(entry) => {
                let (_, value) = entry?;
                Ok(Some(decode(&value)?))
            }
            None => Ok(None),
        }
    }

    fn delete_cycle(&self, counter: u64) -> Result<()> {
        let cf = self.get_cf(CF_CYCLES)?;
        self.db.delete_cf(cf, counter_key(counter))?;
        Ok(())
    }

    fn counters(&self) -> Result<Vec<u64>> {
        let cf = self.get_cf(CF_CYCLES)?;
        let mut counters = Vec::new();
        for entry in self.db.iterator_cf(cf, IteratorMode::From(&[], Direction::Forward)) {
            let (key, _) = entry?;
            counters.push(key_counter(&key)?);
        }
        Ok(counters)
    }

    fn save_node_list(&self, nodes: &NodeList) -> Result<()> {
        let cf = self.get_cf(CF_METADATA)?;
        self.db.put_cf(cf, KEY_NODE_LIST, encode(nodes)?)?;
        Ok(())
    }

    fn load_node_list(&self) -> Result<Option<NodeList>> {
        let cf = self.get_cf(CF_METADATA)?;
        match self.db.get_cf(cf, KEY_NODE_LIST)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }
}
