/// Cycle Consensus
///
/// Leaderless agreement on one record per fixed-length cycle:
/// - Quarter-phased scheduling (Q1 requests, Q3 certification, Q4 comparison, Q0 commit)
/// - XOR-scored certificates; the highest aggregate marker wins
/// - Authenticated unicast and suppressed gossip between known nodes
/// - Membership changes carried by each record (join, activate, rotate, lost, apoptosis)

pub mod config;
pub mod crypto;
pub mod cycle;
pub mod engine;
pub mod membership;
pub mod network;
pub mod scheduler;
pub mod storage;
pub mod submodules;

pub use config::CycleConfig;
pub use crypto::{Hash, KeyPair};
pub use cycle::{CertBundle, CycleCert, CycleRecord};
pub use engine::{CycleEngine, CycleEvent, EngineError};
pub use network::{Comms, MemoryHub, NodeId};
pub use storage::{CycleStore, MemoryStore, RocksStore};
