/// Cycle record types
///
/// A `CycleRecord` is the canonical membership delta of one cycle. Its
/// marker is the canonical hash of the whole record, so field order here is
/// part of the wire contract.

use crate::crypto::{hash_object, ECDSAPublicKey, Hash, HashError};
use crate::network::types::NodeId;
use crate::submodules::{ActiveRequest, ApoptosisProposal, JoinRequest, LostReport};
use serde::{Deserialize, Serialize};

/// Node admitted by a record
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JoinedNode {
    pub id: NodeId,
    pub public_key: ECDSAPublicKey,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleRecord {
    pub network_id: String,

    /// Monotonic cycle number; genesis is 0
    pub counter: u64,

    /// Marker of the previous record (zero for genesis)
    pub previous: Hash,

    /// Cycle start, seconds since the epoch
    pub start: u64,

    /// Cycle length in seconds
    pub duration: u64,

    /// Active nodes when the record was built
    pub active: u64,

    pub desired: u64,

    pub joined: Vec<JoinedNode>,
    pub activated: Vec<NodeId>,
    pub removed: Vec<NodeId>,
    pub lost: Vec<NodeId>,
    pub apoptosized: Vec<NodeId>,
}

impl CycleRecord {
    /// First record of a network: every initial node joins and is activated
    pub fn genesis(network_id: impl Into<String>, start: u64, duration: u64, nodes: Vec<JoinedNode>) -> Self {
        let mut joined = nodes;
        joined.sort();
        joined.dedup_by(|a, b| a.id == b.id);
        let activated = joined.iter().map(|n| n.id.clone()).collect();

        Self {
            network_id: network_id.into(),
            counter: 0,
            previous: Hash::zero(),
            start,
            duration,
            active: 0,
            desired: joined.len() as u64,
            joined,
            activated,
            removed: Vec::new(),
            lost: Vec::new(),
            apoptosized: Vec::new(),
        }
    }

    /// Empty successor of `prev`; submodules fill in the arrays
    pub fn successor(prev: &CycleRecord, prev_marker: Hash, duration: u64, active: u64, desired: u64) -> Self {
        Self {
            network_id: prev.network_id.clone(),
            counter: prev.counter + 1,
            previous: prev_marker,
            start: prev.start + prev.duration,
            duration,
            active,
            desired,
            joined: Vec::new(),
            activated: Vec::new(),
            removed: Vec::new(),
            lost: Vec::new(),
            apoptosized: Vec::new(),
        }
    }

    pub fn marker(&self) -> Result<Hash, HashError> {
        make_cycle_marker(self)
    }

    /// Every node this record takes out of the network
    pub fn departures(&self) -> impl Iterator<Item = &NodeId> {
        self.removed
            .iter()
            .chain(self.lost.iter())
            .chain(self.apoptosized.iter())
    }
}

/// Deterministic fingerprint of a record
pub fn make_cycle_marker(record: &CycleRecord) -> Result<Hash, HashError> {
    hash_object(record)
}

/// Inputs collected by the submodules during one cycle
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CycleTxs {
    pub join: Vec<JoinRequest>,
    pub active: Vec<ActiveRequest>,
    pub apoptosis: Vec<ApoptosisProposal>,
    pub lost: Vec<LostReport>,
}

impl CycleTxs {
    pub fn is_empty(&self) -> bool {
        self.join.is_empty() && self.active.is_empty() && self.apoptosis.is_empty() && self.lost.is_empty()
    }
}
