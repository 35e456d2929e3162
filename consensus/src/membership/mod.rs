/// Node list
///
/// Local view of network membership, advanced only by applying committed
/// cycle records. Iteration is ordered by node id.

use crate::cycle::CycleRecord;
use crate::network::types::{Node, NodeId, NodeStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Changes made by one `apply_record`
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MembershipDelta {
    pub added: usize,
    pub activated: usize,
    pub dropped: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeList {
    nodes: BTreeMap<NodeId, Node>,
}

impl NodeList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, node: Node) {
        self.nodes.insert(node.id.clone(), node);
    }

    pub fn remove(&mut self, id: &NodeId) -> Option<Node> {
        self.nodes.remove(id)
    }

    pub fn get(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn is_active(&self, id: &NodeId) -> bool {
        self.nodes.get(id).map_or(false, Node::is_active)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn all(&self) -> Vec<Node> {
        self.nodes.values().cloned().collect()
    }

    pub fn active(&self) -> Vec<Node> {
        self.nodes.values().filter(|n| n.is_active()).cloned().collect()
    }

    pub fn active_count(&self) -> usize {
        self.nodes.values().filter(|n| n.is_active()).count()
    }

    /// Active nodes ordered oldest first, ties by id
    pub fn by_age(&self) -> Vec<&Node> {
        let mut active: Vec<&Node> = self.nodes.values().filter(|n| n.is_active()).collect();
        active.sort_by(|a, b| a.activated_at.cmp(&b.activated_at).then_with(|| a.id.cmp(&b.id)));
        active
    }

    /// Apply a committed record's membership changes
    pub fn apply_record(&mut self, record: &CycleRecord) -> MembershipDelta {
        let mut delta = MembershipDelta::default();

        for joined in &record.joined {
            if self.nodes.contains_key(&joined.id) {
                continue;
            }
            self.nodes.insert(
                joined.id.clone(),
                Node {
                    id: joined.id.clone(),
                    public_key: joined.public_key.clone(),
                    status: NodeStatus::Syncing,
                    activated_at: 0,
                },
            );
            delta.added += 1;
        }

        for id in &record.activated {
            if let Some(node) = self.nodes.get_mut(id) {
                if !node.is_active() {
                    node.status = NodeStatus::Active;
                    node.activated_at = record.counter;
                    delta.activated += 1;
                }
            }
        }

        for id in record.departures() {
            if self.nodes.remove(id).is_some() {
                delta.dropped += 1;
            }
        }

        debug!(
            counter = record.counter,
            added = delta.added,
            activated = delta.activated,
            dropped = delta.dropped,
            total = self.nodes.len(),
            "applied cycle record to node list"
        );
        delta
    }
}
