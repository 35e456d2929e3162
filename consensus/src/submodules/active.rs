/// Activation requests
///
/// A syncing node announces itself ready in Q1; members record it in
/// `activated` and the node becomes active when the record commits.

use super::{check_cycle, check_sorted, parse, Proposal, Result, SubmoduleContext, SubmoduleError};
use crate::cycle::{CycleRecord, CycleTxs};
use crate::network::types::{GossipType, NodeId, NodeStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::warn;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveBody {
    pub cycle: u64,
}

pub type ActiveRequest = Proposal<ActiveBody>;

#[derive(Debug, Default)]
pub struct ActiveModule {
    collected: BTreeMap<NodeId, ActiveRequest>,
}

impl ActiveModule {
    pub fn init(&mut self) {
        self.collected.clear();
    }

    pub fn reset(&mut self) {
        self.collected.clear();
    }

    fn check(request: &ActiveRequest, ctx: &SubmoduleContext<'_>) -> Result<()> {
        check_cycle(ctx.counter, request.body.cycle)?;
        let node = ctx
            .nodes
            .get(&request.owner)
            .ok_or_else(|| SubmoduleError::UnknownNode(request.owner.clone()))?;
        if node.status != NodeStatus::Syncing {
            return Err(SubmoduleError::Rejected(format!("{} is already active", request.owner)));
        }
        if !request.verify(&node.public_key) {
            return Err(SubmoduleError::InvalidSignature(request.owner.clone()));
        }
        Ok(())
    }

    /// Ask to be activated while we are syncing
    pub fn send_requests(&mut self, ctx: &SubmoduleContext<'_>) -> Vec<(GossipType, Value)> {
        let syncing = ctx
            .nodes
            .get(ctx.self_id)
            .map_or(false, |n| n.status == NodeStatus::Syncing);
        if !syncing {
            return Vec::new();
        }

        let request = match Proposal::sign(ActiveBody { cycle: ctx.counter }, ctx.keypair) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "failed to sign active request");
                return Vec::new();
            }
        };
        let value = match serde_json::to_value(&request) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "failed to encode active request");
                return Vec::new();
            }
        };
        self.collected.insert(request.owner.clone(), request);
        vec![(GossipType::GossipActive, value)]
    }

    pub fn handle_gossip(&mut self, data: Value, ctx: &SubmoduleContext<'_>) -> Result<bool> {
        let request: ActiveRequest = parse(GossipType::GossipActive, data)?;
        Self::check(&request, ctx)?;
        if self.collected.contains_key(&request.owner) {
            return Ok(false);
        }
        self.collected.insert(request.owner.clone(), request);
        Ok(true)
    }

    pub fn get_txs(&self) -> Vec<ActiveRequest> {
        self.collected.values().cloned().collect()
    }

    pub fn update_record(&self, txs: &CycleTxs, record: &mut CycleRecord, ctx: &SubmoduleContext<'_>) {
        let mut activated: Vec<NodeId> = txs
            .active
            .iter()
            .filter(|r| {
                ctx.nodes
                    .get(&r.owner)
                    .map_or(false, |n| n.status == NodeStatus::Syncing)
            })
            .map(|r| r.owner.clone())
            .collect();
        activated.sort();
        activated.dedup();
        record.activated = activated;
    }

    pub fn validate_record_types(record: &CycleRecord) -> Result<()> {
        check_sorted("activated", &record.activated)
    }
}
