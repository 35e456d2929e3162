/// Apoptosis
///
/// A node leaving on its own gossips a signed proposal; members list it in
/// `apoptosized` of the record being built. Proposals for the previous
/// counter are still accepted since the leaving node may not have advanced
/// past the boundary.

use super::{check_sorted, parse, Proposal, Result, SubmoduleContext, SubmoduleError};
use crate::cycle::{CycleRecord, CycleTxs};
use crate::network::types::{GossipType, NodeId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApoptosisBody {
    pub cycle: u64,
}

pub type ApoptosisProposal = Proposal<ApoptosisBody>;

#[derive(Debug, Default)]
pub struct ApoptosisModule {
    collected: BTreeMap<NodeId, ApoptosisProposal>,
}

impl ApoptosisModule {
    pub fn init(&mut self) {
        self.collected.clear();
    }

    pub fn reset(&mut self) {
        self.collected.clear();
    }

    // Our own proposal goes out immediately when we stop, never in Q1
    pub fn send_requests(&mut self, _ctx: &SubmoduleContext<'_>) -> Vec<(GossipType, Value)> {
        Vec::new()
    }

    pub fn handle_gossip(&mut self, data: Value, ctx: &SubmoduleContext<'_>) -> Result<bool> {
        let proposal: ApoptosisProposal = parse(GossipType::Apoptosis, data)?;
        let cycle = proposal.body.cycle;
        if cycle != ctx.counter && cycle + 1 != ctx.counter {
            return Err(SubmoduleError::WrongCycle {
                expected: ctx.counter,
                got: cycle,
            });
        }
        let node = ctx
            .nodes
            .get(&proposal.owner)
            .ok_or_else(|| SubmoduleError::UnknownNode(proposal.owner.clone()))?;
        if !proposal.verify(&node.public_key) {
            return Err(SubmoduleError::InvalidSignature(proposal.owner.clone()));
        }
        if self.collected.contains_key(&proposal.owner) {
            return Ok(false);
        }
        self.collected.insert(proposal.owner.clone(), proposal);
        Ok(true)
    }

    pub fn get_txs(&self) -> Vec<ApoptosisProposal> {
        self.collected.values().cloned().collect()
    }

    pub fn update_record(&self, txs: &CycleTxs, record: &mut CycleRecord, ctx: &SubmoduleContext<'_>) {
        let mut apoptosized: Vec<NodeId> = txs
            .apoptosis
            .iter()
            .map(|p| p.owner.clone())
            .filter(|id| ctx.nodes.contains(id) && !record.removed.contains(id))
            .collect();
        apoptosized.sort();
        apoptosized.dedup();
        record.apoptosized = apoptosized;
    }

    pub fn validate_record_types(record: &CycleRecord) -> Result<()> {
        check_sorted("apoptosized", &record.apoptosized)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::Env;
    use super::*;
    use crate::crypto::KeyPair;

    #[test]
    fn test_apoptosis_accepts_current_and_previous_cycle() {
        let env = Env::new(3);
        let me = env.id(0);
        let ctx = env.ctx(0, &me);
        let mut module = ApoptosisModule::default();

        let current = Proposal::sign(ApoptosisBody { cycle: 1 }, &env.keys[1]).unwrap();
        let previous = Proposal::sign(ApoptosisBody { cycle: 0 }, &env.keys[2]).unwrap();
        let future = Proposal::sign(ApoptosisBody { cycle: 5 }, &env.keys[2]).unwrap();

        assert!(module.handle_gossip(serde_json::to_value(&current).unwrap(), &ctx).unwrap());
        assert!(module.handle_gossip(serde_json::to_value(&previous).unwrap(), &ctx).unwrap());
        assert!(module.handle_gossip(serde_json::to_value(&future).unwrap(), &ctx).is_err());
        assert_eq!(module.get_txs().len(), 2);
    }

    #[test]
    fn test_apoptosis_rejects_strangers() {
        let env = Env::new(2);
        let me = env.id(0);
        let ctx = env.ctx(0, &me);
        let mut module = ApoptosisModule::default();

        let stranger = Proposal::sign(ApoptosisBody { cycle: 1 }, &KeyPair::from_seed(900)).unwrap();
        assert!(matches!(
            module.handle_gossip(serde_json::to_value(&stranger).unwrap(), &ctx),
            Err(SubmoduleError::UnknownNode(_))
        ));
    }

    #[test]
    fn test_rotated_node_not_listed_twice() {
        let env = Env::new(3);
        let me = env.id(0);
        let ctx = env.ctx(0, &me);
        let mut module = ApoptosisModule::default();
        let proposal = Proposal::sign(ApoptosisBody { cycle: 1 }, &env.keys[1]).unwrap();
        module.handle_gossip(serde_json::to_value(&proposal).unwrap(), &ctx).unwrap();

        let mut record = env.next_record();
        record.removed = vec![env.id(1)];
        let txs = CycleTxs {
            apoptosis: module.get_txs(),
            ..CycleTxs::default()
        };
        module.update_record(&txs, &mut record, &ctx);
        assert!(record.apoptosized.is_empty());
    }
}
