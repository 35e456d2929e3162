/// Lost node reports
///
/// An active node that can no longer reach a peer queues a report; it is
/// signed and gossiped in Q1. The first valid report per target counts.

use super::{check_cycle, check_sorted, parse, Proposal, Result, SubmoduleContext, SubmoduleError};
use crate::cycle::{CycleRecord, CycleTxs};
use crate::network::types::{GossipType, NodeId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LostBody {
    pub target: NodeId,
    pub cycle: u64,
}

pub type LostReport = Proposal<LostBody>;

#[derive(Debug, Default)]
pub struct LostModule {
    queued: Vec<NodeId>,
    /// Keyed by target
    collected: BTreeMap<NodeId, LostReport>,
}

impl LostModule {
    pub fn init(&mut self) {
        self.queued.clear();
        self.collected.clear();
    }

    pub fn reset(&mut self) {
        self.collected.clear();
    }

    pub fn queue(&mut self, target: NodeId) {
        if !self.queued.contains(&target) {
            self.queued.push(target);
        }
    }

    fn check(report: &LostReport, ctx: &SubmoduleContext<'_>) -> Result<()> {
        check_cycle(ctx.counter, report.body.cycle)?;
        let reporter = ctx
            .nodes
            .get(&report.owner)
            .ok_or_else(|| SubmoduleError::UnknownNode(report.owner.clone()))?;
        if !reporter.is_active() {
            return Err(SubmoduleError::Rejected(format!("reporter {} is not active", report.owner)));
        }
        if report.body.target == report.owner {
            return Err(SubmoduleError::Rejected("node reported itself lost".into()));
        }
        if !ctx.nodes.contains(&report.body.target) {
            return Err(SubmoduleError::UnknownNode(report.body.target.clone()));
        }
        if !report.verify(&reporter.public_key) {
            return Err(SubmoduleError::InvalidSignature(report.owner.clone()));
        }
        Ok(())
    }

    pub fn send_requests(&mut self, ctx: &SubmoduleContext<'_>) -> Vec<(GossipType, Value)> {
        let mut outgoing = Vec::new();
        for target in std::mem::take(&mut self.queued) {
            let report = match Proposal::sign(
                LostBody {
                    target: target.clone(),
                    cycle: ctx.counter,
                },
                ctx.keypair,
            ) {
                Ok(report) => report,
                Err(e) => {
                    warn!(error = %e, "failed to sign lost report");
                    continue;
                }
            };
            if let Err(e) = Self::check(&report, ctx) {
                debug!(%target, error = %e, "dropping lost report");
                continue;
            }
            match serde_json::to_value(&report) {
                Ok(value) => outgoing.push((GossipType::LostReport, value)),
                Err(e) => {
                    warn!(error = %e, "failed to encode lost report");
                    continue;
                }
            }
            self.collected.entry(target).or_insert(report);
        }
        outgoing
    }

    pub fn handle_gossip(&mut self, data: Value, ctx: &SubmoduleContext<'_>) -> Result<bool> {
        let report: LostReport = parse(GossipType::LostReport, data)?;
        Self::check(&report, ctx)?;
        if self.collected.contains_key(&report.body.target) {
            return Ok(false);
        }
        self.collected.insert(report.body.target.clone(), report);
        Ok(true)
    }

    pub fn get_txs(&self) -> Vec<LostReport> {
        self.collected.values().cloned().collect()
    }

    pub fn update_record(&self, txs: &CycleTxs, record: &mut CycleRecord, ctx: &SubmoduleContext<'_>) {
        let mut lost: Vec<NodeId> = txs
            .lost
            .iter()
            .map(|r| r.body.target.clone())
            .filter(|id| {
                ctx.nodes.contains(id) && !record.removed.contains(id) && !record.apoptosized.contains(id)
            })
            .collect();
        lost.sort();
        lost.dedup();
        record.lost = lost;
    }

    pub fn validate_record_types(record: &CycleRecord) -> Result<()> {
        check_sorted("lost", &record.lost)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::Env;
    use super::*;

    #[test]
    fn test_queued_report_is_signed_and_collected() {
        let env = Env::new(3);
        let me = env.id(0);
        let ctx = env.ctx(0, &me);
        let mut module = LostModule::default();
        module.queue(env.id(2));
        module.queue(env.id(2));

        let outgoing = module.send_requests(&ctx);
        assert_eq!(outgoing.len(), 1);

        let txs = CycleTxs {
            lost: module.get_txs(),
            ..CycleTxs::default()
        };
        let mut record = env.next_record();
        module.update_record(&txs, &mut record, &ctx);
        assert_eq!(record.lost, vec![env.id(2)]);
    }

    #[test]
    fn test_one_report_per_target() {
        let env = Env::new(3);
        let me = env.id(0);
        let ctx = env.ctx(0, &me);
        let mut module = LostModule::default();

        let first = Proposal::sign(LostBody { target: env.id(2), cycle: 1 }, &env.keys[0]).unwrap();
        let second = Proposal::sign(LostBody { target: env.id(2), cycle: 1 }, &env.keys[1]).unwrap();

        assert!(module.handle_gossip(serde_json::to_value(&first).unwrap(), &ctx).unwrap());
        assert!(!module.handle_gossip(serde_json::to_value(&second).unwrap(), &ctx).unwrap());
    }

    #[test]
    fn test_self_report_rejected() {
        let env = Env::new(2);
        let me = env.id(0);
        let ctx = env.ctx(0, &me);
        let mut module = LostModule::default();

        let report = Proposal::sign(LostBody { target: env.id(1), cycle: 1 }, &env.keys[1]).unwrap();
        assert!(module.handle_gossip(serde_json::to_value(&report).unwrap(), &ctx).is_err());
    }
}
