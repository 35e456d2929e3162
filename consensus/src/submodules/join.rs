/// Join requests
///
/// Prospective nodes sign a request naming the cycle they want to join in.
/// Members gossip queued requests in Q1 and admit up to
/// `max_joins_per_cycle` of them, lowest id first.

use super::{check_cycle, parse, Proposal, Result, SubmoduleContext, SubmoduleError};
use crate::crypto::ECDSAPublicKey;
use crate::cycle::{CycleRecord, CycleTxs, JoinedNode};
use crate::network::types::{GossipType, NodeId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinBody {
    pub public_key: ECDSAPublicKey,
    /// Counter of the record the node asks to be admitted by
    pub cycle: u64,
}

pub type JoinRequest = Proposal<JoinBody>;

#[derive(Debug, Default)]
pub struct JoinModule {
    queued: Vec<JoinRequest>,
    collected: BTreeMap<NodeId, JoinRequest>,
}

impl JoinModule {
    pub fn init(&mut self) {
        self.queued.clear();
        self.collected.clear();
    }

    pub fn reset(&mut self) {
        self.collected.clear();
    }

    /// Hold a request until the next Q1
    pub fn queue(&mut self, request: JoinRequest) {
        self.queued.push(request);
    }

    fn check(request: &JoinRequest, ctx: &SubmoduleContext<'_>) -> Result<()> {
        check_cycle(ctx.counter, request.body.cycle)?;
        if NodeId::from_public_key(&request.body.public_key) != request.owner {
            return Err(SubmoduleError::Rejected(format!(
                "join owner {} does not match its key",
                request.owner
            )));
        }
        if !request.verify(&request.body.public_key) {
            return Err(SubmoduleError::InvalidSignature(request.owner.clone()));
        }
        if ctx.nodes.contains(&request.owner) {
            return Err(SubmoduleError::Rejected(format!("{} is already a member", request.owner)));
        }
        Ok(())
    }

    pub fn send_requests(&mut self, ctx: &SubmoduleContext<'_>) -> Vec<(GossipType, Value)> {
        let mut outgoing = Vec::new();
        for request in std::mem::take(&mut self.queued) {
            if let Err(e) = Self::check(&request, ctx) {
                debug!(owner = %request.owner, error = %e, "dropping queued join request");
                continue;
            }
            match serde_json::to_value(&request) {
                Ok(value) => outgoing.push((GossipType::GossipJoin, value)),
                Err(e) => {
                    warn!(error = %e, "failed to encode join request");
                    continue;
                }
            }
            self.collected.insert(request.owner.clone(), request);
        }
        outgoing
    }

    pub fn handle_gossip(&mut self, data: Value, ctx: &SubmoduleContext<'_>) -> Result<bool> {
        let request: JoinRequest = parse(GossipType::GossipJoin, data)?;
        Self::check(&request, ctx)?;
        if self.collected.contains_key(&request.owner) {
            return Ok(false);
        }
        self.collected.insert(request.owner.clone(), request);
        Ok(true)
    }

    pub fn get_txs(&self, max_joins: usize) -> Vec<JoinRequest> {
        self.collected.values().take(max_joins).cloned().collect()
    }

    pub fn update_record(&self, txs: &CycleTxs, record: &mut CycleRecord, ctx: &SubmoduleContext<'_>) {
        let mut joined: Vec<JoinedNode> = txs
            .join
            .iter()
            .filter(|r| !ctx.nodes.contains(&r.owner))
            .map(|r| JoinedNode {
                id: r.owner.clone(),
                public_key: r.body.public_key.clone(),
            })
            .collect();
        joined.sort_by(|a, b| a.id.cmp(&b.id));
        joined.dedup_by(|a, b| a.id == b.id);
        record.joined = joined;
    }

    pub fn validate_record_types(record: &CycleRecord, max_joins: usize) -> Result<()> {
        if record.joined.len() > max_joins {
            return Err(SubmoduleError::Rejected(format!(
                "{} joins exceed the limit of {}",
                record.joined.len(),
                max_joins
            )));
        }
        if !record.joined.windows(2).all(|w| w[0].id < w[1].id) {
            return Err(SubmoduleError::Unsorted("joined"));
        }
        for node in &record.joined {
            if NodeId::from_public_key(&node.public_key) != node.id {
                return Err(SubmoduleError::Rejected(format!("joined id {} does not match its key", node.id)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::Env;
    use super::*;
    use crate::crypto::KeyPair;

    fn request(seed: u64, cycle: u64) -> JoinRequest {
        let keypair = KeyPair::from_seed(seed);
        Proposal::sign(
            JoinBody {
                public_key: keypair.public_key.clone(),
                cycle,
            },
            &keypair,
        )
        .unwrap()
    }

    #[test]
    fn test_join_gossip_collected_once() {
        let env = Env::new(3);
        let me = env.id(0);
        let ctx = env.ctx(0, &me);
        let mut module = JoinModule::default();
        let data = serde_json::to_value(request(700, 1)).unwrap();

        assert!(module.handle_gossip(data.clone(), &ctx).unwrap());
        assert!(!module.handle_gossip(data, &ctx).unwrap());
        assert_eq!(module.get_txs(4).len(), 1);
    }

    #[test]
    fn test_join_rejects_wrong_cycle_and_members() {
        let env = Env::new(3);
        let me = env.id(0);
        let ctx = env.ctx(0, &me);
        let mut module = JoinModule::default();

        let stale = serde_json::to_value(request(700, 9)).unwrap();
        assert!(matches!(
            module.handle_gossip(stale, &ctx),
            Err(SubmoduleError::WrongCycle { expected: 1, got: 9 })
        ));

        // Env keys start at seed 50
        let member = serde_json::to_value(request(50, 1)).unwrap();
        assert!(matches!(module.handle_gossip(member, &ctx), Err(SubmoduleError::Rejected(_))));
    }

    #[test]
    fn test_join_rejects_key_mismatch() {
        let env = Env::new(1);
        let me = env.id(0);
        let ctx = env.ctx(0, &me);
        let mut module = JoinModule::default();

        let mut forged = request(700, 1);
        forged.body.public_key = KeyPair::from_seed(701).public_key;
        let result = module.handle_gossip(serde_json::to_value(forged).unwrap(), &ctx);
        assert!(result.is_err());
    }

    #[test]
    fn test_queued_requests_sent_and_recorded() {
        let env = Env::new(2);
        let me = env.id(0);
        let ctx = env.ctx(0, &me);
        let mut module = JoinModule::default();
        for seed in [703, 701, 702] {
            module.queue(request(seed, 1));
        }

        let outgoing = module.send_requests(&ctx);
        assert_eq!(outgoing.len(), 3);
        assert!(outgoing.iter().all(|(t, _)| *t == GossipType::GossipJoin));

        let txs = CycleTxs {
            join: module.get_txs(2),
            ..CycleTxs::default()
        };
        let mut record = env.next_record();
        module.update_record(&txs, &mut record, &ctx);

        assert_eq!(record.joined.len(), 2);
        assert!(JoinModule::validate_record_types(&record, 2).is_ok());
        assert!(JoinModule::validate_record_types(&record, 1).is_err());
    }
}
