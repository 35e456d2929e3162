// Record contributors
//
// A fixed, ordered set of submodules fills the membership arrays of each
// cycle record. Order matters: later submodules see what earlier ones wrote
// (lost reports skip nodes already leaving through apoptosis or rotation).
//
// Every submodule supports the same lifecycle:
// - `init` / `reset` at start and at each cycle boundary
// - `send_requests` in Q1, producing gossip
// - `handle_gossip` for its own gossip types
// - `get_txs` and `update_record` in Q3
// - `validate_record_types` for records received from peers

pub mod active;
pub mod apoptosis;
pub mod join;
pub mod lost;
pub mod rotation;

pub use active::{ActiveBody, ActiveModule, ActiveRequest};
pub use apoptosis::{ApoptosisBody, ApoptosisModule, ApoptosisProposal};
pub use join::{JoinBody, JoinModule, JoinRequest};
pub use lost::{LostBody, LostModule, LostReport};
pub use rotation::RotationModule;

use crate::config::CycleConfig;
use crate::crypto::{ecdsa_sign, ecdsa_verify, hash_object, ECDSAPublicKey, ECDSASignature, HashError, KeyPair};
use crate::cycle::{CycleRecord, CycleTxs};
use crate::membership::NodeList;
use crate::network::types::{GossipType, NodeId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SubmoduleError {
    #[error("Malformed {0} payload: {1}")]
    Malformed(GossipType, String),

    #[error("Invalid signature from {0}")]
    InvalidSignature(NodeId),

    #[error("Unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("Proposal for cycle {got}, expected {expected}")]
    WrongCycle { expected: u64, got: u64 },

    #[error("Rejected: {0}")]
    Rejected(String),

    #[error("Record field {0} is not sorted and unique")]
    Unsorted(&'static str),

    #[error("Hash error: {0}")]
    Hash(#[from] HashError),
}

pub type Result<T> = std::result::Result<T, SubmoduleError>;

/// Body signed by its owner
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal<T> {
    pub body: T,
    pub owner: NodeId,
    pub sig: ECDSASignature,
}

impl<T: Serialize> Proposal<T> {
    pub fn sign(body: T, keypair: &KeyPair) -> Result<Self> {
        let owner = NodeId::from_public_key(&keypair.public_key);
        let digest = hash_object(&(&body, &owner))?;
        let sig = ecdsa_sign(&keypair.secret_key, digest.as_bytes());
        Ok(Self { body, owner, sig })
    }

    pub fn verify(&self, public_key: &ECDSAPublicKey) -> bool {
        match hash_object(&(&self.body, &self.owner)) {
            Ok(digest) => ecdsa_verify(public_key, digest.as_bytes(), &self.sig),
            Err(_) => false,
        }
    }
}

/// What a submodule may look at while it works
pub struct SubmoduleContext<'a> {
    pub nodes: &'a NodeList,
    /// Counter of the record being built this cycle
    pub counter: u64,
    pub self_id: &'a NodeId,
    pub keypair: &'a KeyPair,
    pub config: &'a CycleConfig,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Submodule {
    Join,
    Active,
    Rotation,
    Apoptosis,
    Lost,
}

impl Submodule {
    /// Processing order
    pub const ORDER: [Submodule; 5] = [
        Submodule::Join,
        Submodule::Active,
        Submodule::Rotation,
        Submodule::Apoptosis,
        Submodule::Lost,
    ];

    /// Submodule owning a gossip type, `None` for protocol gossip
    pub fn for_gossip(gossip_type: GossipType) -> Option<Submodule> {
        match gossip_type {
            GossipType::GossipJoin => Some(Submodule::Join),
            GossipType::GossipActive => Some(Submodule::Active),
            GossipType::Apoptosis => Some(Submodule::Apoptosis),
            GossipType::LostReport => Some(Submodule::Lost),
            GossipType::GossipCert => None,
        }
    }
}

pub(crate) fn parse<T: for<'de> Deserialize<'de>>(gossip_type: GossipType, data: Value) -> Result<T> {
    serde_json::from_value(data).map_err(|e| SubmoduleError::Malformed(gossip_type, e.to_string()))
}

pub(crate) fn check_sorted(field: &'static str, ids: &[NodeId]) -> Result<()> {
    if ids.windows(2).all(|w| w[0] < w[1]) {
        Ok(())
    } else {
        Err(SubmoduleError::Unsorted(field))
    }
}

pub(crate) fn check_cycle(expected: u64, got: u64) -> Result<()> {
    if expected == got {
        Ok(())
    } else {
        Err(SubmoduleError::WrongCycle { expected, got })
    }
}

/// The registry of all submodules
#[derive(Debug, Default)]
pub struct Submodules {
    pub join: JoinModule,
    pub active: ActiveModule,
    pub rotation: RotationModule,
    pub apoptosis: ApoptosisModule,
    pub lost: LostModule,
}

impl Submodules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn init(&mut self) {
        for module in Submodule::ORDER {
            match module {
                Submodule::Join => self.join.init(),
                Submodule::Active => self.active.init(),
                Submodule::Rotation => {}
                Submodule::Apoptosis => self.apoptosis.init(),
                Submodule::Lost => self.lost.init(),
            }
        }
    }

    /// Drop everything collected for the finished cycle
    pub fn reset(&mut self) {
        for module in Submodule::ORDER {
            match module {
                Submodule::Join => self.join.reset(),
                Submodule::Active => self.active.reset(),
                Submodule::Rotation => {}
                Submodule::Apoptosis => self.apoptosis.reset(),
                Submodule::Lost => self.lost.reset(),
            }
        }
    }

    pub fn get_txs(&self, config: &CycleConfig) -> CycleTxs {
        let mut txs = CycleTxs::default();
        for module in Submodule::ORDER {
            match module {
                Submodule::Join => txs.join = self.join.get_txs(config.max_joins_per_cycle),
                Submodule::Active => txs.active = self.active.get_txs(),
                Submodule::Rotation => {}
                Submodule::Apoptosis => txs.apoptosis = self.apoptosis.get_txs(),
                Submodule::Lost => txs.lost = self.lost.get_txs(),
            }
        }
        txs
    }

    pub fn update_record(&self, txs: &CycleTxs, record: &mut CycleRecord, prev: &CycleRecord, ctx: &SubmoduleContext<'_>) {
        for module in Submodule::ORDER {
            match module {
                Submodule::Join => self.join.update_record(txs, record, ctx),
                Submodule::Active => self.active.update_record(txs, record, ctx),
                Submodule::Rotation => self.rotation.update_record(record, prev, ctx),
                Submodule::Apoptosis => self.apoptosis.update_record(txs, record, ctx),
                Submodule::Lost => self.lost.update_record(txs, record, ctx),
            }
        }
    }

    /// Q1 gossip of every submodule, in order
    pub fn send_requests(&mut self, ctx: &SubmoduleContext<'_>) -> Vec<(GossipType, Value)> {
        let mut outgoing = Vec::new();
        for module in Submodule::ORDER {
            let produced = match module {
                Submodule::Join => self.join.send_requests(ctx),
                Submodule::Active => self.active.send_requests(ctx),
                Submodule::Rotation => Vec::new(),
                Submodule::Apoptosis => self.apoptosis.send_requests(ctx),
                Submodule::Lost => self.lost.send_requests(ctx),
            };
            outgoing.extend(produced);
        }
        outgoing
    }

    pub fn validate_record_types(&self, record: &CycleRecord, config: &CycleConfig) -> Result<()> {
        for module in Submodule::ORDER {
            match module {
                Submodule::Join => JoinModule::validate_record_types(record, config.max_joins_per_cycle)?,
                Submodule::Active => ActiveModule::validate_record_types(record)?,
                Submodule::Rotation => RotationModule::validate_record_types(record)?,
                Submodule::Apoptosis => ApoptosisModule::validate_record_types(record)?,
                Submodule::Lost => LostModule::validate_record_types(record)?,
            }
        }
        Ok(())
    }

    /// Route a gossip payload to its submodule.
    ///
    /// `Ok(true)` means the payload was new and valid and should be relayed.
    pub fn handle_gossip(&mut self, gossip_type: GossipType, data: Value, ctx: &SubmoduleContext<'_>) -> Result<bool> {
        match Submodule::for_gossip(gossip_type) {
            Some(Submodule::Join) => self.join.handle_gossip(data, ctx),
            Some(Submodule::Active) => self.active.handle_gossip(data, ctx),
            Some(Submodule::Apoptosis) => self.apoptosis.handle_gossip(data, ctx),
            Some(Submodule::Lost) => self.lost.handle_gossip(data, ctx),
            Some(Submodule::Rotation) | None => Err(SubmoduleError::Rejected(format!(
                "{} is not a submodule gossip type",
                gossip_type
            ))),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::cycle::JoinedNode;

    pub struct Env {
        pub keys: Vec<KeyPair>,
        pub nodes: NodeList,
        pub genesis: CycleRecord,
        pub config: CycleConfig,
    }

    impl Env {
        pub fn new(n: u64) -> Self {
            let keys: Vec<KeyPair> = (0..n).map(|i| KeyPair::from_seed(50 + i)).collect();
            let joined = keys
                .iter()
                .map(|k| JoinedNode {
                    id: NodeId::from_public_key(&k.public_key),
                    public_key: k.public_key.clone(),
                })
                .collect();
            let genesis = CycleRecord::genesis("net", 0, 60, joined);
            let mut nodes = NodeList::new();
            nodes.apply_record(&genesis);
            Self {
                keys,
                nodes,
                genesis,
                config: CycleConfig::default(),
            }
        }

        pub fn id(&self, i: usize) -> NodeId {
            NodeId::from_public_key(&self.keys[i].public_key)
        }

        pub fn ctx<'a>(&'a self, me: usize, self_id: &'a NodeId) -> SubmoduleContext<'a> {
            SubmoduleContext {
                nodes: &self.nodes,
                counter: 1,
                self_id,
                keypair: &self.keys[me],
                config: &self.config,
            }
        }

        pub fn next_record(&self) -> CycleRecord {
            CycleRecord::successor(&self.genesis, self.genesis.marker().unwrap(), 60, 0, 0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::Env;
    use super::*;

    #[test]
    fn test_proposal_sign_verify() {
        let keypair = KeyPair::from_seed(1);
        let proposal = Proposal::sign(ApoptosisBody { cycle: 3 }, &keypair).unwrap();

        assert!(proposal.verify(&keypair.public_key));
        assert!(!proposal.verify(&KeyPair::from_seed(2).public_key));

        let mut tampered = proposal.clone();
        tampered.body.cycle = 4;
        assert!(!tampered.verify(&keypair.public_key));
    }

    #[test]
    fn test_order_is_fixed() {
        assert_eq!(Submodule::ORDER[0], Submodule::Join);
        assert_eq!(Submodule::ORDER[4], Submodule::Lost);
        assert_eq!(Submodule::for_gossip(GossipType::GossipCert), None);
        assert_eq!(Submodule::for_gossip(GossipType::LostReport), Some(Submodule::Lost));
    }

    #[test]
    fn test_registry_rejects_cert_gossip() {
        let env = Env::new(2);
        let me = env.id(0);
        let mut registry = Submodules::new();

        let result = registry.handle_gossip(GossipType::GossipCert, serde_json::json!({}), &env.ctx(0, &me));
        assert!(matches!(result, Err(SubmoduleError::Rejected(_))));
    }

    #[test]
    fn test_apoptosis_before_lost_in_record() {
        let env = Env::new(4);
        let me = env.id(0);
        let ctx = env.ctx(0, &me);
        let mut registry = Submodules::new();
        registry.init();

        // Node 2 leaves voluntarily and is also reported lost by node 1
        let leaving = Proposal::sign(ApoptosisBody { cycle: 1 }, &env.keys[2]).unwrap();
        assert!(registry
            .handle_gossip(GossipType::Apoptosis, serde_json::to_value(&leaving).unwrap(), &ctx)
            .unwrap());
        let report = Proposal::sign(
            LostBody {
                target: env.id(2),
                cycle: 1,
            },
            &env.keys[1],
        )
        .unwrap();
        assert!(registry
            .handle_gossip(GossipType::LostReport, serde_json::to_value(&report).unwrap(), &ctx)
            .unwrap());

        let txs = registry.get_txs(&env.config);
        let mut record = env.next_record();
        registry.update_record(&txs, &mut record, &env.genesis, &ctx);

        assert_eq!(record.apoptosized, vec![env.id(2)]);
        assert!(record.lost.is_empty());
        assert!(registry.validate_record_types(&record, &env.config).is_ok());

        registry.reset();
        assert!(registry.get_txs(&env.config).is_empty());
    }

    #[test]
    fn test_validate_record_types_rejects_unsorted() {
        let env = Env::new(1);
        let registry = Submodules::new();
        let mut record = env.next_record();
        record.lost = vec![NodeId::new("b"), NodeId::new("a")];

        assert!(matches!(
            registry.validate_record_types(&record, &env.config),
            Err(SubmoduleError::Unsorted("lost"))
        ));
    }
}
