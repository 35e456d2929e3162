// Network types and message definitions

use crate::crypto::{hash_data, ECDSAPublicKey, ECDSASignature};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::oneshot;

/// Node identifier: hex digest of the node's public key
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive the id a node announces for a given public key
    pub fn from_public_key(public_key: &ECDSAPublicKey) -> Self {
        Self(hash_data(&public_key.to_bytes()).to_hex())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form for logs
        let end = self.0.len().min(8);
        write!(f, "{}", &self.0[..end])
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

/// Membership status of a node as tracked by the node list
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Accepted by a cycle record, not yet participating in certification
    Syncing,
    /// Full participant
    Active,
}

/// Membership entry for a peer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub public_key: ECDSAPublicKey,
    pub status: NodeStatus,
    /// Counter of the cycle that activated this node
    pub activated_at: u64,
}

impl Node {
    pub fn new_active(public_key: ECDSAPublicKey, activated_at: u64) -> Self {
        Self {
            id: NodeId::from_public_key(&public_key),
            public_key,
            status: NodeStatus::Active,
            activated_at,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == NodeStatus::Active
    }
}

/// Internal request/response routes, symmetric on all nodes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Route {
    /// Legacy marker comparison, not on the convergence path
    CompareMarker,
    /// Quorum exchange of `{certs, record}` bundles
    CompareCert,
    /// Carrier for `{type, data}` gossip envelopes
    Gossip,
    /// Newest committed cycle, used by the quorum fetch at cycle start
    NewestCycle,
}

impl Route {
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::CompareMarker => "compare-marker",
            Route::CompareCert => "compare-cert",
            Route::Gossip => "gossip",
            Route::NewestCycle => "newest-cycle",
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gossip channels demultiplexed on the `gossip` route
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GossipType {
    /// `{certs, record}` bundles
    GossipCert,
    GossipJoin,
    GossipActive,
    Apoptosis,
    LostReport,
}

impl GossipType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GossipType::GossipCert => "gossip-cert",
            GossipType::GossipJoin => "gossip-join",
            GossipType::GossipActive => "gossip-active",
            GossipType::Apoptosis => "apoptosis",
            GossipType::LostReport => "lost-report",
        }
    }
}

impl fmt::Display for GossipType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{type, data}` body carried on the gossip route
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GossipPayload {
    #[serde(rename = "type")]
    pub gossip_type: GossipType,
    pub data: serde_json::Value,
}

/// Wire wrapper for every internal message.
///
/// `tag` authenticates `{payload, sender, tracker}` for exactly one recipient
/// public key; it is produced and checked by `Comms`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub payload: serde_json::Value,
    pub sender: NodeId,
    pub tracker: String,
    pub tag: Option<ECDSASignature>,
}

impl Envelope {
    /// Serialize envelope to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize envelope from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Message handed to the engine by a transport
#[derive(Debug)]
pub struct InboundMessage {
    pub route: Route,
    pub body: Vec<u8>,
    /// Present for requests made with `Transport::request`
    pub reply: Option<oneshot::Sender<Vec<u8>>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    #[test]
    fn test_node_id_from_public_key() {
        let keypair = KeyPair::from_seed(11);
        let id = NodeId::from_public_key(&keypair.public_key);

        assert_eq!(id.as_str().len(), 64);
        assert_eq!(id, NodeId::from_public_key(&keypair.public_key));
        assert_eq!(format!("{}", id).len(), 8);
    }

    #[test]
    fn test_route_and_gossip_type_names() {
        assert_eq!(Route::CompareCert.as_str(), "compare-cert");
        assert_eq!(
            serde_json::to_string(&Route::CompareMarker).unwrap(),
            "\"compare-marker\""
        );
        assert_eq!(
            serde_json::to_string(&GossipType::GossipCert).unwrap(),
            format!("\"{}\"", GossipType::GossipCert.as_str())
        );
    }

    #[test]
    fn test_gossip_payload_wire_shape() {
        let payload = GossipPayload {
            gossip_type: GossipType::LostReport,
            data: serde_json::json!({"target": "ab"}),
        };
        let value = serde_json::to_value(&payload).unwrap();

        assert_eq!(value["type"], "lost-report");
        assert_eq!(value["data"]["target"], "ab");
    }

    #[test]
    fn test_envelope_serialization() {
        let envelope = Envelope {
            payload: serde_json::json!({"x": 1}),
            sender: NodeId::new("aa"),
            tracker: "t1".into(),
            tag: None,
        };

        let bytes = envelope.to_bytes().unwrap();
        let back = Envelope::from_bytes(&bytes).unwrap();
        assert_eq!(back.sender, envelope.sender);
        assert_eq!(back.tracker, "t1");
        assert!(Envelope::from_bytes(b"not json").is_err());
    }
}
