// Authenticated messaging
//
// `Comms` owns a node's identity on the wire. Every outbound payload is
// wrapped as `{payload, sender, tracker}` and tagged for exactly one
// recipient; inbound payloads are accepted only from the expected sender
// group. Gossip is layered on top with the suppression caches from
// `gossip`.

use super::gossip::{select_all, select_gossip_in, select_random, GossipCache, GossipConfig, GossipStats, ReceiveOutcome};
use super::types::{Envelope, GossipPayload, GossipType, Node, NodeId, Route};
use super::{NetworkError, NetworkResult, Transport};
use crate::crypto::{ecdsa_sign, ecdsa_verify, hash_object, ECDSAPublicKey, Hash, HashError, KeyPair};
use rand::rngs::StdRng;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

/// Payload that passed authentication
#[derive(Debug, Clone)]
pub struct Verified {
    pub payload: Value,
    pub sender: NodeId,
    pub tracker: String,
}

/// Signed messaging and gossip for one node
pub struct Comms {
    keypair: KeyPair,
    id: NodeId,
    transport: Arc<dyn Transport>,
    config: GossipConfig,
    gossip: Mutex<GossipCache>,
    rng: Mutex<StdRng>,
    accept_internal: AtomicBool,
    next_tracker: AtomicU64,
}

impl Comms {
    pub fn new(keypair: KeyPair, transport: Arc<dyn Transport>, config: GossipConfig, rng: StdRng) -> Self {
        let id = NodeId::from_public_key(&keypair.public_key);
        Self {
            keypair,
            id,
            transport,
            gossip: Mutex::new(GossipCache::new(config.clone())),
            config,
            rng: Mutex::new(rng),
            accept_internal: AtomicBool::new(false),
            next_tracker: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn public_key(&self) -> &ECDSAPublicKey {
        &self.keypair.public_key
    }

    pub fn keypair(&self) -> &KeyPair {
        &self.keypair
    }

    /// Open or close the gate for inbound internal traffic
    pub fn set_accept_internal(&self, open: bool) {
        self.accept_internal.store(open, Ordering::SeqCst);
    }

    pub fn accepts_internal(&self) -> bool {
        self.accept_internal.load(Ordering::SeqCst)
    }

    pub async fn gossip_stats(&self) -> GossipStats {
        self.gossip.lock().await.stats()
    }

    /// Fresh tracker id for a new exchange
    pub fn new_tracker(&self) -> String {
        let n = self.next_tracker.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.id, n)
    }

    fn tag_digest(
        payload: &Value,
        sender: &NodeId,
        tracker: &str,
        recipient: &ECDSAPublicKey,
    ) -> Result<Hash, HashError> {
        hash_object(&(payload, sender, tracker, recipient.to_hex()))
    }

    /// Wrap and tag a payload for one recipient
    pub fn tag(&self, payload: Value, tracker: String, recipient: &ECDSAPublicKey) -> NetworkResult<Envelope> {
        let digest = Self::tag_digest(&payload, &self.id, &tracker, recipient)
            .map_err(|e| NetworkError::InvalidMessage(e.to_string()))?;
        let tag = ecdsa_sign(&self.keypair.secret_key, digest.as_bytes());
        Ok(Envelope {
            payload,
            sender: self.id.clone(),
            tracker,
            tag: Some(tag),
        })
    }

    /// Check an envelope addressed to us against the expected sender group.
    ///
    /// Returns `None` for a missing tag, an unknown sender, or a tag that
    /// was produced for another recipient or does not verify.
    pub fn authenticate(&self, envelope: Envelope, expected: &[Node]) -> Option<Verified> {
        let Envelope {
            payload,
            sender,
            tracker,
            tag,
        } = envelope;

        let tag = match tag {
            Some(tag) => tag,
            None => {
                debug!(%sender, "dropping untagged message");
                return None;
            }
        };

        let node = match expected.iter().find(|n| n.id == sender) {
            Some(node) => node,
            None => {
                debug!(%sender, "dropping message from sender outside expected group");
                return None;
            }
        };

        let digest = Self::tag_digest(&payload, &sender, &tracker, &self.keypair.public_key).ok()?;
        if !ecdsa_verify(&node.public_key, digest.as_bytes(), &tag) {
            warn!(%sender, %tracker, "message tag verification failed");
            return None;
        }

        Some(Verified {
            payload,
            sender,
            tracker,
        })
    }

    fn seal<T: Serialize + ?Sized>(&self, message: &T, tracker: String, recipient: &Node) -> NetworkResult<Vec<u8>> {
        let payload = serde_json::to_value(message).map_err(|e| NetworkError::InvalidMessage(e.to_string()))?;
        self.tag(payload, tracker, &recipient.public_key)?
            .to_bytes()
            .map_err(|e| NetworkError::InvalidMessage(e.to_string()))
    }

    /// Accept an inbound request body.
    ///
    /// Closed gate, malformed envelope and failed authentication all yield
    /// `None`; the caller drops the message.
    pub fn open(&self, body: &[u8], expected: &[Node]) -> Option<Verified> {
        if !self.accepts_internal() {
            trace!("internal traffic not accepted yet");
            return None;
        }
        let envelope = match Envelope::from_bytes(body) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(error = %e, "dropping malformed envelope");
                return None;
            }
        };
        self.authenticate(envelope, expected)
    }

    /// Response body for a request, tagged for the requester
    pub fn reply<T: Serialize + ?Sized>(&self, requester: &Node, message: &T, tracker: String) -> Option<Vec<u8>> {
        match self.seal(message, tracker, requester) {
            Ok(body) => Some(body),
            Err(e) => {
                warn!(peer = %requester.id, error = %e, "failed to seal response");
                None
            }
        }
    }

    /// Unicast to each node concurrently; returns the number of failures
    async fn fan_out(&self, nodes: &[Node], route: Route, payload: Value, tracker: String) -> usize {
        let mut sends = JoinSet::new();
        let mut failed = 0;

        for node in nodes.iter().filter(|n| n.id != self.id) {
            let body = match self
                .tag(payload.clone(), tracker.clone(), &node.public_key)
                .and_then(|e| e.to_bytes().map_err(|e| NetworkError::InvalidMessage(e.to_string())))
            {
                Ok(body) => body,
                Err(e) => {
                    debug!(peer = %node.id, error = %e, "failed to seal message");
                    failed += 1;
                    continue;
                }
            };
            let transport = Arc::clone(&self.transport);
            let to = node.id.clone();
            sends.spawn(async move { transport.send(&to, route, body).await.map_err(|e| (to, e)) });
        }

        while let Some(joined) = sends.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err((to, e))) => {
                    debug!(peer = %to, %route, error = %e, "unicast failed");
                    failed += 1;
                }
                Err(e) => {
                    warn!(error = %e, "unicast task failed");
                    failed += 1;
                }
            }
        }
        failed
    }

    /// Fire-and-forget to every node except ourselves.
    ///
    /// Failures are logged; the caller never learns which unicasts failed.
    pub async fn tell<T: Serialize + ?Sized>(
        &self,
        nodes: &[Node],
        route: Route,
        message: &T,
        tracker: Option<String>,
    ) {
        let payload = match serde_json::to_value(message) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(%route, error = %e, "failed to encode message");
                return;
            }
        };
        let tracker = tracker.unwrap_or_else(|| self.new_tracker());
        let failed = self.fan_out(nodes, route, payload, tracker).await;
        if failed > 0 {
            warn!(%route, failed, recipients = nodes.len(), "tell: unicasts failed");
        }
    }

    /// Single authenticated round trip.
    ///
    /// Returns the verified response payload, or `None` on any failure.
    pub async fn ask<T: Serialize + ?Sized>(
        &self,
        node: &Node,
        route: Route,
        message: &T,
        tracker: Option<String>,
    ) -> Option<Value> {
        if node.id == self.id {
            return None;
        }
        let tracker = tracker.unwrap_or_else(|| self.new_tracker());
        let body = match self.seal(message, tracker, node) {
            Ok(body) => body,
            Err(e) => {
                debug!(peer = %node.id, %route, error = %e, "ask: failed to seal request");
                return None;
            }
        };

        let response = match self.transport.request(&node.id, route, body).await {
            Ok(response) => response,
            Err(e) => {
                debug!(peer = %node.id, %route, error = %e, "ask failed");
                return None;
            }
        };

        let envelope = match Envelope::from_bytes(&response) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(peer = %node.id, %route, error = %e, "ask: malformed response");
                return None;
            }
        };
        self.authenticate(envelope, std::slice::from_ref(node))
            .map(|verified| verified.payload)
    }

    /// Gossip to a uniform random subset of `gossip_recipients` nodes
    pub async fn send_gossip(
        &self,
        gossip_type: GossipType,
        data: Value,
        tracker: Option<String>,
        exclude: Option<&NodeId>,
        nodes: &[Node],
    ) {
        let recipients = {
            let mut rng = self.rng.lock().await;
            select_random(nodes, self.config.gossip_recipients, &self.id, exclude, &mut *rng)
        };
        self.emit_gossip(gossip_type, data, tracker, &recipients).await;
    }

    /// Gossip with ring-biased recipient selection
    pub async fn send_gossip_in(
        &self,
        gossip_type: GossipType,
        data: Value,
        tracker: Option<String>,
        exclude: Option<&NodeId>,
        nodes: &[Node],
    ) {
        let recipients = {
            let mut rng = self.rng.lock().await;
            select_gossip_in(nodes, self.config.gossip_recipients, &self.id, exclude, &mut *rng)
        };
        self.emit_gossip(gossip_type, data, tracker, &recipients).await;
    }

    /// Gossip to every node except ourselves and the sender
    pub async fn send_gossip_all(
        &self,
        gossip_type: GossipType,
        data: Value,
        tracker: Option<String>,
        exclude: Option<&NodeId>,
        nodes: &[Node],
    ) {
        let recipients = select_all(nodes, &self.id, exclude);
        self.emit_gossip(gossip_type, data, tracker, &recipients).await;
    }

    async fn emit_gossip(&self, gossip_type: GossipType, data: Value, tracker: Option<String>, recipients: &[Node]) {
        let payload = GossipPayload { gossip_type, data };
        let hash = match hash_object(&payload) {
            Ok(hash) => hash,
            Err(e) => {
                warn!(%gossip_type, error = %e, "failed to hash gossip payload");
                return;
            }
        };

        if !self.gossip.lock().await.mark_sent(hash) {
            debug!(%gossip_type, %hash, "payload already emitted, not re-sending");
            return;
        }

        let value = match serde_json::to_value(&payload) {
            Ok(value) => value,
            Err(e) => {
                warn!(%gossip_type, error = %e, "failed to encode gossip payload");
                return;
            }
        };
        let tracker = tracker.unwrap_or_else(|| self.new_tracker());
        trace!(%gossip_type, %hash, recipients = recipients.len(), "emitting gossip");

        let failed = self.fan_out(recipients, Route::Gossip, value, tracker).await;
        if failed > 0 {
            let mut cache = self.gossip.lock().await;
            for _ in 0..failed {
                cache.record_failed_send();
            }
            debug!(%gossip_type, failed, "gossip unicasts failed");
        }
    }

    /// Classify an authenticated gossip delivery.
    ///
    /// Returns the payload only on its first delivery; echoes of our own
    /// gossip and repeats are dropped here.
    pub async fn handle_gossip(&self, verified: &Verified) -> Option<GossipPayload> {
        let payload: GossipPayload = match serde_json::from_value(verified.payload.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                debug!(sender = %verified.sender, error = %e, "dropping malformed gossip");
                return None;
            }
        };
        let hash = hash_object(&payload).ok()?;

        match self.gossip.lock().await.on_receive(hash) {
            ReceiveOutcome::New => Some(payload),
            ReceiveOutcome::Echo => {
                trace!(%hash, "dropping echo of own gossip");
                None
            }
            ReceiveOutcome::Duplicate => {
                trace!(%hash, sender = %verified.sender, "dropping duplicate gossip");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::memory::MemoryHub;
    use crate::network::types::InboundMessage;
    use rand::SeedableRng;
    use tokio::sync::mpsc;

    async fn make_comms(hub: &Arc<MemoryHub>, seed: u64) -> (Arc<Comms>, Node, mpsc::UnboundedReceiver<InboundMessage>) {
        let keypair = KeyPair::from_seed(seed);
        let node = Node::new_active(keypair.public_key.clone(), 0);
        let inbox = hub.register(node.id.clone()).await;
        let transport = Arc::new(hub.transport(node.id.clone()));
        let comms = Comms::new(keypair, transport, GossipConfig::default(), StdRng::seed_from_u64(seed));
        comms.set_accept_internal(true);
        (Arc::new(comms), node, inbox)
    }

    #[tokio::test]
    async fn test_tag_and_authenticate() {
        let hub = MemoryHub::new();
        let (alice, alice_node, _) = make_comms(&hub, 1).await;
        let (bob, _, _) = make_comms(&hub, 2).await;

        let envelope = alice
            .tag(serde_json::json!({"n": 7}), "t".into(), bob.public_key())
            .unwrap();
        let verified = bob.authenticate(envelope, &[alice_node]).unwrap();

        assert_eq!(verified.payload["n"], 7);
        assert_eq!(&verified.sender, alice.id());
        assert_eq!(verified.tracker, "t");
    }

    #[tokio::test]
    async fn test_tag_bound_to_recipient() {
        let hub = MemoryHub::new();
        let (alice, alice_node, _) = make_comms(&hub, 1).await;
        let (bob, _, _) = make_comms(&hub, 2).await;
        let (carol, _, _) = make_comms(&hub, 3).await;

        // Tagged for bob, replayed to carol
        let envelope = alice
            .tag(serde_json::json!("hello"), "t".into(), bob.public_key())
            .unwrap();
        assert!(carol.authenticate(envelope, &[alice_node]).is_none());
    }

    #[tokio::test]
    async fn test_authenticate_rejects_unexpected_sender() {
        let hub = MemoryHub::new();
        let (alice, _, _) = make_comms(&hub, 1).await;
        let (bob, bob_node, _) = make_comms(&hub, 2).await;

        let envelope = alice
            .tag(serde_json::json!(1), "t".into(), bob.public_key())
            .unwrap();
        assert!(bob.authenticate(envelope, &[bob_node]).is_none());
    }

    #[tokio::test]
    async fn test_authenticate_rejects_tampering() {
        let hub = MemoryHub::new();
        let (alice, alice_node, _) = make_comms(&hub, 1).await;
        let (bob, _, _) = make_comms(&hub, 2).await;

        let mut envelope = alice
            .tag(serde_json::json!({"amount": 1}), "t".into(), bob.public_key())
            .unwrap();
        envelope.payload = serde_json::json!({"amount": 1000});
        assert!(bob.authenticate(envelope.clone(), &[alice_node.clone()]).is_none());

        envelope.tag = None;
        assert!(bob.authenticate(envelope, &[alice_node]).is_none());
    }

    #[tokio::test]
    async fn test_closed_gate_drops_traffic() {
        let hub = MemoryHub::new();
        let (alice, alice_node, _) = make_comms(&hub, 1).await;
        let (bob, _, _) = make_comms(&hub, 2).await;
        bob.set_accept_internal(false);

        let body = alice
            .tag(serde_json::json!(1), "t".into(), bob.public_key())
            .unwrap()
            .to_bytes()
            .unwrap();
        assert!(bob.open(&body, &[alice_node.clone()]).is_none());

        bob.set_accept_internal(true);
        assert!(bob.open(&body, &[alice_node]).is_some());
    }

    #[tokio::test]
    async fn test_ask_round_trip() {
        let hub = MemoryHub::new();
        let (alice, alice_node, _) = make_comms(&hub, 1).await;
        let (bob, bob_node, mut bob_inbox) = make_comms(&hub, 2).await;

        let responder = Arc::clone(&bob);
        tokio::spawn(async move {
            let message = bob_inbox.recv().await.unwrap();
            let verified = responder.open(&message.body, &[alice_node.clone()]).unwrap();
            let n = verified.payload["n"].as_u64().unwrap();
            let body = responder
                .reply(&alice_node, &serde_json::json!({"n": n + 1}), verified.tracker)
                .unwrap();
            let _ = message.reply.unwrap().send(body);
        });

        let response = alice
            .ask(&bob_node, Route::CompareCert, &serde_json::json!({"n": 41}), None)
            .await
            .unwrap();
        assert_eq!(response["n"], 42);
    }

    #[tokio::test]
    async fn test_ask_failure_is_none() {
        let hub = MemoryHub::new();
        let (alice, _, _) = make_comms(&hub, 1).await;
        let (_, bob_node, _) = make_comms(&hub, 2).await;

        hub.disconnect(&bob_node.id).await;
        let response = alice
            .ask(&bob_node, Route::CompareCert, &serde_json::json!({}), None)
            .await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn test_ask_rejects_response_from_impostor() {
        let hub = MemoryHub::new();
        let (alice, alice_node, _) = make_comms(&hub, 1).await;
        let (_, bob_node, mut bob_inbox) = make_comms(&hub, 2).await;
        let (mallory, _, _) = make_comms(&hub, 3).await;

        tokio::spawn(async move {
            let message = bob_inbox.recv().await.unwrap();
            let body = mallory
                .reply(&alice_node, &serde_json::json!("forged"), "t".into())
                .unwrap();
            let _ = message.reply.unwrap().send(body);
        });

        let response = alice
            .ask(&bob_node, Route::CompareCert, &serde_json::json!({}), None)
            .await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn test_tell_skips_self() {
        let hub = MemoryHub::new();
        let (alice, alice_node, mut alice_inbox) = make_comms(&hub, 1).await;
        let (_, bob_node, mut bob_inbox) = make_comms(&hub, 2).await;

        alice
            .tell(&[alice_node, bob_node], Route::Gossip, &serde_json::json!("x"), None)
            .await;

        assert!(bob_inbox.recv().await.is_some());
        assert!(alice_inbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_gossip_emitted_once() {
        let hub = MemoryHub::new();
        let (alice, alice_node, _) = make_comms(&hub, 1).await;
        let (_, bob_node, mut bob_inbox) = make_comms(&hub, 2).await;
        let nodes = vec![alice_node, bob_node];

        let data = serde_json::json!({"x": 1});
        alice
            .send_gossip_all(GossipType::GossipJoin, data.clone(), None, None, &nodes)
            .await;
        alice
            .send_gossip_all(GossipType::GossipJoin, data, None, None, &nodes)
            .await;

        assert!(bob_inbox.recv().await.is_some());
        assert!(bob_inbox.try_recv().is_err());
        assert_eq!(alice.gossip_stats().await.messages_broadcast, 1);
    }

    #[tokio::test]
    async fn test_handle_gossip_drops_echo() {
        let hub = MemoryHub::new();
        let (alice, alice_node, _) = make_comms(&hub, 1).await;
        let (bob, bob_node, _) = make_comms(&hub, 2).await;
        let nodes = vec![alice_node, bob_node.clone()];

        let data = serde_json::json!({"x": 2});
        alice
            .send_gossip_all(GossipType::GossipActive, data.clone(), None, None, &nodes)
            .await;

        // bob relays the same payload back to alice
        let payload = serde_json::to_value(GossipPayload {
            gossip_type: GossipType::GossipActive,
            data,
        })
        .unwrap();
        let envelope = bob.tag(payload, "t".into(), alice.public_key()).unwrap();
        let verified = alice.authenticate(envelope, &[bob_node]).unwrap();

        assert!(alice.handle_gossip(&verified).await.is_none());
        assert_eq!(alice.gossip_stats().await.echoes_dropped, 1);
    }
}
