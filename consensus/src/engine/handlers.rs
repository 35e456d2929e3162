// Inbound routes
//
// Every message passes the accept gate and tag verification against the
// current node list before it reaches a handler. Request routes answer with
// a response tagged for the requester; a handler that has nothing to say
// drops the responder and the requester sees a failed `ask`.

use super::fetch::CycleQuery;
use super::{EngineError, EngineInner, Result};
use crate::cycle::{validate_certs, CertBundle, Quarter};
use crate::network::types::{GossipType, InboundMessage, Node, NodeId, Route};
use crate::network::Verified;
use crate::storage::StoredCycle;
use crate::submodules::SubmoduleContext;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

pub(crate) async fn handle_inbound(inner: Arc<EngineInner>, message: InboundMessage) {
    let InboundMessage { route, body, reply } = message;

    let expected = inner.state.read().await.nodes.all();
    let Some(verified) = inner.comms.open(&body, &expected) else {
        return;
    };
    let Some(requester) = expected.into_iter().find(|n| n.id == verified.sender) else {
        return;
    };
    trace!(%route, sender = %verified.sender, tracker = %verified.tracker, "inbound");

    match route {
        Route::Gossip => inner.on_gossip(verified).await,
        Route::CompareCert => {
            let response = inner.on_compare_cert(&verified).await;
            inner.respond(reply, &requester, &response, verified.tracker);
        }
        Route::CompareMarker => {
            let response = inner.state.read().await.best.best_marker;
            inner.respond(reply, &requester, &response, verified.tracker);
        }
        Route::NewestCycle => {
            let response = inner.on_newest_cycle(&verified).await;
            inner.respond(reply, &requester, &response, verified.tracker);
        }
    }
}

impl EngineInner {
    fn respond<T: Serialize>(&self, reply: Option<oneshot::Sender<Vec<u8>>>, requester: &Node, message: &T, tracker: String) {
        let Some(reply) = reply else {
            return;
        };
        if let Some(body) = self.comms.reply(requester, message, tracker) {
            if reply.send(body).is_err() {
                debug!(peer = %requester.id, "requester went away before the response");
            }
        }
    }

    /// Validate a peer's bundle and fold it into our best state.
    ///
    /// `at` pins the cycle and quarter the caller observed; the bundle is
    /// refused with `Stale` when the engine has moved on. Returns whether
    /// our best pair changed.
    pub(crate) async fn accept_bundle(
        &self,
        sender: &NodeId,
        bundle: &CertBundle,
        at: Option<(u64, Quarter)>,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        if let Some((cycle, quarter)) = at {
            if !state.is_current(cycle, Some(quarter)) {
                return Err(EngineError::Stale);
            }
        }

        validate_certs(&bundle.certs, &bundle.record, state.head.counter, &state.nodes, sender)?;
        if bundle.record.previous != state.head_marker {
            return Err(EngineError::InvalidRecord(format!(
                "record {} does not link to head {}",
                bundle.record.counter, state.head_marker
            )));
        }
        state.submodules.validate_record_types(&bundle.record, &self.config)?;

        Ok(state.best.improve_best_cert(&bundle.certs, &bundle.record))
    }

    async fn on_gossip(&self, verified: Verified) {
        let Some(payload) = self.comms.handle_gossip(&verified).await else {
            return;
        };
        let sender = verified.sender;

        if payload.gossip_type == GossipType::GossipCert {
            self.on_gossip_cert(&sender, payload.data).await;
            return;
        }

        let (relay, nodes) = {
            let mut state = self.state.write().await;
            let state = &mut *state;
            let ctx = SubmoduleContext {
                nodes: &state.nodes,
                counter: state.current_cycle,
                self_id: self.id(),
                keypair: self.comms.keypair(),
                config: &self.config,
            };
            let relay = match state.submodules.handle_gossip(payload.gossip_type, payload.data.clone(), &ctx) {
                Ok(relay) => relay,
                Err(e) => {
                    debug!(gossip_type = %payload.gossip_type, peer = %sender, error = %e, "gossip rejected");
                    false
                }
            };
            (relay, state.nodes.all())
        };

        if relay {
            self.comms
                .send_gossip(payload.gossip_type, payload.data, Some(verified.tracker), Some(&sender), &nodes)
                .await;
        }
    }

    async fn on_gossip_cert(&self, sender: &NodeId, data: serde_json::Value) {
        if !self.state.read().await.started {
            return;
        }
        let bundle: CertBundle = match serde_json::from_value(data) {
            Ok(bundle) => bundle,
            Err(e) => {
                debug!(peer = %sender, error = %e, "malformed cert gossip");
                return;
            }
        };

        match self.accept_bundle(sender, &bundle, None).await {
            Ok(true) => {
                let (best, nodes) = {
                    let state = self.state.read().await;
                    (state.best.best_bundle(), state.nodes.all())
                };
                if let Some(best) = best {
                    debug!(peer = %sender, marker = ?best.marker(), "best cert improved by gossip");
                    self.gossip_bundle(&best, Some(sender), &nodes).await;
                }
            }
            Ok(false) => trace!(peer = %sender, "cert gossip did not improve our best"),
            Err(e) => debug!(peer = %sender, error = %e, "cert gossip rejected"),
        }
    }

    /// Merge the requester's bundle, answer with our best
    async fn on_compare_cert(&self, verified: &Verified) -> Option<CertBundle> {
        match serde_json::from_value::<CertBundle>(verified.payload.clone()) {
            Ok(theirs) => {
                if let Err(e) = self.accept_bundle(&verified.sender, &theirs, None).await {
                    debug!(peer = %verified.sender, error = %e, "compare-cert bundle rejected");
                }
            }
            Err(e) => warn!(peer = %verified.sender, error = %e, "malformed compare-cert request"),
        }
        self.state.read().await.best.best_bundle()
    }

    async fn on_newest_cycle(&self, verified: &Verified) -> Option<StoredCycle> {
        let query: CycleQuery = match serde_json::from_value(verified.payload.clone()) {
            Ok(query) => query,
            Err(e) => {
                debug!(peer = %verified.sender, error = %e, "malformed newest-cycle request");
                return None;
            }
        };

        {
            let state = self.state.read().await;
            if query.counter.map_or(true, |c| c == state.head.counter) {
                return Some(StoredCycle::committed(
                    state.head.clone(),
                    state.head_marker,
                    state.head_certs.clone(),
                ));
            }
        }

        let counter = query.counter?;
        match self.store.get_cycle(counter) {
            Ok(Some(stored)) if !stored.provisional => Some(stored),
            Ok(_) => None,
            Err(e) => {
                warn!(counter, error = %e, "failed to read cycle for peer");
                None
            }
        }
    }
}
