// In-process transport
//
// Every registered node gets an unbounded inbox; requests carry a oneshot
// responder. Used by tests and the simulator in place of a socket transport.

use super::types::{InboundMessage, NodeId, Route};
use super::{NetworkError, NetworkResult, Transport};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::trace;

/// Shared switchboard connecting in-process nodes
#[derive(Default)]
pub struct MemoryHub {
    inboxes: RwLock<HashMap<NodeId, mpsc::UnboundedSender<InboundMessage>>>,
    disconnected: RwLock<HashSet<NodeId>>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a node and return its inbox
    pub async fn register(&self, id: NodeId) -> mpsc::UnboundedReceiver<InboundMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.write().await.insert(id, tx);
        rx
    }

    /// Transport handle sending on behalf of `local`
    pub fn transport(self: &Arc<Self>, local: NodeId) -> MemoryTransport {
        MemoryTransport {
            hub: Arc::clone(self),
            local,
        }
    }

    /// Cut a node off: everything to or from it fails
    pub async fn disconnect(&self, id: &NodeId) {
        self.disconnected.write().await.insert(id.clone());
    }

    pub async fn reconnect(&self, id: &NodeId) {
        self.disconnected.write().await.remove(id);
    }

    async fn deliver(&self, from: &NodeId, to: &NodeId, message: InboundMessage) -> NetworkResult<()> {
        {
            let disconnected = self.disconnected.read().await;
            if disconnected.contains(from) {
                return Err(NetworkError::Disconnected(from.clone()));
            }
            if disconnected.contains(to) {
                return Err(NetworkError::Disconnected(to.clone()));
            }
        }

        let inboxes = self.inboxes.read().await;
        let inbox = inboxes
            .get(to)
            .ok_or_else(|| NetworkError::PeerNotFound(to.clone()))?;
        trace!(%from, %to, route = %message.route, "memory hub delivery");
        inbox
            .send(message)
            .map_err(|_| NetworkError::SendError(format!("inbox of {} closed", to)))
    }
}

/// One node's view of the hub
#[derive(Clone)]
pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
    local: NodeId,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, to: &NodeId, route: Route, body: Vec<u8>) -> NetworkResult<()> {
        let message = InboundMessage {
            route,
            body,
            reply: None,
        };
        self.hub.deliver(&self.local, to, message).await
    }

    async fn request(&self, to: &NodeId, route: Route, body: Vec<u8>) -> NetworkResult<Vec<u8>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let message = InboundMessage {
            route,
            body,
            reply: Some(reply_tx),
        };
        self.hub.deliver(&self.local, to, message).await?;
        reply_rx.await.map_err(|_| NetworkError::ResponseDropped(to.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_reaches_inbox() {
        let hub = MemoryHub::new();
        let a = NodeId::new("a");
        let b = NodeId::new("b");
        let _rx_a = hub.register(a.clone()).await;
        let mut rx_b = hub.register(b.clone()).await;

        hub.transport(a).send(&b, Route::Gossip, vec![1, 2]).await.unwrap();

        let message = rx_b.recv().await.unwrap();
        assert_eq!(message.route, Route::Gossip);
        assert_eq!(message.body, vec![1, 2]);
        assert!(message.reply.is_none());
    }

    #[tokio::test]
    async fn test_request_response() {
        let hub = MemoryHub::new();
        let a = NodeId::new("a");
        let b = NodeId::new("b");
        let mut rx_b = hub.register(b.clone()).await;

        tokio::spawn(async move {
            let message = rx_b.recv().await.unwrap();
            let mut body = message.body.clone();
            body.reverse();
            let _ = message.reply.unwrap().send(body);
        });

        let response = hub
            .transport(a)
            .request(&b, Route::CompareCert, vec![1, 2, 3])
            .await
            .unwrap();
        assert_eq!(response, vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn test_unknown_peer() {
        let hub = MemoryHub::new();
        let result = hub
            .transport(NodeId::new("a"))
            .send(&NodeId::new("ghost"), Route::Gossip, vec![])
            .await;
        assert!(matches!(result, Err(NetworkError::PeerNotFound(_))));
    }

    #[tokio::test]
    async fn test_disconnect_and_reconnect() {
        let hub = MemoryHub::new();
        let a = NodeId::new("a");
        let b = NodeId::new("b");
        let mut rx_b = hub.register(b.clone()).await;
        let transport = hub.transport(a);

        hub.disconnect(&b).await;
        let result = transport.send(&b, Route::Gossip, vec![]).await;
        assert!(matches!(result, Err(NetworkError::Disconnected(_))));

        hub.reconnect(&b).await;
        transport.send(&b, Route::Gossip, vec![9]).await.unwrap();
        assert_eq!(rx_b.recv().await.unwrap().body, vec![9]);
    }

    #[tokio::test]
    async fn test_dropped_responder() {
        let hub = MemoryHub::new();
        let b = NodeId::new("b");
        let mut rx_b = hub.register(b.clone()).await;

        tokio::spawn(async move {
            // Drop the request without answering
            let _ = rx_b.recv().await;
        });

        let result = hub
            .transport(NodeId::new("a"))
            .request(&b, Route::CompareCert, vec![])
            .await;
        assert!(matches!(result, Err(NetworkError::ResponseDropped(_))));
    }
}
