// Multi-node messaging integration tests
//
// These tests verify that the messaging layer works correctly with multiple
// nodes, including:
// - Epidemic gossip reaching every node with one handler call each
// - Each fan-out strategy terminating under relay
// - Disconnected nodes being skipped without affecting the rest

use super::*;
use crate::crypto::KeyPair;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};

#[derive(Clone, Copy)]
enum Relay {
    Random,
    Ring,
    All,
}

/// Test structure for managing multiple in-process nodes
struct NetworkCluster {
    hub: Arc<MemoryHub>,
    nodes: Vec<Node>,
    comms: HashMap<NodeId, Arc<Comms>>,
    handled: HashMap<NodeId, Arc<AtomicUsize>>,
    tasks: Vec<JoinHandle<()>>,
}

impl NetworkCluster {
    /// Create a cluster of n nodes, each relaying new gossip with `relay`
    async fn new(n: u64, relay: Relay, fan_out: usize) -> Self {
        let hub = MemoryHub::new();
        let keys: Vec<KeyPair> = testutil::key_seeds(100, n as usize).into_iter().map(KeyPair::from_seed).collect();
        let nodes: Vec<Node> = keys
            .iter()
            .map(|k| Node::new_active(k.public_key.clone(), 0))
            .collect();

        let config = GossipConfig {
            gossip_recipients: fan_out,
            ..GossipConfig::default()
        };

        let mut comms = HashMap::new();
        let mut handled = HashMap::new();
        let mut tasks = Vec::new();

        for (i, keypair) in keys.into_iter().enumerate() {
            let id = nodes[i].id.clone();
            let mut inbox = hub.register(id.clone()).await;
            let transport = Arc::new(hub.transport(id.clone()));
            let node_comms = Arc::new(Comms::new(
                keypair,
                transport,
                config.clone(),
                StdRng::seed_from_u64(i as u64),
            ));
            node_comms.set_accept_internal(true);

            let counter = Arc::new(AtomicUsize::new(0));
            let task_comms = Arc::clone(&node_comms);
            let task_counter = Arc::clone(&counter);
            let peers = nodes.clone();

            tasks.push(tokio::spawn(async move {
                while let Some(message) = inbox.recv().await {
                    if message.route != Route::Gossip {
                        continue;
                    }
                    let verified = match task_comms.open(&message.body, &peers) {
                        Some(verified) => verified,
                        None => continue,
                    };
                    let payload = match task_comms.handle_gossip(&verified).await {
                        Some(payload) => payload,
                        None => continue,
                    };
                    task_counter.fetch_add(1, Ordering::SeqCst);

                    let sender = Some(&verified.sender);
                    match relay {
                        Relay::Random => {
                            task_comms
                                .send_gossip(payload.gossip_type, payload.data, None, sender, &peers)
                                .await
                        }
                        Relay::Ring => {
                            task_comms
                                .send_gossip_in(payload.gossip_type, payload.data, None, sender, &peers)
                                .await
                        }
                        Relay::All => {
                            task_comms
                                .send_gossip_all(payload.gossip_type, payload.data, None, sender, &peers)
                                .await
                        }
                    }
                }
            }));

            comms.insert(id.clone(), node_comms);
            handled.insert(id, counter);
        }

        Self {
            hub,
            nodes,
            comms,
            handled,
            tasks,
        }
    }

    fn comms(&self, index: usize) -> &Arc<Comms> {
        &self.comms[&self.nodes[index].id]
    }

    fn handled(&self, index: usize) -> usize {
        self.handled[&self.nodes[index].id].load(Ordering::SeqCst)
    }

    /// Wait until every node in `indices` handled at least one payload
    async fn wait_for(&self, indices: &[usize]) -> bool {
        timeout(Duration::from_secs(5), async {
            loop {
                if indices.iter().all(|&i| self.handled(i) > 0) {
                    return;
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok()
    }

    fn shutdown(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

#[tokio::test]
async fn test_gossip_all_reaches_everyone_once() {
    let cluster = NetworkCluster::new(6, Relay::All, 3).await;

    cluster
        .comms(0)
        .send_gossip_all(
            GossipType::GossipJoin,
            serde_json::json!({"joining": "n7"}),
            None,
            None,
            &cluster.nodes,
        )
        .await;

    assert!(cluster.wait_for(&[1, 2, 3, 4, 5]).await);
    // Let relays settle
    sleep(Duration::from_millis(100)).await;

    for i in 1..6 {
        assert_eq!(cluster.handled(i), 1, "node {} handled the payload more than once", i);
    }
    assert_eq!(cluster.handled(0), 0);

    let origin_stats = cluster.comms(0).gossip_stats().await;
    assert!(origin_stats.echoes_dropped > 0);
    cluster.shutdown();
}

#[tokio::test]
async fn test_random_gossip_floods_cluster() {
    let cluster = NetworkCluster::new(10, Relay::Random, 3).await;

    cluster
        .comms(0)
        .send_gossip(
            GossipType::GossipActive,
            serde_json::json!({"active": "n0"}),
            None,
            None,
            &cluster.nodes,
        )
        .await;

    // Every relay forwards to 3 random peers; with 10 nodes the flood
    // reaches almost everyone, and nobody handles it twice.
    sleep(Duration::from_millis(300)).await;
    let reached = (1..10).filter(|&i| cluster.handled(i) == 1).count();
    assert!(reached >= 5, "flood reached only {} nodes", reached);
    assert!((0..10).all(|i| cluster.handled(i) <= 1));
    cluster.shutdown();
}

#[tokio::test]
async fn test_ring_gossip_reaches_everyone() {
    // Ring fan-out always includes both neighbours, so the flood walks the
    // whole ring even with the smallest useful fan-out.
    let cluster = NetworkCluster::new(8, Relay::Ring, 2).await;

    cluster
        .comms(3)
        .send_gossip_in(
            GossipType::LostReport,
            serde_json::json!({"target": "n9"}),
            None,
            None,
            &cluster.nodes,
        )
        .await;

    let others: Vec<usize> = (0..8).filter(|&i| i != 3).collect();
    assert!(cluster.wait_for(&others).await);
    sleep(Duration::from_millis(100)).await;
    assert!(others.iter().all(|&i| cluster.handled(i) == 1));
    cluster.shutdown();
}

#[tokio::test]
async fn test_disconnected_node_is_skipped() {
    let cluster = NetworkCluster::new(5, Relay::All, 3).await;
    let cut = cluster.nodes[4].id.clone();
    cluster.hub.disconnect(&cut).await;

    cluster
        .comms(0)
        .send_gossip_all(
            GossipType::Apoptosis,
            serde_json::json!({"node": "n0"}),
            None,
            None,
            &cluster.nodes,
        )
        .await;

    assert!(cluster.wait_for(&[1, 2, 3]).await);
    sleep(Duration::from_millis(100)).await;
    assert_eq!(cluster.handled(4), 0);

    let stats = cluster.comms(0).gossip_stats().await;
    assert_eq!(stats.failed_sends, 1);
    cluster.shutdown();
}

#[tokio::test]
async fn test_distinct_payloads_are_not_suppressed() {
    let cluster = NetworkCluster::new(3, Relay::All, 2).await;

    for round in 0..3 {
        cluster
            .comms(0)
            .send_gossip_all(
                GossipType::GossipJoin,
                serde_json::json!({ "round": round }),
                None,
                None,
                &cluster.nodes,
            )
            .await;
    }

    timeout(Duration::from_secs(5), async {
        while cluster.handled(1) < 3 || cluster.handled(2) < 3 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    cluster.shutdown();
}
