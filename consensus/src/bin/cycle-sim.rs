// In-process cycle network
//
// Usage: cycle-sim [--nodes N] [--cycles C] [--config FILE] [--data-dir DIR]
//
// Runs N engines over a memory hub on the wall clock and prints each
// committed marker until C cycles have been agreed.

use anyhow::{anyhow, bail, Context, Result};
use cycle_consensus::crypto::KeyPair;
use cycle_consensus::cycle::{CycleRecord, JoinedNode};
use cycle_consensus::engine::{CycleEngine, CycleEvent};
use cycle_consensus::network::{MemoryHub, NodeId};
use cycle_consensus::scheduler::Clock;
use cycle_consensus::storage::{CycleStore, MemoryStore, RocksStore};
use cycle_consensus::CycleConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

struct SimArgs {
    nodes: usize,
    cycles: u64,
    config: Option<PathBuf>,
    data_dir: Option<PathBuf>,
}

impl SimArgs {
    fn from_args() -> Result<Self> {
        let mut args = SimArgs {
            nodes: 4,
            cycles: 3,
            config: None,
            data_dir: None,
        };

        let mut iter = std::env::args().skip(1);
        while let Some(flag) = iter.next() {
            let mut value = || iter.next().ok_or_else(|| anyhow!("{} needs a value", flag));
            match flag.as_str() {
                "--nodes" => args.nodes = value()?.parse().context("--nodes")?,
                "--cycles" => args.cycles = value()?.parse().context("--cycles")?,
                "--config" => args.config = Some(PathBuf::from(value()?)),
                "--data-dir" => args.data_dir = Some(PathBuf::from(value()?)),
                other => bail!("unknown argument {}", other),
            }
        }

        if args.nodes == 0 {
            bail!("--nodes must be at least 1");
        }
        Ok(args)
    }
}

fn open_store(data_dir: Option<&PathBuf>, index: usize) -> Result<Arc<dyn CycleStore>> {
    match data_dir {
        Some(dir) => {
            let path = dir.join(format!("node-{}", index));
            std::fs::create_dir_all(&path).with_context(|| format!("creating {}", path.display()))?;
            Ok(Arc::new(RocksStore::new(&path)?))
        }
        None => Ok(Arc::new(MemoryStore::new())),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let args = SimArgs::from_args()?;
    let config = match &args.config {
        Some(path) => CycleConfig::from_json_file(path).with_context(|| format!("loading {}", path.display()))?,
        None => CycleConfig::default(),
    };

    let clock = Clock::system();
    let keys: Vec<KeyPair> = (0..args.nodes).map(|i| KeyPair::from_seed(i as u64 + 1)).collect();
    let joined = keys
        .iter()
        .map(|k| JoinedNode {
            id: NodeId::from_public_key(&k.public_key),
            public_key: k.public_key.clone(),
        })
        .collect();
    // Cycle 1 starts now
    let start = clock.now_secs().saturating_sub(config.cycle_duration_secs);
    let genesis = CycleRecord::genesis(config.network_id.clone(), start, config.cycle_duration_secs, joined);

    info!(nodes = args.nodes, cycles = args.cycles, duration = config.cycle_duration_secs, "starting simulation");

    let hub = MemoryHub::new();
    let mut engines = Vec::with_capacity(args.nodes);
    let mut handles = Vec::with_capacity(args.nodes);
    for (i, keypair) in keys.into_iter().enumerate() {
        let id = NodeId::from_public_key(&keypair.public_key);
        let inbox = hub.register(id.clone()).await;
        let node_config = CycleConfig {
            rng_seed: config.rng_seed.map(|seed| seed.wrapping_add(i as u64 * 2)),
            ..config.clone()
        };
        let engine = CycleEngine::new(
            node_config,
            keypair,
            Arc::new(hub.transport(id)),
            open_store(args.data_dir.as_ref(), i)?,
            genesis.clone(),
            clock,
        )?;
        handles.push(engine.spawn(inbox));
        engines.push(engine);
    }

    let mut events = engines[0].subscribe();
    let mut committed = 0;
    while committed < args.cycles {
        tokio::select! {
            event = events.recv() => match event {
                Ok(CycleEvent::NewCycle { record, marker }) => {
                    committed += 1;
                    println!(
                        "cycle {:>4}  marker {}  active {}  joined {}  departed {}",
                        record.counter,
                        marker,
                        record.active,
                        record.joined.len(),
                        record.departures().count()
                    );
                }
                Ok(CycleEvent::Apoptosized { cycle }) => {
                    error!(cycle, "observer node left the network");
                    break;
                }
                Ok(CycleEvent::QuarterStarted { .. }) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    for engine in &engines {
        engine.stop().await;
    }
    for handle in handles {
        if let Err(e) = handle.await? {
            error!(error = %e, "engine exited with error");
        }
    }
    for (i, engine) in engines.iter().enumerate() {
        let (head, marker) = engine.head().await;
        info!(node = i, head = head.counter, %marker, "final head");
    }
    Ok(())
}
