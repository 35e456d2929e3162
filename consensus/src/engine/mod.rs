/// Cycle Engine - runs the quarter-phased cycle protocol for one node
///
/// The CycleEngine ties together:
/// - Comms (authenticated unicast and gossip)
/// - Scheduler (quarter timers)
/// - Certificate state (best marker, top certs per marker)
/// - Submodules (membership proposals that fill each record)
/// - Storage (committed chain and provisional candidates)
///
/// All per-node state lives in `EngineState` behind one lock that is never
/// held across an await. Timer events and inbound messages are consumed by a
/// single `select!` loop; phases and handlers run as spawned tasks and
/// re-check `(cycle, quarter)` before committing anything.

pub mod fetch;
mod handlers;
mod phases;


use crate::config::{ConfigError, CycleConfig};
use crate::crypto::{Hash, HashError, KeyPair};
use crate::cycle::{calc_cycle_times, BestCertState, CertError, CycleCert, CycleRecord, CycleTimes, Quarter};
use crate::membership::NodeList;
use crate::network::{Comms, GossipStats, InboundMessage, NodeId, Transport};
use crate::scheduler::{Clock, Lateness, Scheduler, TimerEvent};
use crate::storage::{CycleStore, Pruner, StorageError, StoredCycle};
use crate::submodules::{JoinRequest, SubmoduleError, Submodules};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tracing::{debug, info, warn};

pub use fetch::{CycleQuery, FetchTally};

/// Cycle engine errors
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Certificate error: {0}")]
    Cert(#[from] CertError),

    #[error("Submodule error: {0}")]
    Submodule(#[from] SubmoduleError),

    #[error("Hash error: {0}")]
    Hash(#[from] HashError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Cycle or quarter moved on")]
    Stale,

    #[error("Recovery failed: {0}")]
    Recovery(String),

    #[error("Engine already running")]
    AlreadyRunning,
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Notifications published by the engine
#[derive(Clone, Debug, PartialEq)]
pub enum CycleEvent {
    QuarterStarted { cycle: u64, quarter: Quarter },
    /// Record `record.counter` was committed
    NewCycle { record: CycleRecord, marker: Hash },
    /// This node removed itself from the network and stopped
    Apoptosized { cycle: u64 },
}

/// Mutable per-node protocol state
#[derive(Debug)]
pub struct EngineState {
    /// Counter of the record being built
    pub current_cycle: u64,
    pub current_quarter: Quarter,
    /// Last committed record
    pub head: CycleRecord,
    pub head_marker: Hash,
    pub head_certs: Vec<CycleCert>,
    /// Quarter boundaries of `current_cycle`
    pub times: CycleTimes,
    pub best: BestCertState,
    pub nodes: NodeList,
    pub submodules: Submodules,
    pub started: bool,
    /// Consecutive failed fetches of the previous record
    pub fetch_failures: u32,
}

impl EngineState {
    fn new(genesis: &CycleRecord) -> Self {
        Self {
            current_cycle: 0,
            current_quarter: Quarter::NotStarted,
            head: genesis.clone(),
            head_marker: Hash::zero(),
            head_certs: Vec::new(),
            times: calc_cycle_times(genesis),
            best: BestCertState::default(),
            nodes: NodeList::new(),
            submodules: Submodules::new(),
            started: false,
            fetch_failures: 0,
        }
    }

    /// Still in `cycle`, and in `quarter` when given
    pub fn is_current(&self, cycle: u64, quarter: Option<Quarter>) -> bool {
        self.current_cycle == cycle && quarter.map_or(true, |q| self.current_quarter == q)
    }
}

pub(crate) struct EngineInner {
    pub(crate) config: CycleConfig,
    pub(crate) comms: Comms,
    pub(crate) store: Arc<dyn CycleStore>,
    pub(crate) pruner: Pruner,
    pub(crate) clock: Clock,
    pub(crate) genesis: CycleRecord,
    pub(crate) state: RwLock<EngineState>,
    pub(crate) scheduler: Mutex<Scheduler>,
    pub(crate) rng: Mutex<StdRng>,
    pub(crate) events: broadcast::Sender<CycleEvent>,
    pub(crate) shutdown: watch::Sender<bool>,
    pub(crate) apoptosized: AtomicBool,
    timers: Mutex<Option<mpsc::UnboundedReceiver<TimerEvent>>>,
}

impl EngineInner {
    pub(crate) fn id(&self) -> &NodeId {
        self.comms.id()
    }

    pub(crate) fn emit(&self, event: CycleEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub(crate) fn is_stopped(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub(crate) async fn stop(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        self.comms.set_accept_internal(false);
        self.scheduler.lock().await.shutdown();
        info!(node = %self.id(), "cycle engine stopped");
    }

    /// Arm Q1-Q4 of `cycle` (one quarter of lateness) and its closing Q0
    pub(crate) async fn schedule_cycle(&self, cycle: u64, times: &CycleTimes) {
        let quarter_ms = times.quarter_ms();
        let mut scheduler = self.scheduler.lock().await;
        for quarter in [Quarter::Q1, Quarter::Q2, Quarter::Q3, Quarter::Q4] {
            if let Some(at) = times.start_of(quarter) {
                scheduler.schedule(quarter, cycle, at, Lateness::Within(quarter_ms));
            }
        }
        scheduler.schedule(Quarter::Q0, cycle, times.end, Lateness::Unlimited);
        debug!(cycle, start_q1 = times.start_q1, end = times.end, "cycle scheduled");
    }

    /// Newest entry that is not a provisional candidate
    fn latest_committed(&self) -> Result<Option<StoredCycle>> {
        for counter in self.store.counters()?.into_iter().rev() {
            if let Some(stored) = self.store.get_cycle(counter)? {
                if !stored.provisional {
                    return Ok(Some(stored));
                }
            }
        }
        Ok(None)
    }

    /// Load or create the chain head and the node list
    async fn recover(&self) -> Result<()> {
        let (head, nodes) = match self.latest_committed()? {
            Some(stored) => {
                let nodes = self.store.load_node_list()?.ok_or_else(|| {
                    EngineError::Recovery(format!("no node list stored alongside cycle {}", stored.counter()))
                })?;
                info!(counter = stored.counter(), nodes = nodes.len(), "recovered chain head");
                (stored, nodes)
            }
            None => {
                if self.genesis.counter != 0 {
                    return Err(EngineError::InvalidRecord(format!(
                        "genesis counter must be 0, got {}",
                        self.genesis.counter
                    )));
                }
                let marker = self.genesis.marker()?;
                let stored = StoredCycle::committed(self.genesis.clone(), marker, Vec::new());
                self.store.add_cycle(&stored)?;

                let mut nodes = NodeList::new();
                nodes.apply_record(&self.genesis);
                self.store.save_node_list(&nodes)?;
                info!(%marker, nodes = nodes.len(), "initialized chain from genesis");
                (stored, nodes)
            }
        };

        let mut state = self.state.write().await;
        state.current_cycle = head.counter() + 1;
        state.current_quarter = Quarter::NotStarted;
        state.times = calc_cycle_times(&head.record);
        state.head_marker = head.marker;
        state.head_certs = head.certs;
        state.head = head.record;
        state.nodes = nodes;
        state.best.reset();
        state.submodules.init();
        state.fetch_failures = 0;
        Ok(())
    }
}

/// One node's cycle protocol
#[derive(Clone)]
pub struct CycleEngine {
    inner: Arc<EngineInner>,
}

impl CycleEngine {
    /// Create an engine; nothing runs until `run`
    pub fn new(
        config: CycleConfig,
        keypair: KeyPair,
        transport: Arc<dyn Transport>,
        store: Arc<dyn CycleStore>,
        genesis: CycleRecord,
        clock: Clock,
    ) -> Result<Self> {
        config.validate()?;

        let (comms_rng, engine_rng) = match config.rng_seed {
            Some(seed) => (StdRng::seed_from_u64(seed), StdRng::seed_from_u64(seed.wrapping_add(1))),
            None => (StdRng::from_entropy(), StdRng::from_entropy()),
        };
        let comms = Comms::new(keypair, transport, config.gossip.clone(), comms_rng);

        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);
        let (shutdown, _) = watch::channel(false);

        let inner = EngineInner {
            pruner: Pruner::new(config.pruning.clone()),
            comms,
            store,
            clock,
            state: RwLock::new(EngineState::new(&genesis)),
            genesis,
            scheduler: Mutex::new(Scheduler::new(clock, timer_tx)),
            rng: Mutex::new(engine_rng),
            events,
            shutdown,
            apoptosized: AtomicBool::new(false),
            timers: Mutex::new(Some(timer_rx)),
            config,
        };

        Ok(Self { inner: Arc::new(inner) })
    }

    /// Recover, open the inbound gate and arm the next cycle
    pub async fn start(&self) -> Result<()> {
        self.inner.recover().await?;

        let (cycle, times) = {
            let mut state = self.inner.state.write().await;
            state.started = true;
            (state.current_cycle, state.times)
        };
        self.inner.comms.set_accept_internal(true);
        self.inner.schedule_cycle(cycle, &times).await;

        info!(node = %self.inner.id(), cycle, "cycle engine started");
        Ok(())
    }

    /// Start and process timers and inbound traffic until stopped
    pub async fn run(&self, mut inbox: mpsc::UnboundedReceiver<InboundMessage>) -> Result<()> {
        let mut timers = self
            .inner
            .timers
            .lock()
            .await
            .take()
            .ok_or(EngineError::AlreadyRunning)?;
        let mut shutdown = self.inner.shutdown.subscribe();

        self.start().await?;

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                Some(event) = timers.recv() => {
                    self.inner.scheduler.lock().await.fired(event.handle);
                    let inner = Arc::clone(&self.inner);
                    tokio::spawn(async move { inner.run_phase(event).await });
                }
                message = inbox.recv() => match message {
                    Some(message) => {
                        let inner = Arc::clone(&self.inner);
                        tokio::spawn(async move { handlers::handle_inbound(inner, message).await });
                    }
                    None => {
                        warn!(node = %self.inner.id(), "inbound channel closed");
                        break;
                    }
                },
            }
        }

        self.inner.stop().await;
        Ok(())
    }

    /// Spawn `run` on the runtime
    pub fn spawn(&self, inbox: mpsc::UnboundedReceiver<InboundMessage>) -> tokio::task::JoinHandle<Result<()>> {
        let engine = self.clone();
        tokio::spawn(async move { engine.run(inbox).await })
    }

    pub async fn stop(&self) {
        self.inner.stop().await;
    }

    /// Leave the network: gossip our apoptosis proposal and stop
    pub async fn leave(&self) {
        let cycle = self.inner.state.read().await.current_cycle;
        self.inner.apoptosize(cycle).await;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CycleEvent> {
        self.inner.events.subscribe()
    }

    /// Hold a join request until the next Q1
    pub async fn queue_join(&self, request: JoinRequest) {
        self.inner.state.write().await.submodules.join.queue(request);
    }

    /// Report a peer we can no longer reach
    pub async fn report_lost(&self, target: NodeId) {
        self.inner.state.write().await.submodules.lost.queue(target);
    }

    pub fn id(&self) -> &NodeId {
        self.inner.id()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.is_stopped()
    }

    pub async fn current_cycle(&self) -> u64 {
        self.inner.state.read().await.current_cycle
    }

    pub async fn current_quarter(&self) -> Quarter {
        self.inner.state.read().await.current_quarter
    }

    /// Last committed record and its marker
    pub async fn head(&self) -> (CycleRecord, Hash) {
        let state = self.inner.state.read().await;
        (state.head.clone(), state.head_marker)
    }

    /// Certs the last committed record was agreed with
    pub async fn head_certs(&self) -> Vec<CycleCert> {
        self.inner.state.read().await.head_certs.clone()
    }

    pub async fn best_marker(&self) -> Option<Hash> {
        self.inner.state.read().await.best.best_marker
    }

    /// Retained certs for the current best marker
    pub async fn best_certs(&self) -> Vec<CycleCert> {
        let state = self.inner.state.read().await;
        match state.best.best_marker {
            Some(marker) => state.best.certs_for(&marker).to_vec(),
            None => Vec::new(),
        }
    }

    pub async fn nodes(&self) -> NodeList {
        self.inner.state.read().await.nodes.clone()
    }

    pub async fn gossip_stats(&self) -> GossipStats {
        self.inner.comms.gossip_stats().await
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<EngineInner> {
        &self.inner
    }
}
