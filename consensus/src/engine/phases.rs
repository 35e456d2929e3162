// Quarter phases
//
// Q0 closes the cycle: commit, persist, reset, schedule the next one.
// Q1 sends submodule requests, Q2 is idle, Q3 builds our candidate and
// certifies it, Q4 asks peers until enough agree with our best cert.

use super::{CycleEvent, EngineError, EngineInner, Result};
use crate::cycle::{calc_cycle_times, CertBundle, Comparison, CycleCert, CycleRecord, Quarter};
use crate::crypto::Hash;
use crate::network::types::{GossipType, Node, NodeId, Route};
use crate::scheduler::TimerEvent;
use crate::storage::StoredCycle;
use crate::submodules::{ApoptosisBody, Proposal, SubmoduleContext};
use rand::seq::SliceRandom;
use std::sync::atomic::Ordering;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

/// Result of one round of `compare_cycle_cert`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum QuorumOutcome {
    /// Enough peers hold our best marker
    Success { matches: usize },
    /// Not enough matches this round
    Incomplete { matches: usize },
    /// Cycle or quarter moved on
    Aborted,
}

impl EngineInner {
    pub(crate) async fn run_phase(&self, event: TimerEvent) {
        if self.is_stopped() {
            return;
        }
        if !self.enter_quarter(event.cycle, event.phase).await {
            debug!(cycle = event.cycle, phase = %event.phase, "stale timer, skipping");
            return;
        }
        self.emit(CycleEvent::QuarterStarted {
            cycle: event.cycle,
            quarter: event.phase,
        });

        match event.phase {
            Quarter::Q0 => self.q0(event.cycle).await,
            Quarter::Q1 => self.q1(event.cycle).await,
            Quarter::Q2 => debug!(cycle = event.cycle, "Q2"),
            Quarter::Q3 => {
                if let Err(e) = self.q3(event.cycle).await {
                    warn!(cycle = event.cycle, error = %e, "Q3 failed to certify a candidate");
                }
            }
            Quarter::Q4 => self.q4(event.cycle).await,
            Quarter::NotStarted => {}
        }
    }

    async fn enter_quarter(&self, cycle: u64, quarter: Quarter) -> bool {
        let mut state = self.state.write().await;
        if state.current_cycle != cycle {
            return false;
        }
        state.current_quarter = quarter;
        true
    }

    /// Close `cycle`: settle on its record and advance
    async fn q0(&self, cycle: u64) {
        let local = {
            let state = self.state.read().await;
            match (&state.best.best_record, state.best.best_marker) {
                (Some(record), Some(marker)) if record.counter == state.head.counter + 1 => Some(StoredCycle::committed(
                    record.clone(),
                    marker,
                    state.best.certs_for(&marker).to_vec(),
                )),
                _ => None,
            }
        };

        let agreed = match local {
            Some(agreed) => agreed,
            None => match self.fetch_with_retries(cycle).await {
                Some(agreed) => agreed,
                None => return,
            },
        };

        if let Err(e) = self.commit(cycle, agreed).await {
            error!(cycle, error = %e, "failed to commit cycle");
        }
    }

    /// Fetch until a quorum answers; self-remove past the failure limit
    async fn fetch_with_retries(&self, cycle: u64) -> Option<StoredCycle> {
        loop {
            if self.is_stopped() {
                return None;
            }
            if let Some(agreed) = self.fetch_cycle(cycle).await {
                self.state.write().await.fetch_failures = 0;
                return Some(agreed);
            }

            let failures = {
                let mut state = self.state.write().await;
                state.fetch_failures += 1;
                state.fetch_failures
            };
            warn!(cycle, failures, "could not fetch previous record");

            if failures > self.config.max_fetch_failures {
                error!(cycle, failures, "fetch failure limit exceeded");
                self.apoptosize(cycle).await;
                return None;
            }
            sleep(Duration::from_millis(self.config.fetch_retry_delay_ms)).await;
        }
    }

    /// Advance to `cycle + 1` on `agreed`, persist it and arm the next cycle.
    ///
    /// Once the in-memory state has moved on the node either schedules the
    /// next cycle or leaves the network; no storage error ends in between.
    async fn commit(&self, cycle: u64, agreed: StoredCycle) -> Result<()> {
        let (times, removed_self) = {
            let mut state = self.state.write().await;
            if !state.is_current(cycle, Some(Quarter::Q0)) || self.is_stopped() {
                debug!(cycle, "commit raced with another transition");
                return Ok(());
            }

            state.nodes.apply_record(&agreed.record);
            state.head = agreed.record.clone();
            state.head_marker = agreed.marker;
            state.head_certs = agreed.certs.clone();
            state.best.reset();
            state.submodules.reset();
            state.current_cycle = cycle + 1;
            state.times = calc_cycle_times(&agreed.record);

            let removed_self = agreed.record.departures().any(|id| id == self.id());
            (state.times, removed_self)
        };

        if let Err(e) = self.persist_with_retries(&agreed).await {
            error!(cycle, error = %e, "could not persist committed cycle, leaving the network");
            self.apoptosize(cycle + 1).await;
            return Err(e);
        }

        info!(
            cycle,
            marker = %agreed.marker,
            joined = agreed.record.joined.len(),
            departed = agreed.record.departures().count(),
            "committed cycle"
        );
        self.emit(CycleEvent::NewCycle {
            record: agreed.record,
            marker: agreed.marker,
        });

        if removed_self {
            info!(cycle, "removed from the network by this record");
            self.stop().await;
            return Ok(());
        }
        self.schedule_cycle(cycle + 1, &times).await;

        // Retention is housekeeping; the next pass picks up what this one left
        if let Err(e) = self.pruner.prune(self.store.as_ref(), cycle) {
            warn!(cycle, error = %e, "pruning failed");
        }
        Ok(())
    }

    async fn persist_with_retries(&self, agreed: &StoredCycle) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.persist(agreed).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= self.config.max_persist_attempts => return Err(e),
                Err(e) => {
                    warn!(cycle = agreed.counter(), attempt, error = %e, "persisting cycle failed, retrying");
                    attempt += 1;
                    sleep(Duration::from_millis(self.config.persist_retry_delay_ms)).await;
                }
            }
        }
    }

    /// Replace a provisional entry or append, then save the node list
    async fn persist(&self, agreed: &StoredCycle) -> Result<()> {
        let counter = agreed.counter();
        match self.store.get_cycle(counter)? {
            Some(_) => self.store.update_cycle(counter, agreed)?,
            None => self.store.add_cycle(agreed)?,
        }
        let nodes = self.state.read().await.nodes.clone();
        self.store.save_node_list(&nodes)?;
        Ok(())
    }

    async fn q1(&self, cycle: u64) {
        let (outgoing, nodes) = {
            let mut state = self.state.write().await;
            let state = &mut *state;
            let ctx = SubmoduleContext {
                nodes: &state.nodes,
                counter: cycle,
                self_id: self.id(),
                keypair: self.comms.keypair(),
                config: &self.config,
            };
            (state.submodules.send_requests(&ctx), state.nodes.all())
        };

        debug!(cycle, requests = outgoing.len(), "Q1 sending submodule requests");
        for (gossip_type, data) in outgoing {
            self.comms
                .send_gossip_in(gossip_type, data, None, None, &nodes)
                .await;
        }
    }

    /// Build our candidate for `cycle` and certify it
    async fn q3(&self, cycle: u64) -> Result<()> {
        let (record, bundle, nodes) = {
            let mut state = self.state.write().await;
            let state = &mut *state;
            let txs = state.submodules.get_txs(&self.config);
            let mut record = CycleRecord::successor(
                &state.head,
                state.head_marker,
                self.config.cycle_duration_secs,
                state.nodes.active_count() as u64,
                self.config.desired_nodes,
            );
            let ctx = SubmoduleContext {
                nodes: &state.nodes,
                counter: cycle,
                self_id: self.id(),
                keypair: self.comms.keypair(),
                config: &self.config,
            };
            state.submodules.update_record(&txs, &mut record, &state.head, &ctx);

            let marker = record.marker()?;
            let eligible = state.nodes.is_active(self.id()) || self.config.first_node;
            let improved = if eligible {
                let cert = CycleCert::create(marker, self.comms.keypair())?;
                state.best.improve_best_cert(&[cert], &record)
            } else {
                false
            };
            debug!(cycle, %marker, eligible, improved, "Q3 built candidate");

            let bundle = if improved { state.best.best_bundle() } else { None };
            (record, bundle, state.nodes.all())
        };

        let provisional = StoredCycle::provisional(record);
        match self.store.get_cycle(cycle)? {
            Some(existing) if !existing.provisional => {}
            Some(_) => self.store.update_cycle(cycle, &provisional)?,
            None => self.store.add_cycle(&provisional)?,
        }

        if let Some(bundle) = bundle {
            self.gossip_bundle(&bundle, None, &nodes).await;
        }
        Ok(())
    }

    pub(crate) async fn gossip_bundle(
        &self,
        bundle: &CertBundle,
        exclude: Option<&NodeId>,
        nodes: &[Node],
    ) {
        match serde_json::to_value(bundle) {
            Ok(data) => {
                self.comms
                    .send_gossip_all(GossipType::GossipCert, data, None, exclude, nodes)
                    .await
            }
            Err(e) => warn!(error = %e, "failed to encode cert bundle"),
        }
    }

    /// Ask until enough peers agree, the cycle moves on, or Q4 runs out
    async fn q4(&self, cycle: u64) {
        let deadline = self.state.read().await.times.end;
        let mut rounds = 0u32;

        loop {
            if self.is_stopped() || self.clock.now_ms() >= deadline {
                debug!(cycle, rounds, "Q4 budget spent, accepting best effort");
                return;
            }
            rounds += 1;
            match self.compare_cycle_cert(cycle).await {
                QuorumOutcome::Success { matches } => {
                    info!(cycle, matches, rounds, "best cert confirmed by peers");
                    return;
                }
                QuorumOutcome::Aborted => {
                    debug!(cycle, rounds, "Q4 comparison aborted");
                    return;
                }
                QuorumOutcome::Incomplete { matches } => {
                    debug!(cycle, matches, rounds, "Q4 comparison incomplete, retrying");
                }
            }
            sleep(Duration::from_millis(self.config.compare_retry_delay_ms)).await;
        }
    }

    /// One quorum round over shuffled active peers
    pub(crate) async fn compare_cycle_cert(&self, cycle: u64) -> QuorumOutcome {
        let (mut peers, mut bundle) = {
            let state = self.state.read().await;
            if !state.is_current(cycle, Some(Quarter::Q4)) {
                return QuorumOutcome::Aborted;
            }
            let peers: Vec<_> = state
                .nodes
                .active()
                .into_iter()
                .filter(|n| &n.id != self.id())
                .collect();
            (peers, state.best.best_bundle())
        };

        let desired = self.config.desired_cert_matches.min(peers.len());
        if desired == 0 {
            return QuorumOutcome::Success { matches: 0 };
        }
        peers.shuffle(&mut *self.rng.lock().await);

        let mut matches = 0;
        for peer in &peers {
            if matches >= desired {
                break;
            }
            let Some(ours) = bundle.clone() else {
                // Nothing to compare yet; wait for gossip
                return QuorumOutcome::Incomplete { matches };
            };
            let Some(response) = self.comms.ask(peer, Route::CompareCert, &ours, None).await else {
                continue;
            };

            let comparison = match serde_json::from_value::<CertBundle>(response) {
                Ok(theirs) => self.compare_bundle(cycle, &peer.id, &theirs).await,
                Err(_) => Comparison::Worse,
            };
            match comparison {
                Comparison::Equal => matches += 1,
                Comparison::Better => {
                    matches = 0;
                    bundle = self.state.read().await.best.best_bundle();
                }
                Comparison::Worse => {}
                Comparison::Abort => return QuorumOutcome::Aborted,
            }
        }

        if matches >= desired {
            QuorumOutcome::Success { matches }
        } else {
            QuorumOutcome::Incomplete { matches }
        }
    }

    /// Classify a peer's bundle against our best and adopt it when better
    pub(crate) async fn compare_bundle(&self, cycle: u64, sender: &NodeId, theirs: &CertBundle) -> Comparison {
        let ours: Option<Hash> = self.state.read().await.best.best_marker;
        let equal = ours.is_some() && theirs.marker() == ours;

        // `accept_bundle` re-checks the position under the write lock; a
        // stale answer is dropped whatever it says
        match self.accept_bundle(sender, theirs, Some((cycle, Quarter::Q4))).await {
            Err(EngineError::Stale) => Comparison::Abort,
            // Same marker: extra certs are merged but it is still a match
            _ if equal => Comparison::Equal,
            Ok(true) => Comparison::Better,
            Ok(false) => Comparison::Worse,
            Err(e) => {
                debug!(peer = %sender, error = %e, "peer bundle rejected");
                Comparison::Worse
            }
        }
    }

    /// Gossip our apoptosis proposal, announce it and stop. Runs once.
    pub(crate) async fn apoptosize(&self, cycle: u64) {
        if self.apoptosized.swap(true, Ordering::SeqCst) {
            return;
        }
        let nodes = self.state.read().await.nodes.all();

        match Proposal::sign(ApoptosisBody { cycle }, self.comms.keypair()) {
            Ok(proposal) => match serde_json::to_value(&proposal) {
                Ok(data) => {
                    self.comms
                        .send_gossip_all(GossipType::Apoptosis, data, None, None, &nodes)
                        .await
                }
                Err(e) => warn!(error = %e, "failed to encode apoptosis proposal"),
            },
            Err(e) => warn!(error = %e, "failed to sign apoptosis proposal"),
        }

        warn!(cycle, node = %self.id(), "apoptosized");
        self.emit(CycleEvent::Apoptosized { cycle });
        self.stop().await;
    }
}
